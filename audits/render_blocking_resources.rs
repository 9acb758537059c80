/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Scripts and stylesheets that held up the first paint.
//!
//! Each blocking request, and everything that depends on it, is removed
//! from the optimistic FCP graph. Stylesheet bytes are assumed inlined into
//! the document. The difference between the two simulations is the saving.

use std::collections::{HashMap, HashSet};

use log::debug;

use super::{
    Audit, AuditError, AuditProduct, ComputedArtifacts, OpportunityDetails, OpportunityItem, TOTAL_BYTES_HEADING,
    URL_HEADING, WASTED_MS_HEADING,
};
use crate::graph::{DependencyGraph, Node, NodeKey};
use crate::model::{InitiatorType, NetworkRequest, ResourceType};
use crate::simulator::{NodeTiming, SimulationOptions, SimulationResult, Simulator};

/// Requests blocking for less than this are not reported.
const MINIMUM_WASTED_MS: f64 = 50.0;

/// Parser-inserted scripts and stylesheets with render-blocking priority.
fn is_render_blocking_tag(node: &Node) -> bool {
    let Some(network) = node.as_network() else {
        return false;
    };
    let is_tag = matches!(
        network.resource_type(),
        Some(ResourceType::Script) | Some(ResourceType::Stylesheet)
    );
    is_tag && network.initiator_type() == InitiatorType::Parser && network.has_render_blocking_priority()
}

fn nodes_by_url<'a>(
    graph: &'a DependencyGraph,
    simulation: &'a SimulationResult,
) -> HashMap<&'a str, (NodeKey, &'a NetworkRequest, &'a NodeTiming)> {
    simulation
        .node_timings
        .iter()
        .filter_map(|(key, timing)| {
            let record = graph.get_node(*key)?.record()?;
            Some((record.url.as_str(), (*key, record, timing)))
        })
        .collect()
}

/// FCP with the deferred nodes gone and deferred stylesheets inlined into
/// the root document, compared against `fcp_graph` as is. Never negative.
pub fn estimate_savings_with_graphs(
    simulator: &Simulator,
    fcp_graph: &DependencyGraph,
    deferred_ids: &HashSet<String>,
) -> Result<f64, AuditError> {
    let before = simulator.simulate(fcp_graph, SimulationOptions::labeled("render-blocking-before"))?;
    let root = fcp_graph.root()?;

    let mut inlined_bytes = 0u64;
    for (_, node) in fcp_graph.nodes() {
        if !deferred_ids.contains(&node.id) {
            continue;
        }
        if let Some(network) = node.as_network()
            && network.is_stylesheet()
        {
            inlined_bytes += network.record().transfer_size;
        }
    }

    let keep = |node: &Node| !deferred_ids.contains(&node.id);
    let (mut minimal, minimal_root) = fcp_graph.clone_with_relationships(root, Some(&keep))?;
    if let Some(document) = minimal.get_node_mut(minimal_root).and_then(|node| node.as_network_mut()) {
        let size = document.record().transfer_size + inlined_bytes;
        document.set_transfer_size(size);
    }
    let after = simulator.simulate(&minimal, SimulationOptions::labeled("render-blocking-after"))?;

    Ok((before.time_in_ms - after.time_in_ms).max(0.0).round())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderBlockingResources;

impl Audit for RenderBlockingResources {
    fn id(&self) -> &'static str {
        "render-blocking-resources"
    }

    fn audit(&self, artifacts: &ComputedArtifacts<'_>) -> Result<AuditProduct, AuditError> {
        let page = artifacts.page_graph()?;
        let simulator = artifacts.simulator()?;
        let fcp = artifacts.first_contentful_paint()?;
        let Some(observed_fcp) = artifacts.trace().timestamps.first_contentful_paint else {
            return Err(AuditError::Message("trace has no first contentful paint".to_string()));
        };

        let graph = &fcp.optimistic_graph;
        let by_url = nodes_by_url(graph, &fcp.optimistic_estimate);

        let mut blocking: Vec<&Node> = page
            .graph
            .nodes()
            .map(|(_, node)| node)
            .filter(|node| is_render_blocking_tag(node))
            .filter(|node| node.end_time().is_some_and(|end| end <= observed_fcp))
            .collect();
        blocking.sort_by(|a, b| a.start_time().total_cmp(&b.start_time()));

        let mut items = Vec::new();
        let mut deferred_ids = HashSet::new();
        for node in blocking {
            let Some(record) = node.record() else {
                continue;
            };
            let Some(&(key, _, timing)) = by_url.get(record.url.as_str()) else {
                continue;
            };
            graph.traverse(key, |dependent, _| {
                if let Some(dependent) = graph.get_node(dependent) {
                    deferred_ids.insert(dependent.id.clone());
                }
            });

            let wasted_ms = timing.duration.round();
            if wasted_ms < MINIMUM_WASTED_MS {
                continue;
            }
            items.push(OpportunityItem {
                url: record.url.clone(),
                total_bytes: Some(record.transfer_size as f64),
                wasted_ms: Some(wasted_ms),
                ..OpportunityItem::default()
            });
        }

        let wasted_ms = if items.is_empty() {
            0.0
        } else {
            estimate_savings_with_graphs(simulator, graph, &deferred_ids)?
        };
        debug!("{} render-blocking requests, {wasted_ms:.0}ms", items.len());

        let overall_savings_bytes = items.iter().filter_map(|item| item.total_bytes).sum();
        let details = OpportunityDetails {
            headings: vec![URL_HEADING, TOTAL_BYTES_HEADING, WASTED_MS_HEADING],
            items,
            overall_savings_ms: wasted_ms,
            overall_savings_bytes,
        };
        Ok(AuditProduct::opportunity(wasted_ms, details, page.warnings.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audits::PageLoad;
    use crate::model::{Initiator, NavigationTimestamps, ProcessedTrace, ResourcePriority};

    fn parser_request(
        id: &str,
        url: &str,
        resource_type: ResourceType,
        priority: ResourcePriority,
        start: f64,
        end: f64,
    ) -> NetworkRequest {
        NetworkRequest {
            request_id: id.to_string(),
            url: url.to_string(),
            resource_type: Some(resource_type),
            priority,
            start_time: start,
            end_time: Some(end),
            transfer_size: 100_000,
            initiator: Initiator {
                initiator_type: InitiatorType::Parser,
                ..Initiator::default()
            },
            initiator_request_id: Some("doc".to_string()),
            ..NetworkRequest::default()
        }
    }

    fn page_load() -> PageLoad {
        PageLoad {
            records: vec![
                NetworkRequest {
                    request_id: "doc".to_string(),
                    url: "http://example.com/".to_string(),
                    resource_type: Some(ResourceType::Document),
                    priority: ResourcePriority::VeryHigh,
                    end_time: Some(0.3),
                    transfer_size: 20_000,
                    ..NetworkRequest::default()
                },
                parser_request(
                    "css",
                    "http://example.com/style.css",
                    ResourceType::Stylesheet,
                    ResourcePriority::VeryHigh,
                    0.3,
                    1.0,
                ),
                parser_request(
                    "js",
                    "http://example.com/app.js",
                    ResourceType::Script,
                    ResourcePriority::High,
                    0.3,
                    1.2,
                ),
                parser_request(
                    "late",
                    "http://example.com/late.js",
                    ResourceType::Script,
                    ResourcePriority::High,
                    0.3,
                    3.0,
                ),
            ],
            final_url: Some("http://example.com/".to_string()),
            trace: ProcessedTrace {
                timestamps: NavigationTimestamps {
                    navigation_start: 0.0,
                    first_contentful_paint: Some(1_500_000.0),
                    largest_contentful_paint: None,
                },
                ..ProcessedTrace::default()
            },
            ..PageLoad::default()
        }
    }

    #[test]
    fn test_reports_requests_finished_before_fcp() {
        let page_load = page_load();
        let artifacts = ComputedArtifacts::new(&page_load);
        let product = RenderBlockingResources.audit(&artifacts).unwrap();
        let mut urls: Vec<&str> = product.details.items.iter().map(|i| i.url.as_str()).collect();
        urls.sort();
        assert_eq!(urls, vec!["http://example.com/app.js", "http://example.com/style.css"]);
        assert!(product.numeric_value >= 0.0);
        assert_eq!(product.details.overall_savings_bytes, 200_000.0);
    }

    #[test]
    fn test_nothing_deferred_saves_nothing() {
        let page_load = page_load();
        let artifacts = ComputedArtifacts::new(&page_load);
        let fcp = artifacts.first_contentful_paint().unwrap();
        let simulator = artifacts.simulator().unwrap();
        let savings = estimate_savings_with_graphs(simulator, &fcp.optimistic_graph, &HashSet::new()).unwrap();
        assert_eq!(savings, 0.0);
    }
}
