/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Suggests `<link rel=preload>` for late-discovered first-party requests.
//!
//! A request two network hops below the main document is only discovered
//! once its initiator has arrived. Preloading it makes it depend on the
//! document alone; the audit simulates exactly that change.

use std::collections::HashSet;

use log::debug;

use super::{
    Audit, AuditError, AuditProduct, ComputedArtifacts, OpportunityDetails, OpportunityItem, URL_HEADING,
    WASTED_MS_HEADING,
};
use crate::builder::PageGraph;
use crate::graph::{DependencyGraph, GraphError, NodeType};
use crate::model::NetworkRequest;
use crate::model::network_request::root_domains_match;
use crate::simulator::{SimulationOptions, Simulator};

const THRESHOLD_IN_MS: f64 = 100.0;

fn should_preload(request: &NetworkRequest, main_document: &NetworkRequest, network_ancestors: usize) -> bool {
    let main_document_depth = main_document.redirects.len();
    !request.is_link_preload
        && !request.is_non_network_protocol()
        && network_ancestors == main_document_depth + 2
        && request.frame_id == main_document.frame_id
        && root_domains_match(&request.url, &main_document.url)
}

/// URLs of the requests worth preloading.
pub fn critical_requests(page: &PageGraph) -> Result<HashSet<String>, AuditError> {
    let graph = &page.graph;
    let main_document = graph
        .node(page.main_document)?
        .record()
        .ok_or_else(|| AuditError::Message("main document is not a network request".to_string()))?;

    let mut urls = HashSet::new();
    graph.traverse(page.root, |key, path| {
        let Some(record) = graph.get_node(key).and_then(|node| node.record()) else {
            return;
        };
        let network_ancestors = path[1..]
            .iter()
            .filter(|&&ancestor| {
                graph
                    .get_node(ancestor)
                    .is_some_and(|node| node.node_type() == NodeType::Network)
            })
            .count();
        if should_preload(record, main_document, network_ancestors) {
            urls.insert(record.url.clone());
        }
    });
    Ok(urls)
}

/// Simulate with each of `urls` depending only on the main document and
/// report requests that finish at least 100ms sooner.
pub fn compute_waste_with_graph(
    urls: &HashSet<String>,
    graph: &DependencyGraph,
    simulator: &Simulator,
) -> Result<(f64, Vec<OpportunityItem>), AuditError> {
    if urls.is_empty() {
        return Ok((0.0, Vec::new()));
    }
    let root = graph.root()?;
    let before = simulator.simulate(graph, SimulationOptions::labeled("preload-before").flexible())?;

    let (mut modified, _) = graph.clone_with_relationships(root, None)?;
    let main_document = modified
        .main_document()
        .ok_or(GraphError::MainDocumentNotFound)?;
    let to_preload: Vec<_> = modified
        .nodes()
        .filter(|(key, node)| *key != main_document && node.record().is_some_and(|record| urls.contains(&record.url)))
        .map(|(key, _)| key)
        .collect();
    for &key in &to_preload {
        modified.remove_all_dependencies(key);
        modified.add_dependency(key, main_document)?;
    }

    let after = simulator.simulate(&modified, SimulationOptions::labeled("preload-after").flexible())?;

    let mut items = Vec::new();
    for key in to_preload {
        let node = modified.node(key)?;
        let Some(original) = graph.get_node_key_by_id(&node.id) else {
            continue;
        };
        let (Some(timing_before), Some(timing_after)) = (before.timing(original), after.timing(key)) else {
            continue;
        };
        let wasted_ms = (timing_before.end_time - timing_after.end_time).round();
        if wasted_ms < THRESHOLD_IN_MS {
            continue;
        }
        if let Some(record) = node.record() {
            items.push(OpportunityItem {
                url: record.url.clone(),
                wasted_ms: Some(wasted_ms),
                ..OpportunityItem::default()
            });
        }
    }

    let wasted_ms = items
        .iter()
        .filter_map(|item| item.wasted_ms)
        .fold(0.0, f64::max);
    Ok((wasted_ms, items))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsesRelPreload;

impl Audit for UsesRelPreload {
    fn id(&self) -> &'static str {
        "uses-rel-preload"
    }

    fn audit(&self, artifacts: &ComputedArtifacts<'_>) -> Result<AuditProduct, AuditError> {
        let page = artifacts.page_graph()?;
        let simulator = artifacts.simulator()?;
        let urls = critical_requests(page)?;
        debug!("{} preload candidates", urls.len());

        let (wasted_ms, mut items) = compute_waste_with_graph(&urls, &page.graph, simulator)?;
        items.sort_by(|a, b| b.wasted_ms.unwrap_or(0.0).total_cmp(&a.wasted_ms.unwrap_or(0.0)));
        let details = OpportunityDetails {
            headings: vec![URL_HEADING, WASTED_MS_HEADING],
            items,
            overall_savings_ms: wasted_ms,
            overall_savings_bytes: 0.0,
        };
        Ok(AuditProduct::opportunity(wasted_ms, details, page.warnings.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audits::PageLoad;
    use crate::builder::build_page_graph;
    use crate::model::{NavigationTimestamps, ProcessedTrace, ResourceType};

    fn request(id: &str, url: &str, initiator: Option<&str>, start: f64, end: f64, bytes: u64) -> NetworkRequest {
        NetworkRequest {
            request_id: id.to_string(),
            url: url.to_string(),
            resource_type: Some(if initiator.is_none() {
                ResourceType::Document
            } else {
                ResourceType::Other
            }),
            initiator_request_id: initiator.map(str::to_string),
            start_time: start,
            end_time: Some(end),
            transfer_size: bytes,
            ..NetworkRequest::default()
        }
    }

    /// doc → style.css → {font.woff2, cdn font, preloaded font}
    fn records() -> Vec<NetworkRequest> {
        let mut preloaded = request(
            "preloaded",
            "http://example.com/preloaded.woff2",
            Some("css"),
            2.1,
            2.4,
            20_000,
        );
        preloaded.is_link_preload = true;
        vec![
            request("doc", "http://example.com/", None, 0.0, 0.5, 10_000),
            request("css", "http://example.com/style.css", Some("doc"), 0.6, 2.0, 300_000),
            request("font", "http://static.example.com/font.woff2", Some("css"), 2.1, 2.4, 20_000),
            request("cdn", "http://fonts.other.net/font.woff2", Some("css"), 2.1, 2.4, 20_000),
            preloaded,
        ]
    }

    #[test]
    fn test_only_first_party_grandchildren_are_candidates() {
        let page = build_page_graph(&ProcessedTrace::default(), &records(), Some("http://example.com/")).unwrap();
        let urls = critical_requests(&page).unwrap();
        assert_eq!(urls, HashSet::from(["http://static.example.com/font.woff2".to_string()]));
    }

    #[test]
    fn test_preloading_late_font_saves_time() {
        let page_load = PageLoad {
            records: records(),
            final_url: Some("http://example.com/".to_string()),
            trace: ProcessedTrace {
                timestamps: NavigationTimestamps {
                    navigation_start: 0.0,
                    first_contentful_paint: Some(2_500_000.0),
                    largest_contentful_paint: None,
                },
                ..ProcessedTrace::default()
            },
            ..PageLoad::default()
        };
        let artifacts = ComputedArtifacts::new(&page_load);
        let product = UsesRelPreload.audit(&artifacts).unwrap();
        assert_eq!(product.details.items.len(), 1);
        assert_eq!(product.details.items[0].url, "http://static.example.com/font.woff2");
        assert!(product.numeric_value >= THRESHOLD_IN_MS);
        assert_eq!(product.score, crate::audits::score_for_wasted_ms(product.numeric_value));
        assert!(product.display_value.is_some());
    }

    #[test]
    fn test_nothing_to_preload_saves_nothing() {
        let graph = DependencyGraph::new();
        let simulator = Simulator::new(Default::default()).unwrap();
        let (wasted_ms, items) = compute_waste_with_graph(&HashSet::new(), &graph, &simulator).unwrap();
        assert_eq!(wasted_ms, 0.0);
        assert!(items.is_empty());
    }
}
