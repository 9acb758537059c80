/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! What-if driver for audits that find wasted bytes.
//!
//! The page graph is simulated once as observed, then cloned with every
//! matching request's transfer size reduced by its waste and simulated
//! again. The difference is the estimated time saved. Records are shared
//! copy-on-write between the graphs, so the original graph never sees the
//! reduced sizes.

use std::collections::HashMap;

use log::debug;

use super::{
    AuditError, AuditProduct, ComputedArtifacts, OpportunityDetails, OpportunityItem, TOTAL_BYTES_HEADING,
    URL_HEADING, WASTED_BYTES_HEADING,
};
use crate::graph::DependencyGraph;
use crate::metrics::{LONG_TASK_THRESHOLD_MS, last_long_task_end_time};
use crate::simulator::{SimulationOptions, Simulator};

/// Baseline and reduced-bytes timings, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ByteEfficiencyResult {
    pub load_before: f64,
    pub load_after: f64,
    pub last_long_task_before: f64,
    pub last_long_task_after: f64,
}

impl ByteEfficiencyResult {
    pub fn load_savings(&self) -> f64 {
        self.load_before - self.load_after
    }

    pub fn interactive_savings(&self) -> f64 {
        self.last_long_task_before - self.last_long_task_after
    }
}

/// Waste that is negative, infinite or not a number counts as nothing.
fn sanitized_waste(wasted_bytes: f64) -> f64 {
    if !wasted_bytes.is_finite() || wasted_bytes < 0.0 {
        return 0.0;
    }
    wasted_bytes
}

/// Simulate `graph` before and after removing each item's wasted bytes from
/// the requests with its URL. Waste for the same URL accumulates.
pub fn compute_waste_with_graph(
    items: &[OpportunityItem],
    graph: &DependencyGraph,
    simulator: &Simulator,
    label: &str,
) -> Result<ByteEfficiencyResult, AuditError> {
    let root = graph.root()?;
    let before = simulator.simulate(graph, SimulationOptions::labeled(&format!("{label}-before")))?;

    let mut wasted_bytes_by_url: HashMap<&str, f64> = HashMap::new();
    for item in items {
        let wasted = sanitized_waste(item.wasted_bytes.unwrap_or(0.0));
        *wasted_bytes_by_url.entry(item.url.as_str()).or_insert(0.0) += wasted;
    }

    let (mut reduced, _) = graph.clone_with_relationships(root, None)?;
    let keys: Vec<_> = reduced.nodes().map(|(key, _)| key).collect();
    for key in keys {
        let Some(network) = reduced.get_node_mut(key).and_then(|node| node.as_network_mut()) else {
            continue;
        };
        let Some(&wasted) = wasted_bytes_by_url.get(network.record().url.as_str()) else {
            continue;
        };
        let original = network.record().transfer_size as f64;
        let reduced_size = (original - wasted).max(0.0);
        network.set_transfer_size(reduced_size.round() as u64);
    }

    let after = simulator.simulate(&reduced, SimulationOptions::labeled(&format!("{label}-after")))?;

    let result = ByteEfficiencyResult {
        load_before: before.time_in_ms,
        load_after: after.time_in_ms,
        last_long_task_before: last_long_task_end_time(graph, &before, LONG_TASK_THRESHOLD_MS),
        last_long_task_after: last_long_task_end_time(&reduced, &after, LONG_TASK_THRESHOLD_MS),
    };
    debug!(
        "{label}: load {:.0}ms -> {:.0}ms, last long task {:.0}ms -> {:.0}ms",
        result.load_before, result.load_after, result.last_long_task_before, result.last_long_task_after
    );
    Ok(result)
}

/// Milliseconds saved on the last long task, rounded to 10ms and never
/// negative. With `include_load`, savings on the full load count too.
pub fn compute_waste_with_tti_graph(
    items: &[OpportunityItem],
    graph: &DependencyGraph,
    simulator: &Simulator,
    include_load: bool,
) -> Result<f64, AuditError> {
    let result = compute_waste_with_graph(items, graph, simulator, "byte-efficiency")?;
    let mut savings = result.interactive_savings();
    if include_load {
        savings = savings.max(result.load_savings());
    }
    Ok(round_to_ten_ms(savings))
}

/// Savings to the nearest 10ms, never negative.
pub fn round_to_ten_ms(ms: f64) -> f64 {
    if !ms.is_finite() {
        return 0.0;
    }
    (ms.max(0.0) / 10.0).round() * 10.0
}

/// Audits that report wasted bytes per resource.
pub trait ByteEfficiencyAudit {
    fn wasted_resources(&self, artifacts: &ComputedArtifacts<'_>) -> Result<Vec<OpportunityItem>, AuditError>;

    /// Whether savings on the full load count alongside interactivity.
    fn counts_toward_load(&self) -> bool {
        true
    }
}

/// Simulate the savings for `audit` and score them.
pub fn audit_byte_efficiency<A>(audit: &A, artifacts: &ComputedArtifacts<'_>) -> Result<AuditProduct, AuditError>
where
    A: ByteEfficiencyAudit + ?Sized,
{
    let page = artifacts.page_graph()?;
    let simulator = artifacts.simulator()?;
    let items = audit.wasted_resources(artifacts)?;
    let wasted_ms = compute_waste_with_tti_graph(&items, &page.graph, simulator, audit.counts_toward_load())?;
    Ok(create_audit_product(items, wasted_ms, page.warnings.clone()))
}

/// Sort items by wasted bytes, largest first, and score the savings.
pub fn create_audit_product(mut items: Vec<OpportunityItem>, wasted_ms: f64, warnings: Vec<String>) -> AuditProduct {
    items.sort_by(|a, b| {
        let a = a.wasted_bytes.unwrap_or(0.0);
        let b = b.wasted_bytes.unwrap_or(0.0);
        b.total_cmp(&a)
    });
    let overall_savings_bytes = items
        .iter()
        .map(|item| sanitized_waste(item.wasted_bytes.unwrap_or(0.0)))
        .sum();
    let details = OpportunityDetails {
        headings: vec![URL_HEADING, TOTAL_BYTES_HEADING, WASTED_BYTES_HEADING],
        items,
        overall_savings_ms: wasted_ms,
        overall_savings_bytes,
    };
    AuditProduct::opportunity(wasted_ms, details, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::model::{NetworkRequest, ResourceType, TraceEvent};
    use crate::simulator::SimulatorOptions;
    use proptest::prelude::*;
    use rstest::rstest;

    const ORIGIN: &str = "https://example.com";

    fn simulator() -> Simulator {
        Simulator::new(SimulatorOptions {
            rtt: 20.0,
            throughput: 100_000.0,
            cpu_slowdown_multiplier: 1.0,
            server_response_time_by_origin: HashMap::from([(ORIGIN.to_string(), 0.0)]),
            ..SimulatorOptions::default()
        })
        .unwrap()
    }

    /// document → app.js → 80ms task
    fn graph() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        let mut document = Node::network(NetworkRequest {
            request_id: "doc".to_string(),
            url: format!("{ORIGIN}/"),
            resource_type: Some(ResourceType::Document),
            end_time: Some(0.1),
            transfer_size: 2_000,
            ..NetworkRequest::default()
        });
        document.is_main_document = true;
        let document = graph.add_node(document);
        let script = graph.add_node(Node::network(NetworkRequest {
            request_id: "app".to_string(),
            url: format!("{ORIGIN}/app.js"),
            resource_type: Some(ResourceType::Script),
            start_time: 0.1,
            end_time: Some(0.5),
            transfer_size: 200_000,
            ..NetworkRequest::default()
        }));
        let task = graph.add_node(Node::cpu(
            TraceEvent {
                name: "RunTask".to_string(),
                ts: 600_000.0,
                dur: Some(80_000.0),
                ..TraceEvent::default()
            },
            Vec::new(),
        ));
        graph.add_dependency(script, document).unwrap();
        graph.add_dependency(task, script).unwrap();
        graph
    }

    fn item(url: &str, wasted_bytes: f64) -> OpportunityItem {
        OpportunityItem {
            url: url.to_string(),
            total_bytes: Some(200_000.0),
            wasted_bytes: Some(wasted_bytes),
            ..OpportunityItem::default()
        }
    }

    #[test]
    fn test_removing_bytes_saves_time() {
        let graph = graph();
        let items = [item(&format!("{ORIGIN}/app.js"), 150_000.0)];
        let result = compute_waste_with_graph(&items, &graph, &simulator(), "test").unwrap();
        assert!(result.load_after < result.load_before);
        assert!(result.last_long_task_after < result.last_long_task_before);

        let savings = compute_waste_with_tti_graph(&items, &graph, &simulator(), false).unwrap();
        assert!(savings > 0.0);
        assert_eq!(savings % 10.0, 0.0);
    }

    #[test]
    fn test_original_graph_is_untouched() {
        let graph = graph();
        let items = [item(&format!("{ORIGIN}/app.js"), 200_000.0)];
        compute_waste_with_graph(&items, &graph, &simulator(), "test").unwrap();
        let script = graph.get_node_key_by_id("app").unwrap();
        assert_eq!(
            graph.get_node(script).and_then(Node::record).map(|r| r.transfer_size),
            Some(200_000)
        );
    }

    #[rstest]
    #[case(f64::NAN)]
    #[case(-5_000.0)]
    #[case(f64::INFINITY)]
    #[case(f64::NEG_INFINITY)]
    fn test_malformed_waste_counts_as_zero(#[case] wasted_bytes: f64) {
        let graph = graph();
        let items = [item(&format!("{ORIGIN}/app.js"), wasted_bytes)];
        let result = compute_waste_with_graph(&items, &graph, &simulator(), "test").unwrap();
        assert_eq!(result.load_before, result.load_after);
        assert_eq!(compute_waste_with_tti_graph(&items, &graph, &simulator(), true).unwrap(), 0.0);

        let product = create_audit_product(items.to_vec(), 0.0, Vec::new());
        assert_eq!(product.details.overall_savings_bytes, 0.0);
    }

    #[test]
    fn test_unmatched_urls_change_nothing() {
        let graph = graph();
        let items = [item("https://other.example/unused.css", 50_000.0)];
        let result = compute_waste_with_graph(&items, &graph, &simulator(), "test").unwrap();
        assert_eq!(result.load_before, result.load_after);
    }

    #[test]
    fn test_items_sorted_by_wasted_bytes() {
        let product = create_audit_product(
            vec![item("a", 10.0), item("b", 3_000.0), item("c", 200.0)],
            0.0,
            Vec::new(),
        );
        let urls: Vec<&str> = product.details.items.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["b", "c", "a"]);
        assert_eq!(product.details.overall_savings_bytes, 3_210.0);
        assert_eq!(product.score, 1.0);
    }

    proptest! {
        #[test]
        fn prop_more_waste_never_saves_less(a in 0.0f64..200_000.0, b in 0.0f64..200_000.0) {
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let graph = graph();
            let url = format!("{ORIGIN}/app.js");
            let low = compute_waste_with_graph(&[item(&url, low)], &graph, &simulator(), "low").unwrap();
            let high = compute_waste_with_graph(&[item(&url, high)], &graph, &simulator(), "high").unwrap();
            prop_assert!(high.load_savings() >= low.load_savings() - 1e-6);
            prop_assert!(low.load_savings() >= -1e-6);
        }
    }
}
