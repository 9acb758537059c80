/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::{HashMap, HashSet};

use super::{Coefficients, LanternMetric, MetricError, script_urls};
use crate::builder::PageGraph;
use crate::graph::{CpuNode, DependencyGraph, Node, NodeKind};
use crate::model::{InitiatorType, ProcessedTrace};

/// Where to cut the graph for a paint metric and what counts as blocking it.
pub struct PaintCut<'a> {
    /// Trace microseconds.
    pub cutoff: f64,
    pub treat_as_render_blocking: &'a dyn Fn(&Node) -> bool,
    pub additional_blocking_cpu: Option<&'a dyn Fn(&CpuNode) -> bool>,
}

struct BlockingData {
    definitely_not_blocking_script_urls: HashSet<String>,
    blocking_cpu_node_ids: HashSet<String>,
}

fn blocking_data(graph: &DependencyGraph, cut: &PaintCut<'_>) -> BlockingData {
    let mut cpu_before_cutoff: Vec<&Node> = Vec::new();
    let mut earliest_evaluation: HashMap<&str, &Node> = HashMap::new();

    for (_, node) in graph.nodes() {
        let Some(cpu) = node.as_cpu() else {
            continue;
        };
        // The paint may happen inside the task that blocked it.
        if node.start_time() <= cut.cutoff {
            cpu_before_cutoff.push(node);
        }
        for url in cpu.evaluate_script_urls() {
            let earliest = earliest_evaluation.entry(url).or_insert(node);
            if node.start_time() < earliest.start_time() {
                *earliest = node;
            }
        }
    }
    cpu_before_cutoff.sort_by(|a, b| a.start_time().total_cmp(&b.start_time()));

    let possibly_blocking = script_urls(graph, |node| {
        node.end_time().is_some_and(|end| end <= cut.cutoff) && (cut.treat_as_render_blocking)(node)
    });

    let mut definitely_not_blocking_script_urls = HashSet::new();
    let mut blocking_cpu_node_ids = HashSet::new();
    for url in possibly_blocking {
        let Some(evaluation) = earliest_evaluation.get(url.as_str()) else {
            continue;
        };
        if cpu_before_cutoff.iter().any(|node| node.id == evaluation.id) {
            blocking_cpu_node_ids.insert(evaluation.id.clone());
        } else {
            definitely_not_blocking_script_urls.insert(url);
        }
    }

    let first_with = |name: &str| {
        cpu_before_cutoff.iter().find(|node| {
            node.as_cpu()
                .is_some_and(|cpu| cpu.child_events().iter().any(|event| event.name == name))
        })
    };
    for name in ["Layout", "Paint", "ParseHTML"] {
        if let Some(node) = first_with(name) {
            blocking_cpu_node_ids.insert(node.id.clone());
        }
    }

    if let Some(extra) = cut.additional_blocking_cpu {
        for node in &cpu_before_cutoff {
            if node.as_cpu().is_some_and(extra) {
                blocking_cpu_node_ids.insert(node.id.clone());
            }
        }
    }

    BlockingData {
        definitely_not_blocking_script_urls,
        blocking_cpu_node_ids,
    }
}

/// Keep the requests that finished before the paint and were blocking it,
/// plus the tasks that had to run first. The root and the main document
/// always stay, whatever their priority.
pub fn first_paint_based_graph(page: &PageGraph, cut: PaintCut<'_>) -> Result<DependencyGraph, MetricError> {
    let data = blocking_data(&page.graph, &cut);
    let root_id = page.graph.node(page.root)?.id.clone();
    let predicate = |node: &Node| match &node.kind {
        NodeKind::Network(network) => {
            if node.is_main_document || node.id == root_id {
                return true;
            }
            let ended_after_paint = node.end_time().is_some_and(|end| end > cut.cutoff)
                || node.start_time() > cut.cutoff;
            if ended_after_paint {
                return false;
            }
            if data
                .definitely_not_blocking_script_urls
                .contains(&network.record().url)
            {
                return false;
            }
            (cut.treat_as_render_blocking)(node)
        }
        NodeKind::Cpu(_) => data.blocking_cpu_node_ids.contains(&node.id),
    };
    let (graph, _) = page.graph.clone_with_relationships(page.root, Some(&predicate))?;
    Ok(graph)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FirstContentfulPaint;

impl FirstContentfulPaint {
    fn cutoff(trace: &ProcessedTrace) -> Result<f64, MetricError> {
        trace
            .timestamps
            .first_contentful_paint
            .ok_or(MetricError::NoFirstContentfulPaint)
    }
}

impl LanternMetric for FirstContentfulPaint {
    fn name(&self) -> &'static str {
        "FirstContentfulPaint"
    }

    fn coefficients(&self) -> Coefficients {
        Coefficients {
            intercept: 0.0,
            optimistic: 0.5,
            pessimistic: 0.5,
        }
    }

    /// Script-initiated resources with blocking priority do not technically
    /// block rendering.
    fn optimistic_graph(&self, page: &PageGraph, trace: &ProcessedTrace) -> Result<DependencyGraph, MetricError> {
        let treat_as_render_blocking = |node: &Node| {
            node.as_network().is_some_and(|network| {
                network.has_render_blocking_priority()
                    && network.initiator_type() != InitiatorType::Script
            })
        };
        first_paint_based_graph(
            page,
            PaintCut {
                cutoff: Self::cutoff(trace)?,
                treat_as_render_blocking: &treat_as_render_blocking,
                additional_blocking_cpu: None,
            },
        )
    }

    fn pessimistic_graph(&self, page: &PageGraph, trace: &ProcessedTrace) -> Result<DependencyGraph, MetricError> {
        let treat_as_render_blocking = |node: &Node| {
            node.as_network()
                .is_some_and(|network| network.has_render_blocking_priority())
        };
        first_paint_based_graph(
            page,
            PaintCut {
                cutoff: Self::cutoff(trace)?,
                treat_as_render_blocking: &treat_as_render_blocking,
                additional_blocking_cpu: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::CycleDirection;
    use crate::model::{
        Initiator, NavigationTimestamps, NetworkRequest, ResourcePriority, ResourceType, TraceArgs,
        TraceEvent, TraceEventData,
    };
    use crate::simulator::{Simulator, SimulatorOptions};

    fn request(id: &str, url: &str, start: f64, end: f64, priority: ResourcePriority) -> Node {
        Node::network(NetworkRequest {
            request_id: id.to_string(),
            url: url.to_string(),
            resource_type: Some(ResourceType::Script),
            priority,
            start_time: start,
            end_time: Some(end),
            transfer_size: 10_000,
            ..NetworkRequest::default()
        })
    }

    fn evaluate(ts: f64, url: &str) -> Node {
        Node::cpu(
            TraceEvent {
                name: "RunTask".to_string(),
                ts,
                dur: Some(20_000.0),
                ..TraceEvent::default()
            },
            vec![TraceEvent {
                name: "EvaluateScript".to_string(),
                ts: ts + 1.0,
                args: TraceArgs {
                    data: Some(TraceEventData {
                        url: Some(url.to_string()),
                        ..TraceEventData::default()
                    }),
                    ..TraceArgs::default()
                },
                ..TraceEvent::default()
            }],
        )
    }

    /// document → {blocking.js → eval, late.js, async.js (script-initiated)}
    fn page() -> PageGraph {
        let mut graph = DependencyGraph::new();
        let mut document = request("doc", "https://example.com/", 0.0, 0.5, ResourcePriority::VeryHigh);
        document.is_main_document = true;
        let root = graph.add_node(document);
        let blocking = graph.add_node(request(
            "blocking",
            "https://example.com/blocking.js",
            0.6,
            0.8,
            ResourcePriority::High,
        ));
        let eval = graph.add_node(evaluate(850_000.0, "https://example.com/blocking.js"));
        let late = graph.add_node(request(
            "late",
            "https://example.com/late.js",
            0.6,
            3.0,
            ResourcePriority::High,
        ));
        let mut scripted = request(
            "scripted",
            "https://example.com/scripted.js",
            0.6,
            0.9,
            ResourcePriority::High,
        );
        if let Some(network) = scripted.as_network_mut() {
            network.record_mut().initiator = Initiator {
                initiator_type: InitiatorType::Script,
                ..Initiator::default()
            };
        }
        let scripted = graph.add_node(scripted);
        for key in [blocking, late, scripted] {
            graph.add_dependency(key, root).unwrap();
        }
        graph.add_dependency(eval, blocking).unwrap();
        PageGraph {
            graph,
            root,
            main_document: root,
            warnings: Vec::new(),
        }
    }

    fn trace() -> ProcessedTrace {
        ProcessedTrace {
            timestamps: NavigationTimestamps {
                navigation_start: 0.0,
                first_contentful_paint: Some(1_000_000.0),
                largest_contentful_paint: Some(2_000_000.0),
            },
            ..ProcessedTrace::default()
        }
    }

    fn ids(graph: &DependencyGraph) -> Vec<String> {
        let mut ids: Vec<String> = graph.nodes().map(|(_, node)| node.id.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_optimistic_graph_drops_script_initiated_and_late_requests() {
        let graph = FirstContentfulPaint.optimistic_graph(&page(), &trace()).unwrap();
        assert_eq!(ids(&graph), vec!["0.850000", "blocking", "doc"]);
    }

    #[test]
    fn test_pessimistic_graph_keeps_script_initiated_requests() {
        let graph = FirstContentfulPaint.pessimistic_graph(&page(), &trace()).unwrap();
        assert_eq!(ids(&graph), vec!["0.850000", "blocking", "doc", "scripted"]);
        assert!(!graph.has_cycle(graph.root().unwrap(), CycleDirection::Both));
    }

    #[test]
    fn test_low_priority_document_is_kept() {
        let mut page = page();
        let root = page.root;
        if let Some(network) = page.graph.get_node_mut(root).and_then(Node::as_network_mut) {
            network.record_mut().priority = ResourcePriority::default();
        }
        let optimistic = FirstContentfulPaint.optimistic_graph(&page, &trace()).unwrap();
        assert!(ids(&optimistic).contains(&"doc".to_string()));
        let pessimistic = FirstContentfulPaint.pessimistic_graph(&page, &trace()).unwrap();
        assert!(ids(&pessimistic).contains(&"doc".to_string()));

        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        assert!(FirstContentfulPaint.compute(&page, &trace(), &simulator).is_ok());
    }

    #[test]
    fn test_missing_fcp_is_an_error() {
        let result = FirstContentfulPaint.optimistic_graph(&page(), &ProcessedTrace::default());
        assert_eq!(result.err(), Some(MetricError::NoFirstContentfulPaint));
    }

    #[test]
    fn test_timing_sits_between_estimates() {
        let simulator = Simulator::new(SimulatorOptions::default()).unwrap();
        let result = FirstContentfulPaint.compute(&page(), &trace(), &simulator).unwrap();
        let low = result.optimistic_estimate.time_in_ms;
        let high = result.pessimistic_estimate.time_in_ms;
        assert!(low <= high);
        assert!(result.timing >= low && result.timing <= high);
    }
}
