/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use super::{Coefficients, LONG_TASK_THRESHOLD_MS, LanternMetric, MetricError, MetricResult, cpu_end_times_over};
use crate::builder::PageGraph;
use crate::graph::{DependencyGraph, Node, NodeKind};
use crate::model::{ProcessedTrace, ResourcePriority, ResourceType};
use crate::simulator::{SimulationResult, Simulator};

/// Tasks at least this long (microseconds) may turn into long tasks once
/// throttled.
const CRITICAL_LONG_TASK_THRESHOLD: f64 = 20_000.0;

/// End of the last simulated CPU task longer than `threshold_ms`, or 0.
pub fn last_long_task_end_time(graph: &DependencyGraph, simulation: &SimulationResult, threshold_ms: f64) -> f64 {
    cpu_end_times_over(graph, simulation, threshold_ms)
        .into_iter()
        .map(|(_, end)| end)
        .fold(0.0, f64::max)
}

/// Lantern Interactive. Estimates are floored by the paint metric the page
/// must reach first.
#[derive(Debug, Clone, Copy)]
pub struct Interactive {
    /// Optimistic and pessimistic floors in milliseconds.
    floor: (f64, f64),
    floor_timing: f64,
}

impl Interactive {
    pub fn floored_by(paint: &MetricResult) -> Self {
        Self {
            floor: (
                paint.optimistic_estimate.time_in_ms,
                paint.pessimistic_estimate.time_in_ms,
            ),
            floor_timing: paint.timing,
        }
    }

    pub fn compute_with_floor(
        &self,
        page: &PageGraph,
        trace: &ProcessedTrace,
        simulator: &Simulator,
    ) -> Result<MetricResult, MetricError> {
        let mut result = self.compute(page, trace, simulator)?;
        result.timing = result.timing.max(self.floor_timing);
        Ok(result)
    }
}

impl LanternMetric for Interactive {
    fn name(&self) -> &'static str {
        "Interactive"
    }

    fn coefficients(&self) -> Coefficients {
        Coefficients {
            intercept: 0.0,
            optimistic: 0.45,
            pessimistic: 0.55,
        }
    }

    /// Anything that might become a long task, every script, and every high
    /// priority request except images. The root and the main document always
    /// stay.
    fn optimistic_graph(&self, page: &PageGraph, _trace: &ProcessedTrace) -> Result<DependencyGraph, MetricError> {
        let root_id = page.graph.node(page.root)?.id.clone();
        let predicate = |node: &Node| match &node.kind {
            NodeKind::Cpu(cpu) => cpu.duration() > CRITICAL_LONG_TASK_THRESHOLD,
            NodeKind::Network(_) if node.is_main_document || node.id == root_id => true,
            NodeKind::Network(network) => {
                let record = network.record();
                let is_image = record.resource_type == Some(ResourceType::Image);
                let is_script = record.resource_type == Some(ResourceType::Script);
                let is_high_priority =
                    matches!(record.priority, ResourcePriority::High | ResourcePriority::VeryHigh);
                !is_image && (is_script || is_high_priority)
            }
        };
        let (graph, _) = page.graph.clone_with_relationships(page.root, Some(&predicate))?;
        Ok(graph)
    }

    fn pessimistic_graph(&self, page: &PageGraph, _trace: &ProcessedTrace) -> Result<DependencyGraph, MetricError> {
        Ok(page.graph.clone())
    }

    fn estimate_from_simulation(
        &self,
        graph: &DependencyGraph,
        mut simulation: SimulationResult,
        optimistic: bool,
    ) -> SimulationResult {
        let floor = if optimistic { self.floor.0 } else { self.floor.1 };
        let last_long_task = last_long_task_end_time(graph, &simulation, LONG_TASK_THRESHOLD_MS);
        simulation.time_in_ms = floor.max(last_long_task);
        simulation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NetworkRequest, TraceEvent};
    use crate::simulator::{SimulationOptions, SimulatorOptions};

    fn request(id: &str, resource_type: ResourceType, priority: ResourcePriority) -> Node {
        Node::network(NetworkRequest {
            request_id: id.to_string(),
            url: format!("https://example.com/{id}"),
            resource_type: Some(resource_type),
            priority,
            start_time: 0.0,
            end_time: Some(0.1),
            transfer_size: 5_000,
            ..NetworkRequest::default()
        })
    }

    fn task(ts: f64, dur_ms: f64) -> Node {
        Node::cpu(
            TraceEvent {
                name: "RunTask".to_string(),
                ts,
                dur: Some(dur_ms * 1000.0),
                ..TraceEvent::default()
            },
            Vec::new(),
        )
    }

    fn page() -> PageGraph {
        let mut graph = DependencyGraph::new();
        let root = graph.add_node(request("doc", ResourceType::Document, ResourcePriority::VeryHigh));
        let image = graph.add_node(request("img", ResourceType::Image, ResourcePriority::High));
        let script = graph.add_node(request("app.js", ResourceType::Script, ResourcePriority::Low));
        let long = graph.add_node(task(500_000.0, 80.0));
        let short = graph.add_node(task(600_000.0, 5.0));
        graph.add_dependency(image, root).unwrap();
        graph.add_dependency(script, root).unwrap();
        graph.add_dependency(long, script).unwrap();
        graph.add_dependency(short, root).unwrap();
        PageGraph {
            graph,
            root,
            main_document: root,
            warnings: Vec::new(),
        }
    }

    fn unfloored() -> Interactive {
        Interactive {
            floor: (0.0, 0.0),
            floor_timing: 0.0,
        }
    }

    #[test]
    fn test_optimistic_graph_keeps_scripts_and_long_tasks() {
        let graph = unfloored()
            .optimistic_graph(&page(), &ProcessedTrace::default())
            .unwrap();
        let mut ids: Vec<String> = graph.nodes().map(|(_, node)| node.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["0.500000", "app.js", "doc"]);
    }

    #[test]
    fn test_low_priority_document_stays_in_optimistic_graph() {
        let mut page = page();
        let root = page.root;
        if let Some(network) = page.graph.get_node_mut(root).and_then(Node::as_network_mut) {
            network.record_mut().priority = ResourcePriority::Low;
        }
        let graph = unfloored()
            .optimistic_graph(&page, &ProcessedTrace::default())
            .unwrap();
        assert!(graph.get_node_key_by_id("doc").is_some());
        assert!(graph.get_node_key_by_id("img").is_none());
    }

    #[test]
    fn test_estimate_is_last_long_task_end() {
        let page = page();
        let simulator = Simulator::new(SimulatorOptions {
            cpu_slowdown_multiplier: 1.0,
            ..SimulatorOptions::default()
        })
        .unwrap();
        let simulation = simulator
            .simulate(&page.graph, SimulationOptions::default())
            .unwrap();
        let long = page.graph.get_node_key_by_id("0.500000").unwrap();
        let long_end = simulation.timing(long).unwrap().end_time;

        let estimate = unfloored().estimate_from_simulation(&page.graph, simulation.clone(), true);
        assert_eq!(estimate.time_in_ms, long_end);

        let floored = Interactive {
            floor: (long_end + 1000.0, 0.0),
            floor_timing: 0.0,
        };
        let estimate = floored.estimate_from_simulation(&page.graph, simulation, true);
        assert_eq!(estimate.time_in_ms, long_end + 1000.0);
    }

    #[test]
    fn test_no_long_tasks_means_zero() {
        let simulation = SimulationResult::default();
        assert_eq!(last_long_task_end_time(&DependencyGraph::new(), &simulation, 50.0), 0.0);
    }
}
