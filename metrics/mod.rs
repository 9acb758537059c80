/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Page-load metrics estimated by simulation.
//!
//! Each metric reduces the page graph twice: an optimistic graph that keeps
//! only what was most likely required, and a pessimistic graph that keeps
//! everything that could have been. The optimistic graph is simulated with
//! both strict and flexible ordering and the faster run wins; the final
//! timing blends both estimates with per-metric coefficients.
//!
//! - `first_contentful_paint`: render-blocking resources and tasks before FCP
//! - `largest_contentful_paint`: the same cut at LCP, floored by FCP
//! - `interactive`: the last long task, floored by LCP

use std::collections::HashSet;

use log::debug;

use crate::builder::PageGraph;
use crate::graph::{DependencyGraph, GraphError, Node, NodeKey, NodeType};
use crate::model::{ProcessedTrace, ResourceType};
use crate::simulator::{SimulationError, SimulationOptions, SimulationResult, Simulator};

pub mod first_contentful_paint;
pub mod interactive;
pub mod largest_contentful_paint;

pub use first_contentful_paint::FirstContentfulPaint;
pub use interactive::{Interactive, last_long_task_end_time};
pub use largest_contentful_paint::LargestContentfulPaint;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricError {
    NoFirstContentfulPaint,
    NoLargestContentfulPaint,
    Graph(GraphError),
    Simulation(SimulationError),
}

impl std::fmt::Display for MetricError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricError::NoFirstContentfulPaint => write!(f, "trace has no first contentful paint"),
            MetricError::NoLargestContentfulPaint => {
                write!(f, "trace has no largest contentful paint")
            }
            MetricError::Graph(e) => write!(f, "{e}"),
            MetricError::Simulation(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MetricError {}

impl From<GraphError> for MetricError {
    fn from(e: GraphError) -> Self {
        MetricError::Graph(e)
    }
}

impl From<SimulationError> for MetricError {
    fn from(e: SimulationError) -> Self {
        MetricError::Simulation(e)
    }
}

/// Weights blending the two estimates into one timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub intercept: f64,
    pub optimistic: f64,
    pub pessimistic: f64,
}

/// A simulated metric bounded by its optimistic and pessimistic runs.
#[derive(Debug, Clone)]
pub struct MetricResult {
    /// Milliseconds.
    pub timing: f64,
    pub optimistic_estimate: SimulationResult,
    pub pessimistic_estimate: SimulationResult,
    pub optimistic_graph: DependencyGraph,
    pub pessimistic_graph: DependencyGraph,
}

pub trait LanternMetric {
    /// Used to label simulations.
    fn name(&self) -> &'static str;

    fn coefficients(&self) -> Coefficients;

    fn optimistic_graph(&self, page: &PageGraph, trace: &ProcessedTrace) -> Result<DependencyGraph, MetricError>;

    fn pessimistic_graph(&self, page: &PageGraph, trace: &ProcessedTrace) -> Result<DependencyGraph, MetricError>;

    /// Turn a raw simulation of `graph` into the metric's estimate.
    fn estimate_from_simulation(
        &self,
        _graph: &DependencyGraph,
        simulation: SimulationResult,
        _optimistic: bool,
    ) -> SimulationResult {
        simulation
    }

    fn compute(
        &self,
        page: &PageGraph,
        trace: &ProcessedTrace,
        simulator: &Simulator,
    ) -> Result<MetricResult, MetricError> {
        let name = self.name();
        let optimistic_graph = self.optimistic_graph(page, trace)?;
        let pessimistic_graph = self.pessimistic_graph(page, trace)?;

        let optimistic = simulator.simulate(
            &optimistic_graph,
            SimulationOptions::labeled(&format!("optimistic{name}")),
        )?;
        let optimistic_flex = simulator.simulate(
            &optimistic_graph,
            SimulationOptions::labeled(&format!("optimisticFlex{name}")).flexible(),
        )?;
        let pessimistic = simulator.simulate(
            &pessimistic_graph,
            SimulationOptions::labeled(&format!("pessimistic{name}")),
        )?;

        let fastest = if optimistic.time_in_ms < optimistic_flex.time_in_ms {
            optimistic
        } else {
            optimistic_flex
        };
        let optimistic_estimate = self.estimate_from_simulation(&optimistic_graph, fastest, true);
        let pessimistic_estimate = self.estimate_from_simulation(&pessimistic_graph, pessimistic, false);

        let timing = blend(
            self.coefficients(),
            optimistic_estimate.time_in_ms,
            pessimistic_estimate.time_in_ms,
        );
        debug!(
            "{name}: {timing:.0}ms (optimistic {:.0}ms, pessimistic {:.0}ms)",
            optimistic_estimate.time_in_ms, pessimistic_estimate.time_in_ms
        );

        Ok(MetricResult {
            timing,
            optimistic_estimate,
            pessimistic_estimate,
            optimistic_graph,
            pessimistic_graph,
        })
    }
}

/// Estimates under one second barely follow the fitted curve, so the
/// intercept fades in over the first second.
pub fn blend(coefficients: Coefficients, optimistic: f64, pessimistic: f64) -> f64 {
    let intercept_multiplier = if coefficients.intercept > 0.0 {
        (optimistic / 1000.0).min(1.0)
    } else {
        1.0
    };
    coefficients.intercept * intercept_multiplier
        + coefficients.optimistic * optimistic
        + coefficients.pessimistic * pessimistic
}

/// URLs of the script requests in `graph` that `filter` accepts.
pub fn script_urls<F>(graph: &DependencyGraph, filter: F) -> HashSet<String>
where
    F: Fn(&Node) -> bool,
{
    graph
        .nodes()
        .filter_map(|(_, node)| Some((node, node.record()?)))
        .filter(|(_, record)| record.resource_type == Some(ResourceType::Script))
        .filter(|(node, _)| filter(node))
        .map(|(_, record)| record.url.clone())
        .collect()
}

/// How a metric was obtained.
#[derive(Debug, Clone)]
pub enum MetricValue {
    Simulated(Box<MetricResult>),
    /// Read straight from the trace, in milliseconds.
    Observed(f64),
}

impl MetricValue {
    pub fn timing(&self) -> f64 {
        match self {
            MetricValue::Simulated(result) => result.timing,
            MetricValue::Observed(timing) => *timing,
        }
    }
}

/// Observed FCP in milliseconds after navigation start.
pub fn observed_first_contentful_paint(trace: &ProcessedTrace) -> Result<f64, MetricError> {
    trace
        .timestamps
        .first_contentful_paint_ms()
        .ok_or(MetricError::NoFirstContentfulPaint)
}

/// Observed LCP in milliseconds after navigation start.
pub fn observed_largest_contentful_paint(trace: &ProcessedTrace) -> Result<f64, MetricError> {
    trace
        .timestamps
        .largest_contentful_paint_ms()
        .ok_or(MetricError::NoLargestContentfulPaint)
}

/// Long tasks last over this many milliseconds.
pub const LONG_TASK_THRESHOLD_MS: f64 = 50.0;
/// Interactive needs this many quiet milliseconds after the last long task.
pub const QUIET_WINDOW_MS: f64 = 5000.0;

/// Observed Interactive: the end of the last long main-thread task before the
/// first quiet window, and never earlier than FCP.
pub fn observed_interactive(trace: &ProcessedTrace) -> Result<f64, MetricError> {
    let first_contentful_paint = observed_first_contentful_paint(trace)?;
    let navigation_start = trace.timestamps.navigation_start;

    let mut long_tasks: Vec<(f64, f64)> = trace
        .main_thread_events
        .iter()
        .filter(|event| event.is_schedulable_task())
        .filter_map(|event| Some((event.ts, event.dur?)))
        .filter(|&(_, dur)| dur / 1000.0 > LONG_TASK_THRESHOLD_MS)
        .map(|(ts, dur)| {
            let start = (ts - navigation_start) / 1000.0;
            (start, start + dur / 1000.0)
        })
        .filter(|&(_, end)| end > first_contentful_paint)
        .collect();
    long_tasks.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut interactive = first_contentful_paint;
    for (start, end) in long_tasks {
        if start - interactive >= QUIET_WINDOW_MS {
            break;
        }
        interactive = interactive.max(end);
    }
    Ok(interactive)
}

/// CPU nodes in a simulation whose duration exceeds
/// `threshold_ms`, with their end times.
pub(crate) fn cpu_end_times_over(
    graph: &DependencyGraph,
    simulation: &SimulationResult,
    threshold_ms: f64,
) -> Vec<(NodeKey, f64)> {
    simulation
        .node_timings
        .iter()
        .filter(|(key, _)| {
            graph
                .get_node(*key)
                .is_some_and(|node| node.node_type() == NodeType::Cpu)
        })
        .filter(|(_, timing)| timing.duration > threshold_ms)
        .map(|(key, timing)| (*key, timing.end_time))
        .collect()
}
