/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use super::first_contentful_paint::{PaintCut, first_paint_based_graph};
use super::{Coefficients, LanternMetric, MetricError, MetricResult};
use crate::builder::PageGraph;
use crate::graph::{CpuNode, DependencyGraph, Node};
use crate::model::{ProcessedTrace, ResourcePriority, ResourceType};
use crate::simulator::{SimulationResult, Simulator};

/// Low priority images are assumed offscreen and cannot be the LCP element.
pub fn is_not_low_priority_image(node: &Node) -> bool {
    let Some(record) = node.record() else {
        return true;
    };
    let is_image = record.resource_type == Some(ResourceType::Image);
    let is_low_priority = matches!(record.priority, ResourcePriority::Low | ResourcePriority::VeryLow);
    !is_image || !is_low_priority
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LargestContentfulPaint;

impl LargestContentfulPaint {
    fn cutoff(trace: &ProcessedTrace) -> Result<f64, MetricError> {
        trace
            .timestamps
            .largest_contentful_paint
            .ok_or(MetricError::NoLargestContentfulPaint)
    }

    /// Simulate LCP and floor every estimate by the matching FCP estimate.
    pub fn compute_with_floor(
        &self,
        page: &PageGraph,
        trace: &ProcessedTrace,
        simulator: &Simulator,
        first_contentful_paint: &MetricResult,
    ) -> Result<MetricResult, MetricError> {
        let mut result = self.compute(page, trace, simulator)?;
        result.timing = result.timing.max(first_contentful_paint.timing);
        result.optimistic_estimate.time_in_ms = result
            .optimistic_estimate
            .time_in_ms
            .max(first_contentful_paint.optimistic_estimate.time_in_ms);
        result.pessimistic_estimate.time_in_ms = result
            .pessimistic_estimate
            .time_in_ms
            .max(first_contentful_paint.pessimistic_estimate.time_in_ms);
        Ok(result)
    }
}

impl LanternMetric for LargestContentfulPaint {
    fn name(&self) -> &'static str {
        "LargestContentfulPaint"
    }

    fn coefficients(&self) -> Coefficients {
        Coefficients {
            intercept: 0.0,
            optimistic: 0.5,
            pessimistic: 0.5,
        }
    }

    fn optimistic_graph(&self, page: &PageGraph, trace: &ProcessedTrace) -> Result<DependencyGraph, MetricError> {
        first_paint_based_graph(
            page,
            PaintCut {
                cutoff: Self::cutoff(trace)?,
                treat_as_render_blocking: &is_not_low_priority_image,
                additional_blocking_cpu: None,
            },
        )
    }

    /// Everything that finished before LCP, and every task that laid out.
    fn pessimistic_graph(&self, page: &PageGraph, trace: &ProcessedTrace) -> Result<DependencyGraph, MetricError> {
        first_paint_based_graph(
            page,
            PaintCut {
                cutoff: Self::cutoff(trace)?,
                treat_as_render_blocking: &|_: &Node| true,
                additional_blocking_cpu: Some(&|cpu: &CpuNode| cpu.did_perform_layout()),
            },
        )
    }

    fn estimate_from_simulation(
        &self,
        graph: &DependencyGraph,
        mut simulation: SimulationResult,
        _optimistic: bool,
    ) -> SimulationResult {
        simulation.time_in_ms = simulation
            .node_timings
            .iter()
            .filter(|(key, _)| graph.get_node(*key).is_some_and(is_not_low_priority_image))
            .map(|(_, timing)| timing.end_time)
            .fold(f64::NEG_INFINITY, f64::max);
        simulation
    }
}
