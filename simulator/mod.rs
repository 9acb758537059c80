/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Discrete-event replay of a page dependency graph.
//!
//! Network nodes contend for per-origin TCP connections and a shared
//! throughput budget; CPU nodes run one at a time on a single main-thread
//! lane. A run is a pure function of the graph and the simulator options:
//! all per-run state lives inside [`Simulator::simulate`], so one simulator
//! can serve any number of runs, including concurrent ones.

use std::collections::HashMap;

use log::debug;
use serde::Serialize;

use crate::config::{
    DEVTOOLS_RTT_ADJUSTMENT_FACTOR, DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR, Settings,
    ThrottlingMethod,
};
use crate::graph::{CycleDirection, DependencyGraph, GraphError, Node, NodeKey, NodeKind, NodeType};
use crate::model::NetworkRequest;

pub mod connection_pool;
pub mod dns_cache;
pub mod network_analyzer;
pub mod tcp_connection;

use connection_pool::ConnectionPool;
use dns_cache::DnsCache;
pub use network_analyzer::NetworkAnalysis;
pub use tcp_connection::{ConnectionTiming, TcpConnection};

pub const DEFAULT_MAXIMUM_CONCURRENT_REQUESTS: usize = 10;
pub const DEFAULT_LAYOUT_TASK_MULTIPLIER: f64 = 0.5;
/// CPU tasks are capped at this many milliseconds.
pub const DEFAULT_MAXIMUM_CPU_TASK_DURATION: f64 = 10_000.0;
const MAXIMUM_ITERATIONS: usize = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub enum SimulationError {
    Graph(GraphError),
    NoConnectionForOrigin(String),
    /// No ready node could start even with flexible ordering.
    FailedToStartNode,
    DepthExceeded,
    InvalidOptions(String),
    NoTimingInformation { id: String },
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulationError::Graph(e) => write!(f, "{e}"),
            SimulationError::NoConnectionForOrigin(origin) => {
                write!(f, "could not find a connection for origin {origin}")
            }
            SimulationError::FailedToStartNode => write!(f, "failed to start a node"),
            SimulationError::DepthExceeded => write!(f, "simulation failed, depth exceeded"),
            SimulationError::InvalidOptions(reason) => {
                write!(f, "invalid simulator options: {reason}")
            }
            SimulationError::NoTimingInformation { id } => {
                write!(f, "no timing information for node {id}")
            }
        }
    }
}

impl std::error::Error for SimulationError {}

impl From<GraphError> for SimulationError {
    fn from(e: GraphError) -> Self {
        SimulationError::Graph(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorOptions {
    /// Milliseconds.
    pub rtt: f64,
    /// Bits per second.
    pub throughput: f64,
    pub maximum_concurrent_requests: usize,
    pub cpu_slowdown_multiplier: f64,
    /// Applied on top of `cpu_slowdown_multiplier` for tasks that laid out.
    pub layout_task_multiplier: f64,
    pub additional_rtt_by_origin: HashMap<String, f64>,
    pub server_response_time_by_origin: HashMap<String, f64>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        let throttling = crate::config::ThrottlingSettings::mobile_slow_4g();
        Self {
            rtt: throttling.rtt_ms,
            throughput: throttling.throughput_kbps * 1024.0,
            maximum_concurrent_requests: DEFAULT_MAXIMUM_CONCURRENT_REQUESTS,
            cpu_slowdown_multiplier: throttling.cpu_slowdown_multiplier,
            layout_task_multiplier: DEFAULT_LAYOUT_TASK_MULTIPLIER,
            additional_rtt_by_origin: HashMap::new(),
            server_response_time_by_origin: HashMap::new(),
        }
    }
}

impl SimulatorOptions {
    /// Map run settings and the observed network onto simulator options.
    pub fn from_settings(settings: &Settings, analysis: &NetworkAnalysis) -> Self {
        let mut options = Self {
            additional_rtt_by_origin: analysis.additional_rtt_by_origin.clone(),
            server_response_time_by_origin: analysis.server_response_time_by_origin.clone(),
            ..Self::default()
        };
        if let Some(precomputed) = &settings.precomputed_lantern_data {
            options.additional_rtt_by_origin = precomputed.additional_rtt_by_origin.clone();
            options.server_response_time_by_origin =
                precomputed.server_response_time_by_origin.clone();
        }

        let throttling = &settings.throttling;
        match settings.throttling_method {
            ThrottlingMethod::Provided => {
                if analysis.rtt > 0.0 {
                    options.rtt = analysis.rtt;
                }
                options.throughput = analysis.throughput;
                options.cpu_slowdown_multiplier = 1.0;
                options.layout_task_multiplier = 1.0;
            }
            ThrottlingMethod::Devtools => {
                options.rtt = throttling.request_latency_ms / DEVTOOLS_RTT_ADJUSTMENT_FACTOR;
                options.throughput = throttling.download_throughput_kbps * 1024.0
                    / DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR;
                options.cpu_slowdown_multiplier = 1.0;
                options.layout_task_multiplier = 1.0;
            }
            ThrottlingMethod::Simulate => {
                options.rtt = throttling.rtt_ms;
                options.throughput = throttling.throughput_kbps * 1024.0;
                options.cpu_slowdown_multiplier = throttling.cpu_slowdown_multiplier;
            }
        }
        options
    }
}

/// Per-run knobs.
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    /// Diagnostics only.
    pub label: Option<String>,
    /// Let ready network requests take any idle connection, ignoring whether
    /// the request was observed on a warm or cold one.
    pub flexible_ordering: bool,
}

impl SimulationOptions {
    pub fn labeled(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            flexible_ordering: false,
        }
    }

    pub fn flexible(mut self) -> Self {
        self.flexible_ordering = true;
        self
    }
}

/// Simulated timing of one node, in milliseconds from simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodeTiming {
    pub queued_time: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub connection_timing: Option<ConnectionTiming>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimulationResult {
    /// End of the last node to finish.
    pub time_in_ms: f64,
    /// Sorted by start time.
    pub node_timings: Vec<(NodeKey, NodeTiming)>,
    pub warnings: Vec<String>,
}

impl SimulationResult {
    pub fn timing(&self, key: NodeKey) -> Option<&NodeTiming> {
        self.node_timings
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, timing)| timing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    NotReadyToStart,
    ReadyToStart,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Default)]
struct TimingState {
    queued_time: f64,
    start_time: f64,
    end_time: f64,
    time_elapsed: f64,
    time_elapsed_overshoot: f64,
    bytes_downloaded: f64,
    estimated_time_elapsed: f64,
    connection_timing: Option<ConnectionTiming>,
}

#[derive(Debug, Clone)]
pub struct Simulator {
    options: SimulatorOptions,
    maximum_concurrent_requests: usize,
    layout_task_multiplier: f64,
}

impl Simulator {
    pub fn new(options: SimulatorOptions) -> Result<Self, SimulationError> {
        if !(options.rtt > 0.0 && options.rtt.is_finite()) {
            return Err(SimulationError::InvalidOptions(format!(
                "rtt must be positive, got {}",
                options.rtt
            )));
        }
        if !(options.throughput > 0.0) {
            return Err(SimulationError::InvalidOptions(format!(
                "throughput must be positive, got {}",
                options.throughput
            )));
        }

        let saturated = TcpConnection::maximum_saturated_connections(options.rtt, options.throughput);
        let maximum_concurrent_requests = saturated
            .min(options.maximum_concurrent_requests as f64)
            .max(1.0) as usize;
        let layout_task_multiplier = options.cpu_slowdown_multiplier * options.layout_task_multiplier;

        Ok(Self {
            options,
            maximum_concurrent_requests,
            layout_task_multiplier,
        })
    }

    pub fn from_settings(settings: &Settings, analysis: &NetworkAnalysis) -> Result<Self, SimulationError> {
        Self::new(SimulatorOptions::from_settings(settings, analysis))
    }

    pub fn options(&self) -> &SimulatorOptions {
        &self.options
    }

    pub fn rtt(&self) -> f64 {
        self.options.rtt
    }

    pub fn maximum_concurrent_requests(&self) -> usize {
        self.maximum_concurrent_requests
    }

    /// Replay `graph` from its root. Deterministic for a given graph and
    /// options.
    pub fn simulate(
        &self,
        graph: &DependencyGraph,
        options: SimulationOptions,
    ) -> Result<SimulationResult, SimulationError> {
        let Ok(root) = graph.root() else {
            return Ok(SimulationResult {
                warnings: vec!["Cannot simulate an empty graph".to_string()],
                ..SimulationResult::default()
            });
        };
        if graph.has_cycle(root, CycleDirection::Both) {
            return Err(GraphError::CycleDetected.into());
        }

        let mut run = SimulationRun::new(self, graph, root, options.flexible_ordering)?;
        let result = run.execute(root)?;
        debug!(
            "Simulated {} ({} nodes): {:.0}ms",
            options.label.as_deref().unwrap_or("graph"),
            result.node_timings.len(),
            result.time_in_ms
        );
        Ok(result)
    }

    /// Ordering key for ready nodes; network requests are pushed back by
    /// their priority penalty.
    fn node_start_position(node: &Node) -> f64 {
        match &node.kind {
            NodeKind::Cpu(_) => node.start_time(),
            NodeKind::Network(network) => {
                node.start_time() + network.record().priority.start_time_penalty_secs() * 1_000_000.0
            }
        }
    }
}

/// Mutable state of a single `simulate` call.
struct SimulationRun<'a> {
    simulator: &'a Simulator,
    graph: &'a DependencyGraph,
    flexible_ordering: bool,
    dns: DnsCache,
    pool: ConnectionPool,
    states: HashMap<NodeKey, NodeState>,
    timings: HashMap<NodeKey, TimingState>,
    /// Nodes in the order they became ready, for stable result ordering.
    timing_order: Vec<NodeKey>,
    ready_by_start_position: Vec<(f64, NodeKey)>,
    in_progress: Vec<NodeKey>,
    in_progress_network: usize,
    in_progress_cpu: usize,
    not_ready_count: usize,
}

impl<'a> SimulationRun<'a> {
    fn new(
        simulator: &'a Simulator,
        graph: &'a DependencyGraph,
        root: NodeKey,
        flexible_ordering: bool,
    ) -> Result<Self, SimulationError> {
        let reachable = graph.reachable_from(root);
        let records: Vec<&NetworkRequest> = reachable
            .iter()
            .filter_map(|&key| graph.get_node(key).and_then(Node::record))
            .collect();
        let pool = ConnectionPool::new(&records, &simulator.options)?;

        let states = reachable
            .iter()
            .map(|&key| (key, NodeState::NotReadyToStart))
            .collect();

        Ok(Self {
            simulator,
            graph,
            flexible_ordering,
            dns: DnsCache::new(simulator.options.rtt),
            pool,
            states,
            timings: HashMap::new(),
            timing_order: Vec::new(),
            ready_by_start_position: Vec::new(),
            in_progress: Vec::new(),
            in_progress_network: 0,
            in_progress_cpu: 0,
            not_ready_count: reachable.len(),
        })
    }

    fn node(&self, key: NodeKey) -> Result<&'a Node, SimulationError> {
        Ok(self.graph.node(key)?)
    }

    fn timing_mut(&mut self, key: NodeKey) -> Result<&mut TimingState, SimulationError> {
        let graph = self.graph;
        self.timings
            .get_mut(&key)
            .ok_or_else(|| SimulationError::NoTimingInformation {
                id: graph.get_node(key).map(|node| node.id.clone()).unwrap_or_default(),
            })
    }

    fn execute(&mut self, root: NodeKey) -> Result<SimulationResult, SimulationError> {
        let mut total_elapsed_time = 0.0;
        let mut iteration = 0;
        self.mark_ready(root, total_elapsed_time)?;

        while !self.ready_by_start_position.is_empty() || !self.in_progress.is_empty() {
            let ready: Vec<NodeKey> = self.ready_by_start_position.iter().map(|(_, k)| *k).collect();
            for key in ready {
                self.start_node_if_possible(key, total_elapsed_time)?;
            }

            if self.in_progress.is_empty() {
                if self.flexible_ordering {
                    return Err(SimulationError::FailedToStartNode);
                }
                self.flexible_ordering = true;
                continue;
            }

            self.update_network_capacity();
            let minimum_time = self.find_next_node_completion_time()?;
            total_elapsed_time += minimum_time;

            if !minimum_time.is_finite() || iteration > MAXIMUM_ITERATIONS {
                return Err(SimulationError::DepthExceeded);
            }
            iteration += 1;

            let in_progress = self.in_progress.clone();
            for key in in_progress {
                self.update_progress_made_in_time_period(key, minimum_time, total_elapsed_time)?;
            }
        }

        if self.not_ready_count != 0 {
            return Err(GraphError::CycleDetected.into());
        }

        Ok(SimulationResult {
            time_in_ms: total_elapsed_time,
            node_timings: self.final_node_timings(),
            warnings: Vec::new(),
        })
    }

    fn final_node_timings(&self) -> Vec<(NodeKey, NodeTiming)> {
        let mut timings: Vec<(NodeKey, NodeTiming)> = self
            .timing_order
            .iter()
            .filter_map(|key| {
                let state = self.timings.get(key)?;
                Some((
                    *key,
                    NodeTiming {
                        queued_time: state.queued_time,
                        start_time: state.start_time,
                        end_time: state.end_time,
                        duration: state.end_time - state.start_time,
                        connection_timing: state.connection_timing,
                    },
                ))
            })
            .collect();
        timings.sort_by(|a, b| a.1.start_time.total_cmp(&b.1.start_time));
        timings
    }

    fn mark_ready(&mut self, key: NodeKey, queued_time: f64) -> Result<(), SimulationError> {
        let position = Simulator::node_start_position(self.node(key)?);
        let index = self
            .ready_by_start_position
            .iter()
            .position(|(other, _)| *other > position)
            .unwrap_or(self.ready_by_start_position.len());
        self.ready_by_start_position.insert(index, (position, key));

        self.states.insert(key, NodeState::ReadyToStart);
        self.not_ready_count = self.not_ready_count.saturating_sub(1);
        self.timing_order.push(key);
        self.timings.insert(
            key,
            TimingState {
                queued_time,
                ..TimingState::default()
            },
        );
        Ok(())
    }

    fn mark_in_progress(&mut self, key: NodeKey, start_time: f64) -> Result<(), SimulationError> {
        self.ready_by_start_position.retain(|(_, k)| *k != key);
        self.states.insert(key, NodeState::InProgress);
        self.in_progress.push(key);
        match self.node(key)?.node_type() {
            NodeType::Network => self.in_progress_network += 1,
            NodeType::Cpu => self.in_progress_cpu += 1,
        }
        self.timing_mut(key)?.start_time = start_time;
        Ok(())
    }

    fn mark_complete(
        &mut self,
        key: NodeKey,
        end_time: f64,
        connection_timing: Option<ConnectionTiming>,
    ) -> Result<(), SimulationError> {
        self.states.insert(key, NodeState::Complete);
        self.in_progress.retain(|k| *k != key);
        match self.node(key)?.node_type() {
            NodeType::Network => self.in_progress_network -= 1,
            NodeType::Cpu => self.in_progress_cpu -= 1,
        }
        let timing = self.timing_mut(key)?;
        timing.end_time = end_time;
        timing.connection_timing = connection_timing;

        for dependent in self.graph.dependents(key) {
            let all_complete = self
                .graph
                .dependencies(dependent)
                .iter()
                .all(|dep| self.states.get(dep) == Some(&NodeState::Complete));
            if all_complete {
                self.mark_ready(dependent, end_time)?;
            }
        }
        Ok(())
    }

    fn start_node_if_possible(&mut self, key: NodeKey, total_elapsed_time: f64) -> Result<(), SimulationError> {
        let node = self.node(key)?;
        let network = match &node.kind {
            NodeKind::Cpu(_) => {
                if self.in_progress_cpu == 0 {
                    self.mark_in_progress(key, total_elapsed_time)?;
                }
                return Ok(());
            }
            NodeKind::Network(network) => network,
        };

        if !network.is_connectionless() {
            if self.in_progress_network >= self.simulator.maximum_concurrent_requests {
                return Ok(());
            }
            let ignore_connection_reused = self.flexible_ordering;
            if self
                .pool
                .acquire(key, network.record(), ignore_connection_reused)
                .is_none()
            {
                return Ok(());
            }
        }
        self.mark_in_progress(key, total_elapsed_time)
    }

    fn update_network_capacity(&mut self) {
        if self.in_progress_network == 0 {
            return;
        }
        let throughput = self.simulator.options.throughput / self.in_progress_network as f64;
        for connection in self.pool.connections_in_use_mut() {
            connection.set_throughput(throughput);
        }
    }

    fn find_next_node_completion_time(&mut self) -> Result<f64, SimulationError> {
        let mut minimum_time = f64::INFINITY;
        let in_progress = self.in_progress.clone();
        for key in in_progress {
            minimum_time = minimum_time.min(self.estimate_time_remaining(key)?);
        }
        Ok(minimum_time)
    }

    fn estimate_time_remaining(&mut self, key: NodeKey) -> Result<f64, SimulationError> {
        let node = self.node(key)?;
        match &node.kind {
            NodeKind::Cpu(cpu) => {
                let multiplier = if cpu.did_perform_layout() {
                    self.simulator.layout_task_multiplier
                } else {
                    self.simulator.options.cpu_slowdown_multiplier
                };
                let total_duration = (cpu.duration() / 1000.0 * multiplier)
                    .round()
                    .min(DEFAULT_MAXIMUM_CPU_TASK_DURATION);
                let timing = self.timing_mut(key)?;
                let estimated = total_duration - timing.time_elapsed;
                timing.estimated_time_elapsed = estimated;
                Ok(estimated)
            }
            NodeKind::Network(network) => {
                let record = network.record();
                let (time_elapsed, start_time, bytes_downloaded, overshoot) = {
                    let timing = self.timing_mut(key)?;
                    (
                        timing.time_elapsed,
                        timing.start_time,
                        timing.bytes_downloaded,
                        timing.time_elapsed_overshoot,
                    )
                };

                let remaining = if network.from_disk_cache() {
                    let size_in_mb = record.resource_size as f64 / 1024.0 / 1024.0;
                    8.0 + 20.0 * size_in_mb - time_elapsed
                } else if network.is_non_network_protocol() {
                    let size_in_mb = record.resource_size as f64 / 1024.0 / 1024.0;
                    2.0 + 10.0 * size_in_mb - time_elapsed
                } else {
                    let dns_resolution_time =
                        self.dns.time_until_resolution(&record.host(), start_time, true);
                    let connection = self.pool.active_connection_mut(key).ok_or_else(|| {
                        SimulationError::NoConnectionForOrigin(record.security_origin())
                    })?;
                    connection
                        .simulate_download_until(
                            record.transfer_size as f64 - bytes_downloaded,
                            time_elapsed,
                            f64::INFINITY,
                            dns_resolution_time,
                        )
                        .time_elapsed
                };

                let estimated = remaining + overshoot;
                self.timing_mut(key)?.estimated_time_elapsed = estimated;
                Ok(estimated)
            }
        }
    }

    fn update_progress_made_in_time_period(
        &mut self,
        key: NodeKey,
        time_period_length: f64,
        total_elapsed_time: f64,
    ) -> Result<(), SimulationError> {
        let node = self.node(key)?;
        let (is_finished, start_time, time_elapsed, overshoot, bytes_downloaded) = {
            let timing = self.timing_mut(key)?;
            (
                timing.estimated_time_elapsed == time_period_length,
                timing.start_time,
                timing.time_elapsed,
                timing.time_elapsed_overshoot,
                timing.bytes_downloaded,
            )
        };

        let network = match &node.kind {
            NodeKind::Network(network) if !network.is_connectionless() => network,
            _ => {
                if is_finished {
                    return self.mark_complete(key, total_elapsed_time, None);
                }
                self.timing_mut(key)?.time_elapsed += time_period_length;
                return Ok(());
            }
        };

        let record = network.record();
        let dns_resolution_time = self.dns.time_until_resolution(&record.host(), start_time, true);
        let connection = self
            .pool
            .active_connection_mut(key)
            .ok_or_else(|| SimulationError::NoConnectionForOrigin(record.security_origin()))?;
        let calculation = connection.simulate_download_until(
            record.transfer_size as f64 - bytes_downloaded,
            time_elapsed,
            time_period_length - overshoot,
            dns_resolution_time,
        );
        connection.set_congestion_window(calculation.congestion_window);
        connection.set_h2_overflow_bytes_downloaded(calculation.extra_bytes_downloaded);

        if is_finished {
            connection.set_warmed(true);
            self.pool.release(key);
            return self.mark_complete(key, total_elapsed_time, Some(calculation.connection_timing));
        }

        let timing = self.timing_mut(key)?;
        timing.time_elapsed += calculation.time_elapsed;
        timing.time_elapsed_overshoot += calculation.time_elapsed - time_period_length;
        timing.bytes_downloaded += calculation.bytes_downloaded;
        Ok(())
    }
}
