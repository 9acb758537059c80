/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use super::cpu_node::CpuNode;
use super::network_node::NetworkNode;
use crate::model::{NetworkRequest, TraceEvent};

/// Discriminant of a node, for places that only need to branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Network,
    Cpu,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Network(NetworkNode),
    Cpu(CpuNode),
}

/// A vertex of the page dependency graph. Edges live in the owning
/// `DependencyGraph`, so cloning a `Node` copies intrinsic data only.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique within a graph.
    pub id: String,
    pub is_main_document: bool,
    pub kind: NodeKind,
}

impl Node {
    pub fn network(record: NetworkRequest) -> Self {
        Self {
            id: record.request_id.clone(),
            is_main_document: false,
            kind: NodeKind::Network(NetworkNode::new(record)),
        }
    }

    pub fn cpu(event: TraceEvent, child_events: Vec<TraceEvent>) -> Self {
        Self {
            id: format!("{}.{}", event.tid, event.ts),
            is_main_document: false,
            kind: NodeKind::Cpu(CpuNode::new(event, child_events)),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Network(_) => NodeType::Network,
            NodeKind::Cpu(_) => NodeType::Cpu,
        }
    }

    /// Microseconds.
    pub fn start_time(&self) -> f64 {
        match &self.kind {
            NodeKind::Network(network) => network.record().start_time_us(),
            NodeKind::Cpu(cpu) => cpu.event().ts,
        }
    }

    /// Microseconds; `None` for a request that never finished.
    pub fn end_time(&self) -> Option<f64> {
        match &self.kind {
            NodeKind::Network(network) => network.record().end_time_us(),
            NodeKind::Cpu(cpu) => Some(cpu.event().end_time()),
        }
    }

    pub fn as_network(&self) -> Option<&NetworkNode> {
        match &self.kind {
            NodeKind::Network(network) => Some(network),
            NodeKind::Cpu(_) => None,
        }
    }

    pub fn as_network_mut(&mut self) -> Option<&mut NetworkNode> {
        match &mut self.kind {
            NodeKind::Network(network) => Some(network),
            NodeKind::Cpu(_) => None,
        }
    }

    pub fn as_cpu(&self) -> Option<&CpuNode> {
        match &self.kind {
            NodeKind::Cpu(cpu) => Some(cpu),
            NodeKind::Network(_) => None,
        }
    }

    pub fn record(&self) -> Option<&NetworkRequest> {
        self.as_network().map(NetworkNode::record)
    }

    /// Copy of the intrinsic data only. Edges live in the owning
    /// `DependencyGraph`, so a plain clone of either variant carries none.
    pub fn clone_without_relationships(&self) -> Node {
        self.clone()
    }
}
