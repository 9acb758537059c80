/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::{BTreeMap, HashMap};

use super::network_analyzer::{estimate_if_connection_was_reused, group_by_origin};
use super::tcp_connection::TcpConnection;
use super::{SimulationError, SimulatorOptions};
use crate::graph::NodeKey;
use crate::model::NetworkRequest;

/// Server think time when nothing is known about an origin.
pub const DEFAULT_SERVER_RESPONSE_TIME: f64 = 30.0;

/// Browser cap on parallel http/1.1 connections to one origin.
pub const CONNECTIONS_PER_ORIGIN: usize = 6;

#[derive(Debug, Clone)]
struct PooledConnection {
    connection: TcpConnection,
    in_use: bool,
}

/// The TCP connections available to one simulation run, grouped by origin.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    connections_by_origin: BTreeMap<String, Vec<PooledConnection>>,
    /// Node → (origin, index) of the connection it holds.
    active: HashMap<NodeKey, (String, usize)>,
    reused_by_request_id: HashMap<String, bool>,
}

impl ConnectionPool {
    /// One cold connection per request that did not reuse a connection, then
    /// topped up to the per-origin minimum (one for h2).
    pub fn new(records: &[&NetworkRequest], options: &SimulatorOptions) -> Result<Self, SimulationError> {
        let reused_by_request_id = estimate_if_connection_was_reused(records, true);
        let mut connections_by_origin = BTreeMap::new();

        for (origin, origin_records) in group_by_origin(records) {
            let additional_rtt = options
                .additional_rtt_by_origin
                .get(&origin)
                .copied()
                .unwrap_or(0.0);
            let response_time = options
                .server_response_time_by_origin
                .get(&origin)
                .copied()
                .unwrap_or(DEFAULT_SERVER_RESPONSE_TIME);

            let mut connections: Vec<PooledConnection> = origin_records
                .iter()
                .filter(|record| !reused_by_request_id.get(&record.request_id).copied().unwrap_or(false))
                .map(|record| PooledConnection {
                    connection: TcpConnection::new(
                        options.rtt + additional_rtt,
                        options.throughput,
                        response_time,
                        record.is_secure(),
                        record.is_h2(),
                    ),
                    in_use: false,
                })
                .collect();

            let Some(first) = connections.first().cloned() else {
                return Err(SimulationError::NoConnectionForOrigin(origin));
            };
            let minimum_connections = if first.connection.is_h2() {
                1
            } else {
                CONNECTIONS_PER_ORIGIN
            };
            while connections.len() < minimum_connections {
                connections.push(first.clone());
            }
            connections_by_origin.insert(origin, connections);
        }

        Ok(Self {
            connections_by_origin,
            active: HashMap::new(),
            reused_by_request_id,
        })
    }

    /// Claim an idle connection for `key`, preferring the widest congestion
    /// window. Unless `ignore_connection_reused`, the connection's warmth must
    /// match whether the request was observed to reuse one.
    pub fn acquire(
        &mut self,
        key: NodeKey,
        record: &NetworkRequest,
        ignore_connection_reused: bool,
    ) -> Option<&mut TcpConnection> {
        if self.active.contains_key(&key) {
            return None;
        }
        let origin = record.security_origin();
        let observed_reuse = self
            .reused_by_request_id
            .get(&record.request_id)
            .copied()
            .unwrap_or(false);

        let connections = self.connections_by_origin.get_mut(&origin)?;
        let mut best: Option<usize> = None;
        for (index, pooled) in connections.iter().enumerate() {
            if !ignore_connection_reused && pooled.connection.is_warm() != observed_reuse {
                continue;
            }
            if pooled.in_use {
                continue;
            }
            let current_max = best
                .map(|i| connections[i].connection.congestion_window())
                .unwrap_or(f64::NEG_INFINITY);
            if pooled.connection.congestion_window() > current_max {
                best = Some(index);
            }
        }

        let index = best?;
        connections[index].in_use = true;
        self.active.insert(key, (origin, index));
        Some(&mut connections[index].connection)
    }

    pub fn active_connection_mut(&mut self, key: NodeKey) -> Option<&mut TcpConnection> {
        let (origin, index) = self.active.get(&key)?;
        self.connections_by_origin
            .get_mut(origin)?
            .get_mut(*index)
            .map(|pooled| &mut pooled.connection)
    }

    pub fn release(&mut self, key: NodeKey) {
        if let Some((origin, index)) = self.active.remove(&key)
            && let Some(pooled) = self
                .connections_by_origin
                .get_mut(&origin)
                .and_then(|connections| connections.get_mut(index))
        {
            pooled.in_use = false;
        }
    }

    pub fn connections_in_use_mut(&mut self) -> impl Iterator<Item = &mut TcpConnection> {
        self.connections_by_origin
            .values_mut()
            .flatten()
            .filter(|pooled| pooled.in_use)
            .map(|pooled| &mut pooled.connection)
    }

    pub fn connection_count(&self, origin: &str) -> usize {
        self.connections_by_origin
            .get(origin)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
