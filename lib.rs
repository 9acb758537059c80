/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Lantern: page-load simulation over a dependency graph.
//!
//! A captured page load (trace events plus network records) is turned into a
//! DAG of network requests and main-thread tasks, then replayed under
//! simulated network and CPU throttling. Metrics and opportunity audits ask
//! how that replay changes when bytes or dependencies are removed.
//!
//! - `model`: input records and trace events
//! - `graph`: the dependency graph and its node types
//! - `builder`: builds the page graph from a trace and network records
//! - `simulator`: connection pool, TCP model and the discrete-event replay
//! - `config`: throttling settings
//! - `metrics`: simulated FCP, LCP and Interactive
//! - `audits`: byte-efficiency and dependency-reordering opportunities

pub mod audits;
pub mod builder;
pub mod config;
pub mod graph;
pub mod metrics;
pub mod model;
pub mod simulator;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
