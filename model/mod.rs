/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Input records captured from a page load.
//!
//! - `network_request`: one record per network request, as seen by the protocol
//! - `network_log`: folds DevTools `Network.*` events into request records
//! - `trace`: timeline events and the main-thread view of a navigation

pub mod network_log;
pub mod network_request;
pub mod trace;

pub use network_log::{NetworkLogEntry, NetworkRecorder};
pub use network_request::{
    CallFrame, Initiator, InitiatorType, NetworkRequest, ResourcePriority, ResourceTiming,
    ResourceType, StackTrace,
};
pub use trace::{
    NavigationTimestamps, ProcessedTrace, TraceArgs, TraceEvent, TraceEventData, TraceFile,
};
