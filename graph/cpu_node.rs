/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::TraceEvent;

/// A top-level main-thread task and the events nested inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuNode {
    event: Arc<TraceEvent>,
    child_events: Arc<Vec<TraceEvent>>,
}

impl CpuNode {
    pub fn new(event: TraceEvent, child_events: Vec<TraceEvent>) -> Self {
        Self {
            event: Arc::new(event),
            child_events: Arc::new(child_events),
        }
    }

    pub fn event(&self) -> &TraceEvent {
        &self.event
    }

    pub fn child_events(&self) -> &[TraceEvent] {
        &self.child_events
    }

    /// Microseconds.
    pub fn duration(&self) -> f64 {
        self.event.dur.unwrap_or(0.0)
    }

    pub fn did_perform_layout(&self) -> bool {
        self.child_events.iter().any(|event| event.name == "Layout")
    }

    /// URLs of every script this task evaluated.
    pub fn evaluate_script_urls(&self) -> HashSet<&str> {
        self.child_events
            .iter()
            .filter(|event| event.name == "EvaluateScript")
            .filter_map(|event| event.data().and_then(|data| data.url.as_deref()))
            .collect()
    }

    pub fn is_evaluate_script_for(&self, urls: &HashSet<String>) -> bool {
        self.evaluate_script_urls()
            .into_iter()
            .any(|url| urls.contains(url))
    }
}
