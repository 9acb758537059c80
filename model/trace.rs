/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Timeline trace events and the main-thread view of a navigation.

use log::warn;
use serde::{Deserialize, Serialize};

use super::network_request::CallFrame;

/// Top-level scheduler task names. Anything nested inside one of these becomes
/// part of that task's child event list.
pub const SCHEDULABLE_TASK_NAMES: [&str; 4] = [
    "RunTask",
    "ThreadControllerImpl::RunTask",
    "ThreadControllerImpl::DoWork",
    "TaskQueueManager::ProcessTaskFromWorkQueue",
];

const MAIN_THREAD_NAME: &str = "CrRendererMain";

/// Event-specific payload under `args.data`. Only the fields the graph builder
/// and metrics read are modeled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceEventData {
    pub url: Option<String>,
    pub request_id: Option<String>,
    pub frame: Option<String>,
    pub ready_state: Option<i64>,
    pub timer_id: Option<i64>,
    pub style_sheet_url: Option<String>,
    pub stack_trace: Vec<CallFrame>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceArgs {
    pub data: Option<TraceEventData>,
    /// Thread name on `thread_name` metadata events.
    pub name: Option<String>,
    pub frame: Option<String>,
}

/// One timeline event. `ts` and `dur` are microseconds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceEvent {
    pub name: String,
    pub cat: String,
    pub ph: String,
    pub ts: f64,
    pub dur: Option<f64>,
    pub pid: i64,
    pub tid: i64,
    pub args: TraceArgs,
}

impl TraceEvent {
    pub fn end_time(&self) -> f64 {
        self.ts + self.dur.unwrap_or(0.0)
    }

    pub fn is_schedulable_task(&self) -> bool {
        SCHEDULABLE_TASK_NAMES.contains(&self.name.as_str())
    }

    pub fn is_metadata(&self) -> bool {
        self.ph == "M"
    }

    pub fn data(&self) -> Option<&TraceEventData> {
        self.args.data.as_ref()
    }
}

/// Trace JSON as written by the browser: either the object form with a
/// `traceEvents` array, or a bare event array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TraceFile {
    Object {
        #[serde(rename = "traceEvents")]
        trace_events: Vec<TraceEvent>,
    },
    Array(Vec<TraceEvent>),
}

impl TraceFile {
    pub fn into_events(self) -> Vec<TraceEvent> {
        match self {
            TraceFile::Object { trace_events } => trace_events,
            TraceFile::Array(events) => events,
        }
    }
}

/// Key timestamps of the navigation, in trace microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct NavigationTimestamps {
    pub navigation_start: f64,
    pub first_contentful_paint: Option<f64>,
    pub largest_contentful_paint: Option<f64>,
}

impl NavigationTimestamps {
    /// FCP in milliseconds relative to navigation start.
    pub fn first_contentful_paint_ms(&self) -> Option<f64> {
        self.first_contentful_paint
            .map(|ts| (ts - self.navigation_start) / 1000.0)
    }

    pub fn largest_contentful_paint_ms(&self) -> Option<f64> {
        self.largest_contentful_paint
            .map(|ts| (ts - self.navigation_start) / 1000.0)
    }
}

/// Trace narrowed to the renderer main thread of the navigating process.
#[derive(Debug, Clone, Default)]
pub struct ProcessedTrace {
    /// Non-metadata main-thread events, sorted by timestamp.
    pub main_thread_events: Vec<TraceEvent>,
    pub timestamps: NavigationTimestamps,
}

impl ProcessedTrace {
    pub fn from_events(events: Vec<TraceEvent>) -> Self {
        let navigation_start = events.iter().find(|event| event.name == "navigationStart");

        let (pid, tid) = match navigation_start {
            Some(nav) => {
                let renderer_tid = events
                    .iter()
                    .find(|event| {
                        event.is_metadata()
                            && event.name == "thread_name"
                            && event.pid == nav.pid
                            && event.args.name.as_deref() == Some(MAIN_THREAD_NAME)
                    })
                    .map(|event| event.tid);
                (Some(nav.pid), Some(renderer_tid.unwrap_or(nav.tid)))
            }
            None => {
                let renderer = events.iter().find(|event| {
                    event.is_metadata()
                        && event.name == "thread_name"
                        && event.args.name.as_deref() == Some(MAIN_THREAD_NAME)
                });
                (renderer.map(|e| e.pid), renderer.map(|e| e.tid))
            }
        };

        let navigation_start_ts = match navigation_start {
            Some(nav) => nav.ts,
            None => {
                let earliest = events
                    .iter()
                    .filter(|event| !event.is_metadata())
                    .map(|event| event.ts)
                    .fold(f64::INFINITY, f64::min);
                warn!("Trace has no navigationStart event; using earliest timestamp");
                if earliest.is_finite() { earliest } else { 0.0 }
            }
        };

        let first_contentful_paint = events
            .iter()
            .filter(|event| event.name == "firstContentfulPaint")
            .map(|event| event.ts)
            .find(|&ts| ts >= navigation_start_ts);

        let largest_contentful_paint = events
            .iter()
            .filter(|event| event.name == "largestContentfulPaint::Candidate")
            .map(|event| event.ts)
            .filter(|&ts| ts >= navigation_start_ts)
            .last();

        let mut main_thread_events: Vec<TraceEvent> = events
            .into_iter()
            .filter(|event| !event.is_metadata())
            .filter(|event| match (pid, tid) {
                (Some(pid), Some(tid)) => event.pid == pid && event.tid == tid,
                _ => true,
            })
            .collect();
        main_thread_events.sort_by(|a, b| a.ts.total_cmp(&b.ts));

        Self {
            main_thread_events,
            timestamps: NavigationTimestamps {
                navigation_start: navigation_start_ts,
                first_contentful_paint,
                largest_contentful_paint,
            },
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let file: TraceFile = serde_json::from_str(json)?;
        Ok(Self::from_events(file.into_events()))
    }
}
