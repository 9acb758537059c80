/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! DevTools protocol network log → `NetworkRequest` records.
//!
//! Only the `Network.*` events that affect timing, size or identity are
//! interpreted; everything else in the log is skipped.

use std::collections::HashMap;

use log::warn;
use serde::Deserialize;
use serde_json::Value;

use super::network_request::{
    Initiator, NetworkRequest, ResourcePriority, ResourceTiming, ResourceType,
};

/// One protocol message from a captured network log.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkLogEntry {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestPayload {
    url: String,
    #[serde(default)]
    initial_priority: ResourcePriority,
    #[serde(default)]
    is_link_preload: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePayload {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    mime_type: String,
    protocol: Option<String>,
    #[serde(default)]
    connection_id: u64,
    #[serde(default)]
    connection_reused: bool,
    #[serde(default)]
    from_disk_cache: bool,
    #[serde(default)]
    encoded_data_length: u64,
    timing: Option<ResourceTiming>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSent {
    request_id: String,
    frame_id: Option<String>,
    #[serde(rename = "documentURL", default)]
    document_url: String,
    request: RequestPayload,
    timestamp: f64,
    #[serde(default)]
    initiator: Initiator,
    redirect_response: Option<ResponsePayload>,
    #[serde(rename = "type")]
    resource_type: Option<ResourceType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceived {
    request_id: String,
    timestamp: f64,
    #[serde(rename = "type")]
    resource_type: Option<ResourceType>,
    response: ResponsePayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataReceived {
    request_id: String,
    #[serde(default)]
    data_length: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFinished {
    request_id: String,
    timestamp: f64,
    #[serde(default)]
    encoded_data_length: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFailed {
    request_id: String,
    timestamp: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestIdOnly {
    request_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceChangedPriority {
    request_id: String,
    new_priority: ResourcePriority,
}

/// Accumulates protocol events into request records.
#[derive(Debug, Default)]
pub struct NetworkRecorder {
    records: Vec<NetworkRequest>,
    /// Active (not yet redirected) request id → index into `records`.
    active: HashMap<String, usize>,
}

impl NetworkRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert a whole log in one pass.
    pub fn records_from_log(entries: &[NetworkLogEntry]) -> Vec<NetworkRequest> {
        let mut recorder = Self::new();
        for entry in entries {
            recorder.dispatch(entry);
        }
        recorder.finish()
    }

    /// Apply a single protocol event. Malformed payloads are logged and skipped.
    pub fn dispatch(&mut self, entry: &NetworkLogEntry) {
        let result = match entry.method.as_str() {
            "Network.requestWillBeSent" => {
                parse(&entry.params).map(|params| self.on_request_will_be_sent(params))
            }
            "Network.responseReceived" => {
                parse(&entry.params).map(|params| self.on_response_received(params))
            }
            "Network.dataReceived" => {
                parse(&entry.params).map(|params| self.on_data_received(params))
            }
            "Network.loadingFinished" => {
                parse(&entry.params).map(|params| self.on_loading_finished(params))
            }
            "Network.loadingFailed" => {
                parse(&entry.params).map(|params| self.on_loading_failed(params))
            }
            "Network.requestServedFromCache" => {
                parse::<RequestIdOnly>(&entry.params).map(|params| {
                    if let Some(record) = self.active_mut(&params.request_id) {
                        record.from_memory_cache = true;
                    }
                })
            }
            "Network.resourceChangedPriority" => {
                parse::<ResourceChangedPriority>(&entry.params).map(|params| {
                    if let Some(record) = self.active_mut(&params.request_id) {
                        record.priority = params.new_priority;
                    }
                })
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!("Skipping malformed {} event: {}", entry.method, e);
        }
    }

    /// Finalize records, resolving parser initiators to the request that
    /// produced them when the initiator URL is unambiguous.
    pub fn finish(mut self) -> Vec<NetworkRequest> {
        let mut ids_by_url: HashMap<String, Vec<String>> = HashMap::new();
        for record in &self.records {
            ids_by_url
                .entry(record.url.clone())
                .or_default()
                .push(record.request_id.clone());
        }

        for record in &mut self.records {
            if record.initiator_request_id.is_some() {
                continue;
            }
            let Some(initiator_url) = &record.initiator.url else {
                continue;
            };
            if let Some(ids) = ids_by_url.get(initiator_url)
                && ids.len() == 1
                && ids[0] != record.request_id
            {
                record.initiator_request_id = Some(ids[0].clone());
            }
        }

        self.records
    }

    fn active_mut(&mut self, request_id: &str) -> Option<&mut NetworkRequest> {
        let index = *self.active.get(request_id)?;
        self.records.get_mut(index)
    }

    fn on_request_will_be_sent(&mut self, params: RequestWillBeSent) {
        let mut redirects = Vec::new();
        let mut initiator_request_id = None;

        if let Some(redirect_response) = &params.redirect_response
            && let Some(index) = self.active.remove(&params.request_id)
        {
            let previous = &mut self.records[index];
            apply_response(previous, redirect_response, params.timestamp);
            previous.end_time = Some(params.timestamp);
            previous.transfer_size = previous
                .transfer_size
                .max(redirect_response.encoded_data_length);
            previous.request_id = format!("{}:redirect", previous.request_id);

            redirects = previous.redirects.clone();
            redirects.push(previous.request_id.clone());
            initiator_request_id = Some(previous.request_id.clone());
        }

        let record = NetworkRequest {
            request_id: params.request_id.clone(),
            url: params.request.url,
            document_url: params.document_url,
            frame_id: params.frame_id,
            resource_type: params.resource_type,
            priority: params.request.initial_priority,
            start_time: params.timestamp,
            initiator: params.initiator,
            initiator_request_id,
            redirects,
            is_link_preload: params.request.is_link_preload,
            ..NetworkRequest::default()
        };

        self.active.insert(params.request_id, self.records.len());
        self.records.push(record);
    }

    fn on_response_received(&mut self, params: ResponseReceived) {
        let Some(record) = self.active_mut(&params.request_id) else {
            return;
        };
        if params.resource_type.is_some() {
            record.resource_type = params.resource_type;
        }
        apply_response(record, &params.response, params.timestamp);
    }

    fn on_data_received(&mut self, params: DataReceived) {
        if let Some(record) = self.active_mut(&params.request_id) {
            record.resource_size += params.data_length;
        }
    }

    fn on_loading_finished(&mut self, params: LoadingFinished) {
        if let Some(record) = self.active_mut(&params.request_id) {
            record.end_time = Some(params.timestamp);
            record.transfer_size = params.encoded_data_length;
            if record.response_received_time.is_none() {
                record.response_received_time = Some(params.timestamp);
            }
        }
    }

    fn on_loading_failed(&mut self, params: LoadingFailed) {
        if let Some(record) = self.active_mut(&params.request_id) {
            record.end_time = Some(params.timestamp);
            record.failed = true;
        }
    }
}

fn apply_response(record: &mut NetworkRequest, response: &ResponsePayload, timestamp: f64) {
    record.status_code = response.status;
    record.mime_type = response.mime_type.clone();
    if let Some(protocol) = &response.protocol {
        record.protocol = protocol.clone();
    }
    record.connection_id = response.connection_id;
    record.connection_reused = response.connection_reused;
    record.from_disk_cache = response.from_disk_cache;
    record.response_received_time = Some(timestamp);
    if let Some(timing) = response.timing {
        if timing.request_time > 0.0 {
            record.start_time = timing.request_time;
        }
        record.timing = Some(timing);
    }
}

fn parse<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(method: &str, params: Value) -> NetworkLogEntry {
        NetworkLogEntry {
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_records_full_request_lifecycle() {
        let log = vec![
            entry(
                "Network.requestWillBeSent",
                json!({
                    "requestId": "1",
                    "frameId": "F",
                    "documentURL": "https://example.com/",
                    "request": {"url": "https://example.com/", "initialPriority": "VeryHigh"},
                    "timestamp": 1.0,
                    "initiator": {"type": "other"},
                    "type": "Document"
                }),
            ),
            entry(
                "Network.responseReceived",
                json!({
                    "requestId": "1",
                    "timestamp": 1.2,
                    "type": "Document",
                    "response": {
                        "status": 200,
                        "mimeType": "text/html",
                        "protocol": "h2",
                        "connectionId": 7,
                        "timing": {"requestTime": 1.01, "dnsStart": 0, "dnsEnd": 10,
                                   "connectStart": 10, "connectEnd": 50,
                                   "sendStart": 51, "sendEnd": 52, "receiveHeadersEnd": 180}
                    }
                }),
            ),
            entry(
                "Network.dataReceived",
                json!({"requestId": "1", "dataLength": 4000, "encodedDataLength": 1000}),
            ),
            entry(
                "Network.loadingFinished",
                json!({"requestId": "1", "timestamp": 1.4, "encodedDataLength": 1500}),
            ),
        ];

        let records = NetworkRecorder::records_from_log(&log);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.start_time, 1.01);
        assert_eq!(record.end_time, Some(1.4));
        assert_eq!(record.response_received_time, Some(1.2));
        assert_eq!(record.transfer_size, 1500);
        assert_eq!(record.resource_size, 4000);
        assert_eq!(record.protocol, "h2");
        assert_eq!(record.resource_type, Some(ResourceType::Document));
        assert_eq!(record.priority, ResourcePriority::VeryHigh);
        assert!(record.is_finished());
    }

    #[test]
    fn test_redirect_splits_into_chained_records() {
        let log = vec![
            entry(
                "Network.requestWillBeSent",
                json!({
                    "requestId": "1",
                    "request": {"url": "http://example.com/"},
                    "timestamp": 1.0
                }),
            ),
            entry(
                "Network.requestWillBeSent",
                json!({
                    "requestId": "1",
                    "request": {"url": "https://example.com/"},
                    "timestamp": 1.3,
                    "redirectResponse": {"status": 301, "mimeType": "text/html"}
                }),
            ),
            entry(
                "Network.loadingFinished",
                json!({"requestId": "1", "timestamp": 1.6, "encodedDataLength": 900}),
            ),
        ];

        let records = NetworkRecorder::records_from_log(&log);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request_id, "1:redirect");
        assert_eq!(records[0].status_code, 301);
        assert_eq!(records[0].end_time, Some(1.3));
        assert_eq!(records[1].request_id, "1");
        assert_eq!(records[1].redirects, vec!["1:redirect".to_string()]);
        assert_eq!(records[1].initiator_request_id.as_deref(), Some("1:redirect"));
        assert_eq!(records[1].transfer_size, 900);
    }

    #[test]
    fn test_unfinished_request_keeps_open_end_time() {
        let log = vec![entry(
            "Network.requestWillBeSent",
            json!({
                "requestId": "9",
                "request": {"url": "https://example.com/stalled.js"},
                "timestamp": 2.0
            }),
        )];

        let records = NetworkRecorder::records_from_log(&log);
        assert_eq!(records[0].end_time, None);
        assert!(!records[0].is_finished());
    }

    #[test]
    fn test_malformed_events_are_skipped() {
        let log = vec![
            entry("Network.requestWillBeSent", json!({"requestId": 5})),
            entry("Page.frameNavigated", json!({})),
        ];
        assert!(NetworkRecorder::records_from_log(&log).is_empty());
    }

    #[test]
    fn test_parser_initiator_resolves_to_unique_url() {
        let log = vec![
            entry(
                "Network.requestWillBeSent",
                json!({"requestId": "1", "request": {"url": "https://example.com/"}, "timestamp": 1.0}),
            ),
            entry(
                "Network.requestWillBeSent",
                json!({
                    "requestId": "2",
                    "request": {"url": "https://example.com/app.css"},
                    "timestamp": 1.1,
                    "initiator": {"type": "parser", "url": "https://example.com/"}
                }),
            ),
        ];

        let records = NetworkRecorder::records_from_log(&log);
        assert_eq!(records[1].initiator_request_id.as_deref(), Some("1"));
    }
}
