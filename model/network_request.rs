/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-request network records.
//!
//! Times on the record (`start_time`, `response_received_time`, `end_time`) are
//! seconds since an arbitrary monotonic origin, matching the protocol. The
//! `timing` sub-record carries millisecond offsets relative to
//! `timing.request_time`, with `-1` meaning "not applicable".

use serde::{Deserialize, Serialize};
use url::Url;

/// Schemes whose bodies never touch the network.
const NON_NETWORK_SCHEMES: [&str; 6] = [
    "blob",
    "data",
    "intent",
    "file",
    "filesystem",
    "chrome-extension",
];

const TLS_SCHEMES: [&str; 2] = ["https", "wss"];

/// Resource type as reported by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    TextTrack,
    #[serde(rename = "XHR")]
    Xhr,
    Fetch,
    EventSource,
    WebSocket,
    Manifest,
    SignedExchange,
    Ping,
    #[serde(rename = "CSPViolationReport")]
    CspViolationReport,
    Preflight,
    #[serde(other)]
    Other,
}

/// Network fetch priority assigned by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourcePriority {
    VeryLow,
    #[default]
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ResourcePriority {
    /// Seconds added to a request's observed start time when ordering ready
    /// requests in the simulator. Lower priorities queue behind higher ones.
    pub fn start_time_penalty_secs(self) -> f64 {
        match self {
            Self::VeryHigh => 0.0,
            Self::High => 0.25,
            Self::Medium => 0.5,
            Self::Low => 1.0,
            Self::VeryLow => 2.0,
        }
    }
}

/// Connection timing sub-record. All fields are milliseconds relative to
/// `request_time` (seconds), `-1` when the phase did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceTiming {
    pub request_time: f64,
    pub dns_start: f64,
    pub dns_end: f64,
    pub connect_start: f64,
    pub connect_end: f64,
    pub ssl_start: f64,
    pub ssl_end: f64,
    pub send_start: f64,
    pub send_end: f64,
    pub receive_headers_end: f64,
}

impl Default for ResourceTiming {
    fn default() -> Self {
        Self {
            request_time: 0.0,
            dns_start: -1.0,
            dns_end: -1.0,
            connect_start: -1.0,
            connect_end: -1.0,
            ssl_start: -1.0,
            ssl_end: -1.0,
            send_start: -1.0,
            send_end: -1.0,
            receive_headers_end: -1.0,
        }
    }
}

impl ResourceTiming {
    /// True when both ends of the connect phase were recorded.
    pub fn has_valid_connect_timing(&self) -> bool {
        self.connect_start >= 0.0 && self.connect_end >= 0.0
    }

    /// True when the page already held a connection to this origin, so DNS and
    /// the TCP handshake cost nothing for this request.
    pub fn has_already_connected(&self) -> bool {
        let all_skipped = self.dns_start == -1.0
            && self.dns_end == -1.0
            && self.connect_start == -1.0
            && self.connect_end == -1.0;
        if all_skipped {
            return true;
        }
        self.dns_end - self.dns_start == 0.0 && self.connect_end - self.connect_start == 0.0
    }
}

/// One frame of a JavaScript stack trace.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallFrame {
    pub url: String,
    pub function_name: String,
    pub line_number: i64,
    pub column_number: i64,
}

/// Async-aware stack trace attached to script initiators.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackTrace {
    pub call_frames: Vec<CallFrame>,
    pub parent: Option<Box<StackTrace>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InitiatorType {
    Parser,
    Script,
    Preload,
    SignedExchange,
    Preflight,
    #[default]
    #[serde(other)]
    Other,
}

/// What caused the browser to issue a request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Initiator {
    #[serde(rename = "type")]
    pub initiator_type: InitiatorType,
    pub url: Option<String>,
    pub line_number: Option<i64>,
    pub stack: Option<StackTrace>,
}

impl Initiator {
    /// URLs of the resources that may have initiated the request: the explicit
    /// initiator URL, or every distinct script URL on the initiating stack.
    pub fn candidate_urls(&self) -> Vec<String> {
        if let Some(url) = &self.url {
            return vec![url.clone()];
        }
        if self.initiator_type != InitiatorType::Script {
            return Vec::new();
        }

        let mut urls: Vec<String> = Vec::new();
        let mut stack = self.stack.as_ref();
        while let Some(current) = stack {
            for frame in &current.call_frames {
                if !frame.url.is_empty() && !urls.contains(&frame.url) {
                    urls.push(frame.url.clone());
                }
            }
            stack = current.parent.as_deref();
        }
        urls
    }
}

/// A single network request with its lifecycle and size data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkRequest {
    pub request_id: String,
    pub url: String,
    #[serde(rename = "documentURL")]
    pub document_url: String,
    pub frame_id: Option<String>,
    pub mime_type: String,
    pub resource_type: Option<ResourceType>,
    pub priority: ResourcePriority,
    /// Seconds.
    pub start_time: f64,
    /// Seconds; `None` when no response headers arrived.
    pub response_received_time: Option<f64>,
    /// Seconds; `None` when the request never finished.
    pub end_time: Option<f64>,
    pub transfer_size: u64,
    pub resource_size: u64,
    pub protocol: String,
    pub status_code: u16,
    pub timing: Option<ResourceTiming>,
    pub initiator: Initiator,
    /// Request that directly caused this one, e.g. the previous redirect hop.
    pub initiator_request_id: Option<String>,
    /// Request ids of earlier redirect hops, oldest first.
    pub redirects: Vec<String>,
    pub connection_id: u64,
    pub connection_reused: bool,
    pub from_disk_cache: bool,
    pub from_memory_cache: bool,
    pub failed: bool,
    pub is_link_preload: bool,
}

impl Default for NetworkRequest {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            url: String::new(),
            document_url: String::new(),
            frame_id: None,
            mime_type: String::new(),
            resource_type: None,
            priority: ResourcePriority::default(),
            start_time: 0.0,
            response_received_time: None,
            end_time: None,
            transfer_size: 0,
            resource_size: 0,
            protocol: "http/1.1".to_string(),
            status_code: 200,
            timing: None,
            initiator: Initiator::default(),
            initiator_request_id: None,
            redirects: Vec::new(),
            connection_id: 0,
            connection_reused: false,
            from_disk_cache: false,
            from_memory_cache: false,
            failed: false,
            is_link_preload: false,
        }
    }
}

impl NetworkRequest {
    pub fn parsed_url(&self) -> Option<Url> {
        Url::parse(&self.url).ok()
    }

    /// Serialized security origin (`scheme://host[:port]`), or `"null"` for
    /// opaque origins such as `data:` URLs.
    pub fn security_origin(&self) -> String {
        self.parsed_url()
            .map(|url| url.origin().ascii_serialization())
            .unwrap_or_else(|| "null".to_string())
    }

    pub fn scheme(&self) -> String {
        self.parsed_url()
            .map(|url| url.scheme().to_string())
            .unwrap_or_default()
    }

    pub fn host(&self) -> String {
        self.parsed_url()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn is_secure(&self) -> bool {
        TLS_SCHEMES.contains(&self.scheme().as_str())
    }

    pub fn is_h2(&self) -> bool {
        self.protocol == "h2"
    }

    pub fn is_non_network_protocol(&self) -> bool {
        let scheme = self.scheme();
        NON_NETWORK_SCHEMES.contains(&scheme.as_str())
            || NON_NETWORK_SCHEMES.contains(&self.protocol.as_str())
    }

    pub fn is_redirect_status(&self) -> bool {
        (300..400).contains(&self.status_code)
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some() && !self.failed
    }

    /// Start time in microseconds, the unit graph nodes use.
    pub fn start_time_us(&self) -> f64 {
        self.start_time * 1_000_000.0
    }

    pub fn end_time_us(&self) -> Option<f64> {
        self.end_time.map(|end| end * 1_000_000.0)
    }

    /// Registrable-domain approximation: the last two host labels.
    pub fn root_domain(&self) -> String {
        root_domain_of(&self.host())
    }
}

pub(crate) fn root_domain_of(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').filter(|label| !label.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }
    labels[labels.len() - 2..].join(".")
}

/// True when both URLs share a root domain.
pub fn root_domains_match(a: &str, b: &str) -> bool {
    let host = |url: &str| {
        Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string))
    };
    match (host(a), host(b)) {
        (Some(a), Some(b)) => root_domain_of(&a) == root_domain_of(&b),
        _ => false,
    }
}
