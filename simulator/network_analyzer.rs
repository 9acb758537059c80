/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Observed network characteristics: per-origin round-trip time and server
//! response time, connection reuse and overall throughput.
//!
//! All estimates are milliseconds except throughput, which is bits/second.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use url::Url;

use crate::model::{NetworkRequest, ResourceTiming, ResourceType};

/// Below one initial congestion window a download tells nothing about RTT.
const INITIAL_CWD: f64 = 14.0 * 1024.0;

/// Share of TTFB assumed to be server think time for static assets.
const DEFAULT_SERVER_RESPONSE_PERCENTAGE: f64 = 0.4;

fn server_response_percentage_of_ttfb(resource_type: ResourceType) -> f64 {
    match resource_type {
        ResourceType::Document => 0.4,
        ResourceType::Xhr | ResourceType::Fetch => 0.2,
        _ => DEFAULT_SERVER_RESPONSE_PERCENTAGE,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
}

pub type EstimatesByOrigin = BTreeMap<String, Vec<f64>>;

#[derive(Debug, Clone, Copy)]
pub struct RttEstimateOptions {
    /// Skip TCP/SSL timing even when present.
    pub force_coarse_estimates: bool,
    /// Coarse estimates overshoot; they are scaled by this factor.
    pub coarse_estimate_multiplier: f64,
    pub use_download_estimates: bool,
    pub use_send_start_estimates: bool,
    pub use_headers_end_estimates: bool,
}

impl Default for RttEstimateOptions {
    fn default() -> Self {
        Self {
            force_coarse_estimates: false,
            coarse_estimate_multiplier: 0.3,
            use_download_estimates: true,
            use_send_start_estimates: true,
            use_headers_end_estimates: true,
        }
    }
}

/// Network estimates for one page load, the input to the load simulator.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct NetworkAnalysis {
    /// Smallest per-origin RTT; 0 when no origin had usable timing.
    pub rtt: f64,
    /// Extra RTT of each origin above `rtt`.
    pub additional_rtt_by_origin: HashMap<String, f64>,
    /// Median server response time per origin.
    pub server_response_time_by_origin: HashMap<String, f64>,
    pub throughput: f64,
}

impl NetworkAnalysis {
    pub fn analyze(records: &[&NetworkRequest]) -> Self {
        let throughput = estimate_throughput(records);

        let rtt_by_origin: BTreeMap<String, f64> =
            estimate_rtt_by_origin(records, RttEstimateOptions::default())
                .into_iter()
                .map(|(origin, summary)| (origin, summary.min))
                .collect();

        let minimum_rtt = rtt_by_origin.values().copied().fold(f64::INFINITY, f64::min);
        let minimum_rtt = if minimum_rtt.is_finite() { minimum_rtt } else { 0.0 };

        let response_times = estimate_server_response_time_by_origin(records, &rtt_by_origin);
        let mut additional_rtt_by_origin = HashMap::new();
        let mut server_response_time_by_origin = HashMap::new();
        for (origin, summary) in response_times {
            let rtt_for_origin = rtt_by_origin.get(&origin).copied().unwrap_or(minimum_rtt);
            additional_rtt_by_origin.insert(origin.clone(), rtt_for_origin - minimum_rtt);
            server_response_time_by_origin.insert(origin, summary.median);
        }

        Self {
            rtt: minimum_rtt,
            additional_rtt_by_origin,
            server_response_time_by_origin,
            throughput,
        }
    }
}

/// Group records by security origin, in first-seen order within each group.
pub fn group_by_origin<'a>(records: &[&'a NetworkRequest]) -> BTreeMap<String, Vec<&'a NetworkRequest>> {
    let mut grouped: BTreeMap<String, Vec<&NetworkRequest>> = BTreeMap::new();
    for &record in records {
        grouped.entry(record.security_origin()).or_default().push(record);
    }
    grouped
}

pub fn summarize(estimates: EstimatesByOrigin) -> BTreeMap<String, Summary> {
    estimates
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(origin, mut values)| {
            values.sort_by(f64::total_cmp);
            let sum: f64 = values.iter().sum();
            let summary = Summary {
                min: values[0],
                max: values[values.len() - 1],
                avg: sum / values.len() as f64,
                median: values[(values.len() - 1) / 2],
            };
            (origin, summary)
        })
        .collect()
}

/// True when the protocol's connection ids look meaningful: more than one
/// id, and every id was fresh on at least one request.
pub fn can_trust_connection_information(records: &[&NetworkRequest]) -> bool {
    let mut started_by_connection: HashMap<u64, bool> = HashMap::new();
    for record in records {
        let started = started_by_connection
            .get(&record.connection_id)
            .copied()
            .unwrap_or(false)
            || !record.connection_reused;
        started_by_connection.insert(record.connection_id, started);
    }
    if started_by_connection.len() <= 1 {
        return false;
    }
    started_by_connection.values().all(|&started| started)
}

/// Request id → whether the request rode an existing connection.
///
/// Without trustworthy connection ids, a request is assumed to reuse a
/// connection if it is h2 or started after the origin's first response
/// ended. The first request to each origin never reuses.
pub fn estimate_if_connection_was_reused(
    records: &[&NetworkRequest],
    force_coarse_estimates: bool,
) -> HashMap<String, bool> {
    if !force_coarse_estimates && can_trust_connection_information(records) {
        return records
            .iter()
            .map(|record| (record.request_id.clone(), record.connection_reused))
            .collect();
    }

    let mut reused = HashMap::new();
    for origin_records in group_by_origin(records).values() {
        let earliest_reuse_possible = origin_records
            .iter()
            .map(|record| record.end_time.unwrap_or(f64::INFINITY))
            .fold(f64::INFINITY, f64::min);

        for record in origin_records {
            reused.insert(
                record.request_id.clone(),
                record.start_time >= earliest_reuse_possible || record.is_h2(),
            );
        }

        let first = origin_records
            .iter()
            .copied()
            .reduce(|a, b| if a.start_time > b.start_time { b } else { a });
        if let Some(first) = first {
            reused.insert(first.request_id.clone(), false);
        }
    }
    reused
}

fn estimate_value_by_origin<F>(records: &[&NetworkRequest], mut estimate: F) -> EstimatesByOrigin
where
    F: FnMut(&NetworkRequest, &ResourceTiming, bool) -> Vec<f64>,
{
    let reused = estimate_if_connection_was_reused(records, false);
    let mut estimates = EstimatesByOrigin::new();
    for (origin, origin_records) in group_by_origin(records) {
        let mut origin_estimates = Vec::new();
        for record in origin_records {
            let Some(timing) = &record.timing else {
                continue;
            };
            let connection_reused = reused.get(&record.request_id).copied().unwrap_or(false);
            origin_estimates.extend(estimate(record, timing, connection_reused));
        }
        if !origin_estimates.is_empty() {
            estimates.insert(origin, origin_estimates);
        }
    }
    estimates
}

fn estimate_rtt_via_tcp_timing(records: &[&NetworkRequest]) -> EstimatesByOrigin {
    estimate_value_by_origin(records, |_, timing, connection_reused| {
        if connection_reused {
            return Vec::new();
        }
        // TLS gives a second sample; assume false start kept it to one RT.
        if timing.ssl_start > 0.0 && timing.ssl_end > 0.0 {
            vec![
                timing.connect_end - timing.ssl_start,
                timing.ssl_start - timing.connect_start,
            ]
        } else if timing.connect_start > 0.0 && timing.connect_end > 0.0 {
            vec![timing.connect_end - timing.connect_start]
        } else {
            Vec::new()
        }
    })
}

fn estimate_rtt_via_download_timing(records: &[&NetworkRequest]) -> EstimatesByOrigin {
    estimate_value_by_origin(records, |record, timing, connection_reused| {
        if connection_reused {
            return Vec::new();
        }
        let transfer_size = record.transfer_size as f64;
        if transfer_size <= INITIAL_CWD {
            return Vec::new();
        }
        if !timing.receive_headers_end.is_finite() || timing.receive_headers_end < 0.0 {
            return Vec::new();
        }
        let Some(end_time) = record.end_time else {
            return Vec::new();
        };

        let total_time = (end_time - record.start_time) * 1000.0;
        let download_time_after_first_byte = total_time - timing.receive_headers_end;
        let round_trips = (transfer_size / INITIAL_CWD).log2();
        // Past a handful of round trips bandwidth dominates latency.
        if round_trips > 5.0 {
            return Vec::new();
        }
        vec![download_time_after_first_byte / round_trips]
    })
}

fn estimate_rtt_via_send_start_timing(records: &[&NetworkRequest]) -> EstimatesByOrigin {
    estimate_value_by_origin(records, |record, timing, connection_reused| {
        if connection_reused {
            return Vec::new();
        }
        if !timing.send_start.is_finite() || timing.send_start < 0.0 {
            return Vec::new();
        }
        // DNS and TCP, plus TLS on https.
        let mut round_trips = 2.0;
        if record.scheme() == "https" {
            round_trips += 1.0;
        }
        vec![timing.send_start / round_trips]
    })
}

fn estimate_rtt_via_headers_end_timing(records: &[&NetworkRequest]) -> EstimatesByOrigin {
    estimate_value_by_origin(records, |record, timing, connection_reused| {
        if !timing.receive_headers_end.is_finite() || timing.receive_headers_end < 0.0 {
            return Vec::new();
        }
        let Some(resource_type) = record.resource_type else {
            return Vec::new();
        };

        let estimated_server_response_time =
            timing.receive_headers_end * server_response_percentage_of_ttfb(resource_type);

        // A reused connection only pays the request round trip.
        let mut round_trips = 1.0;
        if !connection_reused {
            round_trips += 2.0;
            if record.scheme() == "https" {
                round_trips += 1.0;
            }
        }
        vec![((timing.receive_headers_end - estimated_server_response_time) / round_trips).max(3.0)]
    })
}

pub fn estimate_rtt_by_origin(
    records: &[&NetworkRequest],
    options: RttEstimateOptions,
) -> BTreeMap<String, Summary> {
    let mut estimates = estimate_rtt_via_tcp_timing(records);

    if estimates.is_empty() || options.force_coarse_estimates {
        estimates = EstimatesByOrigin::new();
        let sources = [
            (options.use_download_estimates, estimate_rtt_via_download_timing(records)),
            (options.use_send_start_estimates, estimate_rtt_via_send_start_timing(records)),
            (options.use_headers_end_estimates, estimate_rtt_via_headers_end_timing(records)),
        ];
        for (enabled, source) in sources {
            if !enabled {
                continue;
            }
            for (origin, values) in source {
                estimates.entry(origin).or_default().extend(values);
            }
        }
        for values in estimates.values_mut() {
            for value in values.iter_mut() {
                *value *= options.coarse_estimate_multiplier;
            }
        }
    }

    summarize(estimates)
}

/// TTFB less the origin's RTT, summarized per origin.
pub fn estimate_server_response_time_by_origin(
    records: &[&NetworkRequest],
    rtt_by_origin: &BTreeMap<String, f64>,
) -> BTreeMap<String, Summary> {
    let estimates = estimate_value_by_origin(records, |record, timing, _| {
        if !timing.receive_headers_end.is_finite() || timing.receive_headers_end < 0.0 {
            return Vec::new();
        }
        if !timing.send_end.is_finite() || timing.send_end < 0.0 {
            return Vec::new();
        }
        let ttfb = timing.receive_headers_end - timing.send_end;
        let rtt = rtt_by_origin
            .get(&record.security_origin())
            .copied()
            .unwrap_or(0.0);
        vec![(ttfb - rtt).max(0.0)]
    });
    summarize(estimates)
}

/// Bytes over the wire divided by the time at least one download was in
/// flight. Infinite when nothing usable was downloaded.
pub fn estimate_throughput(records: &[&NetworkRequest]) -> f64 {
    let mut total_bytes = 0.0;
    let mut boundaries: Vec<(f64, bool)> = Vec::new();
    for record in records {
        if record.scheme() == "data"
            || !record.is_finished()
            || record.status_code > 300
            || record.transfer_size == 0
        {
            continue;
        }
        let Some(end_time) = record.end_time else {
            continue;
        };
        total_bytes += record.transfer_size as f64;
        boundaries.push((record.response_received_time.unwrap_or(record.start_time), true));
        boundaries.push((end_time, false));
    }
    if boundaries.is_empty() {
        return f64::INFINITY;
    }
    boundaries.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut in_flight = 0;
    let mut current_start = boundaries[0].0;
    let mut total_duration = 0.0;
    for (time, is_start) in boundaries {
        if is_start {
            if in_flight == 0 {
                current_start = time;
            }
            in_flight += 1;
        } else {
            in_flight -= 1;
            if in_flight == 0 {
                total_duration += time - current_start;
            }
        }
    }
    total_bytes * 8.0 / total_duration
}

fn without_fragment(url: &str) -> Option<Url> {
    let mut parsed = Url::parse(url).ok()?;
    parsed.set_fragment(None);
    Some(parsed)
}

/// The request for `final_url` when known, else the earliest document.
pub fn find_main_document<'a>(
    records: &[&'a NetworkRequest],
    final_url: Option<&str>,
) -> Option<&'a NetworkRequest> {
    if let Some(final_url) = final_url {
        let target = without_fragment(final_url);
        let exact = records.iter().copied().find(|record| {
            final_url.starts_with(&record.url)
                && target.is_some()
                && without_fragment(&record.url) == target
        });
        if exact.is_some() {
            return exact;
        }
    }

    records
        .iter()
        .copied()
        .filter(|record| record.resource_type == Some(ResourceType::Document))
        .reduce(|min, record| if record.start_time < min.start_time { record } else { min })
}
