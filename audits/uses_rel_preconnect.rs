/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Suggests `<link rel=preconnect>` for third-party origins whose
//! connection setup delayed requests needed for the largest paint.

use std::collections::{BTreeMap, HashSet};

use log::debug;

use super::{
    Audit, AuditError, AuditProduct, ComputedArtifacts, OpportunityDetails, OpportunityItem, URL_HEADING,
    WASTED_MS_HEADING,
};
use crate::metrics::MetricError;
use crate::model::NetworkRequest;

/// Origins saving less than this are not worth a hint.
const IGNORE_THRESHOLD_IN_MS: f64 = 50.0;
/// Sockets opened this long after the document (seconds) were not on the
/// critical path.
const PRECONNECT_SOCKET_MAX_IDLE: f64 = 15.0;

fn has_valid_timing(record: &NetworkRequest) -> bool {
    record.timing.is_some_and(|timing| {
        timing.has_valid_connect_timing() && timing.connect_end >= timing.connect_start
    })
}

fn has_already_connected_to_origin(record: &NetworkRequest) -> bool {
    record
        .timing
        .is_some_and(|timing| timing.has_already_connected())
}

fn socket_started_soon_after(record: &NetworkRequest, main_document: &NetworkRequest) -> bool {
    let main_end = main_document.end_time.unwrap_or(main_document.start_time);
    (record.start_time - main_end).max(0.0) < PRECONNECT_SOCKET_MAX_IDLE
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsesRelPreconnect;

impl Audit for UsesRelPreconnect {
    fn id(&self) -> &'static str {
        "uses-rel-preconnect"
    }

    fn audit(&self, artifacts: &ComputedArtifacts<'_>) -> Result<AuditProduct, AuditError> {
        let page = artifacts.page_graph()?;
        let simulator = artifacts.simulator()?;
        let main_document = page
            .graph
            .node(page.main_document)?
            .record()
            .ok_or_else(|| AuditError::Message("main document is not a network request".to_string()))?;
        let main_origin = main_document.security_origin();

        // Without an LCP every origin is a candidate.
        let lcp_urls: Option<HashSet<String>> = match artifacts.largest_contentful_paint() {
            Ok(lcp) => Some(
                lcp.pessimistic_graph
                    .nodes()
                    .filter_map(|(_, node)| node.record().map(|record| record.url.clone()))
                    .collect(),
            ),
            Err(AuditError::Metric(MetricError::NoLargestContentfulPaint)) => None,
            Err(e) => return Err(e),
        };

        let mut by_origin: BTreeMap<String, Vec<&NetworkRequest>> = BTreeMap::new();
        for record in artifacts.records() {
            let origin = record.security_origin();
            if !has_valid_timing(record)
                || record.initiator.url.as_deref() == Some(main_document.url.as_str())
                || origin == "null"
                || origin == main_origin
            {
                continue;
            }
            by_origin.entry(origin).or_default().push(record);
        }

        let rtt = simulator.rtt();
        let additional_rtt_by_origin = &simulator.options().additional_rtt_by_origin;
        let mut items = Vec::new();
        let mut max_wasted = 0.0f64;
        for (origin, records) in by_origin {
            let Some(first) = records
                .into_iter()
                .min_by(|a, b| a.start_time.total_cmp(&b.start_time))
            else {
                continue;
            };
            let Some(timing) = first.timing else {
                continue;
            };
            if lcp_urls.as_ref().is_some_and(|urls| !urls.contains(&first.url)) {
                continue;
            }
            if has_already_connected_to_origin(first) || !socket_started_soon_after(first, main_document) {
                continue;
            }

            let additional_rtt = additional_rtt_by_origin.get(&origin).copied().unwrap_or(0.0);
            let mut connection_time = rtt + additional_rtt;
            if first.is_secure() {
                connection_time *= 2.0;
            }
            let main_end = main_document.end_time.unwrap_or(main_document.start_time);
            let gap = (first.start_time - main_end) * 1000.0 + timing.dns_start.max(0.0);
            let wasted_ms = connection_time.min(gap);
            if wasted_ms < IGNORE_THRESHOLD_IN_MS {
                continue;
            }
            debug!("Preconnect to {origin} could save {wasted_ms:.0}ms");
            max_wasted = max_wasted.max(wasted_ms);
            items.push(OpportunityItem {
                url: origin,
                wasted_ms: Some(wasted_ms),
                ..OpportunityItem::default()
            });
        }

        items.sort_by(|a, b| b.wasted_ms.unwrap_or(0.0).total_cmp(&a.wasted_ms.unwrap_or(0.0)));
        let details = OpportunityDetails {
            headings: vec![URL_HEADING, WASTED_MS_HEADING],
            items,
            overall_savings_ms: max_wasted,
            overall_savings_bytes: 0.0,
        };
        Ok(AuditProduct::opportunity(max_wasted, details, page.warnings.clone()))
    }
}
