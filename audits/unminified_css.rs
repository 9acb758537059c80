/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use super::byte_efficiency::{ByteEfficiencyAudit, audit_byte_efficiency};
use super::{Audit, AuditError, AuditProduct, ComputedArtifacts, OpportunityItem, Stylesheet};

/// Below this share of waste a stylesheet is considered minified.
const IGNORE_THRESHOLD_IN_PERCENT: f64 = 5.0;
const IGNORE_THRESHOLD_IN_BYTES: f64 = 2048.0;

/// Characters a minifier would keep: everything but whitespace outside
/// strings and ordinary comments. `/*! */` license comments are kept.
/// Unterminated strings make the whole stylesheet count.
pub fn compute_token_length(content: &str) -> usize {
    let chars: Vec<char> = content.chars().collect();
    let mut total = 0;
    let mut in_comment = false;
    let mut in_license_comment = false;
    let mut string_open: Option<char> = None;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if in_comment {
            if in_license_comment {
                total += 1;
            }
            if c == '*' && next == Some('/') {
                if in_license_comment {
                    total += 1;
                }
                in_comment = false;
                i += 1;
            }
        } else if let Some(open) = string_open {
            total += 1;
            if c == '\\' {
                total += 1;
                i += 1;
            } else if c == open {
                string_open = None;
            }
        } else if c == '/' && next == Some('*') {
            in_comment = true;
            in_license_comment = chars.get(i + 2) == Some(&'!');
            if in_license_comment {
                total += 2;
            }
            i += 1;
        } else if c == '"' || c == '\'' {
            string_open = Some(c);
            total += 1;
        } else if !matches!(c, ' ' | '\n' | '\t' | '\r') {
            total += 1;
        }
        i += 1;
    }

    if string_open.is_some() {
        return chars.len();
    }
    total
}

/// Waste for one stylesheet, measured against `total_bytes` on the wire.
pub fn compute_waste(url: &str, content: &str, total_bytes: f64) -> OpportunityItem {
    let content_length = content.chars().count();
    let wasted_ratio = if content_length == 0 {
        0.0
    } else {
        1.0 - compute_token_length(content) as f64 / content_length as f64
    };
    OpportunityItem {
        url: url.to_string(),
        total_bytes: Some(total_bytes),
        wasted_bytes: Some((total_bytes * wasted_ratio).round()),
        wasted_percent: Some(100.0 * wasted_ratio),
        wasted_ms: None,
    }
}

/// Stylesheets that would shrink noticeably if minified.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnminifiedCss;

impl UnminifiedCss {
    fn item_for(&self, stylesheet: &Stylesheet, artifacts: &ComputedArtifacts<'_>) -> Option<OpportunityItem> {
        // Inline styles travel inside the document.
        let url = if stylesheet.url.is_empty() {
            artifacts.page_load().final_url.clone()?
        } else {
            stylesheet.url.clone()
        };
        let total_bytes = match artifacts.records().iter().find(|record| record.url == url) {
            Some(record) if !stylesheet.url.is_empty() => record.transfer_size as f64,
            _ => stylesheet.content.len() as f64,
        };
        let item = compute_waste(&url, &stylesheet.content, total_bytes);
        let wasted_percent = item.wasted_percent.unwrap_or(0.0);
        let wasted_bytes = item.wasted_bytes.unwrap_or(0.0);
        if wasted_percent < IGNORE_THRESHOLD_IN_PERCENT || wasted_bytes < IGNORE_THRESHOLD_IN_BYTES {
            return None;
        }
        Some(item)
    }
}

impl ByteEfficiencyAudit for UnminifiedCss {
    fn wasted_resources(&self, artifacts: &ComputedArtifacts<'_>) -> Result<Vec<OpportunityItem>, AuditError> {
        Ok(artifacts
            .page_load()
            .stylesheets
            .iter()
            .filter_map(|stylesheet| self.item_for(stylesheet, artifacts))
            .collect())
    }
}

impl Audit for UnminifiedCss {
    fn id(&self) -> &'static str {
        "unminified-css"
    }

    fn audit(&self, artifacts: &ComputedArtifacts<'_>) -> Result<AuditProduct, AuditError> {
        audit_byte_efficiency(self, artifacts)
    }
}
