/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::HashMap;

/// A lookup costs this many round trips when nothing is cached.
pub const DNS_RESOLUTION_RTT_MULTIPLIER: f64 = 2.0;

/// Per-host DNS resolution times for one simulation run.
#[derive(Debug, Clone, Default)]
pub struct DnsCache {
    rtt: f64,
    resolved_at_by_host: HashMap<String, f64>,
}

impl DnsCache {
    pub fn new(rtt: f64) -> Self {
        Self {
            rtt,
            resolved_at_by_host: HashMap::new(),
        }
    }

    /// Milliseconds until `host` resolves for a lookup issued at
    /// `requested_at`. A host already being resolved finishes no later than
    /// its cached resolution time.
    pub fn time_until_resolution(&mut self, host: &str, requested_at: f64, update_cache: bool) -> f64 {
        let mut time_until_resolved = self.rtt * DNS_RESOLUTION_RTT_MULTIPLIER;
        if let Some(&resolved_at) = self.resolved_at_by_host.get(host) {
            let time_until_cached_resolves = (resolved_at - requested_at).max(0.0);
            time_until_resolved = time_until_resolved.min(time_until_cached_resolves);
        }

        if update_cache {
            self.set_resolved_at(host, requested_at + time_until_resolved);
        }
        time_until_resolved
    }

    /// Keep the earliest known resolution time for `host`.
    pub fn set_resolved_at(&mut self, host: &str, resolved_at: f64) {
        self.resolved_at_by_host
            .entry(host.to_string())
            .and_modify(|existing| *existing = existing.min(resolved_at))
            .or_insert(resolved_at);
    }
}
