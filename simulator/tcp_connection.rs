/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Round-trip model of a single TCP connection with slow start.

use serde::Serialize;

pub const INITIAL_CONGESTION_WINDOW: f64 = 10.0;
pub const TCP_SEGMENT_SIZE: f64 = 1460.0;

/// Setup costs paid by a download, in milliseconds. Connection phases are
/// only present on a cold connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConnectionTiming {
    pub dns_resolution_time: Option<f64>,
    pub connection_time: Option<f64>,
    pub ssl_time: Option<f64>,
    pub time_to_first_byte: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadResult {
    pub round_trips: f64,
    pub time_elapsed: f64,
    pub bytes_downloaded: f64,
    pub extra_bytes_downloaded: f64,
    pub congestion_window: f64,
    pub connection_timing: ConnectionTiming,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpConnection {
    warmed: bool,
    ssl: bool,
    h2: bool,
    rtt: f64,
    /// Bits per second.
    throughput: f64,
    server_latency: f64,
    congestion_window: f64,
    h2_overflow_bytes_downloaded: f64,
}

impl TcpConnection {
    pub fn new(rtt: f64, throughput: f64, server_latency: f64, ssl: bool, h2: bool) -> Self {
        Self {
            warmed: false,
            ssl,
            h2,
            rtt,
            throughput,
            server_latency,
            congestion_window: INITIAL_CONGESTION_WINDOW,
            h2_overflow_bytes_downloaded: 0.0,
        }
    }

    /// How many connections can each push a full segment per round trip
    /// before `available_throughput` is exhausted.
    pub fn maximum_saturated_connections(rtt: f64, available_throughput: f64) -> f64 {
        let round_trips_per_second = 1000.0 / rtt;
        let bytes_per_second = round_trips_per_second * TCP_SEGMENT_SIZE;
        let minimum_throughput_per_request = bytes_per_second * 8.0;
        (available_throughput / minimum_throughput_per_request).floor()
    }

    fn maximum_congestion_window_in_segments(&self) -> f64 {
        let bytes_per_second = self.throughput / 8.0;
        let seconds_per_round_trip = self.rtt / 1000.0;
        let bytes_per_round_trip = bytes_per_second * seconds_per_round_trip;
        (bytes_per_round_trip / TCP_SEGMENT_SIZE).floor()
    }

    pub fn set_throughput(&mut self, throughput: f64) {
        self.throughput = throughput;
    }

    pub fn set_congestion_window(&mut self, congestion_window: f64) {
        self.congestion_window = congestion_window;
    }

    pub fn set_warmed(&mut self, warmed: bool) {
        self.warmed = warmed;
    }

    /// Only h2 connections carry surplus bytes into the next request.
    pub fn set_h2_overflow_bytes_downloaded(&mut self, bytes: f64) {
        if self.h2 {
            self.h2_overflow_bytes_downloaded = bytes;
        }
    }

    pub fn is_warm(&self) -> bool {
        self.warmed
    }

    pub fn is_h2(&self) -> bool {
        self.h2
    }

    pub fn congestion_window(&self) -> f64 {
        self.congestion_window
    }

    /// Simulate downloading `bytes_to_download`, stopping once the download
    /// completes or `maximum_time_to_elapse` ms of transfer time pass.
    /// `time_already_elapsed` is time this request has already spent, so
    /// setup costs it covered are not charged twice.
    pub fn simulate_download_until(
        &self,
        bytes_to_download: f64,
        time_already_elapsed: f64,
        maximum_time_to_elapse: f64,
        dns_resolution_time: f64,
    ) -> DownloadResult {
        let mut bytes_to_download = bytes_to_download;
        if self.warmed && self.h2 {
            bytes_to_download -= self.h2_overflow_bytes_downloaded;
        }

        let two_way_latency = self.rtt;
        let one_way_latency = two_way_latency / 2.0;
        let maximum_congestion_window = self.maximum_congestion_window_in_segments();

        let mut handshake_and_request = one_way_latency;
        if !self.warmed {
            handshake_and_request = dns_resolution_time
                + one_way_latency // SYN
                + one_way_latency // SYN ACK
                + one_way_latency // ACK + initial request
                + if self.ssl { two_way_latency } else { 0.0 };
        }

        let mut round_trips = (handshake_and_request / two_way_latency).ceil();
        let mut time_to_first_byte = handshake_and_request + self.server_latency + one_way_latency;
        if self.warmed && self.h2 {
            time_to_first_byte = 0.0;
        }

        let time_elapsed_for_ttfb = (time_to_first_byte - time_already_elapsed).max(0.0);
        let maximum_download_time_to_elapse = maximum_time_to_elapse - time_elapsed_for_ttfb;

        let mut congestion_window = self.congestion_window.min(maximum_congestion_window);
        let mut total_bytes_downloaded = 0.0;
        if time_elapsed_for_ttfb > 0.0 {
            total_bytes_downloaded = congestion_window * TCP_SEGMENT_SIZE;
        } else {
            round_trips = 0.0;
        }

        let mut download_time_elapsed = 0.0;
        let mut bytes_remaining = bytes_to_download - total_bytes_downloaded;
        while bytes_remaining > 0.0 && download_time_elapsed <= maximum_download_time_to_elapse {
            round_trips += 1.0;
            download_time_elapsed += two_way_latency;
            congestion_window = (congestion_window * 2.0).min(maximum_congestion_window).max(1.0);

            let bytes_downloaded_in_window = congestion_window * TCP_SEGMENT_SIZE;
            total_bytes_downloaded += bytes_downloaded_in_window;
            bytes_remaining -= bytes_downloaded_in_window;
        }

        let time_elapsed = time_elapsed_for_ttfb + download_time_elapsed;
        let extra_bytes_downloaded = if self.h2 {
            (total_bytes_downloaded - bytes_to_download).max(0.0)
        } else {
            0.0
        };
        let bytes_downloaded = total_bytes_downloaded.min(bytes_to_download).max(0.0);

        let connection_timing = if self.warmed {
            ConnectionTiming {
                dns_resolution_time: None,
                connection_time: None,
                ssl_time: None,
                time_to_first_byte,
            }
        } else {
            ConnectionTiming {
                dns_resolution_time: Some(dns_resolution_time),
                connection_time: Some(handshake_and_request - dns_resolution_time),
                ssl_time: self.ssl.then_some(two_way_latency),
                time_to_first_byte,
            }
        };

        DownloadResult {
            round_trips,
            time_elapsed,
            bytes_downloaded,
            extra_bytes_downloaded,
            congestion_window,
            connection_timing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(100.0, 10_000.0 * 1024.0, 87.0)]
    #[case(150.0, 1_638.4 * 1024.0, 21.0)]
    #[case(20.0, 400_000.0, 0.0)]
    fn test_maximum_saturated_connections(
        #[case] rtt: f64,
        #[case] throughput: f64,
        #[case] expected: f64,
    ) {
        assert_eq!(
            TcpConnection::maximum_saturated_connections(rtt, throughput),
            expected
        );
    }

    #[test]
    fn test_cold_connection_pays_handshake() {
        let connection = TcpConnection::new(100.0, f64::INFINITY, 0.0, false, false);
        let result = connection.simulate_download_until(7000.0, 0.0, f64::INFINITY, 0.0);
        // 3 one-way trips of handshake + request, one more for the response.
        assert_eq!(result.time_elapsed, 200.0);
        assert_eq!(result.bytes_downloaded, 7000.0);
        assert_eq!(result.connection_timing.connection_time, Some(150.0));
        assert_eq!(result.connection_timing.ssl_time, None);
    }

    #[test]
    fn test_ssl_adds_a_round_trip() {
        let connection = TcpConnection::new(100.0, f64::INFINITY, 0.0, true, false);
        let result = connection.simulate_download_until(1000.0, 0.0, f64::INFINITY, 0.0);
        assert_eq!(result.time_elapsed, 300.0);
        assert_eq!(result.connection_timing.ssl_time, Some(100.0));
    }

    #[test]
    fn test_warm_connection_skips_handshake_and_dns() {
        let mut connection = TcpConnection::new(100.0, f64::INFINITY, 10.0, true, false);
        connection.set_warmed(true);
        let result = connection.simulate_download_until(1000.0, 0.0, f64::INFINITY, 200.0);
        assert_eq!(result.time_elapsed, 110.0);
        assert_eq!(result.connection_timing.dns_resolution_time, None);
    }

    #[test]
    fn test_slow_start_doubles_window() {
        let connection = TcpConnection::new(100.0, f64::INFINITY, 0.0, false, false);
        // 10 segments in the first flight, then 20 more.
        let bytes = 30.0 * TCP_SEGMENT_SIZE;
        let result = connection.simulate_download_until(bytes, 0.0, f64::INFINITY, 0.0);
        assert_eq!(result.time_elapsed, 300.0);
        assert_eq!(result.congestion_window, 20.0);
    }

    #[test]
    fn test_download_stops_at_time_budget() {
        let connection = TcpConnection::new(100.0, f64::INFINITY, 0.0, false, false);
        let result = connection.simulate_download_until(1_000_000.0, 0.0, 250.0, 0.0);
        assert!(result.bytes_downloaded < 1_000_000.0);
        assert!(result.time_elapsed <= 400.0);
    }

    #[test]
    fn test_h2_overflow_is_credited_on_warm_connection() {
        let mut connection = TcpConnection::new(100.0, f64::INFINITY, 0.0, true, true);
        let first = connection.simulate_download_until(1000.0, 0.0, f64::INFINITY, 0.0);
        assert_eq!(first.extra_bytes_downloaded, 10.0 * TCP_SEGMENT_SIZE - 1000.0);

        connection.set_warmed(true);
        connection.set_h2_overflow_bytes_downloaded(first.extra_bytes_downloaded);
        let second = connection.simulate_download_until(5000.0, 0.0, f64::INFINITY, 0.0);
        assert_eq!(second.time_elapsed, 0.0);
    }
}
