/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Log-normal scoring shared by every opportunity audit.

/// Point of diminishing returns: savings at which the score is 0.9.
pub const WASTED_MS_P10: f64 = 300.0;
/// Savings at which the score is 0.5; beyond this the score drops off fast.
pub const WASTED_MS_MEDIAN: f64 = 750.0;

/// Closest double to `erfc^-1(1/5)`.
const INVERSE_ERFC_ONE_FIFTH: f64 = 0.906_193_802_436_823_2;

/// Abramowitz and Stegun 7.1.26; max error 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = x.signum();
    let x = x.abs();

    let a1 = 0.254_829_592;
    let a2 = -0.284_496_736;
    let a3 = 1.421_413_741;
    let a4 = -1.453_152_027;
    let a5 = 1.061_405_429;
    let p = 0.327_591_1;

    let t = 1.0 / (1.0 + p * x);
    let y = t * (a1 + t * (a2 + t * (a3 + t * (a4 + t * a5))));
    sign * (1.0 - y * (-x * x).exp())
}

/// Complementary log-normal CDF through the given p10 and median, in [0, 1].
/// Non-positive values score 1.
pub fn log_normal_score(p10: f64, median: f64, value: f64) -> f64 {
    if value <= 0.0 {
        return 1.0;
    }
    let x_log_ratio = (value / median).max(f64::MIN_POSITIVE).ln();
    let p10_log_ratio = -(p10 / median).max(f64::MIN_POSITIVE).ln();
    let standardized_x = x_log_ratio * INVERSE_ERFC_ONE_FIFTH / p10_log_ratio;
    ((1.0 - erf(standardized_x)) / 2.0).clamp(0.0, 1.0)
}

/// Two-decimal score, nudging scores above 0.9 up so near-perfect results
/// round to 1.
pub fn compute_log_normal_score(p10: f64, median: f64, value: f64) -> f64 {
    let mut percentile = log_normal_score(p10, median, value);
    if percentile > 0.9 {
        percentile += 0.05 * (percentile - 0.9);
    }
    (percentile * 100.0).floor() / 100.0
}

/// Score for an opportunity saving `wasted_ms`; 1 means nothing to gain.
pub fn score_for_wasted_ms(wasted_ms: f64) -> f64 {
    if !wasted_ms.is_finite() {
        return if wasted_ms > 0.0 { 0.0 } else { 1.0 };
    }
    compute_log_normal_score(WASTED_MS_P10, WASTED_MS_MEDIAN, wasted_ms)
}
