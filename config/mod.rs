/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Run settings: throttling method, throttling parameters and optional
//! precomputed per-origin network estimates. Loaded from TOML.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Where timing numbers come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlingMethod {
    /// Replay the page graph through the load simulator.
    #[default]
    Simulate,
    /// The capture was throttled by the browser at the request level.
    Devtools,
    /// No throttling was applied; use what the trace observed.
    Provided,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingSettings {
    pub rtt_ms: f64,
    pub throughput_kbps: f64,
    pub cpu_slowdown_multiplier: f64,
    pub request_latency_ms: f64,
    pub download_throughput_kbps: f64,
    pub upload_throughput_kbps: f64,
}

/// Request-level throttling adds latency per request rather than per round
/// trip; these factors convert between the two models.
pub const DEVTOOLS_RTT_ADJUSTMENT_FACTOR: f64 = 3.75;
pub const DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR: f64 = 0.9;

impl ThrottlingSettings {
    /// Slow 4G on a mid-tier phone.
    pub fn mobile_slow_4g() -> Self {
        Self {
            rtt_ms: 150.0,
            throughput_kbps: 1.6 * 1024.0,
            cpu_slowdown_multiplier: 4.0,
            request_latency_ms: 150.0 * DEVTOOLS_RTT_ADJUSTMENT_FACTOR,
            download_throughput_kbps: 1.6 * 1024.0 * DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR,
            upload_throughput_kbps: 750.0 * DEVTOOLS_THROUGHPUT_ADJUSTMENT_FACTOR,
        }
    }

    pub fn desktop_dense_4g() -> Self {
        Self {
            rtt_ms: 40.0,
            throughput_kbps: 10.0 * 1024.0,
            cpu_slowdown_multiplier: 1.0,
            request_latency_ms: 0.0,
            download_throughput_kbps: 0.0,
            upload_throughput_kbps: 0.0,
        }
    }
}

impl Default for ThrottlingSettings {
    fn default() -> Self {
        Self::mobile_slow_4g()
    }
}

/// Per-origin network estimates computed ahead of time, overriding what the
/// network analyzer would derive from the records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecomputedLanternData {
    pub additional_rtt_by_origin: HashMap<String, f64>,
    pub server_response_time_by_origin: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub throttling_method: ThrottlingMethod,
    pub throttling: ThrottlingSettings,
    pub precomputed_lantern_data: Option<PrecomputedLanternData>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "Settings parse error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl Settings {
    pub fn desktop() -> Self {
        Self {
            throttling: ThrottlingSettings::desktop_dense_4g(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_default_is_simulated_slow_4g() {
        let settings = Settings::default();
        assert_eq!(settings.throttling_method, ThrottlingMethod::Simulate);
        assert_eq!(settings.throttling.rtt_ms, 150.0);
        assert_eq!(settings.throttling.throughput_kbps, 1638.4);
        assert_eq!(settings.throttling.cpu_slowdown_multiplier, 4.0);
        assert!(settings.precomputed_lantern_data.is_none());
    }

    #[rstest]
    #[case("simulate", ThrottlingMethod::Simulate)]
    #[case("devtools", ThrottlingMethod::Devtools)]
    #[case("provided", ThrottlingMethod::Provided)]
    fn test_throttling_method_names(#[case] name: &str, #[case] expected: ThrottlingMethod) {
        let settings = Settings::from_toml_str(&format!("throttling_method = \"{name}\"")).unwrap();
        assert_eq!(settings.throttling_method, expected);
    }

    #[test]
    fn test_partial_throttling_table_keeps_preset_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [throttling]
            rtt_ms = 40.0
            "#,
        )
        .unwrap();
        assert_eq!(settings.throttling.rtt_ms, 40.0);
        assert_eq!(settings.throttling.cpu_slowdown_multiplier, 4.0);
    }

    #[test]
    fn test_load_from_file_with_precomputed_data() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
throttling_method = "simulate"

[precomputed_lantern_data.additional_rtt_by_origin]
"https://cdn.example.com" = 25.0

[precomputed_lantern_data.server_response_time_by_origin]
"https://cdn.example.com" = 80.0
"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        let precomputed = settings.precomputed_lantern_data.unwrap();
        assert_eq!(
            precomputed.additional_rtt_by_origin["https://cdn.example.com"],
            25.0
        );
        assert_eq!(
            precomputed.server_response_time_by_origin["https://cdn.example.com"],
            80.0
        );
    }

    #[test]
    fn test_load_errors_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(Settings::load(&missing), Err(ConfigError::Io(_))));
        assert!(matches!(
            Settings::from_toml_str("throttling_method = \"warp\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
