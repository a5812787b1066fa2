// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::logger::LogLevel;

const DEFAULT_COLLECTOR_ADDR: &str = "collector.appoptics.com:443";
const DEFAULT_UDP_ADDR: &str = "127.0.0.1:7831";

/// Tunables of the reporter. Every knob has a default and the whole bundle can be
/// overridden at construction, either in code or from a partial JSON document where
/// durations are given in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReporterConfig {
    /// Byte ceiling of a single event batch.
    pub max_event_bytes: usize,
    /// How long the event pipeline waits before flushing a batch.
    #[serde(rename = "event_flush_timeout_ms", with = "duration_ms")]
    pub event_flush_timeout: Duration,
    /// Interval between two metrics snapshots.
    #[serde(rename = "metrics_interval_ms", with = "duration_ms")]
    pub metrics_interval: Duration,
    /// Cadence of the periodic controller.
    #[serde(rename = "tick_interval_ms", with = "duration_ms")]
    pub tick_interval: Duration,
    pub retry_amplifier: u32,
    #[serde(rename = "initial_retry_interval_ms", with = "duration_ms")]
    pub initial_retry_interval: Duration,
    #[serde(rename = "max_retry_interval_ms", with = "duration_ms")]
    pub max_retry_interval: Duration,
    pub max_metrics_retries: u32,
    pub max_conn_redirects: u32,
    pub max_conn_retries: u32,
    pub status_queue_capacity: usize,
    /// How long the controller waits for a first status message when none is queued.
    #[serde(rename = "status_load_block_ms", with = "duration_ms")]
    pub status_load_block: Duration,
    #[serde(rename = "keep_alive_interval_ms", with = "duration_ms")]
    pub keep_alive_interval: Duration,
    pub max_messages_per_post: usize,
    #[serde(rename = "settings_refresh_interval_ms", with = "duration_ms")]
    pub settings_refresh_interval: Duration,
    #[serde(rename = "settings_ttl_check_interval_ms", with = "duration_ms")]
    pub settings_ttl_check_interval: Duration,
    /// Capacity of the inbound event queue. Producers wait when it is full.
    pub event_queue_capacity: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        ReporterConfig {
            max_event_bytes: 64 * 1024 * 1024,
            event_flush_timeout: Duration::from_millis(100),
            metrics_interval: Duration::from_secs(60),
            tick_interval: Duration::from_millis(500),
            retry_amplifier: 2,
            initial_retry_interval: Duration::from_millis(500),
            max_retry_interval: Duration::from_secs(60),
            max_metrics_retries: 20,
            max_conn_redirects: 20,
            max_conn_retries: u32::MAX,
            status_queue_capacity: 200,
            status_load_block: Duration::from_millis(5),
            keep_alive_interval: Duration::from_secs(20),
            max_messages_per_post: 100,
            settings_refresh_interval: Duration::from_secs(20),
            settings_ttl_check_interval: Duration::from_secs(10),
            event_queue_capacity: 1024,
        }
    }
}

impl ReporterConfig {
    /// Parses a partial JSON bundle on top of the defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ReporterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("event_flush_timeout", self.event_flush_timeout),
            ("metrics_interval", self.metrics_interval),
            ("tick_interval", self.tick_interval),
            ("initial_retry_interval", self.initial_retry_interval),
            ("max_retry_interval", self.max_retry_interval),
            ("keep_alive_interval", self.keep_alive_interval),
            ("settings_refresh_interval", self.settings_refresh_interval),
            ("settings_ttl_check_interval", self.settings_ttl_check_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.max_event_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_event_bytes must be greater than zero".to_string(),
            ));
        }
        if self.retry_amplifier == 0 {
            return Err(ConfigError::Invalid(
                "retry_amplifier must be greater than zero".to_string(),
            ));
        }
        if self.event_queue_capacity == 0 || self.status_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be greater than zero".to_string(),
            ));
        }
        if self.max_messages_per_post == 0 {
            return Err(ConfigError::Invalid(
                "max_messages_per_post must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Which backend the reporter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterType {
    /// Long-lived RPC connection to the collector (the default).
    Ssl,
    /// One datagram per event to a local relay.
    Udp,
    /// Accept and drop everything.
    None,
}

impl ReporterType {
    fn from_env_value(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "udp" => ReporterType::Udp,
            "none" => ReporterType::None,
            _ => ReporterType::Ssl,
        }
    }
}

/// Everything needed to construct a reporter, usually read from the environment.
#[derive(Debug, Clone)]
pub struct ReporterOptions {
    pub reporter_type: ReporterType,
    pub service_key: Option<String>,
    /// Collector address as `host:port`.
    pub collector_addr: String,
    /// Extra PEM root certificate trusted when dialing the collector.
    pub trusted_cert_path: Option<PathBuf>,
    /// Dial the collector over plain HTTP. Only meant for local collectors.
    pub plaintext: bool,
    pub udp_addr: String,
    pub hostname_alias: Option<String>,
    pub log_level: LogLevel,
    pub config: ReporterConfig,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        ReporterOptions {
            reporter_type: ReporterType::Ssl,
            service_key: None,
            collector_addr: DEFAULT_COLLECTOR_ADDR.to_string(),
            trusted_cert_path: None,
            plaintext: false,
            udp_addr: DEFAULT_UDP_ADDR.to_string(),
            hostname_alias: None,
            log_level: LogLevel::Error,
            config: ReporterConfig::default(),
        }
    }
}

impl ReporterOptions {
    pub fn from_env() -> Result<ReporterOptions, ConfigError> {
        let disabled = env::var("APPOPTICS_DISABLED")
            .map(|val| val.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let reporter_type = if disabled {
            ReporterType::None
        } else {
            env::var("APPOPTICS_REPORTER")
                .map(|val| ReporterType::from_env_value(&val))
                .unwrap_or(ReporterType::Ssl)
        };

        let service_key = env::var("APPOPTICS_SERVICE_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        let collector_addr = env::var("APPOPTICS_COLLECTOR")
            .ok()
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| DEFAULT_COLLECTOR_ADDR.to_string());

        let udp_addr = env::var("APPOPTICS_COLLECTOR_UDP")
            .ok()
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| DEFAULT_UDP_ADDR.to_string());

        let log_level = match env::var("APPOPTICS_DEBUG_LEVEL") {
            Ok(level) => LogLevel::parse(&level).unwrap_or_else(|| {
                tracing::warn!("APPOPTICS_DEBUG_LEVEL '{level}' is not valid, using error");
                LogLevel::Error
            }),
            Err(_) => LogLevel::Error,
        };

        let config = match env::var("APPOPTICS_REPORTER_CONFIG") {
            Ok(json) if !json.trim().is_empty() => ReporterConfig::from_json(&json)?,
            _ => ReporterConfig::default(),
        };

        Ok(ReporterOptions {
            reporter_type,
            service_key,
            collector_addr,
            trusted_cert_path: env::var("APPOPTICS_TRUSTEDPATH").ok().map(PathBuf::from),
            plaintext: env::var("APPOPTICS_INSECURE_PLAINTEXT")
                .map(|val| val.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            udp_addr,
            hostname_alias: env::var("APPOPTICS_HOSTNAME_ALIAS")
                .ok()
                .filter(|alias| !alias.is_empty()),
            log_level,
            config,
        })
    }
}
