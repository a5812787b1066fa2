// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector-provided settings.
//!
//! The latest settings are kept as one immutable [`SettingsSnapshot`]; a fetch replaces
//! it in a single step so readers never observe a partially applied update.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use appoptics_collector_proto::{OboeSetting, OboeSettingType, SettingsResult};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::schedule::TickGrid;

pub const KV_BUCKET_CAPACITY: &str = "BucketCapacity";
pub const KV_BUCKET_RATE: &str = "BucketRate";
pub const KV_METRICS_FLUSH_INTERVAL: &str = "MetricsFlushInterval";
pub const KV_EVENTS_FLUSH_INTERVAL: &str = "EventsFlushInterval";
pub const KV_MAX_TRANSACTIONS: &str = "MaxTransactions";

/// Well-known arguments attached to a setting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingArgs {
    pub bucket_capacity: Option<f64>,
    pub bucket_rate: Option<f64>,
    pub metrics_flush_interval: Option<u32>,
    pub events_flush_interval: Option<u32>,
    pub max_transactions: Option<u32>,
}

impl SettingArgs {
    /// Reads the known keys. Values with an unexpected width are ignored.
    pub fn from_map(args: &HashMap<String, Vec<u8>>) -> Self {
        Self {
            bucket_capacity: args.get(KV_BUCKET_CAPACITY).and_then(|b| read_f64(b)),
            bucket_rate: args.get(KV_BUCKET_RATE).and_then(|b| read_f64(b)),
            metrics_flush_interval: args.get(KV_METRICS_FLUSH_INTERVAL).and_then(|b| read_u32(b)),
            events_flush_interval: args.get(KV_EVENTS_FLUSH_INTERVAL).and_then(|b| read_u32(b)),
            max_transactions: args.get(KV_MAX_TRANSACTIONS).and_then(|b| read_u32(b)),
        }
    }

    /// Little-endian encoding of the present values. Negative rates and capacities are
    /// left out.
    pub fn to_map(&self) -> HashMap<String, Vec<u8>> {
        let mut args = HashMap::new();
        if let Some(capacity) = self.bucket_capacity.filter(|v| *v >= 0.0) {
            args.insert(KV_BUCKET_CAPACITY.to_string(), capacity.to_le_bytes().to_vec());
        }
        if let Some(rate) = self.bucket_rate.filter(|v| *v >= 0.0) {
            args.insert(KV_BUCKET_RATE.to_string(), rate.to_le_bytes().to_vec());
        }
        if let Some(interval) = self.metrics_flush_interval {
            args.insert(
                KV_METRICS_FLUSH_INTERVAL.to_string(),
                interval.to_le_bytes().to_vec(),
            );
        }
        if let Some(interval) = self.events_flush_interval {
            args.insert(
                KV_EVENTS_FLUSH_INTERVAL.to_string(),
                interval.to_le_bytes().to_vec(),
            );
        }
        if let Some(max) = self.max_transactions {
            args.insert(KV_MAX_TRANSACTIONS.to_string(), max.to_le_bytes().to_vec());
        }
        args
    }
}

fn read_f64(bytes: &[u8]) -> Option<f64> {
    <[u8; 8]>::try_from(bytes).ok().map(f64::from_le_bytes)
}

fn read_u32(bytes: &[u8]) -> Option<u32> {
    <[u8; 4]>::try_from(bytes).ok().map(u32::from_le_bytes)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSetting {
    pub kind: OboeSettingType,
    pub flags: String,
    pub timestamp: i64,
    pub value: i64,
    pub layer: String,
    pub ttl: Duration,
    pub args: SettingArgs,
}

impl From<&OboeSetting> for CollectorSetting {
    fn from(setting: &OboeSetting) -> Self {
        Self {
            kind: setting.r#type(),
            flags: String::from_utf8_lossy(&setting.flags).into_owned(),
            timestamp: setting.timestamp,
            value: setting.value,
            layer: String::from_utf8_lossy(&setting.layer).into_owned(),
            ttl: Duration::from_secs(u64::try_from(setting.ttl).unwrap_or(0)),
            args: SettingArgs::from_map(&setting.arguments),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsSnapshot {
    pub settings: Vec<CollectorSetting>,
    pub received_at: Option<Instant>,
}

impl SettingsSnapshot {
    /// Settings whose TTL has run out at `now`. A zero TTL never expires.
    pub fn expired(&self, now: Instant) -> usize {
        let Some(received_at) = self.received_at else {
            return 0;
        };
        self.settings
            .iter()
            .filter(|s| !s.ttl.is_zero() && received_at + s.ttl <= now)
            .count()
    }
}

/// Process-wide holder of the latest settings.
#[derive(Debug)]
pub struct SettingsStore {
    latest: watch::Sender<Arc<SettingsSnapshot>>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        let (latest, _) = watch::channel(Arc::new(SettingsSnapshot::default()));
        Self { latest }
    }
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot with the settings of `result`. A result without settings
    /// keeps the previous snapshot and returns `false`.
    pub fn store(&self, result: &SettingsResult, now: Instant) -> bool {
        if result.settings.is_empty() {
            debug!("settings result carried no settings, keeping the previous ones");
            return false;
        }
        let snapshot = SettingsSnapshot {
            settings: result.settings.iter().map(CollectorSetting::from).collect(),
            received_at: Some(now),
        };
        debug!("stored {} collector settings", snapshot.settings.len());
        self.latest.send_replace(Arc::new(snapshot));
        true
    }

    pub fn latest(&self) -> Arc<SettingsSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SettingsSnapshot>> {
        self.latest.subscribe()
    }
}

/// Moves the TTL check deadline forward once it has passed.
///
/// Stale settings are reported but stay in place: the snapshot is only ever replaced by
/// a newer fetch.
pub fn invalidate_outdated_settings(
    store: &SettingsStore,
    deadline: &mut Instant,
    now: Instant,
    interval: Duration,
    grid: &TickGrid,
) {
    if *deadline < now {
        let expired = store.latest().expired(now);
        if expired > 0 {
            info!("{expired} collector settings are past their TTL");
        }
        *deadline = grid.next(now, interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appoptics_collector_proto::ResultCode;

    fn setting(value: i64, ttl: i64) -> OboeSetting {
        OboeSetting {
            r#type: OboeSettingType::DefaultSampleRate as i32,
            flags: b"SAMPLE_START,SAMPLE_THROUGH_ALWAYS".to_vec(),
            value,
            ttl,
            arguments: SettingArgs {
                bucket_capacity: Some(16.0),
                bucket_rate: Some(8.0),
                metrics_flush_interval: Some(60),
                events_flush_interval: None,
                max_transactions: Some(200),
            }
            .to_map(),
            ..Default::default()
        }
    }

    #[test]
    fn test_args_encoding() {
        let args = SettingArgs {
            bucket_capacity: Some(2.5),
            bucket_rate: Some(-1.0),
            max_transactions: Some(200),
            ..Default::default()
        }
        .to_map();

        assert_eq!(args.get(KV_BUCKET_CAPACITY), Some(&2.5f64.to_le_bytes().to_vec()));
        assert_eq!(args.get(KV_MAX_TRANSACTIONS), Some(&vec![200, 0, 0, 0]));
        assert!(!args.contains_key(KV_BUCKET_RATE));
        assert!(!args.contains_key(KV_METRICS_FLUSH_INTERVAL));
    }

    #[test]
    fn test_args_decoding_ignores_wrong_widths() {
        let mut raw = HashMap::new();
        raw.insert(KV_BUCKET_RATE.to_string(), vec![1, 2, 3]);
        raw.insert(KV_EVENTS_FLUSH_INTERVAL.to_string(), 5u32.to_le_bytes().to_vec());

        let args = SettingArgs::from_map(&raw);
        assert_eq!(args.bucket_rate, None);
        assert_eq!(args.events_flush_interval, Some(5));
    }

    #[test]
    fn test_store_replaces_snapshot() {
        let store = SettingsStore::new();
        let now = Instant::now();
        let result = SettingsResult {
            result: ResultCode::Ok as i32,
            settings: vec![setting(1_000_000, 120)],
            ..Default::default()
        };
        assert!(store.store(&result, now));

        let latest = store.latest();
        assert_eq!(latest.settings.len(), 1);
        let stored = &latest.settings[0];
        assert_eq!(stored.kind, OboeSettingType::DefaultSampleRate);
        assert_eq!(stored.value, 1_000_000);
        assert_eq!(stored.ttl, Duration::from_secs(120));
        assert_eq!(stored.args.max_transactions, Some(200));
        assert_eq!(stored.flags, "SAMPLE_START,SAMPLE_THROUGH_ALWAYS");
    }

    #[test]
    fn test_empty_result_keeps_previous_snapshot() {
        let store = SettingsStore::new();
        let now = Instant::now();
        store.store(
            &SettingsResult {
                settings: vec![setting(1, 60)],
                ..Default::default()
            },
            now,
        );
        assert!(!store.store(&SettingsResult::default(), now));
        assert_eq!(store.latest().settings[0].value, 1);
    }

    #[test]
    fn test_subscribers_see_complete_snapshots() {
        let store = SettingsStore::new();
        let mut rx = store.subscribe();
        store.store(
            &SettingsResult {
                settings: vec![setting(1, 60), setting(2, 60)],
                ..Default::default()
            },
            Instant::now(),
        );
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().settings.len(), 2);
    }

    #[test]
    fn test_invalidate_only_advances_deadline() {
        let store = SettingsStore::new();
        let origin = Instant::now();
        let grid = TickGrid::new(origin);
        store.store(
            &SettingsResult {
                settings: vec![setting(1, 5)],
                ..Default::default()
            },
            origin,
        );

        let interval = Duration::from_secs(10);
        let mut deadline = origin + interval;

        // deadline not reached yet
        invalidate_outdated_settings(&store, &mut deadline, origin + interval, interval, &grid);
        assert_eq!(deadline, origin + interval);

        let now = origin + Duration::from_secs(12);
        invalidate_outdated_settings(&store, &mut deadline, now, interval, &grid);
        assert_eq!(deadline, origin + Duration::from_secs(20));
        assert_eq!(store.latest().expired(now), 1);
        assert_eq!(store.latest().settings.len(), 1);
    }
}
