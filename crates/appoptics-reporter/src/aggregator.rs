// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request metrics aggregation.
//!
//! Records pushed from request handlers are accumulated per transaction by a background
//! task and turned into one metrics message per metrics interval.

use std::collections::HashMap;
use std::net::{SocketAddrV4, SocketAddrV6};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ReporterConfig;
use crate::event::{BsonEncoder, PayloadEncoder};
use crate::host::HostInfo;

pub const DEFAULT_MAX_TRANSACTIONS: usize = 200;
const RECORD_QUEUE_CAPACITY: usize = 10_000;
const OTHER_TRANSACTION: &str = "other";

/// One served request.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRecord {
    pub transaction: String,
    pub duration: Duration,
    pub status: u16,
    pub method: String,
    pub has_error: bool,
}

/// Process identity sent along with settings requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub ip_addresses: Vec<String>,
    pub uuid: String,
}

#[async_trait]
pub trait MetricsAggregator: Send + Sync {
    /// Hands a record over. Returns `false` when it was not accepted.
    fn push_record(&self, record: MetricsRecord) -> bool;

    /// Encodes everything accumulated since the previous flush.
    async fn flush_snapshot(&self, config: &ReporterConfig) -> Option<Bytes>;

    fn host_identity(&self) -> HostIdentity;

    /// Background processing; returns once `exit` is cancelled.
    async fn process_metrics(&self, exit: CancellationToken);
}

#[derive(Debug, Clone, Default, PartialEq)]
struct TransactionStats {
    count: u64,
    errors: u64,
    total_duration: Duration,
    max_duration: Duration,
}

#[derive(Debug)]
enum AggregatorCommand {
    Record(MetricsRecord),
    Flush(oneshot::Sender<HashMap<String, TransactionStats>>),
}

/// Aggregates records per transaction name, up to a maximum number of distinct
/// transactions; the overflow is folded into an `other` transaction.
pub struct TransactionAggregator {
    tx: mpsc::Sender<AggregatorCommand>,
    rx: Mutex<Option<mpsc::Receiver<AggregatorCommand>>>,
    max_transactions: usize,
    hostname: String,
    identity: HostIdentity,
}

impl TransactionAggregator {
    pub fn new(host: &dyn HostInfo) -> Self {
        let (tx, rx) = mpsc::channel(RECORD_QUEUE_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            max_transactions: DEFAULT_MAX_TRANSACTIONS,
            hostname: host.hostname().to_string(),
            identity: HostIdentity {
                ip_addresses: local_ip_addresses(),
                uuid: host_uuid(),
            },
        }
    }

    #[must_use]
    pub fn with_max_transactions(mut self, max_transactions: usize) -> Self {
        self.max_transactions = max_transactions;
        self
    }

    fn record(&self, stats: &mut HashMap<String, TransactionStats>, record: MetricsRecord) {
        let key = if stats.contains_key(&record.transaction) || stats.len() < self.max_transactions
        {
            record.transaction
        } else {
            OTHER_TRANSACTION.to_string()
        };
        let entry = stats.entry(key).or_default();
        entry.count += 1;
        if record.has_error || record.status >= 500 {
            entry.errors += 1;
        }
        entry.total_duration += record.duration;
        entry.max_duration = entry.max_duration.max(record.duration);
    }

    fn encode(
        &self,
        stats: &HashMap<String, TransactionStats>,
        config: &ReporterConfig,
    ) -> Bytes {
        let mut encoder = BsonEncoder::new();
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        encoder.add_i64("Timestamp_u", micros);
        encoder.add_string("Hostname", &self.hostname);
        encoder.add_int(
            "MetricsFlushInterval",
            i32::try_from(config.metrics_interval.as_secs()).unwrap_or(i32::MAX),
        );
        encoder.add_int(
            "TransactionNameOverflow",
            i32::from(stats.contains_key(OTHER_TRANSACTION)),
        );

        let mut names: Vec<&String> = stats.keys().collect();
        names.sort();
        for name in names {
            let Some(s) = stats.get(name) else { continue };
            encoder.add_i64(&format!("{name}.count"), to_i64(s.count));
            encoder.add_i64(&format!("{name}.errors"), to_i64(s.errors));
            encoder.add_i64(
                &format!("{name}.duration_us"),
                to_i64(s.total_duration.as_micros()),
            );
            encoder.add_i64(
                &format!("{name}.max_duration_us"),
                to_i64(s.max_duration.as_micros()),
            );
        }
        encoder.finish()
    }
}

fn to_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

#[async_trait]
impl MetricsAggregator for TransactionAggregator {
    fn push_record(&self, record: MetricsRecord) -> bool {
        self.tx.try_send(AggregatorCommand::Record(record)).is_ok()
    }

    async fn flush_snapshot(&self, config: &ReporterConfig) -> Option<Bytes> {
        let (response_tx, response_rx) = oneshot::channel();
        if let Err(e) = self.tx.try_send(AggregatorCommand::Flush(response_tx)) {
            warn!("failed to request a metrics flush: {e}");
            return None;
        }
        match response_rx.await {
            Ok(stats) => Some(self.encode(&stats, config)),
            Err(e) => {
                debug!("metrics processing is not running: {e}");
                None
            }
        }
    }

    fn host_identity(&self) -> HostIdentity {
        self.identity.clone()
    }

    async fn process_metrics(&self, exit: CancellationToken) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("metrics processing already started");
            return;
        };
        debug!("metrics processing started");

        let mut stats: HashMap<String, TransactionStats> = HashMap::new();
        loop {
            tokio::select! {
                () = exit.cancelled() => break,
                command = rx.recv() => match command {
                    Some(AggregatorCommand::Record(record)) => self.record(&mut stats, record),
                    Some(AggregatorCommand::Flush(response_tx)) => {
                        if response_tx.send(std::mem::take(&mut stats)).is_err() {
                            error!("failed to send metrics flush response, receiver dropped");
                        }
                    }
                    None => break,
                },
            }
        }

        debug!("metrics processing stopped");
    }
}

fn local_ip_addresses() -> Vec<String> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("failed to list network interfaces: {e}");
            return Vec::new();
        }
    };

    let mut ips: Vec<String> = addrs
        .filter(|ifaddr| !ifaddr.flags.contains(nix::net::if_::InterfaceFlags::IFF_LOOPBACK))
        .filter_map(|ifaddr| ifaddr.address)
        .filter_map(|addr| {
            if let Some(v4) = addr.as_sockaddr_in() {
                Some(SocketAddrV4::from(*v4).ip().to_string())
            } else {
                addr.as_sockaddr_in6()
                    .map(|v6| SocketAddrV6::from(*v6).ip().to_string())
            }
        })
        .collect();
    ips.sort();
    ips.dedup();
    ips
}

fn host_uuid() -> String {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|id| id.trim().to_string())
        .unwrap_or_default()
}
