// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock implementations of the reporter collaborators for testing

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appoptics_collector_proto::{
    MessageRequest, MessageResult, SettingsRequest, SettingsResult,
};
use appoptics_reporter::aggregator::{HostIdentity, MetricsAggregator, MetricsRecord};
use appoptics_reporter::config::ReporterConfig;
use appoptics_reporter::error::TransportError;
use appoptics_reporter::event::PayloadEncoder;
use appoptics_reporter::host::HostInfo;
use appoptics_reporter::transport::{CollectorClient, Dialer};
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

type Scripted<T> = Mutex<VecDeque<Result<T, TransportError>>>;

/// Collector that records every request and answers from per-call scripts. Unscripted
/// calls answer OK.
#[derive(Default)]
pub struct MockCollector {
    events: Mutex<Vec<MessageRequest>>,
    metrics: Mutex<Vec<MessageRequest>>,
    status: Mutex<Vec<MessageRequest>>,
    settings: Mutex<Vec<SettingsRequest>>,
    events_script: Scripted<MessageResult>,
    metrics_script: Scripted<MessageResult>,
    status_script: Scripted<MessageResult>,
    settings_script: Scripted<SettingsResult>,
    event_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_events(&self, result: Result<MessageResult, TransportError>) {
        self.events_script.lock().unwrap().push_back(result);
    }

    pub fn script_metrics(&self, result: Result<MessageResult, TransportError>) {
        self.metrics_script.lock().unwrap().push_back(result);
    }

    pub fn script_status(&self, result: Result<MessageResult, TransportError>) {
        self.status_script.lock().unwrap().push_back(result);
    }

    pub fn script_settings(&self, result: Result<SettingsResult, TransportError>) {
        self.settings_script.lock().unwrap().push_back(result);
    }

    /// How long each events post takes.
    pub fn set_event_delay(&self, delay: Duration) {
        *self.event_delay.lock().unwrap() = delay;
    }

    pub fn events(&self) -> Vec<MessageRequest> {
        self.events.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> Vec<MessageRequest> {
        self.metrics.lock().unwrap().clone()
    }

    pub fn status(&self) -> Vec<MessageRequest> {
        self.status.lock().unwrap().clone()
    }

    pub fn settings(&self) -> Vec<SettingsRequest> {
        self.settings.lock().unwrap().clone()
    }

    /// Sizes of the events of every posted batch, in posting order.
    pub fn event_batches(&self) -> Vec<Vec<usize>> {
        self.events()
            .iter()
            .map(|req| req.messages.iter().map(Vec::len).collect())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn next<T: Default>(script: &Scripted<T>) -> Result<T, TransportError> {
    script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Ok(T::default()))
}

#[async_trait]
impl CollectorClient for MockCollector {
    async fn post_events(&self, request: MessageRequest) -> Result<MessageResult, TransportError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.events.lock().unwrap().push(request);

        let delay = *self.event_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next(&self.events_script)
    }

    async fn post_metrics(&self, request: MessageRequest) -> Result<MessageResult, TransportError> {
        self.metrics.lock().unwrap().push(request);
        next(&self.metrics_script)
    }

    async fn post_status(&self, request: MessageRequest) -> Result<MessageResult, TransportError> {
        self.status.lock().unwrap().push(request);
        next(&self.status_script)
    }

    async fn get_settings(
        &self,
        request: SettingsRequest,
    ) -> Result<SettingsResult, TransportError> {
        self.settings.lock().unwrap().push(request);
        next(&self.settings_script)
    }
}

/// Dialer handing out one shared [`MockCollector`]. Records every dialed address.
pub struct MockDialer {
    collector: Arc<MockCollector>,
    addrs: Mutex<Vec<String>>,
    failures_left: AtomicUsize,
    fail_always: AtomicBool,
    /// Dials succeed up to this many times, then fail.
    successes_left: Mutex<Option<usize>>,
}

impl MockDialer {
    pub fn new(collector: Arc<MockCollector>) -> Arc<Self> {
        Arc::new(Self {
            collector,
            addrs: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            successes_left: Mutex::new(None),
        })
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.fail_always.store(true, Ordering::SeqCst);
    }

    pub fn succeed_only(&self, count: usize) {
        *self.successes_left.lock().unwrap() = Some(count);
    }

    pub fn addrs(&self) -> Vec<String> {
        self.addrs.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.addrs.lock().unwrap().len()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn CollectorClient>, TransportError> {
        self.addrs.lock().unwrap().push(addr.to_string());

        let refused = || TransportError::Dial {
            addr: addr.to_string(),
            reason: "connection refused".to_string(),
        };
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(refused());
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(refused());
        }
        if let Some(left) = self.successes_left.lock().unwrap().as_mut() {
            if *left == 0 {
                return Err(refused());
            }
            *left -= 1;
        }
        Ok(self.collector.clone())
    }
}

/// Aggregator returning a fixed snapshot on every flush.
pub struct MockAggregator {
    snapshot: Mutex<Option<Bytes>>,
    records: Mutex<Vec<MetricsRecord>>,
    flushes: AtomicUsize,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl MockAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(Some(Bytes::from_static(b"metrics-snapshot"))),
            records: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn set_snapshot(&self, snapshot: Option<Bytes>) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsAggregator for MockAggregator {
    fn push_record(&self, record: MetricsRecord) -> bool {
        self.records.lock().unwrap().push(record);
        true
    }

    async fn flush_snapshot(&self, _config: &ReporterConfig) -> Option<Bytes> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.snapshot.lock().unwrap().clone()
    }

    fn host_identity(&self) -> HostIdentity {
        HostIdentity {
            ip_addresses: vec!["10.0.0.7".to_string()],
            uuid: "host-uuid".to_string(),
        }
    }

    async fn process_metrics(&self, exit: CancellationToken) {
        self.started.store(true, Ordering::SeqCst);
        exit.cancelled().await;
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Encoder writing `key=value;` pairs and sharing what it wrote with the test.
#[derive(Default, Clone)]
pub struct MockEncoder {
    fields: Arc<Mutex<Vec<(String, String)>>>,
    body: String,
}

impl MockEncoder {
    pub fn with_body(body: &str) -> Self {
        Self {
            body: body.to_string(),
            ..Default::default()
        }
    }

    pub fn fields(&self) -> Vec<(String, String)> {
        self.fields.lock().unwrap().clone()
    }

    pub fn field(&self, key: &str) -> Option<String> {
        self.fields()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn add(&mut self, key: &str, value: String) {
        self.fields.lock().unwrap().push((key.to_string(), value));
    }
}

impl PayloadEncoder for MockEncoder {
    fn add_i64(&mut self, key: &str, value: i64) {
        self.add(key, value.to_string());
    }

    fn add_int(&mut self, key: &str, value: i32) {
        self.add(key, value.to_string());
    }

    fn add_string(&mut self, key: &str, value: &str) {
        self.add(key, value.to_string());
    }

    fn finish(&mut self) -> Bytes {
        let mut out = self.body.clone();
        for (key, value) in self.fields() {
            out.push_str(&format!("{key}={value};"));
        }
        Bytes::from(out)
    }
}

pub struct FixedHost;

impl HostInfo for FixedHost {
    fn hostname(&self) -> &str {
        "test-host"
    }

    fn pid(&self) -> u32 {
        4242
    }
}
