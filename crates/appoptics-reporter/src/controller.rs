// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The periodic controller.
//!
//! One task, one iteration per tick, in a fixed order: metrics, status, settings,
//! settings TTL, shutdown check, health check. It is the only owner of the
//! [`Connection`] and of the three [`Sender`]s; everybody else sees the connection
//! through the [`ConnectionSnapshot`] published at the end of each tick.

use std::fmt;
use std::sync::Arc;

use appoptics_collector_proto::{
    EncodingType, HostId, MessageRequest, ResultCode, SettingsRequest,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::MetricsAggregator;
use crate::config::ReporterConfig;
use crate::connection::{Connection, ConnectionSnapshot, ConnectionStatus};
use crate::host::HostInfo;
use crate::schedule::TickGrid;
use crate::sender::Sender;
use crate::settings::{invalidate_outdated_settings, SettingsStore};
use crate::transport::Dialer;

pub const CLIENT_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageClass {
    Metrics,
    Status,
    Settings,
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageClass::Metrics => write!(f, "metrics"),
            MessageClass::Status => write!(f, "status"),
            MessageClass::Settings => write!(f, "settings"),
        }
    }
}

/// Collaborators the controller works with.
#[derive(Clone)]
pub struct ControllerDeps {
    pub dialer: Arc<dyn Dialer>,
    pub aggregator: Arc<dyn MetricsAggregator>,
    pub host: Arc<dyn HostInfo>,
    pub settings: Arc<SettingsStore>,
}

/// What other tasks keep to talk to a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    pub connection: watch::Receiver<ConnectionSnapshot>,
    pub ready: watch::Receiver<bool>,
    pub status: mpsc::Sender<Vec<u8>>,
}

pub struct Controller {
    config: ReporterConfig,
    api_key: String,
    deps: ControllerDeps,
    grid: TickGrid,
    conn: Connection,
    metrics: Sender,
    status: Sender,
    settings: Sender,
    status_rx: mpsc::Receiver<Vec<u8>>,
    ttl_deadline: Instant,
    last_tick: Instant,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
    ready_tx: watch::Sender<bool>,
    exit: CancellationToken,
    aggregator_exit: CancellationToken,
}

impl Controller {
    pub fn new(
        config: ReporterConfig,
        api_key: impl Into<String>,
        addr: impl Into<String>,
        deps: ControllerDeps,
        exit: CancellationToken,
    ) -> (Self, ControllerHandle) {
        let start = Instant::now();
        let grid = TickGrid::new(start);
        let (snapshot_tx, connection) = watch::channel(ConnectionSnapshot::default());
        let (ready_tx, ready) = watch::channel(false);
        let (status_tx, status_rx) = mpsc::channel(config.status_queue_capacity);

        let sender = |name, next_time| {
            Sender::new(
                name,
                config.initial_retry_interval,
                config.max_retry_interval,
                next_time,
            )
        };

        let controller = Self {
            // the first snapshot covers a full metrics interval
            metrics: sender("metrics", start + config.metrics_interval),
            status: sender("status", start),
            settings: sender("settings", start),
            conn: Connection::new(addr, grid, start),
            ttl_deadline: grid.next(start, config.settings_ttl_check_interval),
            last_tick: start,
            api_key: api_key.into(),
            deps,
            grid,
            status_rx,
            snapshot_tx,
            ready_tx,
            aggregator_exit: CancellationToken::new(),
            exit,
            config,
        };
        let handle = ControllerHandle {
            connection,
            ready,
            status: status_tx,
        };
        (controller, handle)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn metrics_sender(&self) -> &Sender {
        &self.metrics
    }

    pub fn status_sender(&self) -> &Sender {
        &self.status
    }

    pub fn settings_sender(&self) -> &Sender {
        &self.settings
    }

    /// Runs until the connection is closed, then cancels the exit token so the
    /// event pipeline stops as well.
    pub async fn run(mut self) {
        self.start().await;
        loop {
            let now = self.wait_for_next_tick().await;
            if self.tick(now).await {
                break;
            }
        }
        self.exit.cancel();
        debug!("periodic controller stopped");
    }

    /// Starts the aggregator's background processing and makes the first dial.
    pub async fn start(&mut self) {
        let aggregator = self.deps.aggregator.clone();
        let aggregator_exit = self.aggregator_exit.clone();
        tokio::spawn(async move { aggregator.process_metrics(aggregator_exit).await });

        self.conn.set_curr_time(Instant::now());
        self.conn
            .reconnect(self.deps.dialer.as_ref(), &self.config)
            .await;
        self.publish();
    }

    /// Runs one iteration at tick time `now`. Returns `true` once the connection is
    /// closed and its resources released.
    pub async fn tick(&mut self, now: Instant) -> bool {
        self.last_tick = now;
        self.conn.set_curr_time(now);

        self.send_metrics().await;
        self.send_status().await;
        self.get_settings().await;
        invalidate_outdated_settings(
            &self.deps.settings,
            &mut self.ttl_deadline,
            now,
            self.config.settings_ttl_check_interval,
            &self.grid,
        );

        if self.exit.is_cancelled() {
            self.conn.mark_closing();
        }

        self.health_check().await;
        self.publish();
        self.conn.is_closed()
    }

    async fn wait_for_next_tick(&self) -> Instant {
        let interval = self.config.tick_interval;
        let mut next = self.grid.next(Instant::now(), interval);
        if next <= self.last_tick {
            next = self.last_tick + interval;
        }
        tokio::select! {
            () = sleep_until(next) => next,
            () = self.exit.cancelled() => Instant::now(),
        }
    }

    fn publish(&mut self) {
        self.snapshot_tx.send_replace(self.conn.snapshot());
        if self.conn.is_healthy() && !*self.ready_tx.borrow() {
            info!("reporter ready");
            self.ready_tx.send_replace(true);
        }
    }

    fn sender_mut(&mut self, class: MessageClass) -> &mut Sender {
        match class {
            MessageClass::Metrics => &mut self.metrics,
            MessageClass::Status => &mut self.status,
            MessageClass::Settings => &mut self.settings,
        }
    }

    fn message_request(&self, sender: &Sender) -> MessageRequest {
        MessageRequest {
            api_key: self.api_key.clone(),
            messages: sender.messages().cloned().collect(),
            encoding: EncodingType::Bson as i32,
            identity: None,
        }
    }

    async fn send_metrics(&mut self) {
        let now = self.conn.curr_time();
        if self.metrics.next_time() < now {
            self.metrics
                .set_next_time(self.grid.next(now, self.config.metrics_interval));
            if let Some(message) = self.deps.aggregator.flush_snapshot(&self.config).await {
                self.metrics
                    .push_capped(message.to_vec(), self.config.max_messages_per_post);
            }
        }

        if self.metrics.waiting_for_retry(now) {
            return;
        }
        if !self.conn.is_healthy() || self.metrics.is_empty() {
            return;
        }
        let Some(client) = self.conn.client() else {
            return;
        };

        let request = self.message_request(&self.metrics);
        match client.post_metrics(request).await {
            Ok(result) => {
                self.conn.reschedule_keep_alive(self.config.keep_alive_interval);
                self.handle_result(MessageClass::Metrics, result.result, &result.arg);
            }
            Err(e) => {
                info!("error sending metrics: {e}");
                self.conn.mark_disconnected();
            }
        }
    }

    async fn send_status(&mut self) {
        let now = self.conn.curr_time();
        if !self.conn.is_healthy() || self.status.waiting_for_retry(now) {
            return;
        }
        if self.status.is_empty() && !self.load_status_messages().await {
            return;
        }
        let Some(client) = self.conn.client() else {
            return;
        };

        let request = self.message_request(&self.status);
        match client.post_status(request).await {
            Ok(result) => {
                self.conn.reschedule_keep_alive(self.config.keep_alive_interval);
                self.handle_result(MessageClass::Status, result.result, &result.arg);
            }
            Err(e) => {
                info!("error sending status: {e}");
                self.conn.mark_disconnected();
            }
        }
    }

    /// Moves queued status messages into the status sender. When none is queued, waits
    /// a short while for one.
    async fn load_status_messages(&mut self) -> bool {
        while let Ok(message) = self.status_rx.try_recv() {
            self.status.push(message);
        }
        if self.status.is_empty() {
            if let Ok(Some(message)) =
                timeout(self.config.status_load_block, self.status_rx.recv()).await
            {
                self.status.push(message);
                while let Ok(message) = self.status_rx.try_recv() {
                    self.status.push(message);
                }
            }
        }
        !self.status.is_empty()
    }

    async fn get_settings(&mut self) {
        if !self.conn.is_healthy() {
            return;
        }
        let now = self.conn.curr_time();
        let due = if self.settings.retry_active() {
            self.settings.retry_due(now)
        } else {
            self.settings.next_time() < now || self.conn.keep_alive_due()
        };
        if !due {
            return;
        }
        let Some(client) = self.conn.client() else {
            return;
        };

        debug!("updating settings");
        let identity = self.deps.aggregator.host_identity();
        let request = SettingsRequest {
            api_key: self.api_key.clone(),
            identity: Some(HostId {
                hostname: self.deps.host.hostname().to_string(),
                ip_addresses: identity.ip_addresses,
                uuid: identity.uuid,
                pid: i32::try_from(self.deps.host.pid()).unwrap_or(i32::MAX),
            }),
            client_version: CLIENT_VERSION.to_string(),
        };

        match client.get_settings(request).await {
            Ok(result) => {
                self.conn.reschedule_keep_alive(self.config.keep_alive_interval);
                if result.result == ResultCode::Ok as i32 {
                    self.deps.settings.store(&result, now);
                    self.settings
                        .set_next_time(self.grid.next(now, self.config.settings_refresh_interval));
                }
                self.handle_result(MessageClass::Settings, result.result, &result.arg);
            }
            Err(e) => {
                info!("error retrieving settings: {e}");
                self.conn.mark_disconnected();
            }
        }
    }

    fn handle_result(&mut self, class: MessageClass, code: i32, arg: &str) {
        let Ok(code) = ResultCode::try_from(code) else {
            warn!("unknown result code {code} from collector for {class}, state unchanged");
            return;
        };
        let now = self.conn.curr_time();
        match code {
            ResultCode::Ok => {
                debug!("sent {class}");
                let sender = self.sender_mut(class);
                sender.clear();
                sender.reset();
                self.conn.reset_redirects();
            }
            ResultCode::TryLater | ResultCode::LimitExceeded => {
                info!("got {} from collector for {class}", code.as_str_name());
                let amplifier = self.config.retry_amplifier;
                let ceiling = self.config.max_metrics_retries;
                let sender = self.sender_mut(class);
                if class == MessageClass::Settings {
                    // settings are retried forever
                    sender.restart_retry_count();
                }
                let scheduled = sender.schedule_retry(now, amplifier, ceiling);
                if scheduled && class == MessageClass::Metrics {
                    sender.drop_oldest();
                } else {
                    sender.clear();
                }
            }
            ResultCode::InvalidApiKey => {
                warn!("got INVALID_API_KEY from collector, closing the connection");
                self.conn.mark_closing();
                self.sender_mut(class).clear();
            }
            ResultCode::Redirect => self.process_redirect(arg),
        }
    }

    fn process_redirect(&mut self, host: &str) {
        if self
            .conn
            .redirect(host, self.config.max_conn_redirects)
            .is_ok()
        {
            self.metrics.cancel_retry();
        }
    }

    async fn health_check(&mut self) {
        match self.conn.status() {
            ConnectionStatus::Healthy => {}
            ConnectionStatus::Closing => self.release(),
            ConnectionStatus::Disconnected => {
                self.conn
                    .reconnect(self.deps.dialer.as_ref(), &self.config)
                    .await;
            }
        }
    }

    fn release(&mut self) {
        if self.conn.release() {
            self.metrics.clear();
            self.status.clear();
            self.settings.clear();
            self.aggregator_exit.cancel();
        }
    }
}
