// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reporter backends and the [`Reporter`] facade handed to the rest of the
//! instrumentation.
//!
//! The backend is picked once, when the reporter starts:
//! - [`NullReporter`] accepts and drops everything,
//! - [`UdpReporter`] writes one datagram per event to a local relay,
//! - [`CollectorReporter`] runs the event pipeline and the periodic controller against
//!   the collector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{MetricsAggregator, MetricsRecord, TransactionAggregator};
use crate::config::{ReporterConfig, ReporterOptions, ReporterType};
use crate::connection::ConnectionSnapshot;
use crate::controller::{Controller, ControllerDeps};
use crate::error::{ReportError, ReporterError};
use crate::event::{prepare_event, Event, TraceContext};
use crate::event_pipeline::{EventPipeline, EventPipelineConfig, EventSender};
use crate::host::{HostInfo, SystemHost};
use crate::logger;
use crate::sampler::{SampleDecision, Sampler, SettingsSampler};
use crate::settings::SettingsStore;
use crate::transport::http::{HttpDialer, HttpDialerOptions};
use crate::transport::Dialer;

#[async_trait]
pub trait ReporterBackend: Send + Sync {
    /// Queues an encoded event. May wait when the event queue is full.
    async fn write_event(&self, event: Bytes);

    /// Queues an encoded status message without waiting.
    fn write_status(&self, message: Bytes) -> Result<(), ReportError>;

    fn push_metrics_record(&self, record: MetricsRecord) -> bool;

    fn is_open(&self) -> bool;

    async fn wait_for_ready(&self, timeout: Duration) -> bool;

    async fn shutdown(&self, deadline: Duration) -> Result<(), ReporterError>;

    fn shutdown_now(&self);

    fn closed(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct NullReporter;

#[async_trait]
impl ReporterBackend for NullReporter {
    async fn write_event(&self, _event: Bytes) {}

    fn write_status(&self, _message: Bytes) -> Result<(), ReportError> {
        Ok(())
    }

    fn push_metrics_record(&self, _record: MetricsRecord) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        false
    }

    async fn wait_for_ready(&self, _timeout: Duration) -> bool {
        true
    }

    async fn shutdown(&self, _deadline: Duration) -> Result<(), ReporterError> {
        Ok(())
    }

    fn shutdown_now(&self) {}

    fn closed(&self) -> bool {
        true
    }
}

pub struct UdpReporter {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpReporter {
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        debug!("udp reporter sending to {addr}");
        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ReporterBackend for UdpReporter {
    async fn write_event(&self, event: Bytes) {
        if self.closed() {
            return;
        }
        if let Err(e) = self.socket.send(&event).await {
            debug!("failed to send event datagram: {e}");
        }
    }

    fn write_status(&self, message: Bytes) -> Result<(), ReportError> {
        if self.closed() {
            return Ok(());
        }
        if let Err(e) = self.socket.try_send(&message) {
            debug!("failed to send status datagram: {e}");
        }
        Ok(())
    }

    fn push_metrics_record(&self, _record: MetricsRecord) -> bool {
        false
    }

    fn is_open(&self) -> bool {
        !self.closed()
    }

    async fn wait_for_ready(&self, _timeout: Duration) -> bool {
        true
    }

    async fn shutdown(&self, _deadline: Duration) -> Result<(), ReporterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ReporterError::AlreadyClosed);
        }
        Ok(())
    }

    fn shutdown_now(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Backend delivering to the collector: an event pipeline task and a periodic
/// controller task sharing one exit token.
pub struct CollectorReporter {
    events: EventSender,
    status: mpsc::Sender<Vec<u8>>,
    aggregator: Arc<dyn MetricsAggregator>,
    connection: watch::Receiver<ConnectionSnapshot>,
    ready: watch::Receiver<bool>,
    exit: CancellationToken,
}

impl CollectorReporter {
    /// Spawns both tasks on the current runtime.
    pub fn start(
        config: ReporterConfig,
        api_key: &str,
        addr: &str,
        deps: ControllerDeps,
    ) -> Self {
        let exit = CancellationToken::new();
        let aggregator = deps.aggregator.clone();
        let (controller, handle) =
            Controller::new(config.clone(), api_key, addr, deps, exit.clone());
        let (pipeline, events) = EventPipeline::new(
            EventPipelineConfig {
                api_key: api_key.to_string(),
                max_event_bytes: config.max_event_bytes,
                flush_timeout: config.event_flush_timeout,
                queue_capacity: config.event_queue_capacity,
            },
            handle.connection.clone(),
            exit.clone(),
        );

        tokio::spawn(pipeline.run());
        tokio::spawn(controller.run());

        Self {
            events,
            status: handle.status,
            aggregator,
            connection: handle.connection,
            ready: handle.ready,
            exit,
        }
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.connection.borrow().clone()
    }
}

#[async_trait]
impl ReporterBackend for CollectorReporter {
    async fn write_event(&self, event: Bytes) {
        self.events.send(event).await;
    }

    fn write_status(&self, message: Bytes) -> Result<(), ReportError> {
        match self.status.try_send(message.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ReportError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("reporter closed, dropping status message");
                Ok(())
            }
        }
    }

    fn push_metrics_record(&self, record: MetricsRecord) -> bool {
        if !self.connection.borrow().is_healthy() {
            return false;
        }
        self.aggregator.push_record(record)
    }

    fn is_open(&self) -> bool {
        !self.closed()
    }

    async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.clone();
        let mut connection = self.connection.clone();
        let wait = async move {
            loop {
                if *ready.borrow_and_update() {
                    return true;
                }
                if connection.borrow_and_update().is_closed() {
                    return false;
                }
                tokio::select! {
                    changed = ready.changed() => {
                        if changed.is_err() {
                            return *ready.borrow();
                        }
                    }
                    changed = connection.changed() => {
                        if changed.is_err() {
                            return false;
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), ReporterError> {
        if self.closed() {
            return Err(ReporterError::AlreadyClosed);
        }
        info!("shutting down reporter");
        self.exit.cancel();

        let mut connection = self.connection.clone();
        let wait = async move {
            loop {
                if connection.borrow_and_update().is_closed() {
                    return;
                }
                if connection.changed().await.is_err() {
                    // controller gone, it only stops once closed
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| ReporterError::ShutdownTimeout)
    }

    fn shutdown_now(&self) {
        self.exit.cancel();
    }

    fn closed(&self) -> bool {
        self.connection.borrow().is_closed()
    }
}

/// Collaborators the reporter is built with.
#[derive(Clone)]
pub struct ReporterDeps {
    pub dialer: Arc<dyn Dialer>,
    pub aggregator: Arc<dyn MetricsAggregator>,
    pub host: Arc<dyn HostInfo>,
    pub settings: Arc<SettingsStore>,
}

impl ReporterDeps {
    /// HTTP transport, system host identity and the transaction aggregator.
    pub fn from_options(options: &ReporterOptions) -> Self {
        let host: Arc<dyn HostInfo> = Arc::new(SystemHost::new(options.hostname_alias.as_deref()));
        let aggregator = Arc::new(TransactionAggregator::new(host.as_ref()));
        let dialer = HttpDialer::new(HttpDialerOptions {
            api_key: options.service_key.clone().unwrap_or_default(),
            trusted_cert_path: options.trusted_cert_path.clone(),
            plaintext: options.plaintext,
            ..Default::default()
        });
        Self {
            dialer: Arc::new(dialer),
            aggregator,
            host,
            settings: Arc::new(SettingsStore::new()),
        }
    }
}

impl From<&ReporterDeps> for ControllerDeps {
    fn from(deps: &ReporterDeps) -> Self {
        ControllerDeps {
            dialer: deps.dialer.clone(),
            aggregator: deps.aggregator.clone(),
            host: deps.host.clone(),
            settings: deps.settings.clone(),
        }
    }
}

/// Entry point for the instrumentation: built once at initialization and shared by
/// reference with every call site.
pub struct Reporter {
    kind: ReporterType,
    backend: Arc<dyn ReporterBackend>,
    host: Arc<dyn HostInfo>,
    settings: Arc<SettingsStore>,
    sampler: Arc<dyn Sampler>,
}

impl Reporter {
    /// Selects and starts the backend. Never fails: whatever prevents reporting
    /// downgrades to the no-op backend with a log line.
    pub async fn start(options: ReporterOptions, deps: ReporterDeps) -> Reporter {
        if let Err(e) = logger::init(options.log_level) {
            debug!("keeping the installed log subscriber: {e}");
        }

        let (kind, backend): (ReporterType, Arc<dyn ReporterBackend>) =
            match Self::select_backend(&options, &deps).await {
                Some((kind, backend)) => (kind, backend),
                None => (ReporterType::None, Arc::new(NullReporter)),
            };
        debug!("reporter started with the {kind:?} backend");

        Reporter {
            kind,
            backend,
            host: deps.host,
            sampler: Arc::new(SettingsSampler::new(deps.settings.clone())),
            settings: deps.settings,
        }
    }

    async fn select_backend(
        options: &ReporterOptions,
        deps: &ReporterDeps,
    ) -> Option<(ReporterType, Arc<dyn ReporterBackend>)> {
        if let Err(e) = options.config.validate() {
            error!("{e}, reporting disabled");
            return None;
        }

        match options.reporter_type {
            ReporterType::None => None,
            ReporterType::Udp => match UdpReporter::connect(&options.udp_addr).await {
                Ok(udp) => Some((ReporterType::Udp, Arc::new(udp))),
                Err(e) => {
                    warn!("failed to initialize udp reporter at {}: {e}", options.udp_addr);
                    None
                }
            },
            ReporterType::Ssl => {
                let Some(key) = options.service_key.as_deref() else {
                    warn!("no service key found, check environment variable APPOPTICS_SERVICE_KEY");
                    return None;
                };
                let backend = CollectorReporter::start(
                    options.config.clone(),
                    key,
                    &options.collector_addr,
                    deps.into(),
                );
                Some((ReporterType::Ssl, Arc::new(backend)))
            }
        }
    }

    pub fn kind(&self) -> ReporterType {
        self.kind
    }

    pub fn settings(&self) -> Arc<SettingsStore> {
        self.settings.clone()
    }

    pub fn should_trace_request(&self, layer: &str, traced: bool) -> SampleDecision {
        self.sampler.decide(layer, traced)
    }

    /// Validates, stamps and queues an event. Events reported while the backend is not
    /// open are accepted and dropped.
    pub async fn report_event(
        &self,
        ctx: &mut TraceContext,
        event: Event,
    ) -> Result<(), ReportError> {
        if !self.backend.is_open() {
            return Ok(());
        }
        let buffer = prepare_event(ctx, event, self.host.as_ref())?;
        self.backend.write_event(buffer).await;
        Ok(())
    }

    /// Like [`Reporter::report_event`] for status messages, which go to the bounded
    /// status queue without waiting.
    pub fn report_status(&self, ctx: &mut TraceContext, event: Event) -> Result<(), ReportError> {
        if !self.backend.is_open() {
            return Ok(());
        }
        let buffer = prepare_event(ctx, event, self.host.as_ref())?;
        self.backend.write_status(buffer)
    }

    pub fn push_metrics_record(&self, record: MetricsRecord) -> bool {
        self.backend.push_metrics_record(record)
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    /// Waits until the collector connection is up. `false` on timeout or when the
    /// reporter closes first.
    pub async fn wait_for_ready(&self, timeout: Duration) -> bool {
        self.backend.wait_for_ready(timeout).await
    }

    /// Requests closure and waits until every resource is released.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ReporterError> {
        self.backend.shutdown(deadline).await
    }

    pub fn shutdown_now(&self) {
        self.backend.shutdown_now();
    }

    pub fn closed(&self) -> bool {
        self.backend.closed()
    }
}
