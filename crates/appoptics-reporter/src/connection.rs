// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection to the collector and its reconnection state machine.
//!
//! A [`Connection`] is owned and mutated by the periodic controller only. Other tasks
//! observe it through the [`ConnectionSnapshot`] the controller publishes after each
//! tick.

use std::cmp::min;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ReporterConfig;
use crate::schedule::TickGrid;
use crate::transport::{CollectorClient, Dialer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The channel is usable.
    Healthy,
    /// The channel is unusable; a reconnect is attempted once the retry time is reached.
    Disconnected,
    /// Shutdown was requested or a ceiling was breached. Terminal.
    Closing,
}

/// Read-only view of the connection handed to the event pipeline and the facade.
#[derive(Clone)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub client: Option<Arc<dyn CollectorClient>>,
    pub released: bool,
}

impl ConnectionSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == ConnectionStatus::Healthy && self.client.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.status == ConnectionStatus::Closing && self.released
    }
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            client: None,
            released: false,
        }
    }
}

impl fmt::Debug for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSnapshot")
            .field("status", &self.status)
            .field("connected", &self.client.is_some())
            .field("released", &self.released)
            .finish()
    }
}

/// Why a redirect was not followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectRejection {
    TooManyRedirects,
    InvalidHost(String),
}

pub struct Connection {
    client: Option<Arc<dyn CollectorClient>>,
    addr: String,
    status: ConnectionStatus,
    retries: u32,
    /// Only meaningful while disconnected.
    next_retry_time: Option<Instant>,
    redirects: u32,
    next_keep_alive: Instant,
    /// Tick time captured once per controller iteration.
    curr_time: Instant,
    released: bool,
    grid: TickGrid,
}

impl Connection {
    /// A connection that has not dialed yet. The first reconnect attempt is immediate.
    pub fn new(addr: impl Into<String>, grid: TickGrid, now: Instant) -> Self {
        Self {
            client: None,
            addr: addr.into(),
            status: ConnectionStatus::Disconnected,
            retries: 0,
            next_retry_time: None,
            redirects: 0,
            next_keep_alive: now,
            curr_time: now,
            released: false,
            grid,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ConnectionStatus::Healthy
    }

    /// Closing and every resource released.
    pub fn is_closed(&self) -> bool {
        self.status == ConnectionStatus::Closing && self.released
    }

    pub fn client(&self) -> Option<Arc<dyn CollectorClient>> {
        self.client.clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn redirects(&self) -> u32 {
        self.redirects
    }

    pub fn next_retry_time(&self) -> Option<Instant> {
        self.next_retry_time
    }

    pub fn next_keep_alive(&self) -> Instant {
        self.next_keep_alive
    }

    pub fn curr_time(&self) -> Instant {
        self.curr_time
    }

    pub fn set_curr_time(&mut self, now: Instant) {
        self.curr_time = now;
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: self.status,
            client: self.client.clone(),
            released: self.released,
        }
    }

    /// A transport error was observed. Closing is terminal, so it is never downgraded.
    pub fn mark_disconnected(&mut self) {
        if self.status != ConnectionStatus::Closing {
            self.status = ConnectionStatus::Disconnected;
        }
    }

    pub fn mark_closing(&mut self) {
        self.status = ConnectionStatus::Closing;
    }

    pub fn reset_redirects(&mut self) {
        self.redirects = 0;
    }

    pub fn keep_alive_due(&self) -> bool {
        self.next_keep_alive < self.curr_time
    }

    pub fn reschedule_keep_alive(&mut self, interval: Duration) {
        self.next_keep_alive = self.grid.next(self.curr_time, interval);
    }

    /// Dials the collector again if the connection is disconnected and its backoff has
    /// elapsed. Returns `true` when a new client was installed.
    pub async fn reconnect(&mut self, dialer: &dyn Dialer, config: &ReporterConfig) -> bool {
        if self.status != ConnectionStatus::Disconnected {
            return false;
        }

        if self.retries >= config.max_conn_retries {
            error!(
                "reached the connection retry limit ({}), giving up",
                config.max_conn_retries
            );
            self.status = ConnectionStatus::Closing;
            return false;
        }

        if self.next_retry_time.is_some_and(|at| at > self.curr_time) {
            return false;
        }

        debug!("connecting to collector at {}", self.addr);
        match dialer.dial(&self.addr).await {
            Ok(client) => {
                info!("connected to collector at {}", self.addr);
                self.client = Some(client);
                self.retries = 0;
                self.next_retry_time = None;
                self.status = ConnectionStatus::Healthy;
                self.reschedule_keep_alive(config.keep_alive_interval);
                true
            }
            Err(e) => {
                warn!("failed to connect to collector at {}: {e}", self.addr);
                let backoff = Duration::from_secs(
                    u64::from(self.retries.saturating_add(1)) * u64::from(config.retry_amplifier),
                );
                let interval = min(config.max_retry_interval, backoff);
                self.next_retry_time = Some(self.curr_time + interval);
                self.retries = self.retries.saturating_add(1);
                false
            }
        }
    }

    /// Points the connection at `host` and forces a reconnect on the next health check.
    ///
    /// Hosts carrying a port are never trusted and close the connection, as does going
    /// past `max_redirects`.
    pub fn redirect(&mut self, host: &str, max_redirects: u32) -> Result<(), RedirectRejection> {
        if self.redirects >= max_redirects {
            warn!("reached the redirect limit ({max_redirects}), closing the connection");
            self.status = ConnectionStatus::Closing;
            return Err(RedirectRejection::TooManyRedirects);
        }

        self.status = ConnectionStatus::Disconnected;
        if host.contains(':') {
            warn!("invalid collector redirect target: {host}");
            self.status = ConnectionStatus::Closing;
            return Err(RedirectRejection::InvalidHost(host.to_string()));
        }

        info!("collector redirected us to {host}");
        self.addr = host.to_string();
        self.redirects += 1;
        self.retries = 0;
        self.next_retry_time = None;
        Ok(())
    }

    /// Drops the client. Returns `false`, with a warning, when already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            warn!("closing a connection that is already closed");
            return false;
        }
        info!("closing the collector connection");
        self.client = None;
        self.released = true;
        true
    }
}
