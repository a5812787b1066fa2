// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry-aware outbound queue shared by the metrics, status and settings exchanges.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Pending messages of one message class plus its retry bookkeeping.
///
/// The backoff delay grows multiplicatively while retrying and returns to the initial
/// delay when a send succeeds or when retries are abandoned.
#[derive(Debug)]
pub struct Sender {
    name: &'static str,
    messages: VecDeque<Vec<u8>>,
    /// Next time the class has regular work to do (metrics flush, settings refresh).
    next_time: Instant,
    retry_active: bool,
    retry_time: Option<Instant>,
    next_retry_delay: Duration,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
    retries: u32,
}

impl Sender {
    pub fn new(
        name: &'static str,
        initial_retry_delay: Duration,
        max_retry_delay: Duration,
        next_time: Instant,
    ) -> Self {
        Self {
            name,
            messages: VecDeque::new(),
            next_time,
            retry_active: false,
            retry_time: None,
            next_retry_delay: initial_retry_delay,
            initial_retry_delay,
            max_retry_delay,
            retries: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&mut self, message: Vec<u8>) {
        self.messages.push_back(message);
    }

    /// Appends a message and drops the oldest ones beyond `cap`.
    pub fn push_capped(&mut self, message: Vec<u8>, cap: usize) {
        self.messages.push_back(message);
        while self.messages.len() > cap {
            self.messages.pop_front();
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn drop_oldest(&mut self) {
        self.messages.pop_front();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn next_time(&self) -> Instant {
        self.next_time
    }

    pub fn set_next_time(&mut self, next_time: Instant) {
        self.next_time = next_time;
    }

    pub fn retry_active(&self) -> bool {
        self.retry_active
    }

    pub fn retry_time(&self) -> Option<Instant> {
        self.retry_time
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn next_retry_delay(&self) -> Duration {
        self.next_retry_delay
    }

    /// True while a retry is scheduled in the future.
    pub fn waiting_for_retry(&self, now: Instant) -> bool {
        self.retry_active && self.retry_time.is_some_and(|at| at > now)
    }

    /// True when a scheduled retry has come due.
    pub fn retry_due(&self, now: Instant) -> bool {
        self.retry_active && self.retry_time.map_or(true, |at| at <= now)
    }

    /// Schedules the next retry at `now` plus the current backoff.
    ///
    /// Returns `false` once `retry_ceiling` retries have been made: retrying is disabled
    /// and the backoff goes back to its initial value. The caller is expected to discard
    /// the pending queue in that case.
    pub fn schedule_retry(&mut self, now: Instant, amplifier: u32, retry_ceiling: u32) -> bool {
        if self.retries >= retry_ceiling {
            warn!("{} sender reached the maximum number of retries ({retry_ceiling})", self.name);
            self.retry_active = false;
            self.retry_time = None;
            self.retries = 0;
            self.next_retry_delay = self.initial_retry_delay;
            return false;
        }

        self.retry_time = Some(now + self.next_retry_delay);
        debug!(
            "{} sender retrying in {} ms",
            self.name,
            self.next_retry_delay.as_millis()
        );
        self.retries += 1;
        self.retry_active = true;
        self.next_retry_delay = self
            .next_retry_delay
            .saturating_mul(amplifier)
            .min(self.max_retry_delay);
        true
    }

    /// Forgets the retry count while keeping the current backoff, so the next
    /// [`Sender::schedule_retry`] never hits the ceiling.
    pub fn restart_retry_count(&mut self) {
        self.retries = 0;
    }

    pub fn cancel_retry(&mut self) {
        self.retry_active = false;
    }

    /// Successful send: retry state goes back to its initial values.
    pub fn reset(&mut self) {
        self.retry_active = false;
        self.retry_time = None;
        self.retries = 0;
        self.next_retry_delay = self.initial_retry_delay;
    }
}
