// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event batching and posting.
//!
//! Producers push encoded events into a bounded queue and wait when it is full. The
//! pipeline task drains that queue into an [`EventBatch`] and hands full batches to a
//! poster task, one batch at a time. A flush happens when the flush timeout elapses
//! or when the previous post completes, whichever comes first, and only while the
//! collector connection is healthy.

use std::time::Duration;

use appoptics_collector_proto::{EncodingType, MessageRequest, ResultCode};
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::EventBatch;
use crate::connection::ConnectionSnapshot;
use crate::error::TransportError;

/// Producer side of the event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Bytes>,
}

impl EventSender {
    /// Queues an encoded event, waiting for room when the queue is full. Events sent
    /// after the pipeline stopped are dropped.
    pub async fn send(&self, event: Bytes) {
        if self.tx.send(event).await.is_err() {
            debug!("event pipeline stopped, dropping event");
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventPipelineConfig {
    pub api_key: String,
    pub max_event_bytes: usize,
    pub flush_timeout: Duration,
    pub queue_capacity: usize,
}

pub struct EventPipeline {
    events: mpsc::Receiver<Bytes>,
    batch: EventBatch,
    flush_timeout: Duration,
    api_key: String,
    connection: watch::Receiver<ConnectionSnapshot>,
    exit: CancellationToken,
}

/// Outcome of one batch post with the raw result code, reported back to the pipeline.
type PostOutcome = Result<i32, TransportError>;

impl EventPipeline {
    pub fn new(
        config: EventPipelineConfig,
        connection: watch::Receiver<ConnectionSnapshot>,
        exit: CancellationToken,
    ) -> (Self, EventSender) {
        let (tx, events) = mpsc::channel(config.queue_capacity);
        let pipeline = Self {
            events,
            batch: EventBatch::new(config.max_event_bytes),
            flush_timeout: config.flush_timeout,
            api_key: config.api_key,
            connection,
            exit,
        };
        (pipeline, EventSender { tx })
    }

    pub async fn run(mut self) {
        debug!("event pipeline started");

        // A capacity of one plus the in-flight flag keeps a single batch outstanding.
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Bytes>>(1);
        let (result_tx, mut result_rx) = mpsc::channel::<PostOutcome>(1);
        let poster = tokio::spawn(post_batches(
            batch_rx,
            result_tx,
            self.connection.clone(),
            self.api_key.clone(),
        ));

        let mut in_flight = false;
        let mut next_flush = Instant::now() + self.flush_timeout;

        loop {
            tokio::select! {
                biased;
                () = self.exit.cancelled() => break,
                Some(outcome) = result_rx.recv(), if in_flight => {
                    in_flight = false;
                    log_outcome(outcome);
                    self.flush(&batch_tx, &mut in_flight).await;
                }
                () = sleep_until(next_flush) => {
                    self.flush(&batch_tx, &mut in_flight).await;
                    next_flush = Instant::now() + self.flush_timeout;
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.batch.push(event);
                        // a busy queue must not hold back the timed flush
                        if Instant::now() >= next_flush {
                            self.flush(&batch_tx, &mut in_flight).await;
                            next_flush = Instant::now() + self.flush_timeout;
                        }
                    }
                    None => break,
                },
            }
        }

        // No new batches: the poster finishes what it holds and stops.
        drop(batch_tx);
        drop(result_rx);
        if let Err(e) = poster.await {
            warn!("event poster task failed: {e}");
        }
        debug!("event pipeline stopped");
    }

    async fn flush(&mut self, batch_tx: &mpsc::Sender<Vec<Bytes>>, in_flight: &mut bool) {
        if *in_flight || self.batch.is_empty() {
            return;
        }
        if !self.connection.borrow().is_healthy() {
            debug!(
                "collector connection not healthy, holding {} events",
                self.batch.len()
            );
            return;
        }

        let batch = self.batch.take();
        debug!("flushing {} events", batch.len());
        if batch_tx.send(batch).await.is_err() {
            warn!("event poster stopped, batch dropped");
            return;
        }
        *in_flight = true;
    }
}

async fn post_batches(
    mut batches: mpsc::Receiver<Vec<Bytes>>,
    results: mpsc::Sender<PostOutcome>,
    connection: watch::Receiver<ConnectionSnapshot>,
    api_key: String,
) {
    while let Some(batch) = batches.recv().await {
        let client = connection.borrow().client.clone();
        let outcome = match client {
            Some(client) => {
                let request = MessageRequest {
                    api_key: api_key.clone(),
                    messages: batch.iter().map(|event| event.to_vec()).collect(),
                    encoding: EncodingType::Bson as i32,
                    identity: None,
                };
                client
                    .post_events(request)
                    .await
                    .map(|result| result.result)
            }
            None => Err(TransportError::NotConnected),
        };
        if results.send(outcome).await.is_err() {
            debug!("event pipeline stopped, post result discarded");
        }
    }
}

fn log_outcome(outcome: PostOutcome) {
    match outcome.map(ResultCode::try_from) {
        Ok(Ok(ResultCode::Ok)) => debug!("sent events"),
        Ok(Ok(code)) => info!("events batch dropped, collector answered {}", code.as_str_name()),
        Ok(Err(_)) => warn!("events batch dropped, unknown result code from collector"),
        Err(e) => warn!("events batch dropped: {e}"),
    }
}
