// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport and reporting engine of the AppOptics instrumentation.
//!
//! Encoded trace events, aggregated metrics, status messages and settings requests are
//! delivered to the collector over a long-lived connection that survives network
//! failures, collector overload and collector-directed redirects.
//!
//! - [`reporter`]: the [`reporter::Reporter`] facade and its backends
//! - [`controller`]: the periodic loop driving metrics, status, settings and reconnects
//! - [`event_pipeline`]: event batching with at most one post in flight
//! - [`connection`] and [`sender`]: connection state machine and retry-aware queues
//! - [`transport`]: the collector RPC surface and its HTTP implementation

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod batch;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod event;
pub mod event_pipeline;
pub mod host;
pub mod logger;
pub mod reporter;
pub mod sampler;
pub mod schedule;
pub mod sender;
pub mod settings;
pub mod transport;

pub use config::{ReporterConfig, ReporterOptions, ReporterType};
pub use error::{ConfigError, ReportError, ReporterError, TransportError};
pub use reporter::{Reporter, ReporterDeps};
