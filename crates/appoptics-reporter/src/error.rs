// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Failures talking to the collector. Always recoverable: they drive the connection to
/// `Disconnected` and a scheduled reconnect, and are never surfaced to application code.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to dial collector at {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("no collector connection available")]
    NotConnected,

    #[error("transport error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("collector answered with HTTP status {0}")]
    Status(u16),

    #[error("failed to decode collector response: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Errors returned synchronously at the call boundary. Nothing that fails these checks
/// is ever enqueued.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("invalid event, different task_id from context")]
    DifferentTaskId,

    #[error("invalid event, same op_id as context")]
    SameOpId,

    #[error("status queue is full, message dropped")]
    QueueFull,
}

/// Errors from the reporter lifecycle surface.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReporterError {
    #[error("shutdown deadline exceeded before the collector connection was released")]
    ShutdownTimeout,

    #[error("reporter already closed")]
    AlreadyClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid reporter configuration: {0}")]
    Invalid(String),

    #[error("unable to parse reporter configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
