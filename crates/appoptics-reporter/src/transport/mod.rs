// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! RPC surface toward the collector.
//!
//! The reporter only ever talks to the collector through [`CollectorClient`], and only
//! ever obtains a client through a [`Dialer`]. Tests substitute both.

pub mod http;

use std::sync::Arc;

use appoptics_collector_proto::{MessageRequest, MessageResult, SettingsRequest, SettingsResult};
use async_trait::async_trait;

use crate::error::TransportError;

#[async_trait]
pub trait CollectorClient: Send + Sync {
    async fn post_events(&self, request: MessageRequest) -> Result<MessageResult, TransportError>;

    async fn post_metrics(&self, request: MessageRequest)
        -> Result<MessageResult, TransportError>;

    async fn post_status(&self, request: MessageRequest) -> Result<MessageResult, TransportError>;

    async fn get_settings(
        &self,
        request: SettingsRequest,
    ) -> Result<SettingsResult, TransportError>;
}

/// Opens a fresh channel to a collector address (`host` or `host:port`).
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn CollectorClient>, TransportError>;
}
