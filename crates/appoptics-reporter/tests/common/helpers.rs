// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use appoptics_collector_proto::{OboeSetting, OboeSettingType, ResultCode, SettingsResult};
use appoptics_reporter::config::{ReporterConfig, ReporterOptions, ReporterType};
use appoptics_reporter::controller::{Controller, ControllerDeps, ControllerHandle};
use appoptics_reporter::event::{Event, TraceContext};
use appoptics_reporter::reporter::ReporterDeps;
use appoptics_reporter::settings::SettingsStore;
use tokio_util::sync::CancellationToken;

use super::mocks::{FixedHost, MockAggregator, MockCollector, MockDialer, MockEncoder};

pub const COLLECTOR_ADDR: &str = "collector.example.com:443";
pub const API_KEY: &str = "test-api-key";

pub fn test_config() -> ReporterConfig {
    ReporterConfig {
        status_load_block: Duration::from_millis(1),
        ..Default::default()
    }
}

pub struct Mocks {
    pub collector: Arc<MockCollector>,
    pub dialer: Arc<MockDialer>,
    pub aggregator: Arc<MockAggregator>,
    pub settings: Arc<SettingsStore>,
}

impl Mocks {
    pub fn new() -> Self {
        let collector = MockCollector::new();
        Self {
            dialer: MockDialer::new(collector.clone()),
            collector,
            aggregator: MockAggregator::new(),
            settings: Arc::new(SettingsStore::new()),
        }
    }

    pub fn controller_deps(&self) -> ControllerDeps {
        ControllerDeps {
            dialer: self.dialer.clone(),
            aggregator: self.aggregator.clone(),
            host: Arc::new(FixedHost),
            settings: self.settings.clone(),
        }
    }

    pub fn reporter_deps(&self) -> ReporterDeps {
        ReporterDeps {
            dialer: self.dialer.clone(),
            aggregator: self.aggregator.clone(),
            host: Arc::new(FixedHost),
            settings: self.settings.clone(),
        }
    }

    pub fn controller(
        &self,
        config: ReporterConfig,
    ) -> (Controller, ControllerHandle, CancellationToken) {
        let exit = CancellationToken::new();
        let (controller, handle) = Controller::new(
            config,
            API_KEY,
            COLLECTOR_ADDR,
            self.controller_deps(),
            exit.clone(),
        );
        (controller, handle, exit)
    }
}

pub fn collector_options(config: ReporterConfig) -> ReporterOptions {
    ReporterOptions {
        reporter_type: ReporterType::Ssl,
        service_key: Some(API_KEY.to_string()),
        collector_addr: COLLECTOR_ADDR.to_string(),
        config,
        ..Default::default()
    }
}

pub fn context() -> TraceContext {
    TraceContext {
        task_id: vec![0xA1; 20],
        op_id: vec![0x01; 8],
    }
}

/// An event in the trace of [`context`] with the given op id.
pub fn event(op: u8, encoder: MockEncoder) -> Event {
    Event::new(vec![0xA1; 20], vec![op; 8], Box::new(encoder))
}

pub fn settings_result(value: i64, ttl: i64) -> SettingsResult {
    SettingsResult {
        result: ResultCode::Ok as i32,
        settings: vec![OboeSetting {
            r#type: OboeSettingType::DefaultSampleRate as i32,
            value,
            ttl,
            ..Default::default()
        }],
        ..Default::default()
    }
}
