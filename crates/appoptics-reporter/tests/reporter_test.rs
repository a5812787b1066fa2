// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::time::Duration;

use appoptics_reporter::aggregator::MetricsRecord;
use appoptics_reporter::event::Event;
use appoptics_reporter::sampler::SampleSource;
use appoptics_reporter::{ReportError, Reporter, ReporterConfig, ReporterError, ReporterType};
use tokio::time::sleep;

use common::helpers::{collector_options, context, event, settings_result, test_config, Mocks};
use common::mocks::MockEncoder;

const READY_TIMEOUT: Duration = Duration::from_secs(5);

fn record() -> MetricsRecord {
    MetricsRecord {
        transaction: "/checkout".to_string(),
        duration: Duration::from_millis(12),
        status: 200,
        method: "GET".to_string(),
        has_error: false,
    }
}

async fn start(mocks: &Mocks, config: ReporterConfig) -> Reporter {
    Reporter::start(collector_options(config), mocks.reporter_deps()).await
}

#[tokio::test(start_paused = true)]
async fn test_event_is_stamped_and_delivered() {
    let mocks = Mocks::new();
    let reporter = start(&mocks, test_config()).await;
    assert_eq!(reporter.kind(), ReporterType::Ssl);
    assert!(reporter.wait_for_ready(READY_TIMEOUT).await);
    assert!(reporter.is_open());

    let encoder = MockEncoder::with_body("layer=web;");
    let mut ctx = context();
    reporter
        .report_event(&mut ctx, event(2, encoder.clone()))
        .await
        .unwrap();
    assert_eq!(ctx.op_id, vec![2; 8]);

    sleep(Duration::from_millis(500)).await;

    assert!(encoder.field("Timestamp_u").is_some());
    assert_eq!(encoder.field("Hostname").as_deref(), Some("test-host"));
    assert_eq!(encoder.field("PID").as_deref(), Some("4242"));

    let events = mocks.collector.events();
    assert_eq!(events.len(), 1);
    let body = String::from_utf8(events[0].messages[0].clone()).unwrap();
    assert!(body.starts_with("layer=web;"));
    assert!(body.contains("Hostname=test-host;"));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_events_are_rejected() {
    let mocks = Mocks::new();
    let reporter = start(&mocks, test_config()).await;
    assert!(reporter.wait_for_ready(READY_TIMEOUT).await);

    let mut ctx = context();
    let foreign = Event::new(vec![0xB2; 20], vec![2; 8], Box::new(MockEncoder::default()));
    assert_eq!(
        reporter.report_event(&mut ctx, foreign).await,
        Err(ReportError::DifferentTaskId)
    );
    assert_eq!(
        reporter.report_event(&mut ctx, event(1, MockEncoder::default())).await,
        Err(ReportError::SameOpId)
    );
    assert_eq!(
        reporter.report_status(&mut ctx, event(1, MockEncoder::default())),
        Err(ReportError::SameOpId)
    );
    assert_eq!(ctx, context());

    sleep(Duration::from_millis(500)).await;
    assert!(mocks.collector.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_status_is_delivered() {
    let mocks = Mocks::new();
    let reporter = start(&mocks, test_config()).await;
    assert!(reporter.wait_for_ready(READY_TIMEOUT).await);

    let mut ctx = context();
    reporter
        .report_status(&mut ctx, event(3, MockEncoder::with_body("status;")))
        .unwrap();

    sleep(Duration::from_secs(1)).await;

    let status = mocks.collector.status();
    assert_eq!(status.len(), 1);
    assert!(status[0].messages[0].starts_with(b"status;"));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_collector() {
    let mocks = Mocks::new();
    mocks.dialer.fail_always();
    let config = ReporterConfig {
        status_queue_capacity: 1,
        ..test_config()
    };
    let reporter = start(&mocks, config).await;

    assert!(!reporter.wait_for_ready(Duration::from_secs(1)).await);
    assert!(reporter.is_open());
    assert!(!reporter.closed());

    // nothing drains the status queue while disconnected
    let mut ctx = context();
    reporter
        .report_status(&mut ctx, event(2, MockEncoder::default()))
        .unwrap();
    assert_eq!(
        reporter.report_status(&mut ctx, event(3, MockEncoder::default())),
        Err(ReportError::QueueFull)
    );

    assert!(!reporter.push_metrics_record(record()));
    assert!(mocks.aggregator.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_metrics_records_accepted_when_healthy() {
    let mocks = Mocks::new();
    let reporter = start(&mocks, test_config()).await;
    assert!(reporter.wait_for_ready(READY_TIMEOUT).await);

    assert!(reporter.push_metrics_record(record()));
    assert_eq!(mocks.aggregator.records(), vec![record()]);
}

#[tokio::test(start_paused = true)]
async fn test_sampling_follows_collector_settings() {
    let mocks = Mocks::new();
    mocks
        .collector
        .script_settings(Ok(settings_result(1_000_000, 120)));
    let reporter = start(&mocks, test_config()).await;

    let before = reporter.should_trace_request("web", false);
    assert!(!before.sampled);
    assert_eq!(before.source, SampleSource::Unset);

    assert!(reporter.wait_for_ready(READY_TIMEOUT).await);
    sleep(Duration::from_secs(1)).await;

    let after = reporter.should_trace_request("web", false);
    assert!(after.sampled);
    assert_eq!(after.rate, 1_000_000);
    assert_eq!(after.source, SampleSource::Default);
    assert_eq!(reporter.settings().latest().settings.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let mocks = Mocks::new();
    let reporter = start(&mocks, test_config()).await;
    assert!(reporter.wait_for_ready(READY_TIMEOUT).await);

    reporter.shutdown(READY_TIMEOUT).await.unwrap();
    assert!(reporter.closed());
    assert!(!reporter.is_open());
    assert_eq!(
        reporter.shutdown(READY_TIMEOUT).await,
        Err(ReporterError::AlreadyClosed)
    );

    // closed reporters accept and drop
    let mut ctx = context();
    reporter
        .report_event(&mut ctx, event(2, MockEncoder::default()))
        .await
        .unwrap();
    sleep(Duration::from_millis(500)).await;
    assert!(mocks.collector.events().is_empty());

    for _ in 0..50 {
        if mocks.aggregator.stopped() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(mocks.aggregator.stopped());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_now_closes_without_waiting() {
    let mocks = Mocks::new();
    let reporter = start(&mocks, test_config()).await;
    assert!(reporter.wait_for_ready(READY_TIMEOUT).await);

    reporter.shutdown_now();
    sleep(Duration::from_secs(1)).await;
    assert!(reporter.closed());
}
