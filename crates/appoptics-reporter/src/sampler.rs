// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling decisions for incoming requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use appoptics_collector_proto::OboeSettingType;

use crate::settings::SettingsStore;

/// Sample rates are expressed out of this many requests.
pub const SAMPLE_RESOLUTION: u64 = 1_000_000;

/// Where a sample rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    Unset,
    None,
    File,
    Default,
    Layer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleDecision {
    pub sampled: bool,
    pub rate: u32,
    pub source: SampleSource,
}

pub trait Sampler: Send + Sync {
    fn decide(&self, layer: &str, traced: bool) -> SampleDecision;
}

pub fn should_trace_request(sampler: &dyn Sampler, layer: &str, traced: bool) -> SampleDecision {
    sampler.decide(layer, traced)
}

/// Samples at the rate found in the latest collector settings. A layer-specific rate
/// wins over the default one; without settings nothing is sampled.
///
/// Selection is deterministic: out of every `SAMPLE_RESOLUTION` requests exactly `rate`
/// are sampled, spread evenly.
pub struct SettingsSampler {
    store: Arc<SettingsStore>,
    counter: AtomicU64,
}

impl SettingsSampler {
    pub fn new(store: Arc<SettingsStore>) -> Self {
        Self {
            store,
            counter: AtomicU64::new(0),
        }
    }

    fn rate_for(&self, layer: &str) -> Option<(u32, SampleSource)> {
        let snapshot = self.store.latest();
        let layer_rate = snapshot.settings.iter().find(|s| {
            s.kind == OboeSettingType::LayerSampleRate && s.layer == layer
        });
        let default_rate = snapshot
            .settings
            .iter()
            .find(|s| s.kind == OboeSettingType::DefaultSampleRate);

        layer_rate
            .map(|s| (s.value, SampleSource::Layer))
            .or_else(|| default_rate.map(|s| (s.value, SampleSource::Default)))
            .map(|(value, source)| {
                let clamped = value.clamp(0, SAMPLE_RESOLUTION as i64);
                (u32::try_from(clamped).unwrap_or(0), source)
            })
    }
}

impl Sampler for SettingsSampler {
    fn decide(&self, layer: &str, traced: bool) -> SampleDecision {
        let Some((rate, source)) = self.rate_for(layer) else {
            return SampleDecision {
                sampled: false,
                rate: 0,
                source: SampleSource::Unset,
            };
        };

        if traced {
            return SampleDecision {
                sampled: true,
                rate,
                source,
            };
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let rate64 = u64::from(rate);
        let sampled = (n + 1) * rate64 / SAMPLE_RESOLUTION > n * rate64 / SAMPLE_RESOLUTION;
        SampleDecision {
            sampled,
            rate,
            source,
        }
    }
}
