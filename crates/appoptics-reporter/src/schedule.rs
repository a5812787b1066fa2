// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::time::Instant;

/// Fixed time grid anchored at `origin`. Deadlines computed from it stay phase-aligned
/// no matter how late the loop that asks for them wakes up.
#[derive(Debug, Clone, Copy)]
pub struct TickGrid {
    origin: Instant,
}

impl TickGrid {
    pub fn new(origin: Instant) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// The grid point nearest to `now`, moved one interval ahead if that point is
    /// already in the past.
    pub fn next(&self, now: Instant, interval: Duration) -> Instant {
        let step = interval.as_nanos().max(1);
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let steps = (elapsed + step / 2) / step;

        let mut next = self.origin + nanos(steps * step);
        if next < now {
            next += interval;
        }
        next
    }
}

fn nanos(value: u128) -> Duration {
    Duration::from_nanos(u64::try_from(value).unwrap_or(u64::MAX))
}
