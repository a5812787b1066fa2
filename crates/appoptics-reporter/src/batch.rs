// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

/// Size-bounded batch of encoded events. The sum of buffer sizes never exceeds the
/// ceiling; when a new buffer does not fit, the oldest buffers are evicted first.
#[derive(Debug)]
pub struct EventBatch {
    buffers: VecDeque<Bytes>,
    total_bytes: usize,
    max_bytes: usize,
}

impl EventBatch {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffers: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Adds a buffer to the batch. Returns `false` when the buffer alone exceeds the
    /// ceiling and was dropped.
    pub fn push(&mut self, buffer: Bytes) -> bool {
        if buffer.len() > self.max_bytes {
            debug!(
                "dropping {} byte event larger than the {} byte batch ceiling",
                buffer.len(),
                self.max_bytes
            );
            return false;
        }

        let mut evicted = 0;
        while self.total_bytes + buffer.len() > self.max_bytes {
            match self.buffers.pop_front() {
                Some(oldest) => {
                    self.total_bytes -= oldest.len();
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            debug!("batch full, evicted {evicted} oldest events");
        }

        self.total_bytes += buffer.len();
        self.buffers.push_back(buffer);
        true
    }

    /// Hands over the buffered events, leaving the batch empty.
    pub fn take(&mut self) -> Vec<Bytes> {
        self.total_bytes = 0;
        self.buffers.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.buffers.iter().map(Bytes::len).collect()
    }
}
