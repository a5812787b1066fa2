// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Events and their validation against the trace context they are reported in.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ReportError;
use crate::host::HostInfo;

/// Builds the binary payload of an event or metrics message.
pub trait PayloadEncoder: Send {
    fn add_i64(&mut self, key: &str, value: i64);
    fn add_int(&mut self, key: &str, value: i32);
    fn add_string(&mut self, key: &str, value: &str);
    /// Finalizes the payload. The encoder is left empty.
    fn finish(&mut self) -> Bytes;
}

const BSON_STRING: u8 = 0x02;
const BSON_INT32: u8 = 0x10;
const BSON_INT64: u8 = 0x12;

/// Minimal BSON document writer, the payload format the collector accepts.
#[derive(Debug)]
pub struct BsonEncoder {
    buf: BytesMut,
}

impl Default for BsonEncoder {
    fn default() -> Self {
        let mut buf = BytesMut::with_capacity(256);
        // length prefix, patched in finish()
        buf.put_i32_le(0);
        Self { buf }
    }
}

impl BsonEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn put_key(&mut self, kind: u8, key: &str) {
        self.buf.put_u8(kind);
        self.buf.put_slice(key.as_bytes());
        self.buf.put_u8(0);
    }
}

impl PayloadEncoder for BsonEncoder {
    fn add_i64(&mut self, key: &str, value: i64) {
        self.put_key(BSON_INT64, key);
        self.buf.put_i64_le(value);
    }

    fn add_int(&mut self, key: &str, value: i32) {
        self.put_key(BSON_INT32, key);
        self.buf.put_i32_le(value);
    }

    fn add_string(&mut self, key: &str, value: &str) {
        self.put_key(BSON_STRING, key);
        let len = i32::try_from(value.len() + 1).unwrap_or(i32::MAX);
        self.buf.put_i32_le(len);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    fn finish(&mut self) -> Bytes {
        self.buf.put_u8(0);
        let len = i32::try_from(self.buf.len()).unwrap_or(i32::MAX);
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        let doc = self.buf.split().freeze();
        self.buf.put_i32_le(0);
        doc
    }
}

/// Identifiers of the trace an event is reported into. The op id is the id of the last
/// event reported in this context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub task_id: Vec<u8>,
    pub op_id: Vec<u8>,
}

pub struct Event {
    pub task_id: Vec<u8>,
    pub op_id: Vec<u8>,
    payload: Box<dyn PayloadEncoder>,
}

impl Event {
    pub fn new(task_id: Vec<u8>, op_id: Vec<u8>, payload: Box<dyn PayloadEncoder>) -> Self {
        Self {
            task_id,
            op_id,
            payload,
        }
    }

    pub fn payload_mut(&mut self) -> &mut dyn PayloadEncoder {
        self.payload.as_mut()
    }
}

/// Validates `event` against `ctx`, stamps it with the time and host identity and
/// finalizes its payload. On success the context advances to the event's op id.
pub fn prepare_event(
    ctx: &mut TraceContext,
    mut event: Event,
    host: &dyn HostInfo,
) -> Result<Bytes, ReportError> {
    if ctx.task_id != event.task_id {
        return Err(ReportError::DifferentTaskId);
    }
    if ctx.op_id == event.op_id {
        return Err(ReportError::SameOpId);
    }

    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or_default();
    event.payload.add_i64("Timestamp_u", micros);
    event.payload.add_string("Hostname", host.hostname());
    event
        .payload
        .add_int("PID", i32::try_from(host.pid()).unwrap_or(i32::MAX));

    ctx.op_id = event.op_id.clone();
    Ok(event.payload.finish())
}
