// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Protobuf models for the trace collector service.
//!
//! The collector exposes four request/response calls: `PostEvents`, `PostMetrics`,
//! `PostStatus` and `GetSettings`. Every request carries the API key, and every
//! response carries a [`ResultCode`] plus an optional argument (the new host on a
//! redirect). All messages also derive `serde` so they can be dumped as JSON when
//! debugging a collector exchange.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Result code returned by the collector for every call.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    TryLater = 1,
    InvalidApiKey = 2,
    LimitExceeded = 3,
    Redirect = 4,
}

impl ResultCode {
    /// Name of the code as it appears on the wire definitions.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::TryLater => "TRY_LATER",
            ResultCode::InvalidApiKey => "INVALID_API_KEY",
            ResultCode::LimitExceeded => "LIMIT_EXCEEDED",
            ResultCode::Redirect => "REDIRECT",
        }
    }
}

/// Encoding of the opaque message buffers carried by a [`MessageRequest`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum EncodingType {
    Bson = 0,
    Protobuf = 1,
}

/// Kind of a collector-provided setting.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum OboeSettingType {
    DefaultSampleRate = 0,
    LayerSampleRate = 1,
    LayerAppSampleRate = 2,
    LayerHttpSampleRate = 3,
    ConfigString = 4,
    ConfigInt = 5,
}

/// Identity of the reporting host, sent with settings requests.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HostId {
    #[prost(string, tag = "1")]
    pub hostname: String,
    #[prost(string, repeated, tag = "2")]
    pub ip_addresses: Vec<String>,
    #[prost(string, tag = "3")]
    pub uuid: String,
    #[prost(int32, tag = "4")]
    pub pid: i32,
}

/// Batch of encoded messages posted by `PostEvents`, `PostMetrics` and `PostStatus`.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageRequest {
    #[prost(string, tag = "1")]
    pub api_key: String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub messages: Vec<Vec<u8>>,
    #[prost(enumeration = "EncodingType", tag = "3")]
    pub encoding: i32,
    #[prost(message, optional, tag = "4")]
    pub identity: Option<HostId>,
}

/// Collector answer to a [`MessageRequest`].
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageResult {
    #[prost(enumeration = "ResultCode", tag = "1")]
    pub result: i32,
    /// Redirect target when `result` is `REDIRECT`.
    #[prost(string, tag = "2")]
    pub arg: String,
    #[prost(string, tag = "4")]
    pub warning: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsRequest {
    #[prost(string, tag = "1")]
    pub api_key: String,
    #[prost(message, optional, tag = "2")]
    pub identity: Option<HostId>,
    #[prost(string, tag = "3")]
    pub client_version: String,
}

/// A single collector-provided setting.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct OboeSetting {
    #[prost(enumeration = "OboeSettingType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub flags: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    #[prost(int64, tag = "4")]
    pub value: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub layer: Vec<u8>,
    #[prost(map = "string, bytes", tag = "7")]
    pub arguments: HashMap<String, Vec<u8>>,
    /// Validity window, in seconds.
    #[prost(int64, tag = "8")]
    pub ttl: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsResult {
    #[prost(enumeration = "ResultCode", tag = "1")]
    pub result: i32,
    #[prost(string, tag = "2")]
    pub arg: String,
    #[prost(message, repeated, tag = "3")]
    pub settings: Vec<OboeSetting>,
    #[prost(string, tag = "4")]
    pub warning: String,
}

impl MessageResult {
    pub fn with_code(code: ResultCode) -> Self {
        Self {
            result: code as i32,
            ..Default::default()
        }
    }

    pub fn redirect(host: impl Into<String>) -> Self {
        Self {
            result: ResultCode::Redirect as i32,
            arg: host.into(),
            ..Default::default()
        }
    }
}

impl SettingsResult {
    pub fn with_code(code: ResultCode) -> Self {
        Self {
            result: code as i32,
            ..Default::default()
        }
    }

    pub fn redirect(host: impl Into<String>) -> Self {
        Self {
            result: ResultCode::Redirect as i32,
            arg: host.into(),
            ..Default::default()
        }
    }
}
