// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host and process identity stamped on every event.

use std::env;
use tracing::warn;

pub trait HostInfo: Send + Sync {
    fn hostname(&self) -> &str;
    fn pid(&self) -> u32;
}

/// Hostname and PID looked up once and cached for the life of the reporter.
#[derive(Debug, Clone)]
pub struct SystemHost {
    hostname: String,
    pid: u32,
}

impl SystemHost {
    pub fn new(alias: Option<&str>) -> Self {
        Self {
            hostname: resolve_hostname(alias),
            pid: std::process::id(),
        }
    }
}

impl HostInfo for SystemHost {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

/// Resolution order: explicit alias, `APPOPTICS_HOSTNAME_ALIAS`, `HOSTNAME`, the system
/// hostname, and finally `unknown`.
#[must_use]
pub fn resolve_hostname(alias: Option<&str>) -> String {
    if let Some(alias) = alias.filter(|a| !a.is_empty()) {
        return alias.to_string();
    }

    for var in ["APPOPTICS_HOSTNAME_ALIAS", "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str().filter(|h| !h.is_empty()) {
                return hostname.to_string();
            }
        }
        Err(e) => warn!("failed to get system hostname: {e}"),
    }

    warn!("could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
