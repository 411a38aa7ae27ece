//! Per-channel settings.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings applied when a [`crate::SyncChannel`] is created.
///
/// Missing fields take their defaults, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncChannelConfig {
    /// While blocked, dispatch only messages arriving on the same channel
    pub restrict_dispatch_to_same_channel: bool,
    /// Accept blocking calls that have no timeout
    pub allow_no_timeout_sends: bool,
    /// Timeout used by `send_sync`; `None` waits indefinitely
    pub default_timeout_ms: Option<u64>,
}

impl Default for SyncChannelConfig {
    fn default() -> Self {
        Self {
            restrict_dispatch_to_same_channel: false,
            allow_no_timeout_sends: true,
            default_timeout_ms: None,
        }
    }
}

impl SyncChannelConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_restrict_dispatch(mut self, restrict: bool) -> Self {
        self.restrict_dispatch_to_same_channel = restrict;
        self
    }

    pub fn with_allow_no_timeout_sends(mut self, allow: bool) -> Self {
        self.allow_no_timeout_sends = allow;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}
