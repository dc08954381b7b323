//! Runtime configuration.
//!
//! This module defines the settings for a runtime thread spawned with
//! [`RuntimeHandle::spawn`](crate::runtime::RuntimeHandle::spawn).

use crate::runtime::error::{Error, Result};
use crate::runtime::js_value::{MAX_JS_BYTES, MAX_JS_DEPTH};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single runtime thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name of the OS thread hosting the runtime
    pub thread_name: String,
    /// Maximum nesting depth of values returned to the caller
    pub max_snapshot_depth: usize,
    /// Maximum total size in bytes of values returned to the caller
    pub max_snapshot_bytes: usize,
    /// Run queued jobs before teardown when the runtime closes (default: true)
    pub drain_jobs_on_shutdown: bool,
    /// Optional timeout for async calls, in milliseconds
    pub call_timeout_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name: "jsbridge-runtime".to_string(),
            max_snapshot_depth: MAX_JS_DEPTH,
            max_snapshot_bytes: MAX_JS_BYTES,
            drain_jobs_on_shutdown: true,
            call_timeout_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_max_snapshot_depth(mut self, depth: usize) -> Self {
        self.max_snapshot_depth = depth;
        self
    }

    pub fn with_max_snapshot_bytes(mut self, bytes: usize) -> Self {
        self.max_snapshot_bytes = bytes;
        self
    }

    pub fn with_drain_jobs_on_shutdown(mut self, drain: bool) -> Self {
        self.drain_jobs_on_shutdown = drain;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_name.trim().is_empty() {
            return Err(Error::Runtime("thread_name cannot be empty".to_string()));
        }
        if self.max_snapshot_depth == 0 {
            return Err(Error::Runtime(
                "max_snapshot_depth must be a positive integer".to_string(),
            ));
        }
        if self.max_snapshot_bytes == 0 {
            return Err(Error::Runtime(
                "max_snapshot_bytes must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}
