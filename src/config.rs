//! Session configuration
//!
//! Every field has a default, so an empty TOML file is a valid configuration.
//!
//! ```toml
//! presence_liveness_ms = 30000
//! desync_timeout_ms = 5000
//!
//! [diff]
//! char_diff_limit = 8192
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::error::CollabError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Presence entries not refreshed within this window are expired
    pub presence_liveness_ms: u64,

    /// How long a remote operation may wait for a missing predecessor
    pub desync_timeout_ms: u64,

    /// Outgoing queue length at which backpressure kicks in
    pub outgoing_queue_limit: usize,

    /// Integrated operations kept for replaying to peers
    pub history_limit: usize,

    /// Out-of-order operations buffered per remote site
    pub pending_per_site_limit: usize,

    /// Interval of the session housekeeping tick
    pub tick_interval_ms: u64,

    /// Distinct inbound presence states buffered; a newer state for the same
    /// site and kind replaces the queued one, otherwise the oldest is dropped
    pub presence_queue_capacity: usize,

    pub diff: DiffLimits,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            presence_liveness_ms: 30_000,
            desync_timeout_ms: 5_000,
            outgoing_queue_limit: 256,
            history_limit: 10_000,
            pending_per_site_limit: 1_024,
            tick_interval_ms: 250,
            presence_queue_capacity: 1_024,
            diff: DiffLimits::default(),
        }
    }
}

/// Bounds on the full-text fallback diff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffLimits {
    /// Largest changed region (chars) diffed char by char
    pub char_diff_limit: usize,

    /// Largest changed region (chars) diffed line by line; beyond this the
    /// region is replaced wholesale
    pub line_diff_limit: usize,

    /// Deadline for a single diff
    pub timeout_ms: u64,
}

impl Default for DiffLimits {
    fn default() -> Self {
        Self {
            char_diff_limit: 8_192,
            line_diff_limit: 1 << 20,
            timeout_ms: 50,
        }
    }
}

impl DiffLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CollabConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = Self::from_toml(&raw)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.presence_liveness_ms == 0 {
            return Err(CollabError::Config("presence_liveness_ms must be positive".into()));
        }
        if self.outgoing_queue_limit == 0 {
            return Err(CollabError::Config("outgoing_queue_limit must be positive".into()));
        }
        if self.pending_per_site_limit == 0 {
            return Err(CollabError::Config("pending_per_site_limit must be positive".into()));
        }
        if self.presence_queue_capacity == 0 {
            return Err(CollabError::Config("presence_queue_capacity must be positive".into()));
        }
        if self.diff.line_diff_limit < self.diff.char_diff_limit {
            return Err(CollabError::Config(
                "diff.line_diff_limit must not be below diff.char_diff_limit".into(),
            ));
        }
        Ok(())
    }

    pub fn presence_liveness(&self) -> Duration {
        Duration::from_millis(self.presence_liveness_ms)
    }

    pub fn desync_timeout(&self) -> Duration {
        Duration::from_millis(self.desync_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
