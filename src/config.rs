// LibriSync - Audible Library Sync for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is a Rust port of Libation (https://github.com/rmcrackan/Libation)
// Original work Copyright (C) Libation contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Process-wide pipeline configuration
//!
//! Per-book settings live in [`DownloadOptions`](crate::download::DownloadOptions);
//! this covers what is shared by every download in the process.
//!
//! # Example JSON
//! ```json
//! {
//!   "max_concurrent_downloads": 2,
//!   "aggregate_speed_cap_bps": 1048576,
//!   "temp_dir": "/var/tmp/liberation"
//! }
//! ```
//! Omitted fields take their defaults.

use crate::error::{LibationError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Simultaneous downloads allowed by the manager
    pub max_concurrent_downloads: usize,

    /// Cap shared by all downloads, bytes per second (0 = unlimited)
    pub aggregate_speed_cap_bps: u64,

    /// Root for per-run work directories; defaults to the output directory
    /// so finished files can be renamed into place
    pub temp_dir: Option<PathBuf>,

    pub connect_timeout_secs: u64,

    /// Longest wait for the next chunk of a response body
    pub read_timeout_secs: u64,

    /// Minimum spacing between progress events
    pub progress_interval_ms: u64,

    /// Silence after which a transfer is reported as frozen
    pub freeze_after_secs: u64,

    /// Keep `.part` files across runs and continue them with Range requests
    pub resume_partial_downloads: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            aggregate_speed_cap_bps: 0,
            temp_dir: None,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            progress_interval_ms: 200,
            freeze_after_secs: 30,
            resume_partial_downloads: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&json)
    }

    /// # Errors
    /// - `InvalidInput` - a limit or timeout is zero
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(LibationError::InvalidInput(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(LibationError::InvalidInput(
                "Timeouts must be greater than zero".to_string(),
            ));
        }
        if self.freeze_after_secs == 0 {
            return Err(LibationError::InvalidInput(
                "freeze_after_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn freeze_threshold(&self) -> Duration {
        Duration::from_secs(self.freeze_after_secs)
    }
}
