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


//! Concurrent download management
//!
//! Each book runs as its own task through the shared [`Pipeline`]. Tasks are
//! independent except for a concurrency limit and an optional aggregate speed
//! cap, both taken from [`PipelineConfig`](crate::config::PipelineConfig).
//!
//! # Example
//! ```rust,ignore
//! let manager = DownloadManager::new(Pipeline::new(config, encoder)?);
//! let handle = manager.spawn(options, OutputTarget::new("/books", "Dune"));
//! let outcome = handle.join().await?;
//! ```

use super::options::{DownloadOptions, OutputTarget};
use super::progress::DownloadState;
use super::throttle::Throttle;
use crate::error::{LibationError, Result};
use crate::pipeline::{LiberationOutcome, Pipeline};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

// ============================================================================
// STATISTICS
// ============================================================================

/// Counters shared by every download of one manager
#[derive(Debug, Default)]
pub struct AggregateStats {
    active: AtomicUsize,
    bytes_received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active: usize,
    pub bytes_received: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    fn started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn finished(&self, state: DownloadState) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let counter = match state {
            DownloadState::Completed => &self.completed,
            DownloadState::Cancelled => &self.cancelled,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct DownloadManager {
    pipeline: Arc<Pipeline>,
    semaphore: Arc<Semaphore>,
    stats: Arc<AggregateStats>,
    cancel: CancellationToken,
}

impl DownloadManager {
    /// Wrap `pipeline`, attaching the shared throttle and statistics
    pub fn new(pipeline: Pipeline) -> Self {
        let config = pipeline.config();
        let permits = config.max_concurrent_downloads.max(1);
        let cap = config.aggregate_speed_cap_bps;

        let stats = Arc::new(AggregateStats::new());
        let mut pipeline = pipeline.with_stats(stats.clone());
        if cap > 0 {
            pipeline = pipeline.with_shared_throttle(Arc::new(Throttle::new(cap)));
        }

        Self {
            pipeline: Arc::new(pipeline),
            semaphore: Arc::new(Semaphore::new(permits)),
            stats,
            cancel: CancellationToken::new(),
        }
    }

    /// Queue a download; it starts once a concurrency slot is free
    pub fn spawn(&self, options: DownloadOptions, target: OutputTarget) -> DownloadHandle {
        let id = Uuid::new_v4();
        let cancel = self.cancel.child_token();
        let (state_tx, state_rx) = watch::channel(DownloadState::Queued);

        let pipeline = self.pipeline.clone();
        let semaphore = self.semaphore.clone();
        let stats = self.stats.clone();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let permit = tokio::select! {
                _ = task_cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                let _ = state_tx.send(DownloadState::Cancelled);
                return Err(LibationError::Cancelled);
            };

            stats.started();
            let _ = state_tx.send(DownloadState::Running);
            info!(%id, label = options.label(), "Download started");

            let result = pipeline.run(&options, &target, &task_cancel).await;
            let state = match &result {
                Ok(_) => DownloadState::Completed,
                Err(LibationError::Cancelled) => DownloadState::Cancelled,
                Err(e) => {
                    warn!(%id, error = %e, "Download failed");
                    DownloadState::Failed
                }
            };
            stats.finished(state);
            let _ = state_tx.send(state);
            result
        });

        DownloadHandle {
            id,
            state: state_rx,
            cancel,
            task,
        }
    }

    /// Cancel every queued and running download
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Handle to one spawned download
pub struct DownloadHandle {
    id: Uuid,
    state: watch::Receiver<DownloadState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<LiberationOutcome>>,
}

impl DownloadHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> DownloadState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.state.clone()
    }

    /// Request cancellation; the task stops at its next suspension point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the download to finish
    pub async fn join(self) -> Result<LiberationOutcome> {
        self.task
            .await
            .map_err(|e| LibationError::InvalidState(format!("Download task failed: {}", e)))?
    }
}
