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


//! Download progress tracking and reporting
//!
//! The fetcher emits exactly two kinds of [`DownloadEvent`]: one
//! `StreamingBegin` per transfer, then `StreamingProgressChanged` as bytes
//! arrive. Everything else here consumes those events:
//!
//! - [`AverageSpeed`] - sliding-window transfer rate
//! - [`ProgressReporter`] - percentage, ETA and the `Active`/`Frozen` state
//! - [`watch_for_freeze`] - periodic tick driving freeze detection
//!
//! The reporter is observational only. It never cancels or retries a transfer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// No event for this long means the transfer is reported as frozen
pub const FREEZE_THRESHOLD: Duration = Duration::from_secs(30);

/// Default minimum spacing between progress events
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

// ============================================================================
// EVENTS
// ============================================================================

/// Progress snapshot for one transfer
///
/// `bytes_received` never decreases within a transfer and never exceeds
/// `total_bytes_to_receive` when the total is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub bytes_received: u64,
    /// Absent for chunked or otherwise unsized responses
    pub total_bytes_to_receive: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl DownloadProgress {
    pub fn new(bytes_received: u64, total_bytes_to_receive: Option<u64>) -> Self {
        Self {
            bytes_received,
            total_bytes_to_receive,
            timestamp: Utc::now(),
        }
    }

    /// Whole percentage, truncated; `None` when the total is unknown
    pub fn percent(&self) -> Option<u8> {
        let total = self.total_bytes_to_receive?;
        if total == 0 {
            return Some(100);
        }
        let received = self.bytes_received.min(total) as u128;
        Some((received * 100 / total as u128) as u8)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total_bytes_to_receive, Some(total) if self.bytes_received >= total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum DownloadEvent {
    StreamingBegin { label: String },
    StreamingProgressChanged(DownloadProgress),
}

/// Subscriber for download events
///
/// Invoked inline on the downloading task, in stream order. Keep it cheap.
pub type EventCallback = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

/// Lifecycle of one download as tracked by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    /// Waiting for a concurrency slot
    Queued,
    /// Running the pipeline
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

/// Rate limiter for progress events
///
/// The first and final events of a transfer always pass.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant, is_final: bool) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => is_final || now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }
}

// ============================================================================
// RATE
// ============================================================================

/// Average speed over the most recent position samples
#[derive(Debug, Clone)]
pub struct AverageSpeed {
    samples: VecDeque<(Instant, u64)>,
    max_samples: usize,
}

impl AverageSpeed {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            // ~2 seconds at 200ms intervals
            max_samples: 10,
        }
    }

    pub fn add_position(&mut self, position: u64, now: Instant) {
        self.samples.push_back((now, position));
        if self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Bytes per second across the window; zero until two samples exist
    pub fn average(&self) -> u64 {
        let (Some(&(first_time, first_pos)), Some(&(last_time, last_pos))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0;
        };

        let elapsed = last_time.saturating_duration_since(first_time).as_secs_f64();
        if elapsed > 0.0 {
            (last_pos.saturating_sub(first_pos) as f64 / elapsed) as u64
        } else {
            0
        }
    }
}

impl Default for AverageSpeed {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// REPORTER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    Active,
    Frozen,
}

/// Time since the last event, reported while frozen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeReport {
    pub elapsed: Duration,
}

impl FreezeReport {
    pub fn minutes(&self) -> u64 {
        self.elapsed.as_secs() / 60
    }

    pub fn seconds(&self) -> u64 {
        self.elapsed.as_secs() % 60
    }
}

impl fmt::Display for FreezeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frozen for {}m {}s", self.minutes(), self.seconds())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub label: Option<String>,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<u8>,
    pub bytes_per_second: u64,
    pub eta: Option<Duration>,
    pub state: ReporterState,
}

/// Consumes fetcher events and tracks rate, ETA and staleness
///
/// Staleness is a small state machine: `Active` until [`tick`](Self::tick)
/// observes [`FREEZE_THRESHOLD`] without an event, then `Frozen` until the
/// next event arrives. Time is always passed in so the machine is testable.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    state: ReporterState,
    threshold: Duration,
    label: Option<String>,
    latest: Option<DownloadProgress>,
    last_event: Option<Instant>,
    speed: AverageSpeed,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_threshold(FREEZE_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            state: ReporterState::Active,
            threshold,
            label: None,
            latest: None,
            last_event: None,
            speed: AverageSpeed::new(),
        }
    }

    pub fn state(&self) -> ReporterState {
        self.state
    }

    pub fn latest(&self) -> Option<&DownloadProgress> {
        self.latest.as_ref()
    }

    /// Feed one fetcher event
    ///
    /// # Returns
    /// `true` if the event cleared a frozen state
    pub fn handle_event(&mut self, event: &DownloadEvent, now: Instant) -> bool {
        match event {
            DownloadEvent::StreamingBegin { label } => {
                self.label = Some(label.clone());
                self.latest = None;
                self.speed.reset();
                self.touch(now)
            }
            DownloadEvent::StreamingProgressChanged(progress) => self.observe(progress, now),
        }
    }

    /// Record a progress event
    pub fn observe(&mut self, progress: &DownloadProgress, now: Instant) -> bool {
        if let Some(previous) = &self.latest {
            if progress.bytes_received < previous.bytes_received {
                // Server restarted the transfer from zero
                self.speed.reset();
            }
        }
        self.speed.add_position(progress.bytes_received, now);
        self.latest = Some(*progress);
        self.touch(now)
    }

    fn touch(&mut self, now: Instant) -> bool {
        self.last_event = Some(now);
        let thawed = self.state == ReporterState::Frozen;
        self.state = ReporterState::Active;
        thawed
    }

    /// Periodic staleness check
    ///
    /// # Returns
    /// A report while frozen, `None` while active or before the first event
    pub fn tick(&mut self, now: Instant) -> Option<FreezeReport> {
        let last = self.last_event?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.threshold {
            self.state = ReporterState::Frozen;
            Some(FreezeReport { elapsed })
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let bytes_received = self.latest.map(|p| p.bytes_received).unwrap_or(0);
        let total_bytes = self.latest.and_then(|p| p.total_bytes_to_receive);
        let bytes_per_second = self.speed.average();

        let eta = match total_bytes {
            Some(total) if bytes_per_second > 0 && total > bytes_received => Some(
                Duration::from_secs((total - bytes_received) / bytes_per_second),
            ),
            _ => None,
        };

        ProgressSnapshot {
            label: self.label.clone(),
            bytes_received,
            total_bytes,
            percent: self.latest.and_then(|p| p.percent()),
            bytes_per_second,
            eta,
            state: self.state,
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an [`EventCallback`] that feeds a shared reporter
pub fn reporter_callback(reporter: Arc<Mutex<ProgressReporter>>) -> EventCallback {
    Arc::new(move |event: &DownloadEvent| {
        let mut reporter = reporter.lock().unwrap_or_else(|e| e.into_inner());
        if reporter.handle_event(event, Instant::now()) {
            tracing::info!("Download resumed after stall");
        }
    })
}

/// Tick `reporter` every `period` until `cancel` fires
///
/// `on_freeze` is called on every tick while the transfer is frozen.
pub async fn watch_for_freeze<F>(
    reporter: Arc<Mutex<ProgressReporter>>,
    period: Duration,
    cancel: CancellationToken,
    on_freeze: F,
) where
    F: Fn(FreezeReport) + Send,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            now = interval.tick() => {
                let report = {
                    let mut reporter = reporter.lock().unwrap_or_else(|e| e.into_inner());
                    reporter.tick(now)
                };
                if let Some(report) = report {
                    warn!("Download {}", report);
                    on_freeze(report);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_is_truncated() {
        let progress = DownloadProgress::new(999, Some(1000));
        assert_eq!(progress.percent(), Some(99));

        let progress = DownloadProgress::new(1000, Some(1000));
        assert_eq!(progress.percent(), Some(100));
        assert!(progress.is_complete());
    }

    #[test]
    fn test_percent_hidden_without_total() {
        let progress = DownloadProgress::new(12345, None);
        assert_eq!(progress.percent(), None);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_average_speed() {
        let t0 = Instant::now();
        let mut speed = AverageSpeed::new();
        assert_eq!(speed.average(), 0);

        speed.add_position(0, t0);
        speed.add_position(1000, t0 + Duration::from_millis(100));
        assert_eq!(speed.average(), 10_000);
    }

    #[test]
    fn test_average_speed_window() {
        let t0 = Instant::now();
        let mut speed = AverageSpeed::new();
        for i in 0..20u64 {
            speed.add_position(i * 100, t0 + Duration::from_secs(i));
        }
        // Only the last 10 samples count
        assert_eq!(speed.average(), 100);
    }

    #[test]
    fn test_freeze_not_before_threshold() {
        let t0 = Instant::now();
        let mut reporter = ProgressReporter::new();
        assert_eq!(reporter.tick(t0 + Duration::from_secs(100)), None);

        reporter.observe(&DownloadProgress::new(10, Some(100)), t0);
        assert_eq!(reporter.tick(t0 + Duration::from_millis(29_999)), None);
        assert_eq!(reporter.state(), ReporterState::Active);

        let report = reporter.tick(t0 + Duration::from_secs(30)).unwrap();
        assert_eq!(report.elapsed, Duration::from_secs(30));
        assert_eq!(reporter.state(), ReporterState::Frozen);
    }

    #[test]
    fn test_freeze_report_text_and_thaw() {
        let t0 = Instant::now();
        let mut reporter = ProgressReporter::new();
        reporter.observe(&DownloadProgress::new(10, None), t0);

        let report = reporter.tick(t0 + Duration::from_secs(95)).unwrap();
        assert_eq!(report.to_string(), "frozen for 1m 35s");

        let thawed = reporter.observe(
            &DownloadProgress::new(20, None),
            t0 + Duration::from_secs(96),
        );
        assert!(thawed);
        assert_eq!(reporter.state(), ReporterState::Active);
        assert_eq!(reporter.tick(t0 + Duration::from_secs(97)), None);
    }

    #[test]
    fn test_snapshot_eta() {
        let t0 = Instant::now();
        let mut reporter = ProgressReporter::new();
        reporter.handle_event(
            &DownloadEvent::StreamingBegin {
                label: "B0TEST".to_string(),
            },
            t0,
        );
        reporter.observe(&DownloadProgress::new(0, Some(10_000)), t0);
        reporter.observe(
            &DownloadProgress::new(1_000, Some(10_000)),
            t0 + Duration::from_secs(1),
        );

        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.label.as_deref(), Some("B0TEST"));
        assert_eq!(snapshot.percent, Some(10));
        assert_eq!(snapshot.bytes_per_second, 1_000);
        assert_eq!(snapshot.eta, Some(Duration::from_secs(9)));
    }

    #[test]
    fn test_progress_throttle() {
        let t0 = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_millis(200));
        assert!(throttle.should_emit(t0, false));
        assert!(!throttle.should_emit(t0 + Duration::from_millis(100), false));
        assert!(throttle.should_emit(t0 + Duration::from_millis(150), true));
        assert!(!throttle.should_emit(t0 + Duration::from_millis(300), false));
        assert!(throttle.should_emit(t0 + Duration::from_millis(350), false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_for_freeze_reports_after_threshold() {
        let reporter = Arc::new(Mutex::new(ProgressReporter::new()));
        let started = Instant::now();
        reporter
            .lock()
            .unwrap()
            .observe(&DownloadProgress::new(1, Some(10)), started);

        let reports = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let watcher = {
            let reports = reports.clone();
            tokio::spawn(watch_for_freeze(
                reporter.clone(),
                Duration::from_secs(1),
                cancel.clone(),
                move |report| reports.lock().unwrap().push(report),
            ))
        };

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(reports.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        watcher.await.unwrap();

        let reports = reports.lock().unwrap();
        assert!(!reports.is_empty());
        assert!(reports.iter().all(|r| r.elapsed >= FREEZE_THRESHOLD));
        assert_eq!(reporter.lock().unwrap().state(), ReporterState::Frozen);
    }
}
