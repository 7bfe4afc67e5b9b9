//! Download management and streaming
//!
//! This module fetches encrypted book files over HTTP, reports progress,
//! and runs concurrent downloads under shared limits.

pub mod manager;
pub mod options;
pub mod progress;
pub mod stream;
pub mod throttle;

// Re-export commonly used types
pub use manager::{AggregateStats, DownloadHandle, DownloadManager, StatsSnapshot};
pub use options::{DownloadOptions, OutputLayout, OutputTarget};
pub use progress::{
    reporter_callback, watch_for_freeze, DownloadEvent, DownloadProgress, DownloadState,
    EventCallback, FreezeReport, ProgressReporter, ProgressSnapshot, ReporterState,
};
pub use stream::{FetchRequest, FetchStream, Fetcher};
pub use throttle::Throttle;
