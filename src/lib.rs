//! Audiobook liberation core
//!
//! Downloads an encrypted book over HTTP, decrypts it with the per-book key,
//! post-processes the container (trim, fixup, re-encode), optionally splits
//! it into parts, and writes cue sheet and clips/bookmarks sidecars.
//!
//! The entry point for one book is [`Pipeline::run`]; [`DownloadManager`]
//! runs several books under shared limits.

// Core modules
pub mod error;
pub mod config;
pub mod crypto;
pub mod download;
pub mod audio;
pub mod file;
pub mod sidecar;
pub mod pipeline;

// Re-export commonly used types for convenience
pub use config::PipelineConfig;
pub use download::{DownloadEvent, DownloadManager, DownloadOptions, DownloadProgress, OutputLayout, OutputTarget};
pub use error::{LibationError, Result, SidecarKind, SidecarWarning};
pub use pipeline::{FreezeCallback, LiberationOutcome, OutputFile, Pipeline};
