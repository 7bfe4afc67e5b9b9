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


//! Clips, notes and bookmarks sidecar
//!
//! Annotation records come from the account's sidecar endpoint, which lives
//! in the API layer. The pipeline only sees it through [`RecordsSource`].
//!
//! # Example JSON output
//! ```json
//! [
//!   {
//!     "kind": "clip",
//!     "created": "2024-03-01T18:22:05Z",
//!     "start_ms": 812000,
//!     "end_ms": 845000,
//!     "title": "Litany",
//!     "text": "I must not fear."
//!   }
//! ]
//! ```

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Clip,
    Note,
    Bookmark,
    LastHeard,
}

/// One annotation on a book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudibleRecord {
    pub kind: RecordKind,
    pub created: DateTime<Utc>,
    /// Position in the book
    pub start_ms: u64,
    /// End of a clip; absent for point records
    pub end_ms: Option<u64>,
    pub title: Option<String>,
    pub text: Option<String>,
}

impl AudibleRecord {
    pub fn bookmark(created: DateTime<Utc>, start_ms: u64) -> Self {
        Self {
            kind: RecordKind::Bookmark,
            created,
            start_ms,
            end_ms: None,
            title: None,
            text: None,
        }
    }
}

/// Sidecar file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordsFormat {
    #[default]
    Json,
    Csv,
}

impl RecordsFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RecordsFormat::Json => "json",
            RecordsFormat::Csv => "csv",
        }
    }
}

/// Supplier of annotation records for a book
#[async_trait]
pub trait RecordsSource: Send + Sync {
    /// # Arguments
    /// * `asin` - Book whose records are wanted
    async fn fetch_records(&self, asin: &str) -> Result<Vec<AudibleRecord>>;
}

// ============================================================================
// SAVING
// ============================================================================

/// `Book.m4b` becomes `Book.records.json`
pub fn records_path(audio_path: &Path, format: RecordsFormat) -> PathBuf {
    let stem = audio_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    audio_path.with_file_name(format!("{}.records.{}", stem, format.extension()))
}

/// Fetch a book's records and write them beside `audio_path`
///
/// Does nothing when `enabled` is false.
///
/// # Returns
/// Path of the sidecar file, or `None` when disabled
///
/// # Errors
/// Whatever the source or the file system returns. Callers treat these as
/// warnings.
#[instrument(skip(source), fields(audio = %audio_path.display()))]
pub async fn save_clips_and_bookmarks(
    source: &dyn RecordsSource,
    asin: &str,
    audio_path: &Path,
    format: RecordsFormat,
    enabled: bool,
) -> Result<Option<PathBuf>> {
    if !enabled {
        return Ok(None);
    }

    let records = source.fetch_records(asin).await?;
    debug!(count = records.len(), "Fetched records");

    let contents = match format {
        RecordsFormat::Json => serde_json::to_vec_pretty(&records)?,
        RecordsFormat::Csv => records_to_csv(&records)?,
    };

    let path = records_path(audio_path, format);
    let staging = path.with_extension(format!("{}.tmp", format.extension()));
    tokio::fs::write(&staging, &contents).await?;
    if let Err(e) = tokio::fs::rename(&staging, &path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }

    info!(path = %path.display(), count = records.len(), "Saved clips and bookmarks");
    Ok(Some(path))
}

fn records_to_csv(records: &[AudibleRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if records.is_empty() {
        writer
            .write_record(["kind", "created", "start_ms", "end_ms", "title", "text"])
            .map_err(std::io::Error::from)?;
    }
    for record in records {
        writer.serialize(record).map_err(std::io::Error::from)?;
    }
    writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LibationError;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FixedRecords {
        records: Vec<AudibleRecord>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecordsSource for FixedRecords {
        async fn fetch_records(&self, _asin: &str) -> Result<Vec<AudibleRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.clone())
        }
    }

    struct FailingRecords;

    #[async_trait]
    impl RecordsSource for FailingRecords {
        async fn fetch_records(&self, _asin: &str) -> Result<Vec<AudibleRecord>> {
            Err(LibationError::transport("sidecar endpoint unavailable"))
        }
    }

    fn sample_records() -> Vec<AudibleRecord> {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 18, 22, 5).unwrap();
        vec![
            AudibleRecord {
                kind: RecordKind::Clip,
                created,
                start_ms: 812_000,
                end_ms: Some(845_000),
                title: Some("Litany".to_string()),
                text: Some("I must not fear, \"fear\" is the mind-killer.".to_string()),
            },
            AudibleRecord::bookmark(created, 1_000),
        ]
    }

    fn source() -> FixedRecords {
        FixedRecords {
            records: sample_records(),
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_records_path() {
        assert_eq!(
            records_path(Path::new("/out/Dune.m4b"), RecordsFormat::Csv),
            PathBuf::from("/out/Dune.records.csv")
        );
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let dir = TempDir::new().unwrap();
        let source = source();
        let audio = dir.path().join("Dune.m4b");

        let saved = save_clips_and_bookmarks(&source, "B0", &audio, RecordsFormat::Json, false)
            .await
            .unwrap();
        assert!(saved.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_save_json() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("Dune.m4b");

        let path = save_clips_and_bookmarks(&source(), "B0", &audio, RecordsFormat::Json, true)
            .await
            .unwrap()
            .unwrap();
        let parsed: Vec<AudibleRecord> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed, sample_records());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_save_csv() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("Dune.m4b");

        let path = save_clips_and_bookmarks(&source(), "B0", &audio, RecordsFormat::Csv, true)
            .await
            .unwrap()
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("kind,created,start_ms,end_ms,title,text"));
        assert!(lines.next().unwrap().starts_with("clip,2024-03-01T18:22:05Z,812000,845000,Litany,"));
        assert_eq!(lines.next(), Some("bookmark,2024-03-01T18:22:05Z,1000,,,"));
    }

    #[tokio::test]
    async fn test_source_error_is_returned() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("Dune.m4b");
        let result =
            save_clips_and_bookmarks(&FailingRecords, "B0", &audio, RecordsFormat::Json, true).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
