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


//! Per-book download options
//!
//! Built by the calling layer from the license response and the user's
//! settings, then passed read-only into the pipeline for one download.

use crate::audio::chapters::ChapterInfo;
use crate::audio::encoder::{EncoderConfig, OutputFormat};
use crate::crypto::DecryptionKey;
use crate::error::{LibationError, Result};
use crate::file::naming::ReplacementCharacters;
use crate::sidecar::records::RecordsFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whether the book becomes one file or one file per chapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    #[default]
    SingleFile,
    MultiPart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Audible product ID, used as the transfer label
    #[serde(default)]
    pub asin: String,

    /// Book title, used for part names and titles
    #[serde(default)]
    pub title: String,

    /// Signed content URL from the license response
    pub download_url: String,

    #[serde(default)]
    pub user_agent: String,

    /// Per-book key and IV
    pub decryption_key: DecryptionKey,

    #[serde(default)]
    pub replacement_characters: ReplacementCharacters,

    #[serde(default)]
    pub output_format: OutputFormat,

    #[serde(default)]
    pub output_layout: OutputLayout,

    #[serde(default)]
    pub trim_output_to_chapter_length: bool,

    #[serde(default)]
    pub retain_encrypted_file: bool,

    #[serde(default)]
    pub strip_unabridged: bool,

    #[serde(default)]
    pub create_cue_sheet: bool,

    #[serde(default)]
    pub download_clips_bookmarks: bool,

    #[serde(default)]
    pub records_format: RecordsFormat,

    /// Per-download cap in bytes per second (0 = unlimited)
    #[serde(default)]
    pub download_speed_bps: u64,

    /// Catalog chapters; empty means use the chapters embedded in the file
    #[serde(default)]
    pub chapter_info: ChapterInfo,

    /// Best-effort repair of container metadata
    #[serde(default)]
    pub fixup_file: bool,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub downsample: bool,

    #[serde(default)]
    pub match_source_bitrate: bool,
}

impl DownloadOptions {
    /// Options with every flag off
    pub fn new(download_url: impl Into<String>, decryption_key: DecryptionKey) -> Self {
        Self {
            asin: String::new(),
            title: String::new(),
            download_url: download_url.into(),
            user_agent: String::new(),
            decryption_key,
            replacement_characters: ReplacementCharacters::default(),
            output_format: OutputFormat::default(),
            output_layout: OutputLayout::default(),
            trim_output_to_chapter_length: false,
            retain_encrypted_file: false,
            strip_unabridged: false,
            create_cue_sheet: false,
            download_clips_bookmarks: false,
            records_format: RecordsFormat::default(),
            download_speed_bps: 0,
            chapter_info: ChapterInfo::default(),
            fixup_file: false,
            encoder: EncoderConfig::default(),
            downsample: false,
            match_source_bitrate: false,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// # Errors
    /// - `InvalidInput` - URL is not a well-formed http(s) URL, or the
    ///   encoder bitrate is zero
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.download_url).map_err(|e| {
            LibationError::InvalidInput(format!("Malformed download URL: {}", e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LibationError::InvalidInput(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        if self.encoder.bitrate_kbps == 0 {
            return Err(LibationError::InvalidInput(
                "Encoder bitrate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Label announced with `StreamingBegin`
    pub fn label(&self) -> &str {
        if !self.asin.is_empty() {
            &self.asin
        } else {
            &self.title
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        let key = DecryptionKey::from_slices(&[1u8; 16], &[2u8; 16])
            .unwrap_or_else(|e| panic!("fixture key: {}", e));
        Self::new("https://cdn.example.com/book.aaxc", key)
    }
}

/// Where finished files go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTarget {
    pub directory: PathBuf,
    /// File name without extension for single-file output; also the base
    /// for sidecar names
    pub file_stem: String,
}

impl OutputTarget {
    pub fn new(directory: impl Into<PathBuf>, file_stem: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            file_stem: file_stem.into(),
        }
    }
}
