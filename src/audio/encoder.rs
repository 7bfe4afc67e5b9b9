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


//! Output format selection and audio re-encoding
//!
//! Most liberations never decode audio: the decrypted AAC frames are copied
//! into the output container as-is. A re-encode is only needed for MP3
//! output, downsampling, or a channel change, and goes through the
//! [`AudioEncoder`] trait so the pipeline does not depend on one tool.

use super::container::SourceFormat;
use crate::download::DownloadOptions;
use crate::error::{LibationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Bitrates offered when matching the source, in kbps
pub const STANDARD_BITRATES_KBPS: [u32; 9] = [32, 48, 64, 96, 128, 160, 192, 256, 320];

/// Target rates for downsampling, highest first
pub const DOWNSAMPLE_RATES: [u32; 4] = [44100, 22050, 16000, 8000];

/// Downsampled output never needs more than this
pub const DOWNSAMPLED_MAX_BITRATE_KBPS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    M4b,
    Mp3,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::M4b => "m4b",
            OutputFormat::Mp3 => "mp3",
        }
    }

    /// File type keyword used in cue sheets
    pub fn cue_file_type(&self) -> &'static str {
        match self {
            OutputFormat::M4b => "MP4",
            OutputFormat::Mp3 => "MP3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Mono,
    #[default]
    Passthrough,
}

/// Encoder effort versus output size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Fast,
    #[default]
    Balanced,
    Best,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub bitrate_kbps: u32,
    pub quality: QualityPreset,
    pub channels: ChannelMode,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: 64,
            quality: QualityPreset::default(),
            channels: ChannelMode::default(),
        }
    }
}

/// Concrete parameters for one output file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub format: OutputFormat,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub quality: QualityPreset,
    source_sample_rate: u32,
    source_channels: u16,
}

/// Largest downsample target strictly below `source_rate`
pub fn downsampled_rate(source_rate: u32) -> u32 {
    DOWNSAMPLE_RATES
        .iter()
        .copied()
        .find(|&rate| rate < source_rate)
        .unwrap_or(source_rate)
}

/// Largest standard bitrate not above the source, if any
pub fn matched_bitrate(source_kbps: u32) -> Option<u32> {
    STANDARD_BITRATES_KBPS
        .iter()
        .rev()
        .copied()
        .find(|&rate| rate <= source_kbps)
}

impl EncoderSettings {
    /// Resolve output parameters from the source and the download options
    pub fn resolve(source: &SourceFormat, options: &DownloadOptions) -> Self {
        let config = &options.encoder;

        let mut bitrate_kbps = if options.match_source_bitrate {
            matched_bitrate(source.bitrate_kbps).unwrap_or(config.bitrate_kbps)
        } else {
            config.bitrate_kbps
        };

        let sample_rate = if options.downsample {
            downsampled_rate(source.sample_rate)
        } else {
            source.sample_rate
        };
        if sample_rate < source.sample_rate {
            bitrate_kbps = bitrate_kbps.min(DOWNSAMPLED_MAX_BITRATE_KBPS);
        }

        let channels = match config.channels {
            ChannelMode::Mono => 1,
            ChannelMode::Passthrough => source.channels,
        };

        Self {
            format: options.output_format,
            bitrate_kbps,
            sample_rate,
            channels,
            quality: config.quality,
            source_sample_rate: source.sample_rate,
            source_channels: source.channels,
        }
    }

    /// Whether the copied AAC frames must go through an encoder
    pub fn needs_reencode(&self) -> bool {
        self.format == OutputFormat::Mp3
            || self.sample_rate != self.source_sample_rate
            || self.channels != self.source_channels
    }
}

// ============================================================================
// ENCODERS
// ============================================================================

#[async_trait]
pub trait AudioEncoder: Send + Sync {
    /// Re-encode `input` (an M4B written by this crate) into `output`
    ///
    /// Implementations must stop promptly once `cancel` fires and return
    /// `Cancelled`. Tags and chapters should be carried over.
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        settings: &EncoderSettings,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Encoder backed by an `ffmpeg` executable
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    binary: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEncoder {
    /// Use `ffmpeg` from `PATH`
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args(&self, input: &Path, output: &Path, settings: &EncoderSettings) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_owned());

        let (codec, container) = match settings.format {
            OutputFormat::Mp3 => ("libmp3lame", "mp3"),
            OutputFormat::M4b => ("aac", "ipod"),
        };
        let rest = [
            "-map".to_string(),
            "0:a".to_string(),
            "-map_metadata".to_string(),
            "0".to_string(),
            "-map_chapters".to_string(),
            "0".to_string(),
            "-c:a".to_string(),
            codec.to_string(),
            "-b:a".to_string(),
            format!("{}k", settings.bitrate_kbps),
            "-ar".to_string(),
            settings.sample_rate.to_string(),
            "-ac".to_string(),
            settings.channels.to_string(),
        ];
        args.extend(rest.into_iter().map(OsString::from));

        if settings.format == OutputFormat::Mp3 {
            let level = match settings.quality {
                QualityPreset::Fast => "7",
                QualityPreset::Balanced => "4",
                QualityPreset::Best => "0",
            };
            args.push("-compression_level".into());
            args.push(level.into());
        }

        args.push("-f".into());
        args.push(container.into());
        args.push(output.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl AudioEncoder for FfmpegEncoder {
    #[instrument(skip_all, fields(output = %output.display()))]
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        settings: &EncoderSettings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = self.args(input, output, settings);
        debug!(binary = %self.binary.display(), ?args, "Starting encoder");
        info!(
            format = ?settings.format,
            bitrate_kbps = settings.bitrate_kbps,
            sample_rate = settings.sample_rate,
            channels = settings.channels,
            "Re-encoding audio"
        );

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                LibationError::Encoder(format!(
                    "Failed to start {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        // Dropping the wait future on cancellation drops the child, which kills it
        tokio::select! {
            result = child.wait_with_output() => {
                let output = result?;
                if output.status.success() {
                    Ok(())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
                    Err(LibationError::Encoder(format!(
                        "{} exited with {}: {}",
                        self.binary.display(),
                        output.status,
                        tail
                    )))
                }
            }
            _ = cancel.cancelled() => Err(LibationError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(sample_rate: u32, channels: u16, bitrate_kbps: u32) -> SourceFormat {
        SourceFormat {
            codec: *b"mp4a",
            channels,
            sample_rate,
            bitrate_kbps,
        }
    }

    #[test]
    fn test_matched_bitrate() {
        assert_eq!(matched_bitrate(125), Some(96));
        assert_eq!(matched_bitrate(128), Some(128));
        assert_eq!(matched_bitrate(400), Some(320));
        assert_eq!(matched_bitrate(20), None);
    }

    #[test]
    fn test_downsampled_rate() {
        assert_eq!(downsampled_rate(48000), 44100);
        assert_eq!(downsampled_rate(44100), 22050);
        assert_eq!(downsampled_rate(22050), 16000);
        assert_eq!(downsampled_rate(8000), 8000);
    }

    #[test]
    fn test_default_options_copy_without_reencode() {
        let options = DownloadOptions::for_test();
        let settings = EncoderSettings::resolve(&source(44100, 2, 125), &options);
        assert_eq!(settings.bitrate_kbps, 64);
        assert!(!settings.needs_reencode());
    }

    #[test]
    fn test_mp3_matches_source_bitrate() {
        let mut options = DownloadOptions::for_test();
        options.output_format = OutputFormat::Mp3;
        options.match_source_bitrate = true;

        let settings = EncoderSettings::resolve(&source(44100, 2, 125), &options);
        assert_eq!(settings.bitrate_kbps, 96);
        assert!(settings.needs_reencode());
    }

    #[test]
    fn test_downsample_clamps_bitrate() {
        let mut options = DownloadOptions::for_test();
        options.downsample = true;
        options.encoder.bitrate_kbps = 128;

        let settings = EncoderSettings::resolve(&source(44100, 2, 128), &options);
        assert_eq!(settings.sample_rate, 22050);
        assert_eq!(settings.bitrate_kbps, 64);
        assert!(settings.needs_reencode());
    }

    #[test]
    fn test_mono_forces_reencode_for_stereo_source() {
        let mut options = DownloadOptions::for_test();
        options.encoder.channels = ChannelMode::Mono;

        let stereo = EncoderSettings::resolve(&source(22050, 2, 64), &options);
        assert_eq!(stereo.channels, 1);
        assert!(stereo.needs_reencode());

        let mono = EncoderSettings::resolve(&source(22050, 1, 64), &options);
        assert!(!mono.needs_reencode());
    }

    #[test]
    fn test_ffmpeg_args() {
        let mut options = DownloadOptions::for_test();
        options.output_format = OutputFormat::Mp3;
        let settings = EncoderSettings::resolve(&source(44100, 2, 64), &options);

        let args = FfmpegEncoder::new().args(Path::new("in.m4b"), Path::new("out.mp3"), &settings);
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.windows(2).any(|w| w == ["-c:a", "libmp3lame"]));
        assert!(args.windows(2).any(|w| w == ["-b:a", "64k"]));
        assert_eq!(args.last().map(String::as_str), Some("out.mp3"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_encoder_error() {
        let encoder = FfmpegEncoder::with_binary("/nonexistent/ffmpeg-liberation-test");
        let options = DownloadOptions::for_test();
        let settings = EncoderSettings::resolve(&source(44100, 2, 64), &options);

        let err = encoder
            .encode(
                Path::new("in.m4b"),
                Path::new("out.m4b"),
                &settings,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LibationError::Encoder(_)));
    }
}
