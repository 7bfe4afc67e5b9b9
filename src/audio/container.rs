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


//! M4B container model
//!
//! [`Container::read`] parses the `moov` tree of a decrypted file into a
//! sample table plus tags and chapters. The model can be sliced by sample
//! range and written back out with [`Container::write`], which copies sample
//! bytes from the source file into a fresh `ftyp`/`moov`/`mdat` layout.
//! Nothing is decoded, so trimming and splitting are lossless.
//!
//! # Layout written
//! ```text
//! ftyp
//! moov
//!   mvhd
//!   trak / tkhd, mdia / mdhd, hdlr, minf / smhd, dinf, stbl
//!   udta / chpl, meta / hdlr, ilst
//! mdat   (all samples, one chunk)
//! ```

use super::boxes::{
    children, find_child, parse_box, put_unity_matrix, require_child,
    scan_top_level, write_box, write_full_box, BoxReader, FourCc, TopLevelBox,
};
use super::metadata::Tags;
use crate::error::{LibationError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Upper bound on the `moov` box we are willing to load into memory
const MAX_MOOV_SIZE: u64 = 64 * 1024 * 1024;

const MAX_FTYP_SIZE: u64 = 4096;

/// Sample bytes are copied in pieces of this size so cancellation is observed
const COPY_PIECE: u64 = 4 * 1024 * 1024;

/// `chpl` start times are in 100 ns units
pub const CHPL_UNITS_PER_SECOND: u64 = 10_000_000;

/// `chpl` stores its entry count in a single byte
pub const MAX_CHPL_ENTRIES: usize = 255;

/// Packed ISO-639-2 code for "und"
const LANGUAGE_UNDETERMINED: u16 = 0x55c4;

fn format_err(message: impl Into<String>) -> LibationError {
    LibationError::Format(message.into())
}

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileType {
    pub major_brand: FourCc,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCc>,
}

impl Default for FileType {
    fn default() -> Self {
        Self {
            major_brand: *b"M4B ",
            minor_version: 0,
            compatible_brands: vec![*b"M4B ", *b"M4A ", *b"mp42", *b"isom"],
        }
    }
}

impl FileType {
    fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = BoxReader::new(payload, "ftyp");
        let major_brand = r.fourcc()?;
        let minor_version = r.u32()?;
        let mut compatible_brands = Vec::new();
        while r.remaining() >= 4 {
            compatible_brands.push(r.fourcc()?);
        }
        Ok(Self {
            major_brand,
            minor_version,
            compatible_brands,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovieHeader {
    pub creation_time: u64,
    pub modification_time: u64,
    pub timescale: u32,
    /// In `timescale` units
    pub duration: u64,
}

/// One encoded audio frame in the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub offset: u64,
    pub size: u32,
    /// In media timescale units
    pub duration: u32,
}

/// The `stsd` sample entry, carried as raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEntry {
    /// Entire entry box including its header
    pub raw: Bytes,
    pub codec: FourCc,
    pub channels: u16,
    pub sample_rate: u32,
    pub avg_bitrate: Option<u32>,
    pub max_bitrate: Option<u32>,
}

impl SampleEntry {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (codec, payload, size) = parse_box(raw)?;
        let mut r = BoxReader::new(payload, "stsd entry");
        r.skip(6)?;
        let _data_reference_index = r.u16()?;
        let version = r.u16()?;
        r.skip(6)?;
        let channels = r.u16()?;
        let _sample_size = r.u16()?;
        r.skip(4)?;
        let sample_rate = r.u32()? >> 16;
        match version {
            0 => {}
            1 => r.skip(16)?,
            other => {
                return Err(format_err(format!(
                    "Unsupported sound sample description version {}",
                    other
                )))
            }
        }

        let mut bitrates = None;
        for child in children(r.rest()) {
            let (fourcc, body) = child?;
            if &fourcc == b"esds" {
                bitrates = parse_esds(body)?;
            }
        }

        Ok(Self {
            raw: Bytes::copy_from_slice(&raw[..size]),
            codec,
            channels,
            sample_rate,
            max_bitrate: bitrates.map(|(max, _)| max).filter(|&b| b > 0),
            avg_bitrate: bitrates.map(|(_, avg)| avg).filter(|&b| b > 0),
        })
    }

    /// Build a minimal AAC-LC (`mp4a`) entry
    pub fn aac(channels: u16, sample_rate: u32, avg_bitrate: u32) -> Self {
        const FREQUENCIES: [u32; 13] = [
            96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
            7350,
        ];
        let freq_index = FREQUENCIES
            .iter()
            .position(|&f| f == sample_rate)
            .unwrap_or(4) as u16;
        // AudioSpecificConfig: object type 2 (LC), frequency index, channel config
        let asc = (2u16 << 11) | (freq_index << 7) | ((channels & 0x0f) << 3);

        let mut out = BytesMut::new();
        write_box(&mut out, b"mp4a", |out| {
            out.put_bytes(0, 6);
            out.put_u16(1);
            out.put_bytes(0, 8);
            out.put_u16(channels);
            out.put_u16(16);
            out.put_u32(0);
            out.put_u32(sample_rate.min(0xffff) << 16);
            write_full_box(out, b"esds", 0, 0, |out| {
                out.put_u8(0x03);
                out.put_u8(25);
                out.put_u16(0);
                out.put_u8(0);
                out.put_u8(0x04);
                out.put_u8(17);
                out.put_u8(0x40);
                out.put_u8(0x15);
                out.put_uint(0, 3);
                out.put_u32(avg_bitrate);
                out.put_u32(avg_bitrate);
                out.put_u8(0x05);
                out.put_u8(2);
                out.put_u16(asc);
                out.put_u8(0x06);
                out.put_u8(1);
                out.put_u8(0x02);
            });
        });

        Self {
            raw: out.freeze(),
            codec: *b"mp4a",
            channels,
            sample_rate,
            avg_bitrate: Some(avg_bitrate).filter(|&b| b > 0),
            max_bitrate: Some(avg_bitrate).filter(|&b| b > 0),
        }
    }
}

/// (max bitrate, average bitrate) from the decoder config descriptor
fn parse_esds(payload: &[u8]) -> Result<Option<(u32, u32)>> {
    let mut r = BoxReader::new(payload, "esds");
    r.full_box()?;
    while r.remaining() > 0 {
        let tag = r.u8()?;
        let len = descriptor_len(&mut r)?;
        match tag {
            // ES_Descriptor: fixed fields, then nested descriptors inline
            0x03 => {
                r.u16()?;
                let flags = r.u8()?;
                if flags & 0x80 != 0 {
                    r.skip(2)?;
                }
                if flags & 0x40 != 0 {
                    let url_len = r.u8()? as usize;
                    r.skip(url_len)?;
                }
                if flags & 0x20 != 0 {
                    r.skip(2)?;
                }
            }
            0x04 => {
                r.skip(5)?;
                let max = r.u32()?;
                let avg = r.u32()?;
                return Ok(Some((max, avg)));
            }
            _ => r.skip(len)?,
        }
    }
    Ok(None)
}

fn descriptor_len(r: &mut BoxReader<'_>) -> Result<usize> {
    let mut len = 0usize;
    for _ in 0..4 {
        let byte = r.u8()?;
        len = (len << 7) | (byte & 0x7f) as usize;
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    pub track_id: u32,
    pub creation_time: u64,
    pub modification_time: u64,
    /// In movie timescale units
    pub duration: u64,
    pub media_timescale: u32,
    /// In media timescale units
    pub media_duration: u64,
    pub language: u16,
    pub entry: SampleEntry,
    pub samples: Vec<Sample>,
}

/// Nero-style chapter marker (`chpl`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterMark {
    /// In 100 ns units
    pub start: u64,
    pub title: String,
}

impl ChapterMark {
    pub fn start_ms(&self) -> u64 {
        self.start / (CHPL_UNITS_PER_SECOND / 1000)
    }
}

/// Audio properties used to decide whether and how to re-encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub codec: FourCc,
    pub channels: u16,
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub file_type: FileType,
    pub movie: MovieHeader,
    pub track: AudioTrack,
    pub chapters: Vec<ChapterMark>,
    pub tags: Tags,
}

impl Container {
    /// Build a single-track container around existing sample data
    ///
    /// Timestamps are zero and durations are computed from the samples.
    pub fn new(entry: SampleEntry, samples: Vec<Sample>) -> Self {
        let media_timescale = entry.sample_rate;
        let mut container = Self {
            file_type: FileType::default(),
            movie: MovieHeader {
                creation_time: 0,
                modification_time: 0,
                timescale: 1000,
                duration: 0,
            },
            track: AudioTrack {
                track_id: 1,
                creation_time: 0,
                modification_time: 0,
                duration: 0,
                media_timescale,
                media_duration: 0,
                language: LANGUAGE_UNDETERMINED,
                entry,
                samples,
            },
            chapters: Vec::new(),
            tags: Tags::new(),
        };
        // A zero sample rate leaves durations at zero until fixed up
        let _ = container.recompute_durations();
        container
    }

    /// Parse the container at `path`
    ///
    /// # Errors
    /// - `Format` - missing or corrupt `moov`, sample tables inconsistent,
    ///   or sample data lying outside the file
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn read(path: &Path) -> Result<Self> {
        let mut file = File::open(path).await?;
        let file_len = file.metadata().await?.len();
        let boxes = scan_top_level(&mut file, file_len).await?;

        let moov = boxes
            .iter()
            .find(|b| &b.fourcc == b"moov")
            .ok_or_else(|| format_err("No 'moov' box found"))?;
        if moov.payload_len() > MAX_MOOV_SIZE {
            return Err(format_err(format!(
                "'moov' box is {} bytes, larger than supported",
                moov.payload_len()
            )));
        }
        let moov_bytes = read_payload(&mut file, moov).await?;

        let file_type = match boxes.iter().find(|b| &b.fourcc == b"ftyp") {
            Some(ftyp) if ftyp.payload_len() <= MAX_FTYP_SIZE => {
                FileType::parse(&read_payload(&mut file, ftyp).await?)?
            }
            Some(_) => return Err(format_err("'ftyp' box is implausibly large")),
            None => FileType::default(),
        };

        let container = Self::parse_moov(&moov_bytes, file_type, file_len)?;
        debug!(
            samples = container.track.samples.len(),
            chapters = container.chapters.len(),
            timescale = container.track.media_timescale,
            "Parsed container"
        );
        Ok(container)
    }

    pub(crate) fn parse_moov(moov: &[u8], file_type: FileType, file_len: u64) -> Result<Self> {
        let movie = parse_mvhd(require_child(moov, b"mvhd", "moov")?)?;

        let mut track = None;
        let mut chapters = Vec::new();
        let mut tags = Tags::new();
        for child in children(moov) {
            let (fourcc, payload) = child?;
            match &fourcc {
                b"trak" if track.is_none() => track = parse_trak(payload, file_len)?,
                b"udta" => parse_udta(payload, &mut chapters, &mut tags)?,
                _ => {}
            }
        }
        let track = track.ok_or_else(|| format_err("No audio track in 'moov'"))?;

        Ok(Self {
            file_type,
            movie,
            track,
            chapters,
            tags,
        })
    }

    /// Media timescale, falling back to the sample rate when the header is zero
    pub fn media_timescale(&self) -> Result<u32> {
        if self.track.media_timescale > 0 {
            Ok(self.track.media_timescale)
        } else if self.track.entry.sample_rate > 0 {
            Ok(self.track.entry.sample_rate)
        } else {
            Err(format_err("Audio track has no usable timescale"))
        }
    }

    /// Sum of all sample durations, in media timescale units
    pub fn total_media_ticks(&self) -> u64 {
        self.track.samples.iter().map(|s| s.duration as u64).sum()
    }

    /// Playback length according to the sample table
    pub fn duration(&self) -> Result<Duration> {
        let timescale = self.media_timescale()? as u128;
        let nanos = self.total_media_ticks() as u128 * 1_000_000_000 / timescale;
        Ok(Duration::from_nanos(nanos as u64))
    }

    /// Total bytes of sample data
    pub fn data_len(&self) -> u64 {
        self.track.samples.iter().map(|s| s.size as u64).sum()
    }

    /// Start tick of every sample, plus the end tick as the last element
    pub fn sample_start_ticks(&self) -> Vec<u64> {
        let mut starts = Vec::with_capacity(self.track.samples.len() + 1);
        let mut tick = 0u64;
        starts.push(tick);
        for sample in &self.track.samples {
            tick += sample.duration as u64;
            starts.push(tick);
        }
        starts
    }

    /// Whether the header durations disagree with the sample table
    pub fn has_inconsistent_durations(&self) -> bool {
        self.track.media_timescale == 0 || self.track.media_duration != self.total_media_ticks()
    }

    pub fn source_format(&self) -> Result<SourceFormat> {
        let entry = &self.track.entry;
        let bitrate_kbps = match entry.avg_bitrate {
            Some(bps) => (bps + 500) / 1000,
            None => {
                let seconds = self.duration()?.as_secs_f64();
                if seconds > 0.0 {
                    (self.data_len() as f64 * 8.0 / seconds / 1000.0).round() as u32
                } else {
                    0
                }
            }
        };
        Ok(SourceFormat {
            codec: entry.codec,
            channels: entry.channels,
            sample_rate: entry.sample_rate,
            bitrate_kbps,
        })
    }

    /// Rewrite `mvhd`/`tkhd`/`mdhd` durations from the sample table
    pub fn recompute_durations(&mut self) -> Result<()> {
        let timescale = self.media_timescale()?;
        let ticks = self.total_media_ticks();
        self.track.media_timescale = timescale;
        self.track.media_duration = ticks;

        if self.movie.timescale == 0 {
            self.movie.timescale = timescale;
        }
        let movie_duration =
            (ticks as u128 * self.movie.timescale as u128 / timescale as u128) as u64;
        self.movie.duration = movie_duration;
        self.track.duration = movie_duration;
        Ok(())
    }

    /// Copy of this container restricted to `range` of samples
    ///
    /// Durations are recomputed; chapters are cleared for the caller to set.
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.track.samples.len() {
            return Err(LibationError::InvalidInput(format!(
                "Sample range {:?} outside 0..{}",
                range,
                self.track.samples.len()
            )));
        }

        let track = &self.track;
        let mut sliced = Self {
            file_type: self.file_type.clone(),
            movie: self.movie,
            track: AudioTrack {
                track_id: track.track_id,
                creation_time: track.creation_time,
                modification_time: track.modification_time,
                duration: track.duration,
                media_timescale: track.media_timescale,
                media_duration: track.media_duration,
                language: track.language,
                entry: track.entry.clone(),
                samples: track.samples[range].to_vec(),
            },
            chapters: Vec::new(),
            tags: self.tags.clone(),
        };
        sliced.recompute_durations()?;
        Ok(sliced)
    }

    // ========================================================================
    // WRITING
    // ========================================================================

    /// Write this container to `dest`, copying sample bytes from `source`
    ///
    /// # Arguments
    /// * `source` - File the sample offsets refer to
    /// * `dest` - Output path, created or truncated
    /// * `cancel` - Checked between copy pieces
    ///
    /// # Returns
    /// Number of bytes written
    #[instrument(skip_all, fields(dest = %dest.display(), samples = self.track.samples.len()))]
    pub async fn write(&self, source: &Path, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
        let data_len = self.data_len();
        let ftyp = self.build_ftyp();
        let mdat_header_len: u64 = if data_len + 8 > u32::MAX as u64 { 16 } else { 8 };

        // Sizing pass: the moov length does not depend on the offset value
        let probe_len = self.build_moov(0)?.len() as u64;
        let data_start = ftyp.len() as u64 + probe_len + mdat_header_len;
        let moov = self.build_moov(data_start)?;

        let mut src = File::open(source).await?;
        let mut out = BufWriter::new(File::create(dest).await?);
        out.write_all(&ftyp).await?;
        out.write_all(&moov).await?;
        if mdat_header_len == 16 {
            out.write_u32(1).await?;
            out.write_all(b"mdat").await?;
            out.write_u64(data_len + 16).await?;
        } else {
            out.write_u32((data_len + 8) as u32).await?;
            out.write_all(b"mdat").await?;
        }

        for run in self.contiguous_runs() {
            let mut offset = run.start;
            while offset < run.end {
                if cancel.is_cancelled() {
                    return Err(LibationError::Cancelled);
                }
                let len = (run.end - offset).min(COPY_PIECE);
                src.seek(SeekFrom::Start(offset)).await?;
                let copied = tokio::io::copy(&mut (&mut src).take(len), &mut out).await?;
                if copied < len {
                    return Err(format_err(format!(
                        "Sample data ends early at offset {}",
                        offset + copied
                    )));
                }
                offset += len;
            }
        }

        out.flush().await?;
        let total = ftyp.len() as u64 + moov.len() as u64 + mdat_header_len + data_len;
        debug!(bytes = total, "Container written");
        Ok(total)
    }

    /// Byte ranges of the source file, merged where samples are adjacent
    fn contiguous_runs(&self) -> Vec<Range<u64>> {
        let mut runs: Vec<Range<u64>> = Vec::new();
        for sample in &self.track.samples {
            let end = sample.offset + sample.size as u64;
            match runs.last_mut() {
                Some(run) if run.end == sample.offset => run.end = end,
                _ => runs.push(sample.offset..end),
            }
        }
        runs
    }

    fn build_ftyp(&self) -> BytesMut {
        let mut out = BytesMut::new();
        write_box(&mut out, b"ftyp", |out| {
            out.put_slice(&self.file_type.major_brand);
            out.put_u32(self.file_type.minor_version);
            for brand in &self.file_type.compatible_brands {
                out.put_slice(brand);
            }
        });
        out
    }

    pub(crate) fn build_moov(&self, chunk_offset: u64) -> Result<BytesMut> {
        let chunk_offset = u32::try_from(chunk_offset)
            .map_err(|_| format_err("Sample data offset does not fit a 32-bit chunk table"))?;
        let movie = &self.movie;
        let track = &self.track;

        let mut out = BytesMut::with_capacity(4096 + track.samples.len() * 4);
        write_box(&mut out, b"moov", |out| {
            let v = header_version(&[movie.creation_time, movie.modification_time, movie.duration]);
            write_full_box(out, b"mvhd", v, 0, |out| {
                put_versioned(out, v, movie.creation_time);
                put_versioned(out, v, movie.modification_time);
                out.put_u32(movie.timescale);
                put_versioned(out, v, movie.duration);
                out.put_u32(0x0001_0000);
                out.put_u16(0x0100);
                out.put_bytes(0, 10);
                put_unity_matrix(out);
                out.put_bytes(0, 24);
                out.put_u32(track.track_id.saturating_add(1));
            });

            write_box(out, b"trak", |out| {
                let v = header_version(&[track.creation_time, track.modification_time, track.duration]);
                // enabled | in movie
                write_full_box(out, b"tkhd", v, 0x000003, |out| {
                    put_versioned(out, v, track.creation_time);
                    put_versioned(out, v, track.modification_time);
                    out.put_u32(track.track_id);
                    out.put_u32(0);
                    put_versioned(out, v, track.duration);
                    out.put_bytes(0, 8);
                    out.put_u16(0);
                    out.put_u16(1);
                    out.put_u16(0x0100);
                    out.put_u16(0);
                    put_unity_matrix(out);
                    out.put_u32(0);
                    out.put_u32(0);
                });

                write_box(out, b"mdia", |out| {
                    let v = header_version(&[
                        track.creation_time,
                        track.modification_time,
                        track.media_duration,
                    ]);
                    write_full_box(out, b"mdhd", v, 0, |out| {
                        put_versioned(out, v, track.creation_time);
                        put_versioned(out, v, track.modification_time);
                        out.put_u32(track.media_timescale);
                        put_versioned(out, v, track.media_duration);
                        out.put_u16(track.language);
                        out.put_u16(0);
                    });
                    write_full_box(out, b"hdlr", 0, 0, |out| {
                        out.put_u32(0);
                        out.put_slice(b"soun");
                        out.put_bytes(0, 12);
                        out.put_slice(b"SoundHandler\0");
                    });
                    write_box(out, b"minf", |out| {
                        write_full_box(out, b"smhd", 0, 0, |out| out.put_u32(0));
                        write_box(out, b"dinf", |out| {
                            write_full_box(out, b"dref", 0, 0, |out| {
                                out.put_u32(1);
                                // self-contained
                                write_full_box(out, b"url ", 0, 1, |_| {});
                            });
                        });
                        write_box(out, b"stbl", |out| write_sample_tables(out, track, chunk_offset));
                    });
                });
            });

            if !self.chapters.is_empty() || !self.tags.is_empty() {
                write_box(out, b"udta", |out| {
                    if !self.chapters.is_empty() {
                        write_chpl(out, &self.chapters);
                    }
                    if !self.tags.is_empty() {
                        write_full_box(out, b"meta", 0, 0, |out| {
                            write_full_box(out, b"hdlr", 0, 0, |out| {
                                out.put_u32(0);
                                out.put_slice(b"mdir");
                                out.put_slice(b"appl");
                                out.put_bytes(0, 8);
                                out.put_u8(0);
                            });
                            self.tags.write_ilst(out);
                        });
                    }
                });
            }
        });
        Ok(out)
    }
}

fn header_version(values: &[u64]) -> u8 {
    if values.iter().any(|&v| v > u32::MAX as u64) {
        1
    } else {
        0
    }
}

fn put_versioned(out: &mut BytesMut, version: u8, value: u64) {
    if version == 1 {
        out.put_u64(value);
    } else {
        out.put_u32(value as u32);
    }
}

fn write_sample_tables(out: &mut BytesMut, track: &AudioTrack, chunk_offset: u32) {
    let samples = &track.samples;
    let count = samples.len() as u32;

    write_full_box(out, b"stsd", 0, 0, |out| {
        out.put_u32(1);
        out.put_slice(&track.entry.raw);
    });

    write_full_box(out, b"stts", 0, 0, |out| {
        let mut runs: Vec<(u32, u32)> = Vec::new();
        for sample in samples {
            match runs.last_mut() {
                Some((n, delta)) if *delta == sample.duration => *n += 1,
                _ => runs.push((1, sample.duration)),
            }
        }
        out.put_u32(runs.len() as u32);
        for (n, delta) in runs {
            out.put_u32(n);
            out.put_u32(delta);
        }
    });

    write_full_box(out, b"stsc", 0, 0, |out| {
        if count > 0 {
            out.put_u32(1);
            out.put_u32(1);
            out.put_u32(count);
            out.put_u32(1);
        } else {
            out.put_u32(0);
        }
    });

    write_full_box(out, b"stsz", 0, 0, |out| {
        let uniform = samples.first().map(|s| s.size).filter(|&size| {
            samples.iter().all(|s| s.size == size)
        });
        match uniform {
            Some(size) => {
                out.put_u32(size);
                out.put_u32(count);
            }
            None => {
                out.put_u32(0);
                out.put_u32(count);
                for sample in samples {
                    out.put_u32(sample.size);
                }
            }
        }
    });

    write_full_box(out, b"stco", 0, 0, |out| {
        if count > 0 {
            out.put_u32(1);
            out.put_u32(chunk_offset);
        } else {
            out.put_u32(0);
        }
    });
}

fn write_chpl(out: &mut BytesMut, chapters: &[ChapterMark]) {
    write_full_box(out, b"chpl", 1, 0, |out| {
        out.put_u32(0);
        let kept = &chapters[..chapters.len().min(MAX_CHPL_ENTRIES)];
        out.put_u8(kept.len() as u8);
        for chapter in kept {
            out.put_u64(chapter.start);
            let title = truncate_utf8(&chapter.title, u8::MAX as usize);
            out.put_u8(title.len() as u8);
            out.put_slice(title.as_bytes());
        }
    });
}

fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ============================================================================
// PARSING
// ============================================================================

async fn read_payload(file: &mut File, entry: &TopLevelBox) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(entry.payload_offset())).await?;
    let mut payload = vec![0u8; entry.payload_len() as usize];
    file.read_exact(&mut payload).await?;
    Ok(payload)
}

fn parse_mvhd(payload: &[u8]) -> Result<MovieHeader> {
    let mut r = BoxReader::new(payload, "mvhd");
    let (v, _) = r.full_box()?;
    Ok(MovieHeader {
        creation_time: r.versioned_u64(v)?,
        modification_time: r.versioned_u64(v)?,
        timescale: r.u32()?,
        duration: r.versioned_u64(v)?,
    })
}

/// Parse a `trak`, returning `None` for non-audio tracks
fn parse_trak(trak: &[u8], file_len: u64) -> Result<Option<AudioTrack>> {
    let mdia = require_child(trak, b"mdia", "trak")?;

    let mut r = BoxReader::new(require_child(mdia, b"hdlr", "mdia")?, "hdlr");
    r.full_box()?;
    r.u32()?;
    if &r.fourcc()? != b"soun" {
        return Ok(None);
    }

    let mut r = BoxReader::new(require_child(trak, b"tkhd", "trak")?, "tkhd");
    let (v, _) = r.full_box()?;
    let creation_time = r.versioned_u64(v)?;
    let modification_time = r.versioned_u64(v)?;
    let track_id = r.u32()?;
    r.u32()?;
    let duration = r.versioned_u64(v)?;

    let mut r = BoxReader::new(require_child(mdia, b"mdhd", "mdia")?, "mdhd");
    let (v, _) = r.full_box()?;
    r.versioned_u64(v)?;
    r.versioned_u64(v)?;
    let media_timescale = r.u32()?;
    let media_duration = r.versioned_u64(v)?;
    let language = r.u16()?;

    let minf = require_child(mdia, b"minf", "mdia")?;
    let stbl = require_child(minf, b"stbl", "minf")?;
    let (entry, samples) = parse_stbl(stbl, file_len)?;

    Ok(Some(AudioTrack {
        track_id,
        creation_time,
        modification_time,
        duration,
        media_timescale,
        media_duration,
        language,
        entry,
        samples,
    }))
}

fn parse_stbl(stbl: &[u8], file_len: u64) -> Result<(SampleEntry, Vec<Sample>)> {
    let mut r = BoxReader::new(require_child(stbl, b"stsd", "stbl")?, "stsd");
    r.full_box()?;
    if r.u32()? == 0 {
        return Err(format_err("'stsd' has no sample entries"));
    }
    let entry = SampleEntry::parse(r.rest())?;

    // Sizes
    let mut r = BoxReader::new(require_child(stbl, b"stsz", "stbl")?, "stsz");
    r.full_box()?;
    let uniform_size = r.u32()?;
    let sizes: Vec<u32> = if uniform_size == 0 {
        let count = r.entry_count(4)?;
        (0..count).map(|_| r.u32()).collect::<Result<_>>()?
    } else {
        let count = r.u32()? as u64;
        if count.saturating_mul(uniform_size as u64) > file_len {
            return Err(format_err("'stsz' declares more sample data than the file holds"));
        }
        vec![uniform_size; count as usize]
    };
    let n = sizes.len();

    // Durations
    let mut r = BoxReader::new(require_child(stbl, b"stts", "stbl")?, "stts");
    r.full_box()?;
    let entries = r.entry_count(8)?;
    let mut durations = Vec::with_capacity(n);
    for _ in 0..entries {
        let count = r.u32()? as usize;
        let delta = r.u32()?;
        if durations.len() + count > n {
            return Err(format_err(format!(
                "'stts' covers more samples than the {} in 'stsz'",
                n
            )));
        }
        durations.extend(std::iter::repeat(delta).take(count));
    }
    if durations.len() != n {
        return Err(format_err(format!(
            "'stts' covers {} samples but 'stsz' has {}",
            durations.len(),
            n
        )));
    }

    // Sample-to-chunk
    let mut r = BoxReader::new(require_child(stbl, b"stsc", "stbl")?, "stsc");
    r.full_box()?;
    let entries = r.entry_count(12)?;
    let mut stsc = Vec::with_capacity(entries);
    for _ in 0..entries {
        let first_chunk = r.u32()?;
        let per_chunk = r.u32()?;
        r.u32()?;
        stsc.push((first_chunk, per_chunk));
    }

    // Chunk offsets
    let offsets: Vec<u64> = if let Some(stco) = find_child(stbl, b"stco")? {
        let mut r = BoxReader::new(stco, "stco");
        r.full_box()?;
        let count = r.entry_count(4)?;
        (0..count).map(|_| r.u32().map(u64::from)).collect::<Result<_>>()?
    } else if let Some(co64) = find_child(stbl, b"co64")? {
        let mut r = BoxReader::new(co64, "co64");
        r.full_box()?;
        let count = r.entry_count(8)?;
        (0..count).map(|_| r.u64()).collect::<Result<_>>()?
    } else {
        return Err(format_err("Missing chunk offset table ('stco' or 'co64')"));
    };

    let mut samples = Vec::with_capacity(n);
    let mut stsc_index = 0usize;
    for (chunk_index, &chunk_offset) in offsets.iter().enumerate() {
        if samples.len() >= n {
            break;
        }
        if stsc.is_empty() {
            return Err(format_err("'stsc' is empty but samples are declared"));
        }
        let chunk_number = chunk_index as u32 + 1;
        while stsc_index + 1 < stsc.len() && stsc[stsc_index + 1].0 <= chunk_number {
            stsc_index += 1;
        }

        let mut offset = chunk_offset;
        for _ in 0..stsc[stsc_index].1 {
            let i = samples.len();
            if i >= n {
                break;
            }
            let end = offset.checked_add(sizes[i] as u64).ok_or_else(|| {
                format_err(format!("Sample {} offset {} overflows the file position", i, offset))
            })?;
            if end > file_len {
                return Err(format_err(format!(
                    "Sample {} ({} bytes at offset {}) lies outside the file",
                    i, sizes[i], offset
                )));
            }
            samples.push(Sample {
                offset,
                size: sizes[i],
                duration: durations[i],
            });
            offset = end;
        }
    }
    if samples.len() < n {
        return Err(format_err(format!(
            "Chunk tables locate only {} of {} samples",
            samples.len(),
            n
        )));
    }

    Ok((entry, samples))
}

fn parse_udta(udta: &[u8], chapters: &mut Vec<ChapterMark>, tags: &mut Tags) -> Result<()> {
    for child in children(udta) {
        let (fourcc, payload) = child?;
        match &fourcc {
            b"chpl" => *chapters = parse_chpl(payload)?,
            b"meta" => {
                if let Some(parsed) = parse_meta(payload)? {
                    *tags = parsed;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_chpl(payload: &[u8]) -> Result<Vec<ChapterMark>> {
    let mut r = BoxReader::new(payload, "chpl");
    let (version, _) = r.full_box()?;
    if version == 1 {
        r.skip(4)?;
    }
    let count = r.u8()?;
    let mut chapters = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start = r.u64()?;
        let len = r.u8()? as usize;
        let title = String::from_utf8_lossy(r.bytes(len)?).into_owned();
        chapters.push(ChapterMark { start, title });
    }
    Ok(chapters)
}

fn parse_meta(payload: &[u8]) -> Result<Option<Tags>> {
    // QuickTime writes `meta` as a plain box; ISO as a full box
    let body = if payload.len() >= 8 && &payload[4..8] == b"hdlr" {
        payload
    } else if payload.len() >= 4 {
        &payload[4..]
    } else {
        return Err(format_err("Truncated 'meta' box"));
    };

    match find_child(body, b"ilst")? {
        Some(ilst) => Ok(Some(Tags::parse_ilst(ilst)?)),
        None => {
            debug!("'meta' box without 'ilst'");
            Ok(None)
        }
    }
}
