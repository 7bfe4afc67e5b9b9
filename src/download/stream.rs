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


//! HTTP transport for encrypted book files
//!
//! [`Fetcher::open`] returns a [`FetchStream`] that yields body chunks with
//! the read timeout, speed caps and cancellation applied.
//! [`Fetcher::download_to_file`] drives a stream into a `.part` file and
//! emits [`DownloadEvent`]s along the way.
//!
//! # Resume
//! With `resume` set and a non-empty `.part` file present, the request
//! carries `Range: bytes={len}-`. A `206 Partial Content` reply appends;
//! a plain `200` means the server ignored the range and the file restarts
//! from zero.

use super::manager::AggregateStats;
use super::progress::{DownloadEvent, DownloadProgress, EventCallback, ProgressThrottle};
use super::throttle::Throttle;
use crate::config::PipelineConfig;
use crate::error::{LibationError, Result};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE, USER_AGENT};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One transfer request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub user_agent: String,
    /// Label announced with `StreamingBegin`
    pub label: String,
    /// Per-transfer cap in bytes per second (0 = unlimited)
    pub speed_cap_bps: u64,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            label: url.clone(),
            url,
            user_agent: String::new(),
            speed_cap_bps: 0,
        }
    }
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    read_timeout: Duration,
    progress_interval: Duration,
    shared_throttle: Option<Arc<Throttle>>,
    stats: Option<Arc<AggregateStats>>,
}

impl Fetcher {
    /// # Errors
    /// - `Transport` - the HTTP client could not be built
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| LibationError::Transport {
                message: format!("Failed to build HTTP client: {}", e),
                status: None,
                retryable: false,
            })?;

        Ok(Self {
            client,
            read_timeout: config.read_timeout(),
            progress_interval: config.progress_interval(),
            shared_throttle: None,
            stats: None,
        })
    }

    /// Apply an aggregate cap shared with other fetchers
    pub fn with_shared_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.shared_throttle = Some(throttle);
        self
    }

    pub fn with_stats(mut self, stats: Arc<AggregateStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Send the request and check the response status
    ///
    /// # Arguments
    /// * `request` - URL, user agent and per-transfer cap
    /// * `offset` - Resume position; 0 requests the whole file
    /// * `cancel` - Observed while connecting
    ///
    /// # Errors
    /// - `Transport` - connection failure, timeout, or non-success status
    /// - `Cancelled` - `cancel` fired first
    #[instrument(skip_all, fields(label = %request.label, offset))]
    pub async fn open(
        &self,
        request: &FetchRequest,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<FetchStream> {
        let mut builder = self.client.get(&request.url);
        if !request.user_agent.is_empty() {
            builder = builder.header(USER_AGENT, &request.user_agent);
        }
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LibationError::Cancelled),
            response = builder.send() => response?,
        };

        let status = response.status();
        let (start, total) = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                let total = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total);
                debug!(offset, ?total, "Server accepted range request");
                (offset, total)
            }
            s if s.is_success() => {
                if offset > 0 {
                    info!("Server ignored range request, restarting from zero");
                }
                (0, response.content_length())
            }
            s => return Err(LibationError::http_status(s.as_u16(), &request.url)),
        };

        let throttle = (request.speed_cap_bps > 0).then(|| Throttle::new(request.speed_cap_bps));

        Ok(FetchStream {
            body: response.bytes_stream().boxed(),
            start,
            received: start,
            total,
            read_timeout: self.read_timeout,
            throttle,
            shared_throttle: self.shared_throttle.clone(),
            stats: self.stats.clone(),
            url: request.url.clone(),
        })
    }

    /// Download into `part_path`, emitting begin and progress events
    ///
    /// Partial data stays in `part_path` on failure, so a later call with
    /// `resume` can continue it.
    ///
    /// # Returns
    /// Total size of the completed file
    #[instrument(skip_all, fields(label = %request.label, path = %part_path.display()))]
    pub async fn download_to_file(
        &self,
        request: &FetchRequest,
        part_path: &Path,
        resume: bool,
        events: Option<&EventCallback>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let existing = if resume {
            match tokio::fs::metadata(part_path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            }
        } else {
            0
        };

        let mut stream = match self.open(request, existing, cancel).await {
            Err(LibationError::Transport {
                status: Some(416), ..
            }) if existing > 0 => {
                warn!(existing, "Range not satisfiable, discarding partial file");
                self.open(request, 0, cancel).await?
            }
            other => other?,
        };

        let file = if stream.start() > 0 {
            OpenOptions::new().append(true).open(part_path).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(part_path)
                .await?
        };
        let mut file = BufWriter::new(file);

        let emit = |event: DownloadEvent| {
            if let Some(callback) = events {
                callback(&event);
            }
        };

        emit(DownloadEvent::StreamingBegin {
            label: request.label.clone(),
        });

        let mut throttle = ProgressThrottle::new(self.progress_interval);
        let total = stream.total();
        throttle.should_emit(Instant::now(), false);
        let mut last_emitted = stream.received();
        emit(DownloadEvent::StreamingProgressChanged(DownloadProgress::new(
            last_emitted,
            total,
        )));

        while let Some(chunk) = stream.next_chunk(cancel).await? {
            file.write_all(&chunk).await?;
            let received = stream.received();
            if received > last_emitted && throttle.should_emit(Instant::now(), false) {
                last_emitted = received;
                emit(DownloadEvent::StreamingProgressChanged(DownloadProgress::new(
                    received, total,
                )));
            }
        }
        file.flush().await?;

        // Each event reports more bytes than the one before it
        let received = stream.received();
        if received > last_emitted {
            emit(DownloadEvent::StreamingProgressChanged(DownloadProgress::new(
                received, total,
            )));
        }

        if let Some(total) = total {
            if received < total {
                return Err(LibationError::transport(format!(
                    "Connection closed after {} of {} bytes",
                    received, total
                )));
            }
        }

        info!(bytes = received, "Download complete");
        Ok(received)
    }
}

/// An open response body
pub struct FetchStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    start: u64,
    received: u64,
    total: Option<u64>,
    read_timeout: Duration,
    throttle: Option<Throttle>,
    shared_throttle: Option<Arc<Throttle>>,
    stats: Option<Arc<AggregateStats>>,
    url: String,
}

impl FetchStream {
    /// Offset the body starts at
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Bytes of the whole file received so far, including the resume offset
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Full file size when the server announced it
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Next body chunk, or `None` at end of stream
    ///
    /// # Errors
    /// - `Transport` - read timeout, connection reset, or the server sending
    ///   more bytes than it announced
    /// - `Cancelled`
    pub async fn next_chunk(&mut self, cancel: &CancellationToken) -> Result<Option<Bytes>> {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(LibationError::Cancelled),
            next = tokio::time::timeout(self.read_timeout, self.body.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return Err(LibationError::transport(format!(
                    "No data received for {}s from {}",
                    self.read_timeout.as_secs(),
                    self.url
                )))
            }
            Ok(None) => return Ok(None),
            Ok(Some(chunk)) => chunk?,
        };

        let len = chunk.len() as u64;
        if let Some(total) = self.total {
            if self.received + len > total {
                return Err(LibationError::Transport {
                    message: format!(
                        "Server sent more than the announced {} bytes",
                        total
                    ),
                    status: None,
                    retryable: false,
                });
            }
        }
        self.received += len;
        if let Some(stats) = &self.stats {
            stats.add_bytes(len);
        }

        let delay = async {
            if let Some(throttle) = &self.throttle {
                throttle.consume(len).await;
            }
            if let Some(throttle) = &self.shared_throttle {
                throttle.consume(len).await;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(LibationError::Cancelled),
            _ = delay => {}
        }

        Ok(Some(chunk))
    }
}

/// Total size from `Content-Range: bytes 100-999/1000`
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
