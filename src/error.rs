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


//! Error types for the liberation pipeline
//!
//! Fatal failures are returned as [`LibationError`]. Non-fatal problems with
//! sidecar files are not errors at all: they are collected as
//! [`SidecarWarning`] values on the pipeline outcome.
//!
//! | Stage              | Variant        | Retry?                      |
//! |--------------------|----------------|-----------------------------|
//! | Transport          | `Transport`    | caller policy (`retryable`) |
//! | Decryption         | `Decryption`   | never                       |
//! | Container          | `Format`       | never                       |
//! | Re-encode          | `Encoder`      | never                       |
//! | Any suspension     | `Cancelled`    | n/a                         |

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, LibationError>;

#[derive(Error, Debug)]
pub enum LibationError {
    // ========================================================================
    // Pipeline stage failures
    // ========================================================================
    /// Network or HTTP failure while fetching the encrypted file
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// HTTP status code, if the server answered at all
        status: Option<u16>,
        /// Whether a caller-side retry has a chance of succeeding
        retryable: bool,
    },

    /// Bad key/IV or corrupt ciphertext. Retrying with the same key cannot succeed.
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Corrupt or unsupported container structure
    #[error("Format error: {0}")]
    Format(String),

    /// External audio encoder failed
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// A cancellation signal was observed at a suspension point
    #[error("Operation cancelled")]
    Cancelled,

    // ========================================================================
    // Input / state
    // ========================================================================
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ========================================================================
    // Wrapped library errors
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LibationError {
    /// Build a transport error from an HTTP status code
    ///
    /// Server errors, 408 and 429 are worth retrying; other client errors are not.
    pub fn http_status(status: u16, url: &str) -> Self {
        let retryable = status >= 500 || status == 408 || status == 429;
        LibationError::Transport {
            message: format!("HTTP {} from {}", status, url),
            status: Some(status),
            retryable,
        }
    }

    /// Build a non-HTTP transport error (connect failure, timeout, reset)
    pub fn transport(message: impl Into<String>) -> Self {
        LibationError::Transport {
            message: message.into(),
            status: None,
            retryable: true,
        }
    }

    /// Whether a caller may reasonably retry the whole download
    pub fn is_retryable(&self) -> bool {
        matches!(self, LibationError::Transport { retryable: true, .. })
    }

    /// Fatal errors abort the pipeline and must not be retried with the same input
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LibationError::Decryption(_) | LibationError::Format(_) | LibationError::Encoder(_)
        )
    }
}

impl From<reqwest::Error> for LibationError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let url = err.url().map(|u| u.as_str()).unwrap_or("<unknown>");
            return LibationError::http_status(status.as_u16(), url);
        }

        let kind = if err.is_timeout() {
            "timed out"
        } else if err.is_connect() {
            "connection failed"
        } else if err.is_body() || err.is_decode() {
            "response body interrupted"
        } else {
            "request failed"
        };
        LibationError::transport(format!("{}: {}", kind, err))
    }
}

/// Non-fatal sidecar failure
///
/// The audio artifact is still considered successfully produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SidecarWarning {
    pub sidecar: SidecarKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SidecarKind {
    CueSheet,
    ClipsAndBookmarks,
    PartName,
}

impl SidecarWarning {
    pub fn new(sidecar: SidecarKind, message: impl Into<String>) -> Self {
        Self {
            sidecar,
            message: message.into(),
        }
    }
}

impl fmt::Display for SidecarWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} sidecar failed: {}", self.sidecar, self.message)
    }
}
