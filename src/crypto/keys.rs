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


//! Per-book decryption key material
//!
//! License vouchers carry the key and IV either hex encoded (decrypted
//! `license_response`) or base64 encoded (structured voucher). Both decode
//! into a [`DecryptionKey`], which enforces the AES-128 lengths up front so
//! the decrypter never sees malformed material.

use crate::error::{LibationError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// AES-128 key length in bytes
pub const KEY_LEN: usize = 16;

/// CBC initialization vector length in bytes
pub const IV_LEN: usize = 16;

/// Key and IV pair for one book
///
/// Serialized as hex strings: `{"key": "...", "iv": "..."}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EncodedKey", into = "EncodedKey")]
pub struct DecryptionKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl DecryptionKey {
    /// Create from raw key and IV bytes
    ///
    /// # Errors
    /// - `Decryption` - key or IV is not exactly 16 bytes
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| {
            LibationError::Decryption(format!(
                "Key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            ))
        })?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| {
            LibationError::Decryption(format!(
                "IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            ))
        })?;

        Ok(Self { key, iv })
    }

    /// Create from hex-encoded key and IV (32 hex chars each)
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self> {
        let key = hex::decode(key_hex.trim())
            .map_err(|e| LibationError::Decryption(format!("Invalid hex key: {}", e)))?;
        let iv = hex::decode(iv_hex.trim())
            .map_err(|e| LibationError::Decryption(format!("Invalid hex IV: {}", e)))?;

        Self::from_slices(&key, &iv)
    }

    /// Create from base64-encoded key and IV, as found in structured vouchers
    pub fn from_base64(key: &str, iv: &str) -> Result<Self> {
        use base64::{engine::general_purpose, Engine as _};

        let key = general_purpose::STANDARD
            .decode(key.trim())
            .map_err(|e| LibationError::Decryption(format!("Invalid base64 key: {}", e)))?;
        let iv = general_purpose::STANDARD
            .decode(iv.trim())
            .map_err(|e| LibationError::Decryption(format!("Invalid base64 IV: {}", e)))?;

        Self::from_slices(&key, &iv)
    }

    /// Decode a voucher value, detecting hex (32 chars) versus base64 (24 chars)
    pub fn from_voucher(key: &str, iv: &str) -> Result<Self> {
        if key.trim().len() == KEY_LEN * 2 {
            Self::from_hex(key, iv)
        } else {
            Self::from_base64(key, iv)
        }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// HMAC key used to authenticate envelope segments: SHA-256(key || iv)
    pub(crate) fn mac_key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(self.iv);
        hasher.finalize().into()
    }

    /// IV for segment `index`: the book IV XOR the big-endian segment index
    pub(crate) fn segment_iv(&self, index: u64) -> [u8; IV_LEN] {
        let mut iv = self.iv;
        for (slot, byte) in iv[IV_LEN - 8..].iter_mut().zip(index.to_be_bytes()) {
            *slot ^= byte;
        }
        iv
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedKey {
    key: String,
    iv: String,
}

impl TryFrom<EncodedKey> for DecryptionKey {
    type Error = LibationError;

    fn try_from(encoded: EncodedKey) -> Result<Self> {
        Self::from_voucher(&encoded.key, &encoded.iv)
    }
}

impl From<DecryptionKey> for EncodedKey {
    fn from(key: DecryptionKey) -> Self {
        Self {
            key: key.key_hex(),
            iv: key.iv_hex(),
        }
    }
}
