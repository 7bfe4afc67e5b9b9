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


//! Streaming decryption of the encrypted audiobook envelope
//!
//! The CDN delivers the container wrapped in a segmented, authenticated
//! envelope so it can be decrypted with memory bounded by one segment:
//!
//! ```text
//! header  : "LBXC" | version u8 | reserved u8 | segment_size u32 BE
//! segment : ct_len u32 BE | flags u8 | ciphertext[ct_len] | tag[32]
//! ```
//!
//! Each segment is AES-128-CBC with PKCS#7 padding, IV = book IV XOR the
//! segment index. The tag is HMAC-SHA256 over header, index, flags, length
//! and ciphertext, keyed by SHA-256(key || iv). The last segment carries the
//! FINAL flag so truncation is detected.
//!
//! Plaintext of a segment is written only after its tag verifies.

use crate::crypto::keys::{DecryptionKey, IV_LEN};
use crate::error::{LibationError, Result};
use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const MAGIC: &[u8; 4] = b"LBXC";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 10;
pub const SEGMENT_HEADER_LEN: usize = 5;
pub const TAG_LEN: usize = 32;
pub const DEFAULT_SEGMENT_SIZE: u32 = 64 * 1024;

/// Largest segment a reader will accept; bounds per-segment allocation
pub const MAX_SEGMENT_SIZE: u32 = 8 * 1024 * 1024;

const BLOCK_LEN: usize = 16;
const FLAG_FINAL: u8 = 0x01;

/// Parsed envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub segment_size: u32,
}

impl EnvelopeHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4] = VERSION;
        out[5] = 0;
        out[6..].copy_from_slice(&self.segment_size.to_be_bytes());
        out
    }

    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        if &bytes[..4] != MAGIC {
            return Err(LibationError::Decryption(
                "Not an encrypted audiobook envelope (bad magic)".to_string(),
            ));
        }
        if bytes[4] != VERSION {
            return Err(LibationError::Decryption(format!(
                "Unsupported envelope version {}",
                bytes[4]
            )));
        }

        let segment_size = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        if segment_size == 0 || segment_size > MAX_SEGMENT_SIZE {
            return Err(LibationError::Decryption(format!(
                "Invalid segment size {}",
                segment_size
            )));
        }

        Ok(Self { segment_size })
    }

    /// Largest ciphertext a segment may carry: plaintext plus one padding block
    fn max_ciphertext_len(&self) -> usize {
        self.segment_size as usize + BLOCK_LEN
    }
}

fn segment_tag(
    mac_key: &[u8; 32],
    header: &[u8; HEADER_LEN],
    index: u64,
    flags: u8,
    ciphertext: &[u8],
) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| LibationError::Decryption(format!("Failed to create MAC: {}", e)))?;
    mac.update(header);
    mac.update(&index.to_be_bytes());
    mac.update(&[flags]);
    mac.update(&(ciphertext.len() as u32).to_be_bytes());
    mac.update(ciphertext);
    Ok(mac)
}

/// Read exactly `buf.len()` bytes, mapping a short read to a truncation error
async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(LibationError::Decryption(
            format!("Encrypted stream truncated while reading {}", what),
        )),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// DECRYPTION
// ============================================================================

/// Streaming envelope decrypter
pub struct EnvelopeDecrypter {
    key: DecryptionKey,
    mac_key: [u8; 32],
}

impl EnvelopeDecrypter {
    pub fn new(key: &DecryptionKey) -> Self {
        Self {
            mac_key: key.mac_key(),
            key: key.clone(),
        }
    }

    /// Create from raw key/IV bytes
    ///
    /// # Errors
    /// - `Decryption` - key or IV has the wrong length
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(Self::new(&DecryptionKey::from_slices(key, iv)?))
    }

    /// Decrypt `reader` into `writer`, one segment at a time
    ///
    /// Cancellation is checked at every segment boundary.
    ///
    /// # Returns
    /// Number of plaintext bytes written
    ///
    /// # Errors
    /// - `Decryption` - malformed header, failed authentication, bad padding,
    ///   truncation, or trailing data after the final segment
    /// - `Cancelled` - `cancel` fired between segments
    /// - `Io` - reader or writer failed
    #[instrument(skip_all)]
    pub async fn decrypt<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut header_bytes = [0u8; HEADER_LEN];
        read_exact_or_truncated(reader, &mut header_bytes, "envelope header").await?;
        let header = EnvelopeHeader::parse(&header_bytes)?;
        debug!(segment_size = header.segment_size, "Envelope header parsed");

        let mut buffer = Vec::with_capacity(header.max_ciphertext_len());
        let mut tag = [0u8; TAG_LEN];
        let mut written = 0u64;
        let mut index = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(LibationError::Cancelled);
            }

            let mut segment_header = [0u8; SEGMENT_HEADER_LEN];
            read_exact_or_truncated(reader, &mut segment_header, "segment header").await?;
            let ct_len = u32::from_be_bytes([
                segment_header[0],
                segment_header[1],
                segment_header[2],
                segment_header[3],
            ]) as usize;
            let flags = segment_header[4];

            if ct_len == 0 || ct_len % BLOCK_LEN != 0 || ct_len > header.max_ciphertext_len() {
                return Err(LibationError::Decryption(format!(
                    "Segment {} has invalid ciphertext length {}",
                    index, ct_len
                )));
            }
            if flags & !FLAG_FINAL != 0 {
                return Err(LibationError::Decryption(format!(
                    "Segment {} has unknown flags {:#04x}",
                    index, flags
                )));
            }

            buffer.resize(ct_len, 0);
            read_exact_or_truncated(reader, &mut buffer, "segment ciphertext").await?;
            read_exact_or_truncated(reader, &mut tag, "segment tag").await?;

            segment_tag(&self.mac_key, &header_bytes, index, flags, &buffer)?
                .verify_slice(&tag)
                .map_err(|_| {
                    LibationError::Decryption(format!(
                        "Authentication failed for segment {} (corrupt data or wrong key)",
                        index
                    ))
                })?;

            let iv = self.key.segment_iv(index);
            let plaintext = Aes128CbcDec::new_from_slices(self.key.key(), &iv)
                .map_err(|e| LibationError::Decryption(format!("Failed to create cipher: {:?}", e)))?
                .decrypt_padded_mut::<Pkcs7>(&mut buffer)
                .map_err(|_| {
                    LibationError::Decryption(format!("Invalid padding in segment {}", index))
                })?;

            writer.write_all(plaintext).await?;
            written += plaintext.len() as u64;
            index += 1;

            if flags & FLAG_FINAL != 0 {
                break;
            }
        }

        let mut probe = [0u8; 1];
        if reader.read(&mut probe).await? != 0 {
            return Err(LibationError::Decryption(
                "Unexpected data after final segment".to_string(),
            ));
        }

        writer.flush().await?;
        debug!(segments = index, bytes = written, "Envelope decrypted");
        Ok(written)
    }
}

// ============================================================================
// ENCRYPTION
// ============================================================================

/// Envelope encrypter, the inverse of [`EnvelopeDecrypter`]
pub struct EnvelopeEncrypter {
    key: DecryptionKey,
    mac_key: [u8; 32],
    header: EnvelopeHeader,
}

impl EnvelopeEncrypter {
    pub fn new(key: &DecryptionKey) -> Self {
        Self::with_segment_size(key, DEFAULT_SEGMENT_SIZE)
    }

    pub fn with_segment_size(key: &DecryptionKey, segment_size: u32) -> Self {
        Self {
            mac_key: key.mac_key(),
            key: key.clone(),
            header: EnvelopeHeader {
                segment_size: segment_size.clamp(BLOCK_LEN as u32, MAX_SEGMENT_SIZE),
            },
        }
    }

    /// Encrypt everything from `reader` into `writer`
    ///
    /// # Returns
    /// Number of envelope bytes written
    pub async fn encrypt<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let header_bytes = self.header.encode();
        writer.write_all(&header_bytes).await?;
        let mut written = HEADER_LEN as u64;

        let segment_size = self.header.segment_size as usize;
        let mut current = read_segment(reader, segment_size).await?;
        let mut index = 0u64;

        loop {
            let next = read_segment(reader, segment_size).await?;
            let flags = if next.is_empty() { FLAG_FINAL } else { 0 };

            let msg_len = current.len();
            let mut buffer = current;
            buffer.resize(msg_len + BLOCK_LEN, 0);

            let iv: [u8; IV_LEN] = self.key.segment_iv(index);
            let ct_len = Aes128CbcEnc::new_from_slices(self.key.key(), &iv)
                .map_err(|e| LibationError::Decryption(format!("Failed to create cipher: {:?}", e)))?
                .encrypt_padded_mut::<Pkcs7>(&mut buffer, msg_len)
                .map_err(|_| LibationError::Decryption("Padding buffer too small".to_string()))?
                .len();
            buffer.truncate(ct_len);

            let tag = segment_tag(&self.mac_key, &header_bytes, index, flags, &buffer)?
                .finalize()
                .into_bytes();

            writer.write_all(&(ct_len as u32).to_be_bytes()).await?;
            writer.write_all(&[flags]).await?;
            writer.write_all(&buffer).await?;
            writer.write_all(&tag).await?;
            written += (SEGMENT_HEADER_LEN + ct_len + TAG_LEN) as u64;
            index += 1;

            if flags & FLAG_FINAL != 0 {
                break;
            }
            current = next;
        }

        writer.flush().await?;
        Ok(written)
    }
}

/// Fill up to `segment_size` bytes; a short result means EOF
async fn read_segment<R>(reader: &mut R, segment_size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut segment = Vec::with_capacity(segment_size);
    let mut limited = (&mut *reader).take(segment_size as u64);
    limited.read_to_end(&mut segment).await?;
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> DecryptionKey {
        DecryptionKey::from_hex(
            "2b7e151628aed2a6abf7158809cf4f3c",
            "000102030405060708090a0b0c0d0e0f",
        )
        .unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn encrypt(key: &DecryptionKey, plaintext: &[u8], segment_size: u32) -> Vec<u8> {
        let encrypter = EnvelopeEncrypter::with_segment_size(key, segment_size);
        let mut out = Vec::new();
        encrypter.encrypt(&mut &plaintext[..], &mut out).await.unwrap();
        out
    }

    async fn decrypt(key: &DecryptionKey, envelope: &[u8]) -> Result<Vec<u8>> {
        let decrypter = EnvelopeDecrypter::new(key);
        let mut out = Vec::new();
        decrypter
            .decrypt(&mut &envelope[..], &mut out, &CancellationToken::new())
            .await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_multi_segment_decrypt() {
        let key = test_key();
        let plaintext = payload(10_000);
        let envelope = encrypt(&key, &plaintext, 1024).await;

        let decrypted = decrypt(&key, &envelope).await.unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_exact_segment_multiple_and_empty_input() {
        let key = test_key();

        let plaintext = payload(2048);
        let envelope = encrypt(&key, &plaintext, 1024).await;
        assert_eq!(decrypt(&key, &envelope).await.unwrap(), plaintext);

        let envelope = encrypt(&key, &[], 1024).await;
        assert!(decrypt(&key, &envelope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decrypt_is_deterministic() {
        let key = test_key();
        let envelope = encrypt(&key, &payload(5000), 512).await;

        let first = decrypt(&key, &envelope).await.unwrap();
        let second = decrypt(&key, &envelope).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_corrupted_byte_fails_authentication() {
        let key = test_key();
        let mut envelope = encrypt(&key, &payload(4096), 1024).await;
        envelope[100] ^= 0x5a;

        let err = decrypt(&key, &envelope).await.unwrap_err();
        assert!(matches!(err, LibationError::Decryption(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let key = test_key();
        let envelope = encrypt(&key, &payload(3000), 1024).await;

        let other = DecryptionKey::from_slices(&[1; 16], key.iv()).unwrap();
        let err = decrypt(&other, &envelope).await.unwrap_err();
        assert!(matches!(err, LibationError::Decryption(_)));
    }

    #[tokio::test]
    async fn test_truncation_is_detected() {
        let key = test_key();
        let envelope = encrypt(&key, &payload(4096), 1024).await;

        // Drop the final segment entirely
        let segment_len = SEGMENT_HEADER_LEN + 1024 + BLOCK_LEN + TAG_LEN;
        let truncated = &envelope[..HEADER_LEN + 3 * segment_len];
        let err = decrypt(&key, truncated).await.unwrap_err();
        assert!(matches!(err, LibationError::Decryption(_)));

        // Cut mid-segment
        let err = decrypt(&key, &envelope[..envelope.len() - 7]).await.unwrap_err();
        assert!(matches!(err, LibationError::Decryption(_)));
    }

    #[tokio::test]
    async fn test_trailing_data_rejected() {
        let key = test_key();
        let mut envelope = encrypt(&key, &payload(100), 1024).await;
        envelope.extend_from_slice(b"junk");

        let err = decrypt(&key, &envelope).await.unwrap_err();
        assert!(matches!(err, LibationError::Decryption(_)));
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let key = test_key();
        let err = decrypt(&key, b"ftypM4A \0\0\0\0\0\0").await.unwrap_err();
        assert!(matches!(err, LibationError::Decryption(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_segment() {
        let key = test_key();
        let envelope = encrypt(&key, &payload(100), 1024).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut out = Vec::new();
        let err = EnvelopeDecrypter::new(&key)
            .decrypt(&mut &envelope[..], &mut out, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LibationError::Cancelled));
        assert!(out.is_empty());
    }

    #[test]
    fn test_malformed_key_length() {
        let err = EnvelopeDecrypter::from_slices(&[0; 4], &[0; 16]).err().unwrap();
        assert!(matches!(err, LibationError::Decryption(_)));
    }
}
