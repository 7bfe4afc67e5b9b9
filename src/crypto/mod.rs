//! Cryptography and DRM removal
//!
//! This module turns the encrypted download into plaintext container bytes.
//!
//! # Format
//! The envelope is segmented AES-128-CBC with per-segment HMAC-SHA256,
//! keyed by the per-book key/IV from the license voucher.

pub mod envelope;
pub mod keys;

// Re-export commonly used types
pub use envelope::{EnvelopeDecrypter, EnvelopeEncrypter, EnvelopeHeader};
pub use keys::{DecryptionKey, IV_LEN, KEY_LEN};
