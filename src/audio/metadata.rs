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


//! iTunes-style metadata tags (`moov/udta/meta/ilst`)
//!
//! Items are kept as raw payloads so tags this crate does not understand
//! (cover art, Audible-specific atoms) survive a rewrite untouched.

use super::boxes::{children, write_box, write_full_box, BoxReader, FourCc};
use crate::error::Result;
use bytes::{BufMut, Bytes, BytesMut};
use regex::Regex;
use std::sync::OnceLock;

/// Well-known item keys
pub mod keys {
    use super::FourCc;

    pub const TITLE: FourCc = *b"\xa9nam";
    pub const ALBUM: FourCc = *b"\xa9alb";
    pub const ARTIST: FourCc = *b"\xa9ART";
    pub const ALBUM_ARTIST: FourCc = *b"aART";
    /// Audible stores the narrator here
    pub const COMPOSER: FourCc = *b"\xa9wrt";
    pub const GENRE: FourCc = *b"\xa9gen";
    pub const YEAR: FourCc = *b"\xa9day";
    pub const COMMENT: FourCc = *b"\xa9cmt";
    pub const TRACK_NUMBER: FourCc = *b"trkn";
    pub const MEDIA_TYPE: FourCc = *b"stik";
}

const DATA_TYPE_BINARY: u32 = 0;
const DATA_TYPE_UTF8: u32 = 1;
const DATA_TYPE_INTEGER: u32 = 21;

/// `stik` value for audiobooks
pub const MEDIA_TYPE_AUDIOBOOK: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagItem {
    pub key: FourCc,
    /// Item payload: one or more `data` boxes
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    items: Vec<TagItem>,
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TagItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn parse_ilst(payload: &[u8]) -> Result<Self> {
        let mut items = Vec::new();
        for child in children(payload) {
            let (key, item) = child?;
            items.push(TagItem {
                key,
                payload: Bytes::copy_from_slice(item),
            });
        }
        Ok(Self { items })
    }

    pub(crate) fn write_ilst(&self, out: &mut BytesMut) {
        write_box(out, b"ilst", |out| {
            for item in &self.items {
                write_box(out, &item.key, |out| out.put_slice(&item.payload));
            }
        });
    }

    /// UTF-8 text value of an item, if present and textual
    pub fn text(&self, key: &FourCc) -> Option<String> {
        let item = self.items.iter().find(|item| &item.key == key)?;
        for child in children(&item.payload) {
            let (fourcc, data) = child.ok()?;
            if &fourcc != b"data" {
                continue;
            }
            let mut reader = BoxReader::new(data, "data");
            let (_, data_type) = reader.full_box().ok()?;
            reader.skip(4).ok()?;
            if data_type != DATA_TYPE_UTF8 {
                return None;
            }
            return Some(String::from_utf8_lossy(reader.rest()).into_owned());
        }
        None
    }

    pub fn set_text(&mut self, key: FourCc, value: &str) {
        self.set_data(key, DATA_TYPE_UTF8, value.as_bytes());
    }

    pub fn set_media_type(&mut self, media_type: u8) {
        self.set_data(keys::MEDIA_TYPE, DATA_TYPE_INTEGER, &[media_type]);
    }

    /// `trkn`: track number and total as used for multi-part output
    pub fn set_track_number(&mut self, number: u16, total: u16) {
        let mut value = Vec::with_capacity(8);
        value.extend_from_slice(&[0, 0]);
        value.extend_from_slice(&number.to_be_bytes());
        value.extend_from_slice(&total.to_be_bytes());
        value.extend_from_slice(&[0, 0]);
        self.set_data(keys::TRACK_NUMBER, DATA_TYPE_BINARY, &value);
    }

    pub fn remove(&mut self, key: &FourCc) -> bool {
        let before = self.items.len();
        self.items.retain(|item| &item.key != key);
        self.items.len() != before
    }

    fn set_data(&mut self, key: FourCc, data_type: u32, value: &[u8]) {
        let mut payload = BytesMut::new();
        write_full_box(&mut payload, b"data", 0, data_type, |out| {
            // locale
            out.put_u32(0);
            out.put_slice(value);
        });
        let payload = payload.freeze();

        match self.items.iter_mut().find(|item| item.key == key) {
            Some(item) => item.payload = payload,
            None => self.items.push(TagItem { key, payload }),
        }
    }
}

fn unabridged_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\s*[\(\[]\s*unabridged\s*[\)\]]").ok())
        .as_ref()
}

/// Remove "(Unabridged)" / "[Unabridged]" markers from a title
pub fn strip_unabridged(text: &str) -> String {
    match unabridged_pattern() {
        Some(pattern) => pattern.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Apply [`strip_unabridged`] to the title and album tags
///
/// # Returns
/// `true` if any tag changed
pub fn strip_unabridged_tags(tags: &mut Tags) -> bool {
    let mut changed = false;
    for key in [keys::TITLE, keys::ALBUM] {
        if let Some(value) = tags.text(&key) {
            let stripped = strip_unabridged(&value);
            if stripped != value {
                tags.set_text(key, &stripped);
                changed = true;
            }
        }
    }
    changed
}
