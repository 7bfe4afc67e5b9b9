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


//! File name sanitizing and multi-part naming
//!
//! # Multi-part names
//! Part files are named `{book} - {nn} - {chapter}` where `nn` is the
//! 1-based part index, zero-padded to the width of the part count (at least
//! two digits). Book and chapter pieces are sanitized and truncated
//! separately, so the index always survives and names stay distinct across
//! the parts of one book.

use serde::{Deserialize, Serialize};

/// Longest book-title piece in a part file name, in bytes
const MAX_BOOK_BYTES: usize = 100;

/// Longest chapter-title piece in a part file name, in bytes
const MAX_CHAPTER_BYTES: usize = 80;

/// Longest sanitized file name component, leaving room for an extension
pub const MAX_COMPONENT_BYTES: usize = 200;

/// Characters that are illegal in a file name on at least one platform
const ILLEGAL: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Substitution policy for characters that cannot appear in file names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementCharacters {
    /// Full-width look-alikes (`：` for `:`)
    #[default]
    Default,
    /// ASCII look-alikes (`-` for `:`, `'` for `"`)
    LoFi,
    /// Underscore for everything
    Barebones,
}

impl ReplacementCharacters {
    /// Replacement for one illegal character; empty means drop it
    fn replacement(&self, c: char) -> &'static str {
        match self {
            ReplacementCharacters::Default => match c {
                '<' => "＜",
                '>' => "＞",
                ':' => "：",
                '"' => "＂",
                '/' => "∕",
                '\\' => "＼",
                '|' => "｜",
                '?' => "？",
                '*' => "＊",
                _ => "_",
            },
            ReplacementCharacters::LoFi => match c {
                '<' => "[",
                '>' => "]",
                ':' | '/' | '\\' | '|' => "-",
                '"' => "'",
                '?' | '*' => "",
                _ => "_",
            },
            ReplacementCharacters::Barebones => "_",
        }
    }

    /// Make `name` usable as a single path component
    ///
    /// Control characters are removed, whitespace runs collapse to a single
    /// space, and trailing dots and spaces are trimmed. The result is capped
    /// at [`MAX_COMPONENT_BYTES`] on a character boundary.
    pub fn sanitize(&self, name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut pending_space = false;

        for c in name.chars() {
            if c.is_whitespace() {
                pending_space = !out.is_empty();
                continue;
            }
            if c.is_control() {
                continue;
            }
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            if ILLEGAL.contains(&c) {
                out.push_str(self.replacement(c));
            } else {
                out.push(c);
            }
        }

        let mut out = truncate_bytes(&out, MAX_COMPONENT_BYTES).to_string();
        let trimmed = out.trim_end_matches(['.', ' ']).len();
        out.truncate(trimmed);
        out
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Naming context for one part of a split book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartFileProperties {
    /// 1-based
    pub part_index: usize,
    pub part_count: usize,
    pub chapter_title: String,
    pub book_title: String,
}

impl MultipartFileProperties {
    fn padded_index(&self) -> String {
        let width = self.part_count.to_string().len().max(2);
        format!("{:0width$}", self.part_index, width = width)
    }
}

/// File name (without extension) for one part
///
/// Deterministic for the same properties; distinct part indices always give
/// distinct names.
pub fn multipart_file_name(
    props: &MultipartFileProperties,
    replacement: ReplacementCharacters,
) -> String {
    let book = piece(&props.book_title, replacement, MAX_BOOK_BYTES);
    let chapter = piece(&props.chapter_title, replacement, MAX_CHAPTER_BYTES);
    let index = props.padded_index();

    match (book.is_empty(), chapter.is_empty()) {
        (false, false) => format!("{} - {} - {}", book, index, chapter),
        (false, true) => format!("{} - {}", book, index),
        (true, false) => format!("{} - {}", index, chapter),
        (true, true) => index,
    }
}

fn piece(text: &str, replacement: ReplacementCharacters, max: usize) -> String {
    let sanitized = replacement.sanitize(text);
    truncate_bytes(&sanitized, max)
        .trim_end_matches(['.', ' '])
        .to_string()
}

/// Title tag for one part: the chapter title, or "{book} - Part {n}" when
/// the chapter has none
pub fn multipart_title_name(props: &MultipartFileProperties) -> String {
    let chapter = props.chapter_title.trim();
    if !chapter.is_empty() {
        return chapter.to_string();
    }
    let book = props.book_title.trim();
    if book.is_empty() {
        format!("Part {}", props.part_index)
    } else {
        format!("{} - Part {}", book, props.part_index)
    }
}
