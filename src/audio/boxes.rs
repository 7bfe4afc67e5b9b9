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


//! ISO base media file format box primitives
//!
//! Readers work over in-memory payload slices (the `moov` tree is small and
//! read whole); only the top-level scan touches the file, so `mdat` is never
//! loaded into memory.

use crate::error::{LibationError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

pub type FourCc = [u8; 4];

pub(crate) fn fourcc_str(fourcc: &FourCc) -> String {
    fourcc
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect()
}

fn format_err(message: impl Into<String>) -> LibationError {
    LibationError::Format(message.into())
}

// ============================================================================
// READING
// ============================================================================

/// Checked big-endian reader over a box payload
pub(crate) struct BoxReader<'a> {
    buf: &'a [u8],
    context: &'static str,
}

impl<'a> BoxReader<'a> {
    pub fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self { buf, context }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(format_err(format!("Truncated '{}' box", self.context)));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u24(&mut self) -> Result<u32> {
        self.need(3)?;
        Ok(self.buf.get_uint(3) as u32)
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn fourcc(&mut self) -> Result<FourCc> {
        let bytes = self.bytes(4)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    /// Version and flags of a full box
    pub fn full_box(&mut self) -> Result<(u8, u32)> {
        let version = self.u8()?;
        let flags = self.u24()?;
        Ok((version, flags))
    }

    /// A 32- or 64-bit field depending on the full box version
    pub fn versioned_u64(&mut self, version: u8) -> Result<u64> {
        if version == 1 {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }

    /// Entry count that is checked against the bytes actually present
    pub fn entry_count(&mut self, entry_len: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        if count.saturating_mul(entry_len) > self.remaining() {
            return Err(format_err(format!(
                "'{}' declares {} entries but only {} bytes follow",
                self.context,
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }
}

/// Split one box off the front of `data`: (fourcc, payload, total size)
pub(crate) fn parse_box(data: &[u8]) -> Result<(FourCc, &[u8], usize)> {
    if data.len() < 8 {
        return Err(format_err("Truncated box header"));
    }
    let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let fourcc = [data[4], data[5], data[6], data[7]];

    let (header_len, size) = match size32 {
        0 => (8usize, data.len() as u64),
        1 => {
            if data.len() < 16 {
                return Err(format_err("Truncated large box header"));
            }
            let mut large = &data[8..16];
            (16usize, large.get_u64())
        }
        n => (8usize, n as u64),
    };

    if size < header_len as u64 || size > data.len() as u64 {
        return Err(format_err(format!(
            "Box '{}' overruns its parent ({} bytes declared, {} available)",
            fourcc_str(&fourcc),
            size,
            data.len()
        )));
    }

    let size = size as usize;
    Ok((fourcc, &data[header_len..size], size))
}

/// Iterator over the child boxes of a payload
pub(crate) struct BoxIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<(FourCc, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        match parse_box(self.data) {
            Ok((fourcc, payload, size)) => {
                self.data = &self.data[size..];
                Some(Ok((fourcc, payload)))
            }
            Err(e) => {
                self.data = &[];
                Some(Err(e))
            }
        }
    }
}

pub(crate) fn children(data: &[u8]) -> BoxIter<'_> {
    BoxIter { data }
}

pub(crate) fn find_child<'a>(data: &'a [u8], fourcc: &FourCc) -> Result<Option<&'a [u8]>> {
    for child in children(data) {
        let (found, payload) = child?;
        if &found == fourcc {
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

pub(crate) fn require_child<'a>(data: &'a [u8], fourcc: &FourCc, parent: &str) -> Result<&'a [u8]> {
    find_child(data, fourcc)?.ok_or_else(|| {
        format_err(format!(
            "Missing '{}' box in '{}'",
            fourcc_str(fourcc),
            parent
        ))
    })
}

/// A top-level box located in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TopLevelBox {
    pub fourcc: FourCc,
    pub offset: u64,
    pub header_len: u64,
    pub size: u64,
}

impl TopLevelBox {
    pub fn payload_offset(&self) -> u64 {
        self.offset + self.header_len
    }

    pub fn payload_len(&self) -> u64 {
        self.size - self.header_len
    }
}

/// Walk the top-level boxes of a file without reading their payloads
pub(crate) async fn scan_top_level<R>(reader: &mut R, file_len: u64) -> Result<Vec<TopLevelBox>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let mut boxes = Vec::new();
    let mut offset = 0u64;

    while offset < file_len {
        if file_len - offset < 8 {
            // Trailing padding too short to be a box
            break;
        }

        reader.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut header = [0u8; 8];
        reader.read_exact(&mut header).await?;
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let fourcc = [header[4], header[5], header[6], header[7]];

        let (header_len, size) = match size32 {
            0 => (8u64, file_len - offset),
            1 => {
                if file_len - offset < 16 {
                    return Err(format_err("Truncated large box header at end of file"));
                }
                (16u64, reader.read_u64().await?)
            }
            n => (8u64, n as u64),
        };

        if size < header_len || size > file_len - offset {
            return Err(format_err(format!(
                "Top-level box '{}' at offset {} overruns the file",
                fourcc_str(&fourcc),
                offset
            )));
        }

        boxes.push(TopLevelBox {
            fourcc,
            offset,
            header_len,
            size,
        });
        offset += size;
    }

    Ok(boxes)
}

// ============================================================================
// WRITING
// ============================================================================

/// Append a box whose size is patched in after `body` runs
pub(crate) fn write_box(out: &mut BytesMut, fourcc: &FourCc, body: impl FnOnce(&mut BytesMut)) {
    let start = out.len();
    out.put_u32(0);
    out.put_slice(fourcc);
    body(out);
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

pub(crate) fn write_full_box(
    out: &mut BytesMut,
    fourcc: &FourCc,
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut BytesMut),
) {
    write_box(out, fourcc, |out| {
        out.put_u8(version);
        out.put_uint(flags as u64, 3);
        body(out);
    });
}

/// Unity transformation matrix used by `mvhd` and `tkhd`
pub(crate) fn put_unity_matrix(out: &mut BytesMut) {
    for value in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        out.put_u32(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_iterate_children() {
        let mut out = BytesMut::new();
        write_box(&mut out, b"abcd", |out| out.put_u32(7));
        write_full_box(&mut out, b"efgh", 1, 0x000003, |out| out.put_u8(9));

        let mut iter = children(&out);
        let (fourcc, payload) = iter.next().unwrap().unwrap();
        assert_eq!(&fourcc, b"abcd");
        assert_eq!(payload, &[0, 0, 0, 7]);

        let (fourcc, payload) = iter.next().unwrap().unwrap();
        assert_eq!(&fourcc, b"efgh");
        let mut reader = BoxReader::new(payload, "efgh");
        assert_eq!(reader.full_box().unwrap(), (1, 3));
        assert_eq!(reader.u8().unwrap(), 9);

        assert!(iter.next().is_none());
    }

    #[test]
    fn test_overrunning_box_is_format_error() {
        let data = [0, 0, 0, 64, b'm', b'o', b'o', b'v', 0, 0];
        let err = parse_box(&data).unwrap_err();
        assert!(matches!(err, LibationError::Format(_)));
    }

    #[test]
    fn test_large_size_box() {
        let mut data = vec![0, 0, 0, 1, b'm', b'd', b'a', b't'];
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);

        let (fourcc, payload, size) = parse_box(&data).unwrap();
        assert_eq!(&fourcc, b"mdat");
        assert_eq!(payload, &[1, 2, 3, 4]);
        assert_eq!(size, 20);
    }

    #[test]
    fn test_entry_count_guard() {
        let data = [0xff, 0xff, 0xff, 0xff, 0, 0];
        let mut reader = BoxReader::new(&data, "stts");
        assert!(reader.entry_count(8).is_err());
    }

    #[tokio::test]
    async fn test_scan_top_level() {
        let mut out = BytesMut::new();
        write_box(&mut out, b"ftyp", |out| out.put_slice(b"M4B \0\0\0\0"));
        write_box(&mut out, b"mdat", |out| out.put_slice(&[0u8; 100]));
        let len = out.len() as u64;

        let mut cursor = std::io::Cursor::new(out.to_vec());
        let boxes = scan_top_level(&mut cursor, len).await.unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(&boxes[1].fourcc, b"mdat");
        assert_eq!(boxes[1].offset, 16);
        assert_eq!(boxes[1].payload_len(), 100);
    }
}
