// SPDX-License-Identifier: AGPL-3.0-or-later
// CanopyDB - Streaming Disk-Backed Vector Search
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Identifiers and the on-storage posting record codec.
//!
//! Vectors and heads (centroids) share one dense 32-bit id space. A posting
//! list is a flat concatenation of fixed-size records:
//!
//! ```text
//! Offset  Size     Field
//! 0       4        vid      i32 (LE)
//! 4       1        version  u8
//! 5       4*dim    payload  f32[dim] (LE)
//! ```
//!
//! Records carry no length prefix; a blob whose length is not a multiple of
//! the record size is corrupt.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{CanopyError, Result};

/// Dense id of a data vector.
pub type VectorId = u32;

/// Dense id of a head (centroid). Shares the id space with [`VectorId`].
pub type HeadId = u32;

/// One posting-list record: a replica of a vector hosted under some head.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub vid: VectorId,
    pub version: u8,
    pub payload: Vec<f32>,
}

impl VectorRecord {
    /// Serialized size of one record for the given dimensionality.
    #[inline]
    pub const fn wire_size(dim: usize) -> usize {
        4 + 1 + 4 * dim
    }

    /// Append the wire form of this record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut head = [0u8; 5];
        LittleEndian::write_i32(&mut head[0..4], self.vid as i32);
        head[4] = self.version;
        buf.extend_from_slice(&head);
        let base = buf.len();
        buf.resize(base + 4 * self.payload.len(), 0);
        LittleEndian::write_f32_into(&self.payload, &mut buf[base..]);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::wire_size(self.payload.len()));
        self.encode_into(&mut buf);
        buf
    }
}

/// Borrowed view of one record inside a posting blob.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub vid: VectorId,
    pub version: u8,
    raw_payload: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Decode the payload into an owned vector.
    pub fn payload(&self) -> Vec<f32> {
        let mut out = vec![0f32; self.raw_payload.len() / 4];
        LittleEndian::read_f32_into(self.raw_payload, &mut out);
        out
    }

    pub fn to_record(&self) -> VectorRecord {
        VectorRecord {
            vid: self.vid,
            version: self.version,
            payload: self.payload(),
        }
    }

    /// Raw wire bytes of the payload portion.
    pub fn payload_bytes(&self) -> &'a [u8] {
        self.raw_payload
    }
}

/// Iterator over the fixed-size records of a posting blob.
pub struct RecordCursor<'a> {
    blob: &'a [u8],
    dim: usize,
    offset: usize,
}

impl<'a> RecordCursor<'a> {
    /// Fails when the blob length is not a whole number of records.
    pub fn new(blob: &'a [u8], dim: usize) -> Result<Self> {
        let rec = VectorRecord::wire_size(dim);
        if blob.len() % rec != 0 {
            return Err(CanopyError::Corrupted(format!(
                "posting blob length {} is not a multiple of record size {}",
                blob.len(),
                rec
            )));
        }
        Ok(Self {
            blob,
            dim,
            offset: 0,
        })
    }

    /// Number of records in the blob.
    pub fn len(&self) -> usize {
        self.blob.len() / VectorRecord::wire_size(self.dim)
    }

    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }
}

impl<'a> Iterator for RecordCursor<'a> {
    type Item = RecordView<'a>;

    fn next(&mut self) -> Option<RecordView<'a>> {
        let rec = VectorRecord::wire_size(self.dim);
        if self.offset + rec > self.blob.len() {
            return None;
        }
        let at = &self.blob[self.offset..self.offset + rec];
        self.offset += rec;
        Some(RecordView {
            vid: LittleEndian::read_i32(&at[0..4]) as VectorId,
            version: at[4],
            raw_payload: &at[5..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let rec = VectorRecord {
            vid: 42,
            version: 3,
            payload: vec![1.0, -2.5, 0.0, 7.25],
        };
        let blob = rec.encode();
        assert_eq!(blob.len(), VectorRecord::wire_size(4));

        let mut cursor = RecordCursor::new(&blob, 4).unwrap();
        let view = cursor.next().unwrap();
        assert_eq!(view.vid, 42);
        assert_eq!(view.version, 3);
        assert_eq!(view.payload(), rec.payload);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn cursor_walks_concatenated_records() {
        let mut blob = Vec::new();
        for vid in 0..5u32 {
            VectorRecord {
                vid,
                version: vid as u8,
                payload: vec![vid as f32; 3],
            }
            .encode_into(&mut blob);
        }
        let cursor = RecordCursor::new(&blob, 3).unwrap();
        assert_eq!(cursor.len(), 5);
        let vids: Vec<u32> = cursor.map(|v| v.vid).collect();
        assert_eq!(vids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let rec = VectorRecord {
            vid: 1,
            version: 0,
            payload: vec![0.0; 4],
        };
        let mut blob = rec.encode();
        blob.pop();
        assert!(RecordCursor::new(&blob, 4).is_err());
    }
}
