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

//! The durable assignment log (persistent buffer).
//!
//! A FIFO of opaque assignment records with dense monotonic ids starting at
//! 0. `append` returns only after the record is on stable storage; `get`
//! never fails for an id below `next_id()` and returns empty above it. The
//! log is never truncated while the index is live.
//!
//! On-disk record framing: `len:u32 (LE) | bytes`. A torn tail record (crash
//! mid-append) is dropped on recovery.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};

use canopy_core::distance::DistanceKind;
use canopy_core::{normalize, CanopyError, HeadId, Result, VectorId};

// ============================================================================
// Assignment codec
// ============================================================================

const OP_INSERT: u8 = 0x00;
const OP_DELETE: u8 = 0x01;

/// One replica placement inside an insert assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaAssignment {
    pub head: HeadId,
    pub vid: VectorId,
    pub version: u8,
    pub payload: Vec<f32>,
}

/// A record in the assignment log.
///
/// Wire layout:
/// - Insert: `0x00 | replica_count:i8 | N x (head:i32 | vid:i32 | version:u8 | payload:f32[dim])`
/// - Delete: `0x01 | vid:i32`
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Insert { replicas: Vec<ReplicaAssignment> },
    Delete { vid: VectorId },
}

impl Assignment {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Assignment::Insert { replicas } => {
                let dim = replicas.first().map(|r| r.payload.len()).unwrap_or(0);
                let mut buf = Vec::with_capacity(2 + replicas.len() * (9 + 4 * dim));
                buf.push(OP_INSERT);
                buf.push(replicas.len() as u8);
                for r in replicas {
                    let mut header = [0u8; 9];
                    LittleEndian::write_i32(&mut header[0..4], r.head as i32);
                    LittleEndian::write_i32(&mut header[4..8], r.vid as i32);
                    header[8] = r.version;
                    buf.extend_from_slice(&header);
                    let base = buf.len();
                    buf.resize(base + 4 * r.payload.len(), 0);
                    LittleEndian::write_f32_into(&r.payload, &mut buf[base..]);
                }
                buf
            }
            Assignment::Delete { vid } => {
                let mut buf = vec![OP_DELETE, 0, 0, 0, 0];
                LittleEndian::write_i32(&mut buf[1..5], *vid as i32);
                buf
            }
        }
    }

    pub fn decode(bytes: &[u8], dim: usize) -> Result<Assignment> {
        let Some(&op) = bytes.first() else {
            return Err(CanopyError::Corrupted("empty assignment record".into()));
        };
        match op {
            OP_INSERT => {
                let count = *bytes
                    .get(1)
                    .ok_or_else(|| CanopyError::Corrupted("insert missing count".into()))?
                    as usize;
                let stride = 9 + 4 * dim;
                if bytes.len() != 2 + count * stride {
                    return Err(CanopyError::Corrupted(format!(
                        "insert record length {} != {} replicas of {} bytes",
                        bytes.len(),
                        count,
                        stride
                    )));
                }
                let mut replicas = Vec::with_capacity(count);
                for i in 0..count {
                    let at = 2 + i * stride;
                    let chunk = &bytes[at..at + stride];
                    let mut payload = vec![0f32; dim];
                    LittleEndian::read_f32_into(&chunk[9..], &mut payload);
                    replicas.push(ReplicaAssignment {
                        head: LittleEndian::read_i32(&chunk[0..4]) as HeadId,
                        vid: LittleEndian::read_i32(&chunk[4..8]) as VectorId,
                        version: chunk[8],
                        payload,
                    });
                }
                Ok(Assignment::Insert { replicas })
            }
            OP_DELETE => {
                if bytes.len() != 5 {
                    return Err(CanopyError::Corrupted("bad delete record length".into()));
                }
                Ok(Assignment::Delete {
                    vid: LittleEndian::read_i32(&bytes[1..5]) as VectorId,
                })
            }
            other => Err(CanopyError::Corrupted(format!(
                "unknown assignment opcode {:#04x}",
                other
            ))),
        }
    }

    /// Normalize every replica payload in place (cosine write path).
    pub fn normalize_payloads(&mut self, kind: DistanceKind) {
        if kind != DistanceKind::Cosine {
            return;
        }
        if let Assignment::Insert { replicas } = self {
            for r in replicas.iter_mut() {
                normalize(&mut r.payload);
            }
        }
    }
}

// ============================================================================
// AssignmentLog
// ============================================================================

enum LogInner {
    Mem(RwLock<Vec<Vec<u8>>>),
    File {
        file: File,
        offsets: RwLock<Vec<u64>>,
        tail: Mutex<u64>,
    },
}

/// Durable append-only assignment log.
pub struct AssignmentLog {
    inner: LogInner,
}

impl AssignmentLog {
    /// Volatile log for ephemeral indexes and tests.
    pub fn in_memory() -> Self {
        Self {
            inner: LogInner::Mem(RwLock::new(Vec::new())),
        }
    }

    /// Open (or create) a file-backed log, rebuilding the offset table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();

        let mut offsets = Vec::new();
        let mut at = 0u64;
        let mut header = [0u8; 4];
        while at + 4 <= len {
            file.read_exact_at(&mut header, at)?;
            let rec_len = LittleEndian::read_u32(&header) as u64;
            if at + 4 + rec_len > len {
                // torn tail record from a crash mid-append
                break;
            }
            offsets.push(at);
            at += 4 + rec_len;
        }
        let tail = at;
        if tail < len {
            // Drop torn bytes so they cannot be misparsed by a later reopen.
            file.set_len(tail)?;
        }

        Ok(Self {
            inner: LogInner::File {
                file,
                offsets: RwLock::new(offsets),
                tail: Mutex::new(tail),
            },
        })
    }

    /// Durably append one record; returns its dense id.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        match &self.inner {
            LogInner::Mem(records) => {
                let mut records = records.write();
                records.push(bytes.to_vec());
                Ok(records.len() as u64 - 1)
            }
            LogInner::File {
                file,
                offsets,
                tail,
            } => {
                let mut tail = tail.lock();
                let at = *tail;
                let mut framed = Vec::with_capacity(4 + bytes.len());
                framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                framed.extend_from_slice(bytes);
                file.write_all_at(&framed, at)?;
                file.sync_data()?;
                let mut offsets = offsets.write();
                offsets.push(at);
                *tail = at + framed.len() as u64;
                Ok(offsets.len() as u64 - 1)
            }
        }
    }

    /// Read one record; empty for ids not yet assigned.
    pub fn get(&self, id: u64) -> Result<Vec<u8>> {
        match &self.inner {
            LogInner::Mem(records) => {
                Ok(records.read().get(id as usize).cloned().unwrap_or_default())
            }
            LogInner::File { file, offsets, .. } => {
                let Some(&at) = offsets.read().get(id as usize) else {
                    return Ok(Vec::new());
                };
                let mut header = [0u8; 4];
                file.read_exact_at(&mut header, at)?;
                let len = LittleEndian::read_u32(&header) as usize;
                let mut out = vec![0u8; len];
                file.read_exact_at(&mut out, at + 4)?;
                Ok(out)
            }
        }
    }

    /// Next id to be handed out.
    pub fn next_id(&self) -> u64 {
        match &self.inner {
            LogInner::Mem(records) => records.read().len() as u64,
            LogInner::File { offsets, .. } => offsets.read().len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn insert_codec_round_trip() {
        let assignment = Assignment::Insert {
            replicas: vec![
                ReplicaAssignment {
                    head: 3,
                    vid: 100,
                    version: 0,
                    payload: vec![1.0, 2.0],
                },
                ReplicaAssignment {
                    head: 9,
                    vid: 100,
                    version: 0,
                    payload: vec![1.0, 2.0],
                },
            ],
        };
        let bytes = assignment.encode();
        assert_eq!(bytes[0], OP_INSERT);
        assert_eq!(bytes[1], 2);
        assert_eq!(Assignment::decode(&bytes, 2).unwrap(), assignment);
    }

    #[test]
    fn delete_codec_round_trip() {
        let assignment = Assignment::Delete { vid: 77 };
        let bytes = assignment.encode();
        assert_eq!(bytes.len(), 5);
        assert_eq!(Assignment::decode(&bytes, 4).unwrap(), assignment);
    }

    #[test]
    fn decode_rejects_bad_opcode_and_length() {
        assert!(Assignment::decode(&[0x02, 0, 0, 0, 0], 2).is_err());
        assert!(Assignment::decode(&[OP_INSERT, 1, 0, 0], 2).is_err());
        assert!(Assignment::decode(&[], 2).is_err());
    }

    #[test]
    fn log_ids_are_dense_and_reads_never_fail() {
        let log = AssignmentLog::in_memory();
        assert_eq!(log.next_id(), 0);
        assert!(log.get(0).unwrap().is_empty());

        assert_eq!(log.append(b"a").unwrap(), 0);
        assert_eq!(log.append(b"bb").unwrap(), 1);
        assert_eq!(log.next_id(), 2);
        assert_eq!(log.get(0).unwrap(), b"a");
        assert_eq!(log.get(1).unwrap(), b"bb");
        assert!(log.get(5).unwrap().is_empty());
    }

    #[test]
    fn file_log_recovers_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assignments.log");
        {
            let log = AssignmentLog::open(&path).unwrap();
            log.append(b"first").unwrap();
            log.append(b"second-record").unwrap();
        }
        let log = AssignmentLog::open(&path).unwrap();
        assert_eq!(log.next_id(), 2);
        assert_eq!(log.get(0).unwrap(), b"first");
        assert_eq!(log.get(1).unwrap(), b"second-record");
        assert_eq!(log.append(b"third").unwrap(), 2);
        assert_eq!(log.get(2).unwrap(), b"third");
    }

    #[test]
    fn torn_tail_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assignments.log");
        {
            let log = AssignmentLog::open(&path).unwrap();
            log.append(b"whole").unwrap();
        }
        // Simulate a crash mid-append: a length prefix promising more bytes
        // than the file holds.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"torn").unwrap();
        }
        let log = AssignmentLog::open(&path).unwrap();
        assert_eq!(log.next_id(), 1);
        assert_eq!(log.get(0).unwrap(), b"whole");
    }
}
