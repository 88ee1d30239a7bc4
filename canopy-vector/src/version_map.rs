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

//! Per-vector version counter and tombstone flag.
//!
//! A record is live iff its tombstone is clear and the version byte in the
//! record equals the map entry. Reassignment bumps the entry with a CAS, so
//! a successful bump instantly stales every record carrying the old version.
//!
//! Storage grows in fixed blocks appended under a single growth lock (the
//! `data_add_lock` of the write path); readers never take a lock beyond the
//! block-vector rw-lock. The map is snapshotted to a binary image with a
//! per-block capacity header.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};

use canopy_core::{CanopyError, Result, VectorId};

/// Ids per block.
const BLOCK: usize = 8192;
const BLOCK_WORDS: usize = BLOCK / 64;

const IMAGE_MAGIC: [u8; 4] = *b"CVMP";
const IMAGE_VERSION: u32 = 1;

struct VersionBlock {
    versions: Vec<AtomicU8>,
    tombstones: Vec<AtomicU64>,
}

impl VersionBlock {
    fn empty() -> Self {
        Self {
            versions: (0..BLOCK).map(|_| AtomicU8::new(0)).collect(),
            tombstones: (0..BLOCK_WORDS).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

pub struct VersionMap {
    blocks: RwLock<Vec<Arc<VersionBlock>>>,
    /// Ids covered so far (high-water mark).
    count: AtomicU32,
    max_capacity: usize,
    grow_lock: Mutex<()>,
}

impl VersionMap {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            count: AtomicU32::new(0),
            max_capacity,
            grow_lock: Mutex::new(()),
        }
    }

    /// Ids covered by the map.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Grow the map so that `id` has a slot. Fails with [`CanopyError::MemoryOverflow`]
    /// when the configured ceiling would be crossed.
    pub fn cover(&self, id: VectorId) -> Result<()> {
        if (id as usize) < self.count() as usize {
            return Ok(());
        }
        let _growth = self.grow_lock.lock();
        let needed = id as usize + 1;
        if needed <= self.count() as usize {
            return Ok(());
        }
        if needed > self.max_capacity {
            return Err(CanopyError::MemoryOverflow);
        }
        let mut blocks = self.blocks.write();
        while blocks.len() * BLOCK < needed {
            blocks.push(Arc::new(VersionBlock::empty()));
        }
        drop(blocks);
        self.count.store(needed as u32, Ordering::Release);
        Ok(())
    }

    /// Grow by `n` fresh slots.
    pub fn add_batch(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let target = self.count() + n;
        self.cover(target - 1)
    }

    fn block_for(&self, id: VectorId) -> Option<Arc<VersionBlock>> {
        self.blocks.read().get(id as usize / BLOCK).cloned()
    }

    /// Current version of `id`; fresh (never-covered) ids read as 0.
    pub fn version(&self, id: VectorId) -> u8 {
        match self.block_for(id) {
            Some(block) => block.versions[id as usize % BLOCK].load(Ordering::Acquire),
            None => 0,
        }
    }

    pub fn is_deleted(&self, id: VectorId) -> bool {
        match self.block_for(id) {
            Some(block) => {
                let at = id as usize % BLOCK;
                let word = block.tombstones[at / 64].load(Ordering::Acquire);
                word & (1u64 << (at % 64)) != 0
            }
            None => false,
        }
    }

    /// Whether a record carrying `version` is current for `id`.
    #[inline]
    pub fn check_valid(&self, id: VectorId, version: u8) -> bool {
        self.version(id) == version
    }

    /// Set the tombstone for `id`, growing the map if needed.
    pub fn delete(&self, id: VectorId) -> Result<()> {
        self.cover(id)?;
        let block = self
            .block_for(id)
            .ok_or_else(|| CanopyError::Internal(format!("no block for id {}", id)))?;
        let at = id as usize % BLOCK;
        block.tombstones[at / 64].fetch_or(1u64 << (at % 64), Ordering::AcqRel);
        Ok(())
    }

    /// CAS the version from `from` to `from + 1`. Returns false when another
    /// reassignment (or delete-triggered bump) won the race.
    pub fn try_bump(&self, id: VectorId, from: u8) -> bool {
        match self.block_for(id) {
            Some(block) => block.versions[id as usize % BLOCK]
                .compare_exchange(
                    from,
                    from.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Binary image
    // ------------------------------------------------------------------

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let blocks = self.blocks.read();
        let count = self.count();
        let mut buf = Vec::with_capacity(16 + blocks.len() * (4 + BLOCK + 8 * BLOCK_WORDS));
        buf.extend_from_slice(&IMAGE_MAGIC);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, IMAGE_VERSION);
        buf.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, count);
        buf.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, blocks.len() as u32);
        buf.extend_from_slice(&word);
        for block in blocks.iter() {
            LittleEndian::write_u32(&mut word, BLOCK as u32);
            buf.extend_from_slice(&word);
            for v in &block.versions {
                buf.push(v.load(Ordering::Acquire));
            }
            let mut wide = [0u8; 8];
            for w in &block.tombstones {
                LittleEndian::write_u64(&mut wide, w.load(Ordering::Acquire));
                buf.extend_from_slice(&wide);
            }
        }
        drop(blocks);

        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, max_capacity: usize) -> Result<Self> {
        let mut raw = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut raw)?;
        if raw.len() < 16 || raw[0..4] != IMAGE_MAGIC {
            return Err(CanopyError::Corrupted("bad version map header".into()));
        }
        let image_version = LittleEndian::read_u32(&raw[4..8]);
        if image_version != IMAGE_VERSION {
            return Err(CanopyError::Corrupted(format!(
                "unsupported version map image v{}",
                image_version
            )));
        }
        let count = LittleEndian::read_u32(&raw[8..12]);
        let block_count = LittleEndian::read_u32(&raw[12..16]) as usize;

        let mut blocks = Vec::with_capacity(block_count);
        let mut at = 16usize;
        for _ in 0..block_count {
            if at + 4 > raw.len() {
                return Err(CanopyError::Corrupted("version map truncated".into()));
            }
            let capacity = LittleEndian::read_u32(&raw[at..at + 4]) as usize;
            at += 4;
            if capacity != BLOCK {
                return Err(CanopyError::Corrupted(format!(
                    "unexpected version block capacity {}",
                    capacity
                )));
            }
            if at + BLOCK + 8 * BLOCK_WORDS > raw.len() {
                return Err(CanopyError::Corrupted("version map truncated".into()));
            }
            let block = VersionBlock::empty();
            for (i, v) in block.versions.iter().enumerate() {
                v.store(raw[at + i], Ordering::Relaxed);
            }
            at += BLOCK;
            for (i, w) in block.tombstones.iter().enumerate() {
                w.store(
                    LittleEndian::read_u64(&raw[at + 8 * i..at + 8 * i + 8]),
                    Ordering::Relaxed,
                );
            }
            at += 8 * BLOCK_WORDS;
            blocks.push(Arc::new(block));
        }

        Ok(Self {
            blocks: RwLock::new(blocks),
            count: AtomicU32::new(count),
            max_capacity,
            grow_lock: Mutex::new(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_ids_are_live_at_version_zero() {
        let map = VersionMap::new(1 << 20);
        map.cover(10).unwrap();
        assert_eq!(map.version(3), 0);
        assert!(!map.is_deleted(3));
        assert!(map.check_valid(3, 0));
        assert!(!map.check_valid(3, 1));
    }

    #[test]
    fn delete_sets_tombstone_only() {
        let map = VersionMap::new(1 << 20);
        map.delete(5).unwrap();
        assert!(map.is_deleted(5));
        assert!(!map.is_deleted(4));
        assert_eq!(map.version(5), 0);
    }

    #[test]
    fn try_bump_is_a_cas() {
        let map = VersionMap::new(1 << 20);
        map.cover(0).unwrap();
        assert!(map.try_bump(0, 0));
        assert_eq!(map.version(0), 1);
        // re-running with the settled version is a no-op
        assert!(!map.try_bump(0, 0));
        assert_eq!(map.version(0), 1);
        assert!(map.try_bump(0, 1));
        assert_eq!(map.version(0), 2);
    }

    #[test]
    fn growth_crosses_block_boundaries() {
        let map = VersionMap::new(1 << 20);
        map.cover(BLOCK as u32 * 2 + 5).unwrap();
        assert_eq!(map.count() as usize, BLOCK * 2 + 6);
        assert!(map.try_bump(BLOCK as u32 * 2 + 5, 0));
    }

    #[test]
    fn overflow_is_fatal() {
        let map = VersionMap::new(100);
        assert!(map.cover(99).is_ok());
        assert!(matches!(
            map.cover(100),
            Err(CanopyError::MemoryOverflow)
        ));
    }

    #[test]
    fn image_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("versions.bin");

        let map = VersionMap::new(1 << 20);
        map.cover(BLOCK as u32 + 1).unwrap();
        map.try_bump(7, 0);
        map.try_bump(7, 1);
        map.delete(9).unwrap();
        map.save(&path).unwrap();

        let back = VersionMap::load(&path, 1 << 20).unwrap();
        assert_eq!(back.count(), map.count());
        assert_eq!(back.version(7), 2);
        assert!(back.is_deleted(9));
        assert!(!back.is_deleted(7));
    }
}
