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

//! Head-index adapter.
//!
//! The in-memory centroid index is an external collaborator; the update
//! engine talks to it only through [`HeadIndex`]. The in-tree default,
//! [`FlatHeadIndex`], is a lock-guarded brute-force scan that is perfectly
//! adequate for the head counts a single index shard carries. Centroid ids
//! come from the same [`IdAllocator`] that hands out vector ids, so heads
//! and vectors share one dense id space.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;

use canopy_core::{distance, CanopyError, DistanceKind, HeadId, Result};

/// Monotonic source of dense 32-bit ids shared by vectors and heads.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Next id that would be handed out.
    pub fn current(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    /// Move the counter forward to at least `floor` (load path).
    pub fn advance_to(&self, floor: u32) {
        self.next.fetch_max(floor, Ordering::Relaxed);
    }
}

/// Seam to the in-memory centroid index.
///
/// Implementations must be internally synchronized: centroid add/delete is
/// called from split workers while searches run from reader threads.
pub trait HeadIndex: Send + Sync {
    /// Nearest heads to `query`, closest first.
    fn search(&self, query: &[f32], k: usize) -> Vec<(HeadId, f32)>;

    /// Install a new centroid, allocating its id from the shared counter.
    fn add(&self, payload: Vec<f32>) -> HeadId;

    fn remove(&self, head: HeadId);

    fn contains(&self, head: HeadId) -> bool;

    /// Sample access to the centroid payload.
    fn payload(&self, head: HeadId) -> Option<Vec<f32>>;

    fn head_count(&self) -> usize;

    /// All live head ids, ascending.
    fn head_ids(&self) -> Vec<HeadId>;
}

/// Brute-force head index guarded by a single rw-lock.
pub struct FlatHeadIndex {
    kind: DistanceKind,
    ids: Arc<IdAllocator>,
    heads: RwLock<HashMap<HeadId, Vec<f32>>>,
}

impl FlatHeadIndex {
    pub fn new(kind: DistanceKind, ids: Arc<IdAllocator>) -> Self {
        Self {
            kind,
            ids,
            heads: RwLock::new(HashMap::new()),
        }
    }

    /// Reinstall a head under a known id (load path).
    pub fn insert_with_id(&self, head: HeadId, payload: Vec<f32>) {
        self.ids.advance_to(head + 1);
        self.heads.write().insert(head, payload);
    }
}

impl HeadIndex for FlatHeadIndex {
    fn search(&self, query: &[f32], k: usize) -> Vec<(HeadId, f32)> {
        let heads = self.heads.read();
        let mut scored: Vec<(HeadId, f32)> = heads
            .iter()
            .map(|(&head, payload)| (head, distance(self.kind, query, payload)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    fn add(&self, payload: Vec<f32>) -> HeadId {
        let head = self.ids.allocate();
        self.heads.write().insert(head, payload);
        head
    }

    fn remove(&self, head: HeadId) {
        self.heads.write().remove(&head);
    }

    fn contains(&self, head: HeadId) -> bool {
        self.heads.read().contains_key(&head)
    }

    fn payload(&self, head: HeadId) -> Option<Vec<f32>> {
        self.heads.read().get(&head).cloned()
    }

    fn head_count(&self) -> usize {
        self.heads.read().len()
    }

    fn head_ids(&self) -> Vec<HeadId> {
        let mut ids: Vec<HeadId> = self.heads.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

// ============================================================================
// Head files
// ============================================================================

const HEAD_VECTOR_MAGIC: [u8; 4] = *b"CHDV";

/// Write the head-id file: one `u64` per head, ascending, length = head count.
pub fn save_head_ids(index: &dyn HeadIndex, path: impl AsRef<Path>) -> Result<()> {
    let ids = index.head_ids();
    let mut buf = Vec::with_capacity(8 * ids.len());
    let mut word = [0u8; 8];
    for head in ids {
        LittleEndian::write_u64(&mut word, head as u64);
        buf.extend_from_slice(&word);
    }
    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

pub fn load_head_ids(path: impl AsRef<Path>) -> Result<Vec<u64>> {
    let mut raw = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut raw)?;
    if raw.len() % 8 != 0 {
        return Err(CanopyError::Corrupted(format!(
            "head-id file {} has odd length {}",
            path.as_ref().display(),
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(8)
        .map(LittleEndian::read_u64)
        .collect())
}

/// Write centroid payloads aligned with the head-id file order.
pub fn save_head_payloads(
    index: &dyn HeadIndex,
    dim: usize,
    path: impl AsRef<Path>,
) -> Result<()> {
    let ids = index.head_ids();
    let mut buf = Vec::with_capacity(12 + ids.len() * 4 * dim);
    buf.extend_from_slice(&HEAD_VECTOR_MAGIC);
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, ids.len() as u32);
    buf.extend_from_slice(&word);
    LittleEndian::write_u32(&mut word, dim as u32);
    buf.extend_from_slice(&word);
    for head in ids {
        let payload = index.payload(head).ok_or_else(|| {
            CanopyError::Internal(format!("head {} vanished during save", head))
        })?;
        let base = buf.len();
        buf.resize(base + 4 * dim, 0);
        LittleEndian::write_f32_into(&payload, &mut buf[base..]);
    }
    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

/// Rebuild a [`FlatHeadIndex`] from the head-id and payload files.
pub fn load_flat_head_index(
    kind: DistanceKind,
    ids: Arc<IdAllocator>,
    id_path: impl AsRef<Path>,
    payload_path: impl AsRef<Path>,
) -> Result<FlatHeadIndex> {
    let head_ids = load_head_ids(id_path)?;

    let mut raw = Vec::new();
    File::open(payload_path.as_ref())?.read_to_end(&mut raw)?;
    if raw.len() < 12 || raw[0..4] != HEAD_VECTOR_MAGIC {
        return Err(CanopyError::Corrupted("bad head payload header".into()));
    }
    let count = LittleEndian::read_u32(&raw[4..8]) as usize;
    let dim = LittleEndian::read_u32(&raw[8..12]) as usize;
    if count != head_ids.len() {
        return Err(CanopyError::Corrupted(format!(
            "head payload count {} disagrees with id file count {}",
            count,
            head_ids.len()
        )));
    }
    if raw.len() != 12 + count * 4 * dim {
        return Err(CanopyError::Corrupted("head payload file truncated".into()));
    }

    let index = FlatHeadIndex::new(kind, ids);
    for (i, &head) in head_ids.iter().enumerate() {
        let at = 12 + i * 4 * dim;
        let mut payload = vec![0f32; dim];
        LittleEndian::read_f32_into(&raw[at..at + 4 * dim], &mut payload);
        index.insert_with_id(head as HeadId, payload);
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn flat() -> FlatHeadIndex {
        FlatHeadIndex::new(DistanceKind::L2, Arc::new(IdAllocator::new()))
    }

    #[test]
    fn add_search_remove() {
        let index = flat();
        let a = index.add(vec![0.0, 0.0]);
        let b = index.add(vec![10.0, 0.0]);
        assert_eq!(index.head_count(), 2);

        let hits = index.search(&[1.0, 0.0], 2);
        assert_eq!(hits[0].0, a);
        assert_eq!(hits[1].0, b);

        index.remove(a);
        assert!(!index.contains(a));
        assert!(index.contains(b));
        assert_eq!(index.search(&[1.0, 0.0], 2).len(), 1);
    }

    #[test]
    fn ids_are_shared_and_monotonic() {
        let ids = Arc::new(IdAllocator::new());
        let index = FlatHeadIndex::new(DistanceKind::L2, ids.clone());
        let h0 = index.add(vec![0.0]);
        let v0 = ids.allocate();
        let h1 = index.add(vec![1.0]);
        assert!(h0 < v0 && v0 < h1);
    }

    #[test]
    fn search_ties_break_by_id() {
        let index = flat();
        let a = index.add(vec![1.0, 0.0]);
        let b = index.add(vec![-1.0, 0.0]);
        let hits = index.search(&[0.0, 0.0], 2);
        assert_eq!(hits[0].0, a.min(b));
        assert_eq!(hits[1].0, a.max(b));
    }

    #[test]
    fn head_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let ids = Arc::new(IdAllocator::new());
        let index = FlatHeadIndex::new(DistanceKind::L2, ids);
        index.add(vec![1.0, 2.0, 3.0]);
        ids_gap(&index);
        index.add(vec![4.0, 5.0, 6.0]);

        let id_path = dir.path().join("heads.ids");
        let vec_path = dir.path().join("heads.vec");
        save_head_ids(&index, &id_path).unwrap();
        save_head_payloads(&index, 3, &vec_path).unwrap();

        let loaded = load_flat_head_index(
            DistanceKind::L2,
            Arc::new(IdAllocator::new()),
            &id_path,
            &vec_path,
        )
        .unwrap();
        assert_eq!(loaded.head_ids(), index.head_ids());
        for head in index.head_ids() {
            assert_eq!(loaded.payload(head), index.payload(head));
        }
    }

    // burn an id so the saved ids are non-contiguous
    fn ids_gap(index: &FlatHeadIndex) {
        index.ids.allocate();
    }
}
