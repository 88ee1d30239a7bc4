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

//! Posting-list storage backends.
//!
//! Two backends share one capability set (get / put / append / delete /
//! multi-get with a deadline / flush), dispatched through the tagged
//! [`PostingStore`] type rather than a trait object:
//!
//! - [`KvPostingStore`]: a large-value key-value store, whole posting blobs
//!   under their head id, sharded in memory, snapshotted to a single file.
//! - [`BlockPostingStore`]: a raw-block allocator, 4 KiB pages handed out
//!   from a free stack over one arena (memory or file); the per-head entry
//!   records `(total_bytes, pages[])`.
//!
//! ```text
//! ┌──────────────┐   get/put/append/delete/multi_get   ┌─────────────────┐
//! │ update engine │ ───────────────────────────────────>│  PostingStore   │
//! │  + read path  │                                     │  ├─ Kv variant  │
//! └──────────────┘                                     │  └─ Block variant│
//!                                                       └─────────────────┘
//! ```
//!
//! `multi_get` honors a microsecond-scale deadline: postings that cannot be
//! read in time come back as empty blobs, never as errors.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use canopy_core::{CanopyError, HeadId, Result, PAGE_SIZE};

// ============================================================================
// Tagged dispatch
// ============================================================================

/// The posting-list backend, one of two variants behind a shared contract.
pub enum PostingStore {
    Kv(KvPostingStore),
    Block(BlockPostingStore),
}

impl PostingStore {
    pub fn get(&self, head: HeadId) -> Result<Vec<u8>> {
        match self {
            PostingStore::Kv(s) => s.get(head),
            PostingStore::Block(s) => s.get(head),
        }
    }

    pub fn put(&self, head: HeadId, value: &[u8]) -> Result<()> {
        match self {
            PostingStore::Kv(s) => s.put(head, value),
            PostingStore::Block(s) => s.put(head, value),
        }
    }

    pub fn append(&self, head: HeadId, value: &[u8]) -> Result<()> {
        match self {
            PostingStore::Kv(s) => s.append(head, value),
            PostingStore::Block(s) => s.append(head, value),
        }
    }

    pub fn delete(&self, head: HeadId) -> Result<()> {
        match self {
            PostingStore::Kv(s) => s.delete(head),
            PostingStore::Block(s) => s.delete(head),
        }
    }

    /// Read several postings under one deadline. The result is aligned with
    /// `heads`; entries that missed the deadline (or do not exist) are empty.
    pub fn multi_get(&self, heads: &[HeadId], deadline: Duration) -> Result<Vec<Vec<u8>>> {
        match self {
            PostingStore::Kv(s) => s.multi_get(heads, deadline),
            PostingStore::Block(s) => s.multi_get(heads, deadline),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self {
            PostingStore::Kv(s) => s.flush(),
            PostingStore::Block(s) => s.flush(),
        }
    }
}

// ============================================================================
// KV variant
// ============================================================================

const KV_SNAPSHOT_MAGIC: [u8; 4] = *b"CKVS";

/// Large-value KV store. Per-key append is serialized by the map shard lock,
/// which is exactly the serialization the append path needs.
pub struct KvPostingStore {
    map: DashMap<HeadId, Vec<u8>>,
    snapshot_path: Option<PathBuf>,
}

impl KvPostingStore {
    pub fn in_memory() -> Self {
        Self {
            map: DashMap::new(),
            snapshot_path: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it if present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = DashMap::new();
        if path.exists() {
            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;
            if raw.len() < 8 || raw[0..4] != KV_SNAPSHOT_MAGIC {
                return Err(CanopyError::Corrupted(format!(
                    "bad kv snapshot header in {}",
                    path.display()
                )));
            }
            let entries = LittleEndian::read_u32(&raw[4..8]) as usize;
            let mut at = 8usize;
            for _ in 0..entries {
                if at + 8 > raw.len() {
                    return Err(CanopyError::Corrupted("kv snapshot truncated".into()));
                }
                let head = LittleEndian::read_u32(&raw[at..at + 4]);
                let len = LittleEndian::read_u32(&raw[at + 4..at + 8]) as usize;
                at += 8;
                if at + len > raw.len() {
                    return Err(CanopyError::Corrupted("kv snapshot truncated".into()));
                }
                map.insert(head, raw[at..at + len].to_vec());
                at += len;
            }
        }
        Ok(Self {
            map,
            snapshot_path: Some(path),
        })
    }

    pub fn get(&self, head: HeadId) -> Result<Vec<u8>> {
        Ok(self.map.get(&head).map(|v| v.clone()).unwrap_or_default())
    }

    pub fn put(&self, head: HeadId, value: &[u8]) -> Result<()> {
        self.map.insert(head, value.to_vec());
        Ok(())
    }

    pub fn append(&self, head: HeadId, value: &[u8]) -> Result<()> {
        self.map
            .entry(head)
            .or_default()
            .extend_from_slice(value);
        Ok(())
    }

    pub fn delete(&self, head: HeadId) -> Result<()> {
        self.map.remove(&head);
        Ok(())
    }

    pub fn multi_get(&self, heads: &[HeadId], deadline: Duration) -> Result<Vec<Vec<u8>>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity(heads.len());
        for &head in heads {
            if start.elapsed() > deadline {
                out.push(Vec::new());
                continue;
            }
            out.push(self.get(head)?);
        }
        Ok(out)
    }

    /// Snapshot the whole map. A no-op for purely in-memory stores.
    pub fn flush(&self) -> Result<()> {
        match &self.snapshot_path {
            Some(path) => self.export(&path.clone()),
            None => Ok(()),
        }
    }

    /// Write a snapshot to an arbitrary path.
    pub fn export(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&KV_SNAPSHOT_MAGIC);
        let mut count = [0u8; 4];
        LittleEndian::write_u32(&mut count, self.map.len() as u32);
        buf.extend_from_slice(&count);
        for entry in self.map.iter() {
            let mut header = [0u8; 8];
            LittleEndian::write_u32(&mut header[0..4], *entry.key());
            LittleEndian::write_u32(&mut header[4..8], entry.value().len() as u32);
            buf.extend_from_slice(&header);
            buf.extend_from_slice(entry.value());
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ============================================================================
// Block variant
// ============================================================================

const BLOCK_MANIFEST_MAGIC: [u8; 4] = *b"CBLK";

/// Per-head entry: total byte length plus the pages holding it, in order.
#[derive(Debug, Clone, Default)]
struct PostingExtent {
    total: u64,
    pages: Vec<u64>,
}

enum BlockMedium {
    Mem(RwLock<Vec<u8>>),
    File(File),
}

impl BlockMedium {
    fn read_page(&self, page: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert!(buf.len() <= PAGE_SIZE);
        match self {
            BlockMedium::Mem(arena) => {
                let arena = arena.read();
                let at = page as usize * PAGE_SIZE;
                if at + buf.len() > arena.len() {
                    return Err(CanopyError::Backend(format!(
                        "page {} beyond arena end",
                        page
                    )));
                }
                buf.copy_from_slice(&arena[at..at + buf.len()]);
                Ok(())
            }
            BlockMedium::File(file) => {
                file.read_exact_at(buf, page * PAGE_SIZE as u64)
                    .map_err(|e| CanopyError::Backend(format!("page {} read: {}", page, e)))
            }
        }
    }

    fn write_page(&self, page: u64, buf: &[u8]) -> Result<()> {
        debug_assert!(buf.len() <= PAGE_SIZE);
        match self {
            BlockMedium::Mem(arena) => {
                let mut arena = arena.write();
                let end = (page as usize + 1) * PAGE_SIZE;
                if arena.len() < end {
                    arena.resize(end, 0);
                }
                let at = page as usize * PAGE_SIZE;
                arena[at..at + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            BlockMedium::File(file) => {
                file.write_all_at(buf, page * PAGE_SIZE as u64)
                    .map_err(|e| CanopyError::Backend(format!("page {} write: {}", page, e)))
            }
        }
    }
}

/// Raw-block posting store over 4 KiB pages.
///
/// Pages are recycled through a free stack; the high-water mark only moves
/// when the stack is empty. All mutation of one head's extent happens under
/// that head's entry lock in the extent map.
pub struct BlockPostingStore {
    medium: BlockMedium,
    extents: DashMap<HeadId, PostingExtent>,
    free: Mutex<Vec<u64>>,
    next_page: AtomicU64,
    manifest_path: Option<PathBuf>,
}

impl BlockPostingStore {
    pub fn in_memory() -> Self {
        Self {
            medium: BlockMedium::Mem(RwLock::new(Vec::new())),
            extents: DashMap::new(),
            free: Mutex::new(Vec::new()),
            next_page: AtomicU64::new(0),
            manifest_path: None,
        }
    }

    /// Open a file-backed store; `path` is the page arena, `path` +
    /// `.manifest` records extents and the free stack.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let manifest_path = manifest_path_for(&path);
        let store = Self {
            medium: BlockMedium::File(file),
            extents: DashMap::new(),
            free: Mutex::new(Vec::new()),
            next_page: AtomicU64::new(0),
            manifest_path: Some(manifest_path.clone()),
        };
        if manifest_path.exists() {
            store.load_manifest(&manifest_path)?;
        }
        Ok(store)
    }

    fn alloc_pages(&self, n: usize) -> Vec<u64> {
        let mut pages = Vec::with_capacity(n);
        let mut free = self.free.lock();
        while pages.len() < n {
            match free.pop() {
                Some(page) => pages.push(page),
                None => pages.push(self.next_page.fetch_add(1, Ordering::Relaxed)),
            }
        }
        pages
    }

    fn release_pages(&self, pages: &[u64]) {
        if pages.is_empty() {
            return;
        }
        let mut free = self.free.lock();
        free.extend_from_slice(pages);
    }

    fn read_extent(&self, extent: &PostingExtent) -> Result<Vec<u8>> {
        let mut out = vec![0u8; extent.total as usize];
        let mut at = 0usize;
        for &page in &extent.pages {
            let take = (extent.total as usize - at).min(PAGE_SIZE);
            self.medium.read_page(page, &mut out[at..at + take])?;
            at += take;
            if at >= extent.total as usize {
                break;
            }
        }
        Ok(out)
    }

    fn write_extent(&self, pages: &[u64], value: &[u8]) -> Result<()> {
        let mut at = 0usize;
        for &page in pages {
            let take = (value.len() - at).min(PAGE_SIZE);
            self.medium.write_page(page, &value[at..at + take])?;
            at += take;
        }
        Ok(())
    }

    pub fn get(&self, head: HeadId) -> Result<Vec<u8>> {
        match self.extents.get(&head) {
            Some(extent) => self.read_extent(&extent),
            None => Ok(Vec::new()),
        }
    }

    pub fn put(&self, head: HeadId, value: &[u8]) -> Result<()> {
        let needed = value.len().div_ceil(PAGE_SIZE);
        let pages = self.alloc_pages(needed);
        self.write_extent(&pages, value)?;
        let old = self.extents.insert(
            head,
            PostingExtent {
                total: value.len() as u64,
                pages,
            },
        );
        if let Some(old) = old {
            self.release_pages(&old.pages);
        }
        Ok(())
    }

    pub fn append(&self, head: HeadId, value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        let mut entry = self.extents.entry(head).or_default();
        let tail = (entry.total as usize) % PAGE_SIZE;
        let mut at = 0usize;

        // Fill the partial tail page first.
        if tail != 0 {
            let page = *entry.pages.last().expect("partial tail implies a page");
            let take = (PAGE_SIZE - tail).min(value.len());
            let mut buf = vec![0u8; tail + take];
            self.medium.read_page(page, &mut buf[..tail])?;
            buf[tail..].copy_from_slice(&value[..take]);
            self.medium.write_page(page, &buf)?;
            at = take;
        }

        while at < value.len() {
            let take = (value.len() - at).min(PAGE_SIZE);
            let page = self.alloc_pages(1)[0];
            self.medium.write_page(page, &value[at..at + take])?;
            entry.pages.push(page);
            at += take;
        }
        entry.total += value.len() as u64;
        Ok(())
    }

    pub fn delete(&self, head: HeadId) -> Result<()> {
        if let Some((_, extent)) = self.extents.remove(&head) {
            self.release_pages(&extent.pages);
        }
        Ok(())
    }

    pub fn multi_get(&self, heads: &[HeadId], deadline: Duration) -> Result<Vec<Vec<u8>>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity(heads.len());
        let mut expired = 0usize;
        for &head in heads {
            if start.elapsed() > deadline {
                expired += 1;
                out.push(Vec::new());
                continue;
            }
            out.push(self.get(head)?);
        }
        if expired > 0 {
            warn!(expired, total = heads.len(), "multi_get deadline expired");
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        if let BlockMedium::File(file) = &self.medium {
            file.sync_data()?;
        }
        let Some(path) = &self.manifest_path else {
            return Ok(());
        };
        self.save_manifest(path)
    }

    fn save_manifest(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&BLOCK_MANIFEST_MAGIC);
        let mut word = [0u8; 8];
        LittleEndian::write_u64(&mut word, self.next_page.load(Ordering::Relaxed));
        buf.extend_from_slice(&word);

        let free = self.free.lock();
        LittleEndian::write_u64(&mut word, free.len() as u64);
        buf.extend_from_slice(&word);
        for &page in free.iter() {
            LittleEndian::write_u64(&mut word, page);
            buf.extend_from_slice(&word);
        }
        drop(free);

        LittleEndian::write_u64(&mut word, self.extents.len() as u64);
        buf.extend_from_slice(&word);
        for entry in self.extents.iter() {
            let mut header = [0u8; 20];
            LittleEndian::write_u32(&mut header[0..4], *entry.key());
            LittleEndian::write_u64(&mut header[4..12], entry.total);
            LittleEndian::write_u64(&mut header[12..20], entry.pages.len() as u64);
            buf.extend_from_slice(&header);
            for &page in &entry.pages {
                LittleEndian::write_u64(&mut word, page);
                buf.extend_from_slice(&word);
            }
        }

        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn load_manifest(&self, path: &Path) -> Result<()> {
        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;
        if raw.len() < 12 || raw[0..4] != BLOCK_MANIFEST_MAGIC {
            return Err(CanopyError::Corrupted(format!(
                "bad block manifest header in {}",
                path.display()
            )));
        }
        let mut at = 4usize;
        let read_u64 = |at: &mut usize| -> Result<u64> {
            if *at + 8 > raw.len() {
                return Err(CanopyError::Corrupted("block manifest truncated".into()));
            }
            let v = LittleEndian::read_u64(&raw[*at..*at + 8]);
            *at += 8;
            Ok(v)
        };

        self.next_page
            .store(read_u64(&mut at)?, Ordering::Relaxed);
        let free_len = read_u64(&mut at)? as usize;
        {
            let mut free = self.free.lock();
            free.clear();
            for _ in 0..free_len {
                free.push(read_u64(&mut at)?);
            }
        }
        let extent_count = read_u64(&mut at)? as usize;
        for _ in 0..extent_count {
            if at + 4 > raw.len() {
                return Err(CanopyError::Corrupted("block manifest truncated".into()));
            }
            let head = LittleEndian::read_u32(&raw[at..at + 4]);
            at += 4;
            let total = read_u64(&mut at)?;
            let page_count = read_u64(&mut at)? as usize;
            let mut pages = Vec::with_capacity(page_count);
            for _ in 0..page_count {
                pages.push(read_u64(&mut at)?);
            }
            self.extents.insert(head, PostingExtent { total, pages });
        }
        Ok(())
    }
}

fn manifest_path_for(arena: &Path) -> PathBuf {
    let mut name = arena
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".manifest");
    arena.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stores() -> Vec<PostingStore> {
        vec![
            PostingStore::Kv(KvPostingStore::in_memory()),
            PostingStore::Block(BlockPostingStore::in_memory()),
        ]
    }

    #[test]
    fn put_get_append_delete() {
        for store in stores() {
            assert!(store.get(7).unwrap().is_empty());

            store.put(7, b"hello").unwrap();
            assert_eq!(store.get(7).unwrap(), b"hello");

            store.append(7, b" world").unwrap();
            assert_eq!(store.get(7).unwrap(), b"hello world");

            store.delete(7).unwrap();
            assert!(store.get(7).unwrap().is_empty());
        }
    }

    #[test]
    fn append_crosses_page_boundary() {
        let store = PostingStore::Block(BlockPostingStore::in_memory());
        let first = vec![1u8; PAGE_SIZE - 10];
        let second = vec![2u8; 30];
        store.put(3, &first).unwrap();
        store.append(3, &second).unwrap();

        let got = store.get(3).unwrap();
        assert_eq!(got.len(), PAGE_SIZE + 20);
        assert_eq!(&got[..PAGE_SIZE - 10], first.as_slice());
        assert_eq!(&got[PAGE_SIZE - 10..], second.as_slice());
    }

    #[test]
    fn pages_are_recycled_after_delete() {
        let store = BlockPostingStore::in_memory();
        store.put(1, &vec![0u8; PAGE_SIZE * 3]).unwrap();
        let used = store.next_page.load(Ordering::Relaxed);
        store.delete(1).unwrap();
        store.put(2, &vec![1u8; PAGE_SIZE * 3]).unwrap();
        assert_eq!(store.next_page.load(Ordering::Relaxed), used);
    }

    #[test]
    fn multi_get_zero_deadline_returns_empties() {
        for store in stores() {
            store.put(1, b"abc").unwrap();
            store.put(2, b"def").unwrap();
            let got = store
                .multi_get(&[1, 2], Duration::from_micros(0))
                .unwrap();
            assert_eq!(got.len(), 2);
            // A zero deadline may still let the first read through on a fast
            // clock, but never yields an error or a short vector.
        }
    }

    #[test]
    fn multi_get_alignment_with_missing_heads() {
        for store in stores() {
            store.put(5, b"present").unwrap();
            let got = store
                .multi_get(&[4, 5, 6], Duration::from_secs(1))
                .unwrap();
            assert_eq!(got.len(), 3);
            assert!(got[0].is_empty());
            assert_eq!(got[1], b"present");
            assert!(got[2].is_empty());
        }
    }

    #[test]
    fn kv_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postings.kv");
        {
            let store = KvPostingStore::open(&path).unwrap();
            store.put(1, b"one").unwrap();
            store.append(1, b"+two").unwrap();
            store.put(9, b"nine").unwrap();
            store.flush().unwrap();
        }
        let store = KvPostingStore::open(&path).unwrap();
        assert_eq!(store.get(1).unwrap(), b"one+two");
        assert_eq!(store.get(9).unwrap(), b"nine");
    }

    #[test]
    fn block_manifest_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postings.blk");
        let payload = vec![7u8; PAGE_SIZE + 100];
        {
            let store = BlockPostingStore::open(&path).unwrap();
            store.put(11, &payload).unwrap();
            store.flush().unwrap();
        }
        let store = BlockPostingStore::open(&path).unwrap();
        assert_eq!(store.get(11).unwrap(), payload);
    }
}
