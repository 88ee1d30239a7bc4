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

//! The index facade.
//!
//! `CanopyIndex` owns every service (store, log, head index, version map,
//! dispatcher, worker pools) and tears them down bottom-up on drop. User
//! writes go through the assignment log only; the background engine applies
//! them. Reads are lock-light and can run at full concurrency.
//!
//! ## Persistence layout
//!
//! ```text
//! <dir>/index.json        config + dispatcher cursor + id counter
//! <dir>/heads.ids         u64 head id per entry
//! <dir>/heads.vec         centroid payloads, aligned with heads.ids
//! <dir>/ssdinfo.bin       vector count + posting sizes
//! <dir>/versions.bin      version map image
//! <dir>/assignments.log   durable assignment log (block-backed deployments)
//! <dir>/postings.kv|blk   posting store
//! <dir>/translate.bin     optional, immutable deployments only
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use canopy_core::{
    normalize, CanopyError, DistanceKind, HeadId, IndexConfig, Result, VectorId, VectorRecord,
};
use canopy_storage::{
    Assignment, AssignmentLog, BlockPostingStore, KvPostingStore, PostingStore, ReplicaAssignment,
};

use crate::dispatcher::Dispatcher;
use crate::engine::{IndexInner, IndexStats};
use crate::head::{
    load_flat_head_index, save_head_ids, save_head_payloads, FlatHeadIndex, HeadIndex, IdAllocator,
};
use crate::posting_sizes::{load_ssd_info, save_ssd_info, PostingSizeTable};
use crate::search::Neighbor;
use crate::selection::select_replicas;
use crate::version_map::VersionMap;

const META_FILE: &str = "index.json";
const HEAD_ID_FILE: &str = "heads.ids";
const HEAD_VECTOR_FILE: &str = "heads.vec";
const SSD_INFO_FILE: &str = "ssdinfo.bin";
const VERSION_MAP_FILE: &str = "versions.bin";
const ASSIGNMENT_LOG_FILE: &str = "assignments.log";
const KV_STORE_FILE: &str = "postings.kv";
const BLOCK_STORE_FILE: &str = "postings.blk";
const TRANSLATE_FILE: &str = "translate.bin";

#[derive(Serialize, Deserialize)]
struct IndexMeta {
    config: IndexConfig,
    /// First unconsumed assignment id at save time.
    consumed: u64,
    /// Shared id counter at save time.
    next_id: u32,
}

/// A streaming, updatable, disk-backed ANN index.
pub struct CanopyIndex {
    inner: Arc<IndexInner>,
    dispatcher: Option<Dispatcher>,
    translate: Option<Vec<u64>>,
    search_pool: rayon::ThreadPool,
}

impl CanopyIndex {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Build an ephemeral index (in-memory KV backend and log).
    pub fn build(config: IndexConfig, vectors: &[Vec<f32>]) -> Result<Self> {
        Self::build_with_parts(
            config,
            vectors,
            PostingStore::Kv(KvPostingStore::in_memory()),
            AssignmentLog::in_memory(),
        )
    }

    /// Build a durable index in `dir` (block-store backend, file log).
    pub fn build_in(config: IndexConfig, vectors: &[Vec<f32>], dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Self::build_with_parts(
            config,
            vectors,
            PostingStore::Block(BlockPostingStore::open(dir.join(BLOCK_STORE_FILE))?),
            AssignmentLog::open(dir.join(ASSIGNMENT_LOG_FILE))?,
        )
    }

    fn build_with_parts(
        config: IndexConfig,
        vectors: &[Vec<f32>],
        store: PostingStore,
        log: AssignmentLog,
    ) -> Result<Self> {
        if vectors.is_empty() {
            return Err(CanopyError::EmptyData);
        }
        if config.dim == 0 {
            return Err(CanopyError::InvalidArgument("dim must be set".into()));
        }
        for v in vectors {
            if v.len() != config.dim {
                return Err(CanopyError::InvalidArgument(format!(
                    "vector dimension {} != configured {}",
                    v.len(),
                    config.dim
                )));
            }
        }

        let kind = config.distance;
        let mut data: Vec<Vec<f32>> = vectors.to_vec();
        if kind == DistanceKind::Cosine {
            for v in data.iter_mut() {
                normalize(v);
            }
        }

        let ids = Arc::new(IdAllocator::new());
        let heads = FlatHeadIndex::new(kind, ids.clone());

        // Random head selection at the configured ratio.
        let n = data.len();
        let head_count = ((config.head_ratio * n as f64).round() as usize).clamp(1, n);
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut thread_rng());
        for &i in order.iter().take(head_count) {
            heads.add(data[i].clone());
        }
        info!(vectors = n, heads = head_count, "initial head selection done");

        let inner = IndexInner::new(
            config.clone(),
            store,
            log,
            Box::new(heads),
            VersionMap::new(config.max_vector_count),
            PostingSizeTable::new(),
            ids,
        );

        // Assign the build set directly to postings, bypassing the log.
        let mut grouped: HashMap<HeadId, (u32, Vec<u8>)> = HashMap::new();
        for payload in &data {
            let vid = inner.ids.allocate();
            inner.versions.cover(vid)?;
            let candidates = inner.heads.search(payload, config.internal_result_num);
            let selected = select_replicas(
                inner.heads.as_ref(),
                kind,
                &candidates,
                config.replica_count,
                1.0,
            );
            for &(head, _) in selected.iter() {
                let (count, blob) = grouped.entry(head).or_default();
                VectorRecord {
                    vid,
                    version: 0,
                    payload: payload.clone(),
                }
                .encode_into(blob);
                *count += 1;
            }
        }
        for (head, (count, blob)) in grouped {
            inner.store.put(head, &blob)?;
            inner.sizes.store(head, count);
        }

        inner.start_workers();
        let start_from = inner.log.next_id();
        let dispatcher = Dispatcher::start(Arc::downgrade(&inner), start_from);

        Ok(Self {
            search_pool: build_search_pool(&inner.config)?,
            inner,
            dispatcher: Some(dispatcher),
            translate: None,
        })
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Snapshot the index into `dir`. Background work is drained first so
    /// the snapshot is internally consistent.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.drain();

        save_head_ids(self.inner.heads.as_ref(), dir.join(HEAD_ID_FILE))?;
        save_head_payloads(
            self.inner.heads.as_ref(),
            self.inner.config.dim,
            dir.join(HEAD_VECTOR_FILE),
        )?;
        self.inner.versions.save(dir.join(VERSION_MAP_FILE))?;
        save_ssd_info(
            &self.inner.sizes,
            self.inner.ids.current() as i32,
            self.inner.ids.current(),
            dir.join(SSD_INFO_FILE),
        )?;
        match &self.inner.store {
            PostingStore::Kv(kv) => kv.export(&dir.join(KV_STORE_FILE))?,
            // arena and manifest already live in the index directory
            PostingStore::Block(block) => block.flush()?,
        }

        let meta = IndexMeta {
            config: self.inner.config.clone(),
            consumed: self
                .dispatcher
                .as_ref()
                .map(|d| d.consumed())
                .unwrap_or_default(),
            next_id: self.inner.ids.current(),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| CanopyError::Internal(format!("meta encode: {}", e)))?;
        std::fs::write(dir.join(META_FILE), json)?;
        info!(dir = %dir.display(), "index saved");
        Ok(())
    }

    /// Load a saved index and resume the update engine.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let (inner, meta) = Self::load_parts(dir.as_ref())?;
        inner.start_workers();
        let start_from = meta.consumed.min(inner.log.next_id());
        let dispatcher = Dispatcher::start(Arc::downgrade(&inner), start_from);
        Ok(Self {
            search_pool: build_search_pool(&inner.config)?,
            inner,
            dispatcher: Some(dispatcher),
            translate: None,
        })
    }

    /// Load a saved index read-only: no dispatcher, no worker pools, updates
    /// rejected. The optional translate map (original insertion ids) is
    /// applied to search results.
    pub fn load_immutable(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let (inner, _meta) = Self::load_parts(dir)?;
        let translate_path = dir.join(TRANSLATE_FILE);
        let translate = if translate_path.exists() {
            let mut raw = Vec::new();
            File::open(&translate_path)?.read_to_end(&mut raw)?;
            if raw.len() % 8 != 0 {
                return Err(CanopyError::Corrupted("translate map has odd length".into()));
            }
            Some(raw.chunks_exact(8).map(LittleEndian::read_u64).collect())
        } else {
            None
        };
        Ok(Self {
            search_pool: build_search_pool(&inner.config)?,
            inner,
            dispatcher: None,
            translate,
        })
    }

    fn load_parts(dir: &Path) -> Result<(Arc<IndexInner>, IndexMeta)> {
        let raw = std::fs::read(dir.join(META_FILE))?;
        let meta: IndexMeta = serde_json::from_slice(&raw)
            .map_err(|e| CanopyError::Corrupted(format!("meta decode: {}", e)))?;
        let config = meta.config.clone();

        let kv_path = dir.join(KV_STORE_FILE);
        let store = if kv_path.exists() {
            PostingStore::Kv(KvPostingStore::open(kv_path)?)
        } else {
            PostingStore::Block(BlockPostingStore::open(dir.join(BLOCK_STORE_FILE))?)
        };
        let log = AssignmentLog::open(dir.join(ASSIGNMENT_LOG_FILE))?;

        let ids = Arc::new(IdAllocator::new());
        ids.advance_to(meta.next_id);
        let heads = load_flat_head_index(
            config.distance,
            ids.clone(),
            dir.join(HEAD_ID_FILE),
            dir.join(HEAD_VECTOR_FILE),
        )?;
        let versions = VersionMap::load(dir.join(VERSION_MAP_FILE), config.max_vector_count)?;
        let (_vector_count, sizes) = load_ssd_info(dir.join(SSD_INFO_FILE))?;

        let inner = IndexInner::new(
            config,
            store,
            log,
            Box::new(heads),
            versions,
            sizes,
            ids,
        );
        info!(dir = %dir.display(), heads = inner.heads.head_count(), "index loaded");
        Ok((inner, meta))
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Queue vectors for insertion; returns their ids. Durable once this
    /// returns; visible once the dispatcher applies them.
    pub fn add(&self, vectors: &[Vec<f32>]) -> Result<Vec<VectorId>> {
        if self.dispatcher.is_none() {
            return Err(CanopyError::Immutable);
        }
        if vectors.is_empty() {
            return Err(CanopyError::EmptyData);
        }
        let config = &self.inner.config;
        let mut vids = Vec::with_capacity(vectors.len());
        for vector in vectors {
            if vector.len() != config.dim {
                return Err(CanopyError::InvalidArgument(format!(
                    "vector dimension {} != configured {}",
                    vector.len(),
                    config.dim
                )));
            }
            let mut payload = vector.clone();
            if config.distance == DistanceKind::Cosine {
                normalize(&mut payload);
            }

            let vid = self.inner.ids.allocate();
            self.inner.versions.cover(vid)?;

            let candidates = self.inner.heads.search(&payload, config.internal_result_num);
            let selected = select_replicas(
                self.inner.heads.as_ref(),
                config.distance,
                &candidates,
                config.replica_count,
                1.0,
            );
            let replicas = selected
                .iter()
                .map(|&(head, _)| ReplicaAssignment {
                    head,
                    vid,
                    version: 0,
                    payload: payload.clone(),
                })
                .collect();
            self.inner
                .log
                .append(&Assignment::Insert { replicas }.encode())?;
            vids.push(vid);
        }
        Ok(vids)
    }

    /// Queue a delete. The tombstone is set when the dispatcher applies it;
    /// stale records are physically collected at the next split.
    pub fn delete(&self, vid: VectorId) -> Result<()> {
        if self.dispatcher.is_none() {
            return Err(CanopyError::Immutable);
        }
        self.inner.log.append(&Assignment::Delete { vid }.encode())?;
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Top-k similarity search.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_with_ratio(query, k, self.inner.config.max_dist_ratio)
    }

    /// Top-k with an explicit candidate-pruning ratio (recall/latency knob).
    pub fn search_with_ratio(
        &self,
        query: &[f32],
        k: usize,
        max_dist_ratio: f32,
    ) -> Result<Vec<Neighbor>> {
        let mut results = self
            .search_pool
            .install(|| self.inner.search_with_ratio(query, k, max_dist_ratio))?;
        if let Some(map) = &self.translate {
            for neighbor in results.iter_mut() {
                if let Some(&original) = map.get(neighbor.vid as usize) {
                    neighbor.vid = original as VectorId;
                }
            }
        }
        Ok(results)
    }

    // ========================================================================
    // Maintenance & introspection
    // ========================================================================

    /// Block until the dispatcher has consumed the log and both pools are
    /// idle. Two consecutive clean polls guard against jobs enqueued by a
    /// job that was finishing during the first poll.
    pub fn drain(&self) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let mut clean = 0;
        loop {
            let settled = !dispatcher.is_busy()
                && dispatcher.consumed() >= self.inner.log.next_id()
                && self.inner.pools_idle();
            if settled {
                clean += 1;
                if clean >= 2 {
                    return;
                }
            } else {
                clean = 0;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn stats(&self) -> IndexStats {
        self.inner.stats()
    }

    pub fn head_count(&self) -> usize {
        self.inner.heads.head_count()
    }

    pub fn head_ids(&self) -> Vec<HeadId> {
        self.inner.heads.head_ids()
    }

    /// Ids handed out so far (vectors and heads share the counter).
    pub fn id_watermark(&self) -> u32 {
        self.inner.ids.current()
    }

    /// Raw `(vid, version)` pairs in a head's posting, stale records
    /// included. Diagnostics and invariant checks.
    pub fn posting_records(&self, head: HeadId) -> Result<Vec<(VectorId, u8)>> {
        self.inner.posting_records(head)
    }

    /// Posting length as tracked by the size table.
    pub fn posting_size(&self, head: HeadId) -> u32 {
        self.inner.sizes.get(head)
    }

    pub fn current_version(&self, vid: VectorId) -> u8 {
        self.inner.versions.version(vid)
    }

    pub fn is_deleted(&self, vid: VectorId) -> bool {
        self.inner.versions.is_deleted(vid)
    }
}

impl Drop for CanopyIndex {
    fn drop(&mut self) {
        // Teardown is bottom-up: stop feeding work, drain the pools, then
        // flush storage.
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.stop();
        }
        self.inner.shutdown_workers();
        let _ = self.inner.store.flush();
    }
}

fn build_search_pool(config: &IndexConfig) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(config.search_thread_num.max(1))
        .thread_name(|i| format!("canopy-search-{}", i))
        .build()
        .map_err(|e| CanopyError::Internal(format!("search pool: {}", e)))
}
