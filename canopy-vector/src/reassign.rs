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

//! Post-split reassignment.
//!
//! A split displaces vectors: members of the two fresh postings whose old
//! centroid was closer than their new owner, and vectors in nearby postings
//! that are now closer to one of the new heads. Candidates are deduplicated
//! by vid (direct candidates win over neighbor candidates) and handed to the
//! reassign pool.
//!
//! The worker re-validates liveness, picks up to `replica_count` heads with
//! the RNG filter, bumps the version with a CAS (instantly staling every old
//! record), and appends the record at the new version. A CAS loss means a
//! concurrent reassignment settled the vector first; the job drops silently,
//! which is what makes duplicate reassign work idempotent.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, warn};

use canopy_core::{distance, HeadId, RecordCursor, Result, VectorId, VectorRecord};

use crate::engine::{AppendOrigin, AppendOutcome, IndexInner, ReassignJob};
use crate::head::HeadIndex;
use crate::selection::select_replicas;

impl IndexInner {
    /// Scan the fresh postings (and optionally the old centroid's nearest
    /// neighbors) for vectors whose placement a split has made stale.
    pub(crate) fn collect_reassign_candidates(
        &self,
        old_head: HeadId,
        old_payload: &[f32],
        new_heads: &[HeadId],
        new_blobs: &[Vec<u8>],
    ) -> Result<()> {
        let kind = self.distance_kind();
        let dim = self.config.dim;
        let new_payloads: Vec<Option<Vec<f32>>> =
            new_heads.iter().map(|&h| self.heads.payload(h)).collect();
        let mut pending: HashMap<VectorId, ReassignJob> = HashMap::new();

        // Direct candidates: members of the fresh postings that sat closer
        // to the old centroid than to their new owner.
        for (i, blob) in new_blobs.iter().enumerate() {
            let Some(owner_payload) = new_payloads[i].as_deref() else {
                continue;
            };
            for view in RecordCursor::new(blob, dim)? {
                if self.versions.is_deleted(view.vid)
                    || !self.versions.check_valid(view.vid, view.version)
                {
                    continue;
                }
                let payload = view.payload();
                let owner_dist = distance(kind, owner_payload, &payload);
                let prev_dist = distance(kind, old_payload, &payload);
                if prev_dist < owner_dist {
                    pending.insert(
                        view.vid,
                        ReassignJob {
                            vid: view.vid,
                            version: view.version,
                            prev_head: new_heads[i],
                            payload,
                        },
                    );
                }
            }
        }

        // Neighbor candidates: postings of the heads nearest the old
        // centroid may hold vectors now closer to one of the new heads.
        if self.config.reassign_k > 0 {
            let nearby = self
                .heads
                .search(old_payload, self.config.reassign_k + new_heads.len());
            let neighbor_heads: Vec<HeadId> = nearby
                .into_iter()
                .map(|(h, _)| h)
                .filter(|h| !new_heads.contains(h) && *h != old_head)
                .take(self.config.reassign_k)
                .collect();
            let deadline = Duration::from_micros(self.config.latency_limit_us);
            let blobs = self.store.multi_get(&neighbor_heads, deadline)?;

            for (&neighbor, blob) in neighbor_heads.iter().zip(blobs.iter()) {
                let Some(neighbor_payload) = self.heads.payload(neighbor) else {
                    continue;
                };
                for view in RecordCursor::new(blob, dim)? {
                    if pending.contains_key(&view.vid) {
                        continue;
                    }
                    if self.versions.is_deleted(view.vid)
                        || !self.versions.check_valid(view.vid, view.version)
                    {
                        continue;
                    }
                    let payload = view.payload();
                    let owner_dist = distance(kind, &neighbor_payload, &payload);
                    let best_new = new_payloads
                        .iter()
                        .flatten()
                        .map(|p| distance(kind, p, &payload))
                        .fold(f32::INFINITY, f32::min);
                    if best_new < owner_dist {
                        pending.insert(
                            view.vid,
                            ReassignJob {
                                vid: view.vid,
                                version: view.version,
                                prev_head: neighbor,
                                payload,
                            },
                        );
                    }
                }
            }
        }

        if !pending.is_empty() {
            debug!(
                old_head,
                candidates = pending.len(),
                "queueing reassignment candidates"
            );
        }
        for (_, job) in pending {
            self.submit_reassign(job);
        }
        Ok(())
    }

    /// Reassign one displaced vector. Errors are logged, never propagated
    /// into the pool.
    pub(crate) fn process_reassign(&self, job: ReassignJob) {
        let vid = job.vid;
        if let Err(err) = self.reassign_update(job) {
            warn!(%err, vid, "reassignment failed; job discarded");
        }
    }

    fn reassign_update(&self, job: ReassignJob) -> Result<()> {
        self.counters.reassigns.fetch_add(1, Ordering::Relaxed);

        // Stale work: the vector was deleted or already migrated.
        if self.versions.is_deleted(job.vid)
            || !self.versions.check_valid(job.vid, job.version)
        {
            return Ok(());
        }

        let candidates = self
            .heads
            .search(&job.payload, self.config.internal_result_num);
        let selected = select_replicas(
            self.heads.as_ref(),
            self.distance_kind(),
            &candidates,
            self.config.replica_count,
            self.config.rng_factor,
        );

        // The bump makes every record at the old version stale. Losing the
        // race means another reassignment settled this vid; drop silently.
        if !self.versions.try_bump(job.vid, job.version) {
            return Ok(());
        }
        let new_version = job.version.wrapping_add(1);

        for &(head, _) in selected.iter() {
            if !self.versions.check_valid(job.vid, new_version) {
                break;
            }
            let record = VectorRecord {
                vid: job.vid,
                version: new_version,
                payload: job.payload.clone(),
            };
            match self.append(head, 1, &record.encode(), AppendOrigin::Reassign)? {
                AppendOutcome::Appended => {}
                // The head vanished under us; append already queued the
                // recursive reassign, so stop fanning out here.
                AppendOutcome::HeadMissing => break,
            }
        }
        Ok(())
    }
}
