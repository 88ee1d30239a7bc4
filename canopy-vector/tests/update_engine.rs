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

//! End-to-end scenarios for the update engine: splits, deletes,
//! reassignment, and the version/tombstone protocol.

use canopy_vector::{CanopyError, CanopyIndex, IndexConfig};

fn vec4(x: f32) -> Vec<f32> {
    vec![x, x + 0.25, x + 0.5, x + 0.75]
}

#[test]
fn inserts_split_and_remain_searchable() {
    // One head, replica 1, tiny split threshold: ten inserts must force at
    // least one split and every vector must stay recoverable by top-1.
    let config = IndexConfig::new(4)
        .posting_size_limit_of(5)
        .replica_count(1);
    let index = CanopyIndex::build(config, &[vec4(0.0)]).unwrap();
    assert_eq!(index.head_count(), 1);

    let mut inserted = Vec::new();
    for i in 0..5 {
        inserted.push(vec4(0.5 + i as f32 * 0.1));
    }
    for i in 0..5 {
        inserted.push(vec4(50.0 + i as f32 * 0.1));
    }
    let vids = index.add(&inserted).unwrap();
    index.drain();

    let stats = index.stats();
    assert!(stats.split_count >= 1, "expected a split, got {:?}", stats);
    assert!(
        (2..=3).contains(&index.head_count()),
        "head count {} outside expected range",
        index.head_count()
    );

    for (payload, &vid) in inserted.iter().zip(vids.iter()) {
        let hits = index.search(payload, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].vid, vid);
        assert!(hits[0].distance < 1e-5);
    }
}

#[test]
fn deletes_are_filtered_after_drain() {
    let config = IndexConfig::new(4)
        .posting_size_limit_of(100)
        .replica_count(1);
    // build seeds one head (id 0) and one data vector (vid 1)
    let index = CanopyIndex::build(config, &[vec4(0.0)]).unwrap();
    let vids = index
        .add(&[
            vec4(1.0),
            vec4(2.0),
            vec4(3.0),
            vec4(4.0),
            vec4(5.0),
        ])
        .unwrap();

    index.delete(1).unwrap(); // the build seed
    index.delete(vids[0]).unwrap();
    index.delete(vids[1]).unwrap();
    index.delete(vids[2]).unwrap();
    index.drain();

    let hits = index.search(&vec4(2.5), 5).unwrap();
    let got: Vec<u32> = hits.iter().map(|n| n.vid).collect();
    assert_eq!(hits.len(), 2, "only the undeleted vectors survive: {:?}", got);
    assert!(got.contains(&vids[3]));
    assert!(got.contains(&vids[4]));
}

#[test]
fn append_at_limit_does_not_split_one_more_does() {
    let config = IndexConfig::new(4)
        .posting_size_limit_of(5)
        .replica_count(1);
    let index = CanopyIndex::build(config, &[vec4(0.0)]).unwrap();

    // posting holds the seed; four more bring it exactly to the limit
    index
        .add(&[vec4(0.1), vec4(0.2), vec4(0.3), vec4(0.4)])
        .unwrap();
    index.drain();
    assert_eq!(index.stats().split_count, 0);
    let head = index.head_ids()[0];
    assert_eq!(index.posting_size(head), 5);

    // one record past the limit forces the split
    index.add(&[vec4(0.5)]).unwrap();
    index.drain();
    assert!(index.stats().split_count >= 1);
}

#[test]
fn fully_stale_posting_is_collected() {
    let config = IndexConfig::new(4)
        .posting_size_limit_of(3)
        .replica_count(1);
    let index = CanopyIndex::build(config, &[vec4(0.0)]).unwrap();
    let vids = index.add(&[vec4(0.1), vec4(0.2)]).unwrap();
    index.drain();

    // tombstone everything, then push one more insert+delete pair so the
    // overflow append arrives with nothing live left
    index.delete(1).unwrap();
    index.delete(vids[0]).unwrap();
    index.delete(vids[1]).unwrap();
    let last = index.add(&[vec4(0.3)]).unwrap();
    index.delete(last[0]).unwrap();
    index.drain();

    assert!(index.stats().split_count >= 1);
    assert!(index.head_count() <= 1);
    // deleted vectors never surface, whether or not the head survived
    match index.search(&vec4(0.2), 10) {
        Ok(hits) => assert!(hits.is_empty(), "stale records surfaced: {:?}", hits),
        Err(CanopyError::EmptyIndex) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }
}

#[test]
fn split_reassigns_vector_stranded_at_the_old_centroid() {
    // Seed the single head at x=5; the inserts cluster at x~0 and x~10, so
    // after the split the seed sits closer to the dead centroid's position
    // than to either new center and must migrate (version 0 -> 1).
    let dim2 = |x: f32| vec![x, 0.0];
    let config = IndexConfig::new(2)
        .posting_size_limit_of(8)
        .replica_count(1);
    let index = CanopyIndex::build(config, &[dim2(5.0)]).unwrap();
    let seed_vid = 1u32;

    let mut batch = Vec::new();
    for i in 0..5 {
        batch.push(dim2(i as f32 * 0.2));
    }
    for i in 0..5 {
        batch.push(dim2(10.0 + i as f32 * 0.2));
    }
    index.add(&batch).unwrap();
    index.drain();

    let stats = index.stats();
    assert!(stats.split_count >= 1);
    assert!(stats.reassign_count >= 1, "no reassignment ran: {:?}", stats);
    assert_eq!(index.current_version(seed_vid), 1);

    // the seed is still found, exactly once, through its new record
    let hits = index.search(&dim2(5.0), 3).unwrap();
    let seed_hits: Vec<_> = hits.iter().filter(|n| n.vid == seed_vid).collect();
    assert_eq!(seed_hits.len(), 1);
    assert!(seed_hits[0].distance < 1e-5);

    // exactly one posting carries the record at the bumped version
    let mut fresh_records = 0;
    for head in index.head_ids() {
        for (vid, version) in index.posting_records(head).unwrap() {
            if vid == seed_vid && version == 1 {
                fresh_records += 1;
            }
        }
    }
    assert_eq!(fresh_records, 1);
}

#[test]
fn reassign_k_pulls_vectors_from_neighbor_postings() {
    // Heads at x=0 and x=100. X=55 lands in the x=100 posting. A cluster at
    // x~40 splits the x=0 head; with reassign_k=2 the neighbor posting is
    // rescanned and X migrates to the new x~40 head.
    let dim2 = |x: f32| vec![x, 0.0];
    let config = IndexConfig::new(2)
        .posting_size_limit_of(7)
        .replica_count(1)
        .reassign_k(2)
        .head_ratio(1.0);
    let index = CanopyIndex::build(config, &[dim2(0.0), dim2(100.0)]).unwrap();
    assert_eq!(index.head_count(), 2);
    let original_heads = index.head_ids();

    let x_vid = index.add(&[dim2(55.0)]).unwrap()[0];
    index.drain();
    // X sits in the x=100 head's posting
    let far_head = original_heads[1];
    assert!(index
        .posting_records(far_head)
        .unwrap()
        .iter()
        .any(|&(vid, _)| vid == x_vid));

    let cluster: Vec<Vec<f32>> = (0..7).map(|i| dim2(39.7 + i as f32 * 0.1)).collect();
    index.add(&cluster).unwrap();
    index.drain();

    let stats = index.stats();
    assert!(stats.split_count >= 1);
    assert!(stats.reassign_count >= 1, "neighbor scan queued nothing: {:?}", stats);
    assert_eq!(index.current_version(x_vid), 1);

    // the fresh record lives in a new head's posting, not the original one
    let mut hosting_heads = Vec::new();
    for head in index.head_ids() {
        if index
            .posting_records(head)
            .unwrap()
            .iter()
            .any(|&(vid, version)| vid == x_vid && version == 1)
        {
            hosting_heads.push(head);
        }
    }
    assert_eq!(hosting_heads.len(), 1);
    assert_ne!(hosting_heads[0], far_head);

    let hits = index.search(&dim2(55.0), 1).unwrap();
    assert_eq!(hits[0].vid, x_vid);
}

#[test]
fn rerunning_reassign_is_idempotent() {
    // After a settled reassignment the version map holds v+1; any duplicate
    // reassign work carrying v loses the CAS and must not advance versions
    // again. Exercised indirectly: drain twice and re-add pressure.
    let dim2 = |x: f32| vec![x, 0.0];
    let config = IndexConfig::new(2)
        .posting_size_limit_of(8)
        .replica_count(1);
    let index = CanopyIndex::build(config, &[dim2(5.0)]).unwrap();
    let seed_vid = 1u32;

    let mut batch = Vec::new();
    for i in 0..5 {
        batch.push(dim2(i as f32 * 0.2));
        batch.push(dim2(10.0 + i as f32 * 0.2));
    }
    index.add(&batch).unwrap();
    index.drain();
    let settled = index.current_version(seed_vid);
    assert!(settled >= 1);

    index.drain();
    assert_eq!(index.current_version(seed_vid), settled);
}

#[test]
fn empty_add_is_rejected() {
    let config = IndexConfig::new(4);
    let index = CanopyIndex::build(config, &[vec4(0.0)]).unwrap();
    assert!(matches!(index.add(&[]), Err(CanopyError::EmptyData)));
    assert!(matches!(
        CanopyIndex::build(IndexConfig::new(4), &[]),
        Err(CanopyError::EmptyData)
    ));
}

#[test]
fn posting_sizes_match_backend_contents() {
    // size table vs physical posting length, across splits and deletes
    let config = IndexConfig::new(4)
        .posting_size_limit_of(4)
        .replica_count(2);
    let index = CanopyIndex::build(config, &[vec4(0.0), vec4(30.0)]).unwrap();

    let mut batch = Vec::new();
    for i in 0..20 {
        batch.push(vec4(i as f32 * 3.0));
    }
    let vids = index.add(&batch).unwrap();
    for &vid in vids.iter().step_by(3) {
        index.delete(vid).unwrap();
    }
    index.drain();

    for head in index.head_ids() {
        let physical = index.posting_records(head).unwrap().len() as u32;
        assert_eq!(
            index.posting_size(head),
            physical,
            "size table diverged for head {}",
            head
        );
    }
}
