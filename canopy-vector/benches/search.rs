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

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use canopy_core::distance::l2;
use canopy_vector::{CanopyIndex, IndexConfig};

fn synthetic(n: usize, dim: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| {
            (0..dim)
                .map(|d| ((i * 31 + d * 7) % 97) as f32 / 9.7)
                .collect()
        })
        .collect()
}

fn bench_search(c: &mut Criterion) {
    let dim = 16;
    let data = synthetic(2000, dim);
    let config = IndexConfig::new(dim).replica_count(2).head_ratio(0.05);
    let index = CanopyIndex::build(config, &data).unwrap();
    let query = data[123].clone();

    c.bench_function("search_top10_2k_dim16", |b| {
        b.iter(|| index.search(black_box(&query), 10).unwrap())
    });
}

fn bench_distance(c: &mut Criterion) {
    let a: Vec<f32> = (0..128).map(|i| i as f32 * 0.01).collect();
    let b_vec: Vec<f32> = (0..128).map(|i| (128 - i) as f32 * 0.01).collect();

    c.bench_function("l2_dim128", |b| {
        b.iter(|| l2(black_box(&a), black_box(&b_vec)))
    });
}

criterion_group!(benches, bench_search, bench_distance);
criterion_main!(benches);
