#![allow(dead_code)]

//! Shared helpers for the end-to-end tests.

use rand::prelude::*;
use rand::rngs::StdRng;

use thicket::{DistanceKind, IndexParams};

/// Row-major random vectors in `[-1, 1)`.
pub fn random_data(count: usize, dim: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count * dim)
        .map(|_| rng.random_range(-1.0_f32..1.0))
        .collect()
}

/// L2 configuration sized for test corpora.
pub fn l2_params() -> IndexParams {
    let mut params = IndexParams::default();
    params.dist_calc_method = DistanceKind::L2;
    params.cef = 200;
    params.add_cef = 100;
    params.max_check_for_refine_graph = 2048;
    params.max_check = 2048;
    params
}

/// Exact nearest neighbors by brute force, sorted by (distance, id).
pub fn brute_force_knn(
    data: &[f32],
    dim: usize,
    query: &[f32],
    k: usize,
    kind: DistanceKind,
) -> Vec<(i32, f32)> {
    let mut hits: Vec<(i32, f32)> = data
        .chunks_exact(dim)
        .enumerate()
        .map(|(id, row)| (i32::try_from(id).unwrap_or(i32::MAX), kind.between(query, row)))
        .collect();
    hits.sort_by(|(a_id, a_dist), (b_id, b_dist)| {
        a_dist
            .partial_cmp(b_dist)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a_id.cmp(b_id))
    });
    hits.truncate(k);
    hits
}

/// Asserts the basic shape of a result list: at most `k` entries, sorted by
/// ascending distance, pairwise-distinct ids.
pub fn assert_result_shape(hits: &[(i32, f32)], k: usize) {
    assert!(hits.len() <= k, "more than {k} results");
    for window in hits.windows(2) {
        assert!(
            window[0].1 <= window[1].1,
            "results out of order: {window:?}"
        );
    }
    let mut ids: Vec<i32> = hits.iter().map(|&(id, _)| id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), hits.len(), "duplicate ids in results");
}
