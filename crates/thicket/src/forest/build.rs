//! Balanced k-means construction of the forest.

use rand::prelude::*;
use rand::rngs::StdRng;

use super::{BktForest, BktNode, LeafGroup};
use crate::deletions::DeletionSet;
use crate::element::Element;
use crate::metric::{DistanceKind, normalize_f32};
use crate::params::IndexParams;
use crate::search::Hit;
use crate::vectors::VectorSet;

/// Base seed for the per-tree generators; tree `t` derives its own from it,
/// so trees stay mutually independent and rebuilds are reproducible.
const SEED_BASE: u64 = 0x5eed_b412;

/// Attempts at picking an initial center set; the cheapest one wins.
const KMEANS_INITS: usize = 3;

/// Lloyd rounds per clustering call.
const KMEANS_ITERS: usize = 16;

/// Largest tolerated cluster, as a multiple of the balanced mean.
const BALANCE_FACTOR: f32 = 4.0;

/// Builds the forest over every vector not currently deleted.
pub(crate) fn build_forest<T: Element>(
    vectors: &VectorSet<T>,
    deleted: &DeletionSet,
    params: &IndexParams,
) -> BktForest {
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let mut ids: Vec<i32> = (0..vectors.count() as i32)
        .filter(|&id| !deleted.contains(id))
        .collect();
    let mut forest = BktForest::new();
    forest.sample_count = ids.len();

    let k = params.bkt_kmeans_k.max(2);
    let leaf_size = params.bkt_leaf_size.max(1);
    ftlog::debug!(
        "building {} tree(s) over {} vectors, k={k}, leaf={leaf_size}",
        params.bkt_number.max(1),
        ids.len()
    );

    for tree in 0..params.bkt_number.max(1) {
        let mut rng = StdRng::seed_from_u64(SEED_BASE.wrapping_add(tree as u64));
        ids.shuffle(&mut rng);
        grow_tree(
            vectors,
            params,
            &mut forest,
            &mut ids,
            k,
            leaf_size,
            tree == 0,
            &mut rng,
        );
    }
    forest
}

/// Appends one tree to the forest, consuming the current order of `ids`.
#[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
#[expect(clippy::too_many_arguments)]
fn grow_tree<T: Element>(
    vectors: &VectorSet<T>,
    params: &IndexParams,
    forest: &mut BktForest,
    ids: &mut [i32],
    k: usize,
    leaf_size: usize,
    record_groups: bool,
    rng: &mut StdRng,
) {
    forest.roots.push(forest.nodes.len() as i32);
    forest.nodes.push(BktNode::new(-1));
    let root = forest.nodes.len() - 1;

    let mut pending = vec![(root, 0_usize, ids.len())];
    while let Some((index, first, last)) = pending.pop() {
        let child_start = forest.nodes.len() as i32;
        forest.nodes[index].child_start = child_start;

        if last - first <= leaf_size {
            for &id in &ids[first..last] {
                forest.nodes.push(BktNode::new(id));
            }
            if record_groups && last > first {
                forest.leaf_groups.push(LeafGroup {
                    node: index as i32,
                    members: ids[first..last].to_vec(),
                });
            }
        } else if all_equal(vectors, &ids[first..last]) {
            // A duplicate cluster: one representative carries the search,
            // the remaining members are recorded behind it so results can
            // still surface them.
            ids[first..last].sort_unstable();
            let representative = ids[first];
            forest.nodes[index].center = representative;
            forest.nodes[index].child_start = -child_start;
            for &id in &ids[first + 1..last] {
                forest.nodes.push(BktNode::new(id));
            }
            if record_groups {
                forest.leaf_groups.push(LeafGroup {
                    node: index as i32,
                    members: ids[first..last].to_vec(),
                });
            }
        } else {
            let counts = cluster(vectors, params, &mut ids[first..last], k, rng);
            let mut position = first;
            for count in counts {
                if count == 0 {
                    continue;
                }
                // The segment's center sits last; it becomes the child node
                // and is not recursed into.
                let center = ids[position + count - 1];
                forest.nodes.push(BktNode::new(center));
                let child = forest.nodes.len() - 1;
                if count > 1 {
                    pending.push((child, position, position + count - 1));
                }
                position += count;
            }
        }
        forest.nodes[index].child_end = forest.nodes.len() as i32;
    }
}

/// Whether every vector in the range is byte-for-byte the same point.
#[expect(clippy::cast_sign_loss)]
fn all_equal<T: Element>(vectors: &VectorSet<T>, ids: &[i32]) -> bool {
    let first = vectors.get(ids[0] as usize);
    ids[1..].iter().all(|&id| {
        vectors
            .get(id as usize)
            .iter()
            .zip(first.iter())
            .all(|(a, b)| a.to_f32() == b.to_f32())
    })
}

/// Partitions `ids` into up to `k` contiguous, roughly balanced segments.
///
/// Centers train on a `Samples`-capped batch with a count penalty pulling
/// the assignment toward balance; the full range is then assigned with the
/// same penalty. Each returned segment holds its center sample in the last
/// slot. Falls back to a nearest-of-k-random-pivots split when the result is
/// badly unbalanced.
#[expect(clippy::cast_precision_loss)]
fn cluster<T: Element>(
    vectors: &VectorSet<T>,
    params: &IndexParams,
    ids: &mut [i32],
    k: usize,
    rng: &mut StdRng,
) -> Vec<usize> {
    let kind = params.dist_calc_method;
    let k = k.min(ids.len());
    let batch = ids.len().min(params.samples.max(k));
    let lambda = T::NORM_BASE * T::NORM_BASE / (100.0 * batch as f32);

    // Cheapest of a few random initializations.
    let mut centers: Vec<Vec<f32>> = Vec::new();
    let mut best_total = f32::INFINITY;
    for _ in 0..KMEANS_INITS {
        let candidate: Vec<Vec<f32>> = rand::seq::index::sample(rng, ids.len(), k)
            .iter()
            .map(|slot| widen(vectors, ids[slot]))
            .collect();
        let total: f32 = ids[..batch]
            .iter()
            .map(|&id| nearest(kind, vectors, &candidate, id, lambda, &[]).1)
            .sum();
        if total < best_total {
            best_total = total;
            centers = candidate;
        }
    }

    // Count-penalized Lloyd rounds over the batch.
    let dim = vectors.dim();
    let mut assignment = vec![0_usize; batch];
    for _ in 0..KMEANS_ITERS {
        let mut counts = vec![0_usize; k];
        let mut moved = 0_usize;
        for (slot, &id) in ids[..batch].iter().enumerate() {
            let (best, _) = nearest(kind, vectors, &centers, id, lambda, &counts);
            if assignment[slot] != best {
                moved += 1;
                assignment[slot] = best;
            }
            counts[best] += 1;
        }

        let mut sums = vec![vec![0.0_f32; dim]; k];
        for (slot, &id) in ids[..batch].iter().enumerate() {
            #[expect(clippy::cast_sign_loss)]
            for (sum, &x) in sums[assignment[slot]].iter_mut().zip(vectors.get(id as usize)) {
                *sum += x.to_f32();
            }
        }
        for (center, (sum, &count)) in centers.iter_mut().zip(sums.iter_mut().zip(&counts)) {
            if count > 0 {
                for s in sum.iter_mut() {
                    *s /= count as f32;
                }
                if kind == DistanceKind::Cosine {
                    normalize_f32(sum, T::NORM_BASE);
                }
                center.clone_from(sum);
            }
        }
        if moved == 0 {
            break;
        }
    }

    let counts = partition_by(vectors, kind, ids, &centers, lambda);
    if balanced(&counts, ids.len()) {
        counts
    } else {
        random_pivot_split(vectors, kind, ids, k, rng)
    }
}

/// The closest center to `id` under a count penalty, with its score.
#[expect(clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn nearest<T: Element>(
    kind: DistanceKind,
    vectors: &VectorSet<T>,
    centers: &[Vec<f32>],
    id: i32,
    lambda: f32,
    counts: &[usize],
) -> (usize, f32) {
    let v = vectors.get(id as usize);
    let mut best = 0;
    let mut best_score = f32::INFINITY;
    for (c, center) in centers.iter().enumerate() {
        let penalty = counts.get(c).map_or(0.0, |&n| lambda * n as f32);
        let score = kind.from_centroid(center, v) + penalty;
        if score < best_score {
            best_score = score;
            best = c;
        }
    }
    (best, best_score)
}

/// Assigns every id to its (penalized) nearest center and reorders `ids`
/// cluster-contiguously, each segment's best center sample last.
#[expect(clippy::cast_sign_loss)]
fn partition_by<T: Element>(
    vectors: &VectorSet<T>,
    kind: DistanceKind,
    ids: &mut [i32],
    centers: &[Vec<f32>],
    lambda: f32,
) -> Vec<usize> {
    let k = centers.len();
    let mut clusters: Vec<Vec<Hit>> = vec![Vec::new(); k];
    let mut counts = vec![0_usize; k];
    for &id in ids.iter() {
        let (best, _) = nearest(kind, vectors, centers, id, lambda, &counts);
        let raw = kind.from_centroid(&centers[best], vectors.get(id as usize));
        clusters[best].push(Hit::new(id, raw));
        counts[best] += 1;
    }

    let mut cursor = 0;
    for members in &mut clusters {
        if members.is_empty() {
            continue;
        }
        // Closest member to the trained centroid becomes the segment center
        // and must land in the last slot.
        let center_at = members
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map_or(0, |(at, _)| at);
        let last = members.len() - 1;
        members.swap(center_at, last);
        for hit in members.iter() {
            ids[cursor] = hit.id;
            cursor += 1;
        }
    }
    counts
}

/// Whether a split is worth keeping: at least two clusters, none hogging
/// more than [`BALANCE_FACTOR`] times its fair share.
#[expect(clippy::cast_precision_loss)]
fn balanced(counts: &[usize], total: usize) -> bool {
    let non_empty = counts.iter().filter(|&&count| count > 0).count();
    if non_empty < 2 {
        return false;
    }
    let mean = total as f32 / non_empty as f32;
    counts
        .iter()
        .all(|&count| (count as f32) <= (BALANCE_FACTOR * mean).max(1.0))
}

/// The fallback split: nearest of `k` randomly chosen pivot samples.
#[expect(clippy::cast_sign_loss)]
fn random_pivot_split<T: Element>(
    vectors: &VectorSet<T>,
    kind: DistanceKind,
    ids: &mut [i32],
    k: usize,
    rng: &mut StdRng,
) -> Vec<usize> {
    let pivots: Vec<Vec<f32>> = rand::seq::index::sample(rng, ids.len(), k.min(ids.len()))
        .iter()
        .map(|slot| widen(vectors, ids[slot]))
        .collect();
    partition_by(vectors, kind, ids, &pivots, 0.0)
}

/// Row `id` widened to `f32`.
#[expect(clippy::cast_sign_loss)]
fn widen<T: Element>(vectors: &VectorSet<T>, id: i32) -> Vec<f32> {
    vectors.get(id as usize).iter().map(|&x| x.to_f32()).collect()
}
