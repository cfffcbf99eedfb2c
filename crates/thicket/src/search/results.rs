//! Scored candidates and the bounded top-k result set.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A candidate scored by distance.
///
/// Orders by distance ascending with ties broken by id ascending, which makes
/// every ordered structure over hits totally ordered and deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Hit {
    /// Vector id, or a tree node index when queued on the pivot frontier.
    pub id: i32,
    /// Distance from the query.
    pub dist: f32,
}

impl Hit {
    /// A scored candidate.
    pub fn new(id: i32, dist: f32) -> Self {
        Self { id, dist }
    }
}

impl Eq for Hit {}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> Ordering {
        // Distances are never NaN; equal-compare is a safe fallback.
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// The k best hits seen so far, kept as a max-heap so the worst is on top.
pub(crate) struct ResultSet {
    /// Current hits; never more than `k` of them.
    heap: BinaryHeap<Hit>,
    /// Capacity of the set.
    k: usize,
}

impl ResultSet {
    /// An unconfigured set; call [`ResultSet::reset`] before use.
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            k: 0,
        }
    }

    /// Empties the set and fixes its capacity for the next query.
    pub fn reset(&mut self, k: usize) {
        self.heap.clear();
        self.k = k;
    }

    /// Distance of the k-th best hit, or +∞ while the set is underfilled.
    pub fn worst_dist(&self) -> f32 {
        if self.heap.len() < self.k {
            f32::INFINITY
        } else {
            self.heap.peek().map_or(f32::INFINITY, |worst| worst.dist)
        }
    }

    /// Offers a hit; `true` when it entered the set.
    pub fn insert(&mut self, id: i32, dist: f32) -> bool {
        let hit = Hit::new(id, dist);
        if self.heap.len() < self.k {
            self.heap.push(hit);
            true
        } else if self.heap.peek().is_some_and(|worst| hit < *worst) {
            self.heap.pop();
            self.heap.push(hit);
            true
        } else {
            false
        }
    }

    /// Offers a hit, rejecting ids already present.
    pub fn insert_unique(&mut self, id: i32, dist: f32) -> bool {
        if self.heap.iter().any(|hit| hit.id == id) {
            return false;
        }
        self.insert(id, dist)
    }

    /// Drains the set into ascending (distance, id) order.
    pub fn take_sorted(&mut self) -> Vec<(i32, f32)> {
        let mut hits = std::mem::take(&mut self.heap).into_vec();
        hits.sort_unstable();
        hits.into_iter().map(|hit| (hit.id, hit.dist)).collect()
    }
}
