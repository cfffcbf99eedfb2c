//! Reusable per-query scratch and the pool that rents it out.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use super::results::{Hit, ResultSet};

/// A growable bitset of visited vector ids.
#[derive(Default)]
pub(crate) struct VisitedSet {
    /// One bit per id.
    words: Vec<u64>,
}

impl VisitedSet {
    /// Marks `id` visited; `true` when it already was.
    #[expect(clippy::cast_sign_loss)]
    pub fn check_and_set(&mut self, id: i32) -> bool {
        debug_assert!(id >= 0);
        let i = id as usize;
        let (word, bit) = (i / 64, i % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1 << bit;
        let seen = self.words[word] & mask != 0;
        self.words[word] |= mask;
        seen
    }

    /// Clears the set and sizes it for `n` ids.
    pub fn clear(&mut self, n: usize) {
        self.words.clear();
        self.words.resize(n.div_ceil(64), 0);
    }
}

/// Per-query scratch: the two best-first frontiers, the visited set, the
/// work counters, and the top-k result set.
pub(crate) struct Workspace {
    /// Ids whose distance has been taken or that are already queued.
    pub visited: VisitedSet,
    /// Graph frontier: vector ids by ascending distance.
    pub ng_queue: BinaryHeap<Reverse<Hit>>,
    /// Tree frontier: forest node indices by ascending center distance.
    pub spt_queue: BinaryHeap<Reverse<Hit>>,
    /// Distance computations taken so far.
    pub checked_leaves: usize,
    /// Consecutive pops that could not improve the results.
    pub no_better: usize,
    /// Budget on `checked_leaves` for this rental.
    pub max_check: usize,
    /// Budget on `no_better` for this rental.
    pub continuous_limit: usize,
    /// The top-k collected so far.
    pub results: ResultSet,
}

impl Workspace {
    /// Fresh scratch; sized lazily on reset.
    fn new() -> Self {
        Self {
            visited: VisitedSet::default(),
            ng_queue: BinaryHeap::new(),
            spt_queue: BinaryHeap::new(),
            checked_leaves: 0,
            no_better: 0,
            max_check: 0,
            continuous_limit: 0,
            results: ResultSet::new(),
        }
    }

    /// Readies the scratch for one query over `n` vectors.
    pub fn reset(&mut self, n: usize, k: usize, max_check: usize, continuous_limit: usize) {
        self.visited.clear(n);
        self.ng_queue.clear();
        self.spt_queue.clear();
        self.checked_leaves = 0;
        self.no_better = 0;
        self.max_check = max_check;
        self.continuous_limit = continuous_limit;
        self.results.reset(k);
    }
}

/// A fixed pool of workspaces; renting blocks while the pool is empty.
///
/// The pool caps the number of in-flight queries at its size, which bounds
/// the scratch memory a query storm can pin.
pub(crate) struct WorkspacePool {
    /// Idle workspaces, oldest first.
    idle: Mutex<VecDeque<Workspace>>,
    /// Signaled whenever a workspace is returned.
    returned: Condvar,
}

impl WorkspacePool {
    /// A pool of `size` workspaces; at least one.
    pub fn new(size: usize) -> Self {
        let mut idle = VecDeque::new();
        idle.resize_with(size.max(1), Workspace::new);
        Self {
            idle: Mutex::new(idle),
            returned: Condvar::new(),
        }
    }

    /// Takes a workspace, waiting for one to be returned if none are idle.
    pub fn rent(self: &Arc<Self>) -> WorkspaceGuard {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(workspace) = idle.pop_front() {
                return WorkspaceGuard {
                    pool: Arc::clone(self),
                    workspace: Some(workspace),
                };
            }
            idle = self
                .returned
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Puts a workspace back and wakes one waiting renter.
    fn put_back(&self, workspace: Workspace) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(workspace);
        self.returned.notify_one();
    }
}

/// A rented workspace; returns itself to the pool on drop.
pub(crate) struct WorkspaceGuard {
    /// The pool to return to.
    pool: Arc<WorkspacePool>,
    /// The workspace; `Some` until dropped.
    workspace: Option<Workspace>,
}

impl Deref for WorkspaceGuard {
    type Target = Workspace;

    fn deref(&self) -> &Self::Target {
        self.workspace
            .as_ref()
            .unwrap_or_else(|| unreachable!("present until drop"))
    }
}

impl DerefMut for WorkspaceGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.workspace
            .as_mut()
            .unwrap_or_else(|| unreachable!("present until drop"))
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            self.pool.put_back(workspace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visited_set_reports_prior_marks() {
        let mut visited = VisitedSet::default();
        visited.clear(100);
        assert!(!visited.check_and_set(70));
        assert!(visited.check_and_set(70));
        visited.clear(100);
        assert!(!visited.check_and_set(70));
    }

    #[test]
    fn rent_blocks_until_a_return() {
        let pool = Arc::new(WorkspacePool::new(1));
        let guard = pool.rent();

        let contender = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let _guard = pool.rent();
            })
        };
        // The contender can only finish once the first rental is dropped.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!contender.is_finished());
        drop(guard);
        contender.join().expect("contender finished");
    }
}
