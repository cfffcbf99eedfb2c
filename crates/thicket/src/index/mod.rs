//! The coordinator that owns the stores, the locks, and the background
//! rebuild worker.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;

use rayon::prelude::*;

use crate::deletions::DeletionSet;
use crate::element::Element;
use crate::error::{Error, Result};
use crate::forest::{BktForest, build_forest};
use crate::graph::{self, NeighborGraph};
use crate::metric::{DistanceKind, normalize};
use crate::params::IndexParams;
use crate::search::{self, SearchContext, WorkspacePool};
use crate::vectors::VectorSet;

/// Distance below which a searched vector counts as an exact match when
/// deleting by content.
const EXACT_MATCH_EPSILON: f32 = 1e-6;

/// The three stores that grow together, kept under one lock so readers
/// always see them the same length.
struct Store<T> {
    /// The vector data.
    vectors: VectorSet<T>,
    /// The neighborhood graph, one row per vector.
    graph: NeighborGraph,
    /// The deletion marks, one bit per vector.
    deleted: DeletionSet,
}

/// State shared between the handle and the rebuild worker.
struct Inner<T> {
    /// The live configuration.
    params: RwLock<IndexParams>,
    /// Serializes all growth: build, add, refine, save.
    add_lock: Mutex<()>,
    /// Shared by add/delete/search; exclusive for save and refine, which
    /// need a consistent snapshot of data plus deletions.
    delete_lock: RwLock<()>,
    /// The grow-together stores. Readers hold this for the duration of a
    /// query; growth holds it exclusively. Deletion marks and graph row
    /// updates are atomic and happen under read mode.
    store: RwLock<Store<T>>,
    /// The tree forest; swapped wholesale by rebuilds.
    forest: RwLock<BktForest>,
    /// Per-query scratch; replaced when the thread count changes.
    workspaces: RwLock<Arc<WorkspacePool>>,
    /// Whether build or load has completed.
    ready: AtomicBool,
}

/// The hybrid tree-and-graph nearest neighbor index.
///
/// All operations take `&self`; growth is serialized internally while
/// queries run concurrently. Locks are always taken in the order add →
/// delete → store → forest.
pub struct Index<T: Element> {
    /// Shared state.
    inner: Arc<Inner<T>>,
    /// Single-slot queue feeding the rebuild worker; a send that finds the
    /// slot full is dropped, because a rebuild is already pending.
    rebuild: Option<SyncSender<()>>,
    /// The rebuild worker; joined on drop.
    worker: Option<JoinHandle<()>>,
}

impl<T: Element> Index<T> {
    /// An empty index with the given configuration.
    ///
    /// Nothing can be searched until [`Index::build`], [`Index::add`], or
    /// one of the load constructors has run.
    #[must_use]
    pub fn new(params: IndexParams) -> Self {
        let threads = params.number_of_threads.max(1);
        let inner = Arc::new(Inner {
            params: RwLock::new(params),
            add_lock: Mutex::new(()),
            delete_lock: RwLock::new(()),
            store: RwLock::new(Store {
                vectors: VectorSet::new(1),
                graph: NeighborGraph::new(2, 0),
                deleted: DeletionSet::new(0),
            }),
            forest: RwLock::new(BktForest::new()),
            workspaces: RwLock::new(Arc::new(WorkspacePool::new(threads))),
            ready: AtomicBool::new(false),
        });

        let (sender, receiver) = mpsc::sync_channel::<()>(1);
        let worker_state = Arc::clone(&inner);
        let worker = std::thread::spawn(move || {
            while receiver.recv().is_ok() {
                rebuild_forest(&worker_state);
            }
        });

        Self {
            inner,
            rebuild: Some(sender),
            worker: Some(worker),
        }
    }

    /// A copy of the live configuration.
    fn params_snapshot(&self) -> IndexParams {
        self.inner
            .params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current workspace pool.
    fn workspace_pool(&self) -> Arc<WorkspacePool> {
        Arc::clone(
            &self
                .inner
                .workspaces
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Sets a parameter by its configuration key; unknown keys are ignored.
    ///
    /// Structural parameters only affect builds that happen afterwards.
    ///
    /// # Errors
    ///
    /// [`Error::FailedParseValue`] when a known key gets an unparsable
    /// value.
    pub fn set_parameter(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .params
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(key, value)
    }

    /// Renders a parameter by its configuration key; unknown keys yield an
    /// empty string.
    #[must_use]
    pub fn get_parameter(&self, key: &str) -> String {
        self.inner
            .params
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
    }

    /// Number of stored vectors, live and deleted alike.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .vectors
            .count()
    }

    /// Number of vectors currently marked deleted.
    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .deleted
            .count()
    }

    /// The vector dimension, or 0 before the first build.
    #[must_use]
    pub fn dim(&self) -> usize {
        let store = self
            .inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if store.vectors.count() == 0 {
            0
        } else {
            store.vectors.dim()
        }
    }

    /// How many vectors the forest was last built over; observing this grow
    /// past [`Index::count`] minus pending inserts shows a background
    /// rebuild landing.
    #[must_use]
    pub fn forest_size(&self) -> usize {
        self.inner
            .forest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sample_count()
    }

    /// Whether the index has been built or loaded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// A copy of stored row `id`, if it exists.
    #[must_use]
    #[expect(clippy::cast_sign_loss)]
    pub fn vector(&self, id: i32) -> Option<Vec<T>> {
        let store = self
            .inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if id < 0 || id as usize >= store.vectors.count() {
            None
        } else {
            Some(store.vectors.get(id as usize).to_vec())
        }
    }

    /// Builds the index over `data`, replacing any existing contents.
    ///
    /// `data` is row-major with `dim` elements per vector. Under cosine
    /// distance the stored rows are normalized.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyData`] when `data` is empty, `dim` is 0, or `data` is
    ///   not a whole number of rows.
    /// - [`Error::Fail`] when the thread pool cannot be created.
    pub fn build(&self, data: &[T], dim: usize) -> Result<()> {
        let _add = self
            .inner
            .add_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.build_locked(data, dim)
    }

    /// [`Index::build`] body; the caller holds the add lock.
    fn build_locked(&self, data: &[T], dim: usize) -> Result<()> {
        if dim == 0 || data.is_empty() || data.len() % dim != 0 {
            return Err(Error::EmptyData);
        }
        let params = self.params_snapshot();
        let count = data.len() / dim;
        ftlog::info!("building index over {count} vectors of dimension {dim}");

        let pool = thread_pool(params.number_of_threads)?;
        let mut data = data.to_vec();
        if params.dist_calc_method == DistanceKind::Cosine {
            pool.install(|| data.par_chunks_mut(dim).for_each(normalize));
        }
        let vectors = VectorSet::with_data(dim, data);

        let deleted = DeletionSet::new(count);
        let forest = build_forest(&vectors, &deleted, &params);
        let graph = NeighborGraph::new(params.neighborhood_size, count);

        {
            let mut store = self
                .inner
                .store
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *store = Store {
                vectors,
                graph,
                deleted,
            };
        }
        {
            let mut slot = self
                .inner
                .forest
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = forest;
        }
        *self
            .inner
            .workspaces
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            Arc::new(WorkspacePool::new(params.number_of_threads.max(1)));

        let workspaces = self.workspace_pool();
        {
            let store = self
                .inner
                .store
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let forest = self
                .inner
                .forest
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let ctx = SearchContext {
                vectors: &store.vectors,
                graph: &store.graph,
                forest: &forest,
                deleted: &store.deleted,
                params: &params,
            };
            pool.install(|| graph::build_graph(&ctx, &workspaces));
        }

        self.inner.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Appends vectors and links them into the graph.
    ///
    /// An add on an empty index is a build. Crossing the rebuild threshold
    /// schedules a background forest rebuild unless one is already pending.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyData`] when `data` is empty, `dim` is 0, or `data` is
    ///   not a whole number of rows.
    /// - [`Error::DimensionSizeMismatch`] when `dim` differs from the built
    ///   dimension.
    /// - [`Error::MemoryOverflow`] when storage cannot grow; the stores are
    ///   rolled back to their pre-call sizes.
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn add(&self, data: &[T], dim: usize) -> Result<()> {
        if dim == 0 || data.is_empty() || data.len() % dim != 0 {
            return Err(Error::EmptyData);
        }
        let _add = self
            .inner
            .add_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _delete = self
            .inner
            .delete_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let params = self.params_snapshot();
        let count = data.len() / dim;

        let begin;
        {
            let mut store = self
                .inner
                .store
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            begin = store.vectors.count();
            if begin == 0 {
                drop(store);
                return self.build_locked(data, dim);
            }
            if dim != store.vectors.dim() {
                return Err(Error::DimensionSizeMismatch);
            }
            if let Err(error) = grow(&mut store, data, count) {
                ftlog::info!("rolling back failed append of {count} vectors");
                store.vectors.rollback(begin);
                store.graph.rollback(begin);
                store.deleted.rollback(begin);
                return Err(error);
            }
            if params.dist_calc_method == DistanceKind::Cosine {
                for i in begin..begin + count {
                    normalize(store.vectors.get_mut(i));
                }
            }
        }
        let end = begin + count;

        let forest_size = self.forest_size();
        if end.saturating_sub(forest_size) >= params.add_count_for_rebuild {
            if let Some(sender) = &self.rebuild {
                // A full slot means a rebuild is already queued.
                let _ = sender.try_send(());
            }
        }

        let workspaces = self.workspace_pool();
        for id in begin..end {
            let store = self
                .inner
                .store
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let forest = self
                .inner
                .forest
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let ctx = SearchContext {
                vectors: &store.vectors,
                graph: &store.graph,
                forest: &forest,
                deleted: &store.deleted,
                params: &params,
            };
            let mut ws = workspaces.rent();
            graph::refine_node(&ctx, &mut ws, id as i32, true, true, params.add_cef);
        }
        ftlog::debug!("added {count} vectors, ids {begin}..{end}");
        Ok(())
    }

    /// Marks `id` deleted; the data stays in place until the next refine.
    ///
    /// # Errors
    ///
    /// [`Error::VectorNotFound`] when `id` is out of range or was already
    /// deleted.
    #[expect(clippy::cast_sign_loss)]
    pub fn delete(&self, id: i32) -> Result<()> {
        let _delete = self
            .inner
            .delete_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let store = self
            .inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if id < 0 || id as usize >= store.vectors.count() {
            return Err(Error::VectorNotFound);
        }
        if store.deleted.insert(id) {
            Ok(())
        } else {
            Err(Error::VectorNotFound)
        }
    }

    /// Deletes every stored vector that exactly matches one of the given
    /// rows, located through a CEF-deep search per row.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyData`] when `data` is empty or misshapen.
    /// - [`Error::EmptyIndex`] when the index is not ready.
    pub fn delete_matching(&self, data: &[T], dim: usize) -> Result<()> {
        if dim == 0 || data.is_empty() || data.len() % dim != 0 {
            return Err(Error::EmptyData);
        }
        if !self.is_ready() {
            return Err(Error::EmptyIndex);
        }
        let params = self.params_snapshot();
        let pool = thread_pool(params.number_of_threads)?;
        pool.install(|| {
            data.par_chunks_exact(dim).for_each(|row| {
                if let Ok(hits) = self.search(row, params.cef) {
                    for (id, dist) in hits {
                        if dist < EXACT_MATCH_EPSILON {
                            // Already-deleted ids are fine here.
                            let _ = self.delete(id);
                        }
                    }
                }
            });
        });
        Ok(())
    }

    /// Searches for the `k` nearest neighbors of `query`, hiding deleted
    /// vectors.
    ///
    /// Returns at most `k` `(id, distance)` pairs sorted by ascending
    /// distance, ties by id.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyIndex`] when the index has not been built or loaded.
    pub fn search(&self, query: &[T], k: usize) -> Result<Vec<(i32, f32)>> {
        self.search_with_options(query, k, false)
    }

    /// [`Index::search`] with deleted vectors optionally visible.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyIndex`] when the index has not been built or loaded.
    pub fn search_with_options(
        &self,
        query: &[T],
        k: usize,
        search_deleted: bool,
    ) -> Result<Vec<(i32, f32)>> {
        if !self.is_ready() {
            return Err(Error::EmptyIndex);
        }
        let params = self.params_snapshot();
        let _delete = self
            .inner
            .delete_lock
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let workspaces = self.workspace_pool();
        let mut ws = workspaces.rent();

        let normalized;
        let query = if params.dist_calc_method == DistanceKind::Cosine {
            let mut owned = query.to_vec();
            normalize(&mut owned);
            normalized = owned;
            &normalized[..]
        } else {
            query
        };

        let store = self
            .inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let forest = self
            .inner
            .forest
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let ctx = SearchContext {
            vectors: &store.vectors,
            graph: &store.graph,
            forest: &forest,
            deleted: &store.deleted,
            params: &params,
        };
        Ok(search::search(&ctx, query, &mut ws, k, search_deleted))
    }

    /// Compacts out the deleted vectors into a fresh, independent index.
    ///
    /// The surviving vectors are renumbered by the swap-compact remap: each
    /// deleted prefix id is paired with a live suffix id. The source index
    /// is untouched apart from incidental row refinement.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyData`] when nothing would survive.
    /// - [`Error::Fail`] when the thread pool cannot be created.
    pub fn refine(&self) -> Result<Self> {
        let _add = self
            .inner
            .add_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _delete = self
            .inner
            .delete_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.refine_locked()
    }

    /// Like [`Index::refine`], but writing the new index's snapshot blobs
    /// into `dir` instead of keeping it.
    ///
    /// # Errors
    ///
    /// As [`Index::refine`], plus [`Error::FailedCreateFile`] when the
    /// directory or a blob file cannot be created.
    pub fn refine_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let refined = self.refine()?;
        refined.save_to_dir(dir)
    }

    /// Like [`Index::refine`], but streaming the new index's snapshot blobs
    /// in the [`Index::save_to_writers`] order.
    ///
    /// # Errors
    ///
    /// As [`Index::refine`], plus [`Error::LackOfInputs`] when fewer than
    /// four writers are given.
    pub fn refine_to_writers(&self, writers: &mut [&mut dyn Write]) -> Result<()> {
        if writers.len() < 4 {
            return Err(Error::LackOfInputs);
        }
        let refined = self.refine()?;
        refined.save_to_writers(writers)
    }

    /// [`Index::refine`] body; the caller holds both outer locks.
    fn refine_locked(&self) -> Result<Self> {
        let params = self.params_snapshot();
        let (keep, reverse) = {
            let store = self
                .inner
                .store
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            compact_remap(&store.deleted, store.vectors.count())
        };
        if keep.is_empty() {
            return Err(Error::EmptyData);
        }
        ftlog::info!(
            "refining index from {} down to {} vectors",
            reverse.len(),
            keep.len()
        );

        let refined = Self::new(params.clone());
        {
            let store = self
                .inner
                .store
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let vectors = store.vectors.refine(&keep);
            let deleted = DeletionSet::new(keep.len());
            let forest = build_forest(&vectors, &deleted, &params);
            let graph = NeighborGraph::new(params.neighborhood_size, keep.len());
            *refined
                .inner
                .store
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Store {
                vectors,
                graph,
                deleted,
            };
            *refined
                .inner
                .forest
                .write()
                .unwrap_or_else(PoisonError::into_inner) = forest;
        }

        let pool = thread_pool(params.number_of_threads)?;
        let workspaces = self.workspace_pool();
        {
            let store = self
                .inner
                .store
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let forest = self
                .inner
                .forest
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let old_ctx = SearchContext {
                vectors: &store.vectors,
                graph: &store.graph,
                forest: &forest,
                deleted: &store.deleted,
                params: &params,
            };
            let new_store = refined
                .inner
                .store
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let new_forest = refined
                .inner
                .forest
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            pool.install(|| {
                graph::refine_graph(
                    &old_ctx,
                    &workspaces,
                    &keep,
                    &reverse,
                    &new_store.graph,
                    &new_forest,
                );
            });
        }

        refined.inner.ready.store(true, Ordering::Release);
        Ok(refined)
    }

    /// Writes the four snapshot blobs as files under `dir`, using the
    /// configured file names.
    ///
    /// # Errors
    ///
    /// - [`Error::FailedCreateFile`] when the directory or a file cannot be
    ///   created.
    /// - [`Error::Fail`] when writing a blob fails; partial files may
    ///   remain.
    pub fn save_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let params = self.params_snapshot();
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|_| Error::FailedCreateFile)?;
        let create = |name: &str| -> Result<BufWriter<File>> {
            File::create(dir.join(name))
                .map(BufWriter::new)
                .map_err(|_| Error::FailedCreateFile)
        };
        let mut vectors = create(&params.data_points_filename)?;
        let mut tree = create(&params.bkt_filename)?;
        let mut graph = create(&params.graph_filename)?;
        let mut deletions = create(&params.delete_data_points_filename)?;

        let _add = self
            .inner
            .add_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _delete = self
            .inner
            .delete_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.save_blobs(&mut [&mut vectors, &mut tree, &mut graph, &mut deletions])?;
        for writer in [&mut vectors, &mut tree, &mut graph, &mut deletions] {
            writer.flush().map_err(|_| Error::Fail)?;
        }
        Ok(())
    }

    /// Writes the four snapshot blobs in order: vectors, tree, graph,
    /// deletions.
    ///
    /// # Errors
    ///
    /// - [`Error::LackOfInputs`] when fewer than four writers are given.
    /// - [`Error::Fail`] when writing a blob fails.
    pub fn save_to_writers(&self, writers: &mut [&mut dyn Write]) -> Result<()> {
        if writers.len() < 4 {
            return Err(Error::LackOfInputs);
        }
        let _add = self
            .inner
            .add_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _delete = self
            .inner
            .delete_lock
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.save_blobs(writers)
    }

    /// The blob writes themselves; the caller holds the outer locks.
    fn save_blobs(&self, writers: &mut [&mut dyn Write]) -> Result<()> {
        let store = self
            .inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let forest = self
            .inner
            .forest
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut writers = writers.iter_mut();
        let mut next = || writers.next().ok_or(Error::LackOfInputs);
        store.vectors.save(next()?)?;
        forest.save(next()?)?;
        store.graph.save(next()?)?;
        store.deleted.save(next()?)
    }

    /// Loads an index from a directory written by [`Index::save_to_dir`].
    ///
    /// The configuration is not part of the snapshot; pass the same
    /// parameters the index was saved under.
    ///
    /// # Errors
    ///
    /// [`Error::Fail`] when any blob is missing, unreadable, or
    /// inconsistent.
    pub fn load_from_dir<P: AsRef<Path>>(dir: P, params: IndexParams) -> Result<Self> {
        let dir = dir.as_ref();
        let open = |name: &str| -> Result<BufReader<File>> {
            File::open(dir.join(name))
                .map(BufReader::new)
                .map_err(|_| Error::Fail)
        };
        let vectors = VectorSet::load(&mut open(&params.data_points_filename)?)
            .map_err(|_| Error::Fail)?;
        let forest =
            BktForest::load(&mut open(&params.bkt_filename)?).map_err(|_| Error::Fail)?;
        let graph =
            NeighborGraph::load(&mut open(&params.graph_filename)?).map_err(|_| Error::Fail)?;
        let deleted = DeletionSet::load(&mut open(&params.delete_data_points_filename)?)
            .map_err(|_| Error::Fail)?;
        Self::assemble(params, vectors, forest, graph, deleted).map_err(|_| Error::Fail)
    }

    /// Loads an index from in-memory blobs in the order written by
    /// [`Index::save_to_writers`]. The deletions blob may be omitted, in
    /// which case nothing is deleted.
    ///
    /// # Errors
    ///
    /// - [`Error::LackOfInputs`] when fewer than three blobs are given.
    /// - [`Error::FailedParseValue`] when a blob does not parse or the
    ///   blobs are mutually inconsistent.
    pub fn load_from_blobs(blobs: &[&[u8]], params: IndexParams) -> Result<Self> {
        if blobs.len() < 3 {
            return Err(Error::LackOfInputs);
        }
        let vectors = VectorSet::load(&mut &blobs[0][..])?;
        let forest = BktForest::load(&mut &blobs[1][..])?;
        let graph = NeighborGraph::load(&mut &blobs[2][..])?;
        let deleted = if blobs.len() > 3 {
            DeletionSet::load(&mut &blobs[3][..])?
        } else {
            DeletionSet::new(vectors.count())
        };
        Self::assemble(params, vectors, forest, graph, deleted)
    }

    /// Stitches loaded parts into a ready index after consistency checks.
    fn assemble(
        params: IndexParams,
        vectors: VectorSet<T>,
        forest: BktForest,
        graph: NeighborGraph,
        deleted: DeletionSet,
    ) -> Result<Self> {
        let count = vectors.count();
        if graph.count() != count || deleted.len() != count || !forest.validate(count) {
            return Err(Error::FailedParseValue);
        }
        let index = Self::new(params);
        {
            let mut store = index
                .inner
                .store
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *store = Store {
                vectors,
                graph,
                deleted,
            };
        }
        {
            let mut slot = index
                .inner
                .forest
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = forest;
        }
        index.inner.ready.store(true, Ordering::Release);
        ftlog::info!("loaded index with {count} vectors");
        Ok(index)
    }
}

impl<T: Element> Drop for Index<T> {
    fn drop(&mut self) {
        // Disconnecting the channel lets the worker drain and exit.
        self.rebuild.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Grows the three stores together; any failure leaves the caller to roll
/// all of them back.
fn grow<T: Element>(store: &mut Store<T>, data: &[T], count: usize) -> Result<()> {
    store.vectors.append(data)?;
    store.graph.extend(count)?;
    store.deleted.grow(count)?;
    Ok(())
}

/// Builds a pool of the configured width.
fn thread_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|_| Error::Fail)
}

/// The background job: rebuild the forest over the live vectors and swap it
/// in. Failures are silent; the next threshold crossing tries again.
fn rebuild_forest<T: Element>(inner: &Inner<T>) {
    let params = inner
        .params
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let forest = {
        let store = inner.store.read().unwrap_or_else(PoisonError::into_inner);
        if store.vectors.count() == 0 {
            return;
        }
        ftlog::info!(
            "background rebuild over {} live vectors",
            store.vectors.count() - store.deleted.count()
        );
        build_forest(&store.vectors, &store.deleted, &params)
    };
    let mut slot = inner.forest.write().unwrap_or_else(PoisonError::into_inner);
    *slot = forest;
}

/// The swap-compact remap: walks ids from the front and pairs each deleted
/// prefix id with a live suffix id.
///
/// Returns the kept old ids in new-id order, and the old → new translation
/// (`-1` for deleted ids).
#[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn compact_remap(deleted: &DeletionSet, n: usize) -> (Vec<i32>, Vec<i32>) {
    let mut keep = Vec::with_capacity(n - deleted.count());
    let mut reverse = vec![-1_i32; n];
    let mut tail = n as i32;
    let mut id = 0_i32;
    while id < tail {
        if deleted.contains(id) {
            while tail > id && deleted.contains(tail - 1) {
                tail -= 1;
            }
            if tail == id {
                break;
            }
            keep.push(tail - 1);
            reverse[(tail - 1) as usize] = id;
            tail -= 1;
        } else {
            keep.push(id);
            reverse[id as usize] = id;
        }
        id += 1;
    }
    (keep, reverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::prelude::*;
    use rand::rngs::StdRng;

    /// Every graph row built through the public API keeps its shape: unique
    /// non-negative entries sorted by ascending distance, sentinels
    /// trailing, and the relative-neighborhood property between admitted
    /// neighbors.
    #[test]
    #[expect(clippy::cast_sign_loss)]
    fn graph_rows_hold_their_invariants() -> Result<()> {
        let mut params = IndexParams::default();
        params.dist_calc_method = DistanceKind::L2;
        params.neighborhood_size = 8;
        params.cef = 64;
        params.max_check_for_refine_graph = 512;

        let mut rng = StdRng::seed_from_u64(9);
        let dim = 8;
        let data: Vec<f32> = (0..200 * dim)
            .map(|_| rng.random_range(-1.0_f32..1.0))
            .collect();
        let index = Index::new(params.clone());
        index.build(&data, dim)?;

        let store = index
            .inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let kind = params.dist_calc_method;
        let width = store.graph.width();
        for row in 0..store.vectors.count() {
            let anchor = store.vectors.get(row);
            let mut neighbors: Vec<i32> = Vec::new();
            let mut dists: Vec<f32> = Vec::new();
            let mut ended = false;
            for slot in 0..width - 1 {
                let value = store.graph.slot(row, slot);
                if value < 0 {
                    assert_eq!(value, -1, "only -1 marks an empty slot");
                    ended = true;
                    continue;
                }
                assert!(!ended, "sentinels must be trailing in row {row}");
                assert!(
                    !neighbors.contains(&value),
                    "duplicate neighbor in row {row}"
                );
                neighbors.push(value);
                dists.push(kind.between(anchor, store.vectors.get(value as usize)));
            }
            for pair in dists.windows(2) {
                assert!(pair[0] <= pair[1], "row {row} not sorted by distance");
            }
            for (later, &b) in neighbors.iter().enumerate() {
                for &a in &neighbors[..later] {
                    let d_ab =
                        kind.between(store.vectors.get(a as usize), store.vectors.get(b as usize));
                    assert!(
                        dists[later] < d_ab,
                        "row {row}: neighbor {b} is shadowed by {a}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Exhaustive check of the remap's subtle decrement loop: for every
    /// deletion pattern over small sets, it keeps exactly the live ids and
    /// is a bijection onto the compacted range.
    #[test]
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn compact_remap_is_a_bijection_for_every_pattern() {
        for n in 0_usize..=10 {
            for mask in 0_u32..(1 << n) {
                let deleted = DeletionSet::new(n);
                for bit in 0..n {
                    if mask & (1 << bit) != 0 {
                        deleted.insert(bit as i32);
                    }
                }
                let live = n - mask.count_ones() as usize;
                let (keep, reverse) = compact_remap(&deleted, n);

                assert_eq!(keep.len(), live, "n={n} mask={mask:b}");

                // Each kept id is live and appears exactly once.
                let mut sorted = keep.clone();
                sorted.sort_unstable();
                sorted.dedup();
                assert_eq!(sorted.len(), live);
                assert!(sorted.iter().all(|&old| !deleted.contains(old)));

                // reverse inverts keep, and deleted ids map nowhere.
                for (new_id, &old_id) in keep.iter().enumerate() {
                    assert_eq!(reverse[old_id as usize], new_id as i32);
                }
                for old in 0..n {
                    if deleted.contains(old as i32) {
                        assert!(
                            !keep.contains(&(old as i32)),
                            "deleted id kept: n={n} mask={mask:b}"
                        );
                    }
                }
            }
        }
    }
}
