//! The best-first traversal that combines the forest and the graph.

mod results;
mod workspace;

pub(crate) use results::Hit;
pub(crate) use workspace::{Workspace, WorkspacePool};

use std::cmp::Reverse;

use crate::deletions::DeletionSet;
use crate::element::Element;
use crate::forest::BktForest;
use crate::graph::{self, NeighborGraph};
use crate::params::IndexParams;
use crate::vectors::VectorSet;

/// Read-only views of everything one query touches.
///
/// The coordinator assembles one of these under its locks; nothing below this
/// layer knows locks exist.
pub(crate) struct SearchContext<'a, T> {
    /// The stored vectors.
    pub vectors: &'a VectorSet<T>,
    /// The neighborhood graph.
    pub graph: &'a NeighborGraph,
    /// The tree forest.
    pub forest: &'a BktForest,
    /// The deletion set.
    pub deleted: &'a DeletionSet,
    /// The active configuration.
    pub params: &'a IndexParams,
}

/// Runs a standard top-k query: duplication check on, per-query budget.
pub(crate) fn search<T: Element>(
    ctx: &SearchContext<'_, T>,
    query: &[T],
    ws: &mut Workspace,
    k: usize,
    search_deleted: bool,
) -> Vec<(i32, f32)> {
    ws.reset(
        ctx.vectors.count(),
        k,
        ctx.params.max_check,
        ctx.params.continuous_limit,
    );
    dispatch(ctx, query, ws, search_deleted, true)
}

/// Runs a refine-time query: deeper budget, duplication check selectable.
///
/// Row refinement wants the budget of `MaxCheckForRefineGraph` and usually
/// wants every candidate, even ones the caller already holds.
pub(crate) fn refine_search<T: Element>(
    ctx: &SearchContext<'_, T>,
    query: &[T],
    ws: &mut Workspace,
    k: usize,
    dedup: bool,
) -> Vec<(i32, f32)> {
    ws.reset(
        ctx.vectors.count(),
        k,
        ctx.params.max_check_for_refine_graph,
        ctx.params.continuous_limit,
    );
    dispatch(ctx, query, ws, false, dedup)
}

/// Picks the specialization for this query's predicates.
///
/// The four instantiations are semantically the generic algorithm with the
/// deletion and duplication predicates substituted; specializing keeps the
/// hot loop free of dead branches.
fn dispatch<T: Element>(
    ctx: &SearchContext<'_, T>,
    query: &[T],
    ws: &mut Workspace,
    search_deleted: bool,
    check_dup: bool,
) -> Vec<(i32, f32)> {
    let hide_deleted = ctx.deleted.count() > 0 && !search_deleted;
    match (hide_deleted, check_dup) {
        (false, false) => walk::<T, false, false>(ctx, query, ws),
        (false, true) => walk::<T, false, true>(ctx, query, ws),
        (true, false) => walk::<T, true, false>(ctx, query, ws),
        (true, true) => walk::<T, true, true>(ctx, query, ws),
    }
}

/// The best-first walk itself.
///
/// Tree pivots seed the graph frontier; popping the frontier admits results
/// and expands neighbors; fresh pivots are pulled whenever the nearest queued
/// tree node is closer than the nearest queued graph node. Terminates when
/// the frontier drains, the distance budget is spent, or too many consecutive
/// pops fail to improve the results.
#[expect(clippy::cast_sign_loss)]
fn walk<T: Element, const HIDE_DELETED: bool, const CHECK_DUP: bool>(
    ctx: &SearchContext<'_, T>,
    query: &[T],
    ws: &mut Workspace,
) -> Vec<(i32, f32)> {
    let kind = ctx.params.dist_calc_method;
    ctx.forest.init_search(ctx.vectors, kind, query, ws);
    ctx.forest
        .search_more(ctx.vectors, kind, query, ws, ctx.params.initial_dynamic_pivots);

    let width = ctx.graph.width();

    while let Some(Reverse(cell)) = ws.ng_queue.pop() {
        let row = cell.id as usize;
        prefetch(ctx.graph, ctx.vectors, row);

        if cell.dist <= ws.results.worst_dist() {
            admit::<T, HIDE_DELETED, CHECK_DUP>(ctx, ws, cell);
        } else {
            ws.no_better += 1;
            if ws.no_better > ws.continuous_limit || ws.checked_leaves > ws.max_check {
                break;
            }
        }

        // Expand the neighbor slots; the back-link slot is not a neighbor.
        for slot in 0..width - 1 {
            let neighbor = ctx.graph.slot(row, slot);
            if neighbor < 0 {
                break;
            }
            if ws.visited.check_and_set(neighbor) {
                continue;
            }
            let dist = kind.between(query, ctx.vectors.get(neighbor as usize));
            ws.checked_leaves += 1;
            ws.ng_queue.push(Reverse(Hit::new(neighbor, dist)));
        }

        // If the tree frontier now looks more promising than the graph
        // frontier, pull more pivots out of the forest.
        let tree_is_closer = match (ws.ng_queue.peek(), ws.spt_queue.peek()) {
            (Some(Reverse(ng)), Some(Reverse(spt))) => ng.dist > spt.dist,
            _ => false,
        };
        if tree_is_closer {
            let budget = ctx.params.other_dynamic_pivots + ws.checked_leaves;
            ctx.forest.search_more(ctx.vectors, kind, query, ws, budget);
        }
    }

    ws.results.take_sorted()
}

/// Offers a popped frontier node (or the duplicate cluster behind it) to the
/// result set.
#[expect(clippy::cast_sign_loss)]
fn admit<T: Element, const HIDE_DELETED: bool, const CHECK_DUP: bool>(
    ctx: &SearchContext<'_, T>,
    ws: &mut Workspace,
    cell: Hit,
) {
    let link = ctx.graph.back_link(cell.id as usize);

    // A back-link into the forest means this row represents a cluster of
    // duplicates; the members are recorded behind the tree node. A stale
    // link (the forest was rebuilt underneath) fails the bounds or shape
    // checks and degrades to plain admission.
    let duplicate_range = graph::decode_tree_link(link)
        .and_then(|t| ctx.forest.node(t))
        .filter(|node| node.child_start < 0)
        .map(|node| {
            let start = (-node.child_start) as usize;
            let end = (node.child_end.max(0) as usize).min(ctx.forest.node_count());
            (start, end.max(start))
        });

    if let Some((start, end)) = duplicate_range {
        let members = std::iter::once(cell.id)
            .chain((start..end).filter_map(|t| ctx.forest.node(t)).map(|n| n.center));
        // With the duplication check on, members keep flowing in while the
        // result set accepts them and the walk stops at the first rejection;
        // without it, exactly one admission attempt is made.
        for member in members {
            if HIDE_DELETED && ctx.deleted.contains(member) {
                continue;
            }
            ws.no_better = 0;
            if CHECK_DUP {
                if !ws.results.insert_unique(member, cell.dist) {
                    break;
                }
            } else {
                ws.results.insert(member, cell.dist);
                break;
            }
        }
    } else if !(HIDE_DELETED && ctx.deleted.contains(cell.id)) {
        ws.no_better = 0;
        if CHECK_DUP {
            ws.results.insert_unique(cell.id, cell.dist);
        } else {
            ws.results.insert(cell.id, cell.dist);
        }
    }
}

/// Warms the cache lines the next loop iteration will touch: the row itself
/// and the vectors of its neighbors.
#[cfg(target_arch = "x86_64")]
#[expect(clippy::cast_sign_loss)]
fn prefetch<T: Element>(graph: &NeighborGraph, vectors: &VectorSet<T>, row: usize) {
    use core::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
    use std::sync::atomic::Ordering;

    let slots = graph.row(row);
    // SAFETY: prefetch reads nothing and writes nothing; any address is
    // sound to hint.
    #[expect(unsafe_code)]
    unsafe {
        _mm_prefetch::<_MM_HINT_T0>(slots.as_ptr().cast::<i8>());
        for slot in slots {
            let neighbor = slot.load(Ordering::Relaxed);
            if neighbor < 0 {
                break;
            }
            if (neighbor as usize) < vectors.count() {
                _mm_prefetch::<_MM_HINT_T0>(vectors.get(neighbor as usize).as_ptr().cast::<i8>());
            }
        }
    }
}

/// No-op on targets without prefetch hints.
#[cfg(not(target_arch = "x86_64"))]
fn prefetch<T: Element>(_graph: &NeighborGraph, _vectors: &VectorSet<T>, _row: usize) {}
