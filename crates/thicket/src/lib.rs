//! An in-memory index for approximate nearest neighbor search over
//! high-dimensional vectors.
//!
//! The index is a hybrid of two structures that cover each other's weak
//! spots:
//!
//! - a forest of balanced k-means trees that turns a query into good entry
//!   points anywhere in the space, and
//! - a relative-neighborhood-pruned graph that walks from those entry points
//!   to the true neighborhood in a handful of hops.
//!
//! Queries run the two together: tree pivots feed a best-first frontier, the
//! graph expands it, and fresh pivots are pulled in whenever the graph stops
//! improving. Top-k results come back sorted by distance.
//!
//! The [`Index`] supports incremental insertion, soft deletion, periodic
//! compaction (`refine`), snapshot persistence, and concurrent queries
//! against a single writer.
//!
//! ```
//! use thicket::{DistanceKind, Index, IndexParams};
//!
//! let mut params = IndexParams::default();
//! params.dist_calc_method = DistanceKind::L2;
//!
//! let index = Index::new(params);
//! index.build(&[0.0_f32, 0.0, 1.0, 1.0, 2.0, 2.0], 2)?;
//!
//! let hits = index.search(&[1.1, 1.1], 1)?;
//! assert_eq!(hits[0].0, 1);
//! # Ok::<(), thicket::Error>(())
//! ```

mod deletions;
mod element;
mod error;
mod forest;
mod graph;
mod index;
mod metric;
mod params;
mod search;
mod vectors;

pub use element::Element;
pub use error::{Error, Result};
pub use index::Index;
pub use metric::DistanceKind;
pub use params::IndexParams;
