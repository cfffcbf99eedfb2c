//! The balanced k-means tree forest that seeds every search.

mod build;

pub(crate) use build::build_forest;

use std::cmp::Reverse;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::element::Element;
use crate::error::{Error, Result};
use crate::metric::DistanceKind;
use crate::search::{Hit, Workspace};
use crate::vectors::{BLOB_VERSION, VectorSet};

/// A node in the flat forest array.
///
/// Children occupy `child_start..child_end` of the same array, and every
/// node's children are contiguous. For a duplicate cluster the stored
/// `child_start` is negated: the node's center is the cluster representative
/// and the (negated) range holds the remaining members, one per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BktNode {
    /// The vector id of the cluster centroid sample; `-1` on a pseudo root.
    pub center: i32,
    /// First child index, negated for duplicate clusters, `-1` for leaves.
    pub child_start: i32,
    /// One past the last child index.
    pub child_end: i32,
}

impl BktNode {
    /// A childless node for the given center.
    pub fn new(center: i32) -> Self {
        Self {
            center,
            child_start: -1,
            child_end: -1,
        }
    }

    /// Whether the node ends a descent: a leaf or a duplicate cluster.
    pub fn is_terminal(&self) -> bool {
        self.child_start < 0
    }
}

/// A terminal cluster of the first tree, kept around for the graph builder.
pub(crate) struct LeafGroup {
    /// Index of the node the cluster hangs off.
    pub node: i32,
    /// The member ids, including the center where the cluster has one.
    pub members: Vec<i32>,
}

/// One or more balanced k-means trees over the live vectors, flattened into
/// a single node array with per-tree root offsets.
pub(crate) struct BktForest {
    /// All nodes of all trees.
    nodes: Vec<BktNode>,
    /// Index of each tree's root in `nodes`.
    roots: Vec<i32>,
    /// Terminal clusters of the first tree; rebuilt with the forest and not
    /// persisted (only graph construction consumes them).
    leaf_groups: Vec<LeafGroup>,
    /// How many vectors the forest was built over.
    sample_count: usize,
}

impl BktForest {
    /// An empty forest.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            roots: Vec::new(),
            leaf_groups: Vec::new(),
            sample_count: 0,
        }
    }

    /// The node at `t`, if `t` is in bounds.
    ///
    /// Graph back-links can go stale across a background rebuild, so callers
    /// must not assume their node indices resolve.
    pub fn node(&self, t: usize) -> Option<&BktNode> {
        self.nodes.get(t)
    }

    /// Total node count across all trees.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// How many vectors the forest was built over.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// The terminal clusters of the first tree.
    pub fn leaf_groups(&self) -> &[LeafGroup] {
        &self.leaf_groups
    }

    /// Seeds the tree frontier with every root's children, keyed by the
    /// distance from the query to each child's center.
    #[expect(clippy::cast_sign_loss)]
    pub fn init_search<T: Element>(
        &self,
        vectors: &VectorSet<T>,
        kind: DistanceKind,
        query: &[T],
        ws: &mut Workspace,
    ) {
        for &root in &self.roots {
            let node = self.nodes[root as usize];
            if node.is_terminal() {
                // A tree degenerated into a single duplicate cluster; its
                // center stands in for the whole tree.
                if node.center >= 0 {
                    let dist = kind.between(query, vectors.get(node.center as usize));
                    ws.spt_queue.push(Reverse(Hit::new(root, dist)));
                }
            } else {
                for child in node.child_start..node.child_end {
                    let center = self.nodes[child as usize].center;
                    let dist = kind.between(query, vectors.get(center as usize));
                    ws.spt_queue.push(Reverse(Hit::new(child, dist)));
                }
            }
        }
    }

    /// Pops tree nodes best-first, feeding centers onto the graph frontier,
    /// until `limit` leaves have been checked or the frontier drains.
    #[expect(clippy::cast_sign_loss)]
    pub fn search_more<T: Element>(
        &self,
        vectors: &VectorSet<T>,
        kind: DistanceKind,
        query: &[T],
        ws: &mut Workspace,
        limit: usize,
    ) {
        while let Some(Reverse(cell)) = ws.spt_queue.pop() {
            let node = self.nodes[cell.id as usize];
            if node.is_terminal() {
                if node.center >= 0 && !ws.visited.check_and_set(node.center) {
                    ws.checked_leaves += 1;
                    ws.ng_queue.push(Reverse(Hit::new(node.center, cell.dist)));
                }
                if ws.checked_leaves >= limit {
                    break;
                }
            } else {
                if node.center >= 0 && !ws.visited.check_and_set(node.center) {
                    ws.ng_queue.push(Reverse(Hit::new(node.center, cell.dist)));
                }
                for child in node.child_start..node.child_end {
                    let center = self.nodes[child as usize].center;
                    let dist = kind.between(query, vectors.get(center as usize));
                    ws.spt_queue.push(Reverse(Hit::new(child, dist)));
                }
            }
        }
    }

    /// Structural soundness for index-based traversal: every root, child
    /// range, and center stays in bounds. Fresh builds hold this by
    /// construction; loaded snapshots are checked before use.
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn validate(&self, vector_count: usize) -> bool {
        let n = self.nodes.len() as i32;
        let count = vector_count as i32;
        self.roots.iter().all(|&root| root >= 0 && root < n)
            && self.nodes.iter().all(|node| {
                let range_ok = if node.child_start >= 0 {
                    node.child_start <= node.child_end && node.child_end <= n
                } else if node.child_start < -1 {
                    -node.child_start <= node.child_end && node.child_end <= n
                } else {
                    true
                };
                range_ok && node.center >= -1 && node.center < count
            })
    }

    /// Writes the blob form: version, sample count, roots, nodes.
    ///
    /// # Errors
    ///
    /// [`Error::Fail`] when the writer reports an error.
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut inner = || -> std::io::Result<()> {
            writer.write_u8(BLOB_VERSION)?;
            writer.write_i32::<LittleEndian>(self.sample_count as i32)?;
            writer.write_i32::<LittleEndian>(self.roots.len() as i32)?;
            for &root in &self.roots {
                writer.write_i32::<LittleEndian>(root)?;
            }
            writer.write_i32::<LittleEndian>(self.nodes.len() as i32)?;
            for node in &self.nodes {
                writer.write_i32::<LittleEndian>(node.center)?;
                writer.write_i32::<LittleEndian>(node.child_start)?;
                writer.write_i32::<LittleEndian>(node.child_end)?;
            }
            Ok(())
        };
        inner().map_err(|_| Error::Fail)
    }

    /// Reads the blob form written by [`BktForest::save`].
    ///
    /// The leaf groups are not persisted; only a fresh build needs them.
    ///
    /// # Errors
    ///
    /// [`Error::FailedParseValue`] on a version mismatch, an implausible
    /// header, or a short read.
    #[expect(clippy::cast_sign_loss)]
    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let parse = Error::FailedParseValue;
        let version = reader.read_u8().map_err(|_| parse)?;
        if version != BLOB_VERSION {
            return Err(parse);
        }
        let sample_count = reader.read_i32::<LittleEndian>().map_err(|_| parse)?;
        let num_roots = reader.read_i32::<LittleEndian>().map_err(|_| parse)?;
        if sample_count < 0 || num_roots < 0 {
            return Err(parse);
        }
        let mut roots = Vec::with_capacity(num_roots as usize);
        for _ in 0..num_roots {
            roots.push(reader.read_i32::<LittleEndian>().map_err(|_| parse)?);
        }
        let num_nodes = reader.read_i32::<LittleEndian>().map_err(|_| parse)?;
        if num_nodes < 0 {
            return Err(parse);
        }
        let mut nodes = Vec::with_capacity(num_nodes as usize);
        for _ in 0..num_nodes {
            nodes.push(BktNode {
                center: reader.read_i32::<LittleEndian>().map_err(|_| parse)?,
                child_start: reader.read_i32::<LittleEndian>().map_err(|_| parse)?,
                child_end: reader.read_i32::<LittleEndian>().map_err(|_| parse)?,
            });
        }
        if roots.iter().any(|&r| r < 0 || r as usize >= nodes.len().max(1)) {
            return Err(parse);
        }
        Ok(Self {
            nodes,
            roots,
            leaf_groups: Vec::new(),
            sample_count: sample_count as usize,
        })
    }
}
