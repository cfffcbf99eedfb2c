//! The RNG-pruned neighborhood graph.

mod refine;

pub(crate) use refine::{build_graph, refine_graph, refine_node};

use std::io::{Read, Write};
use std::sync::atomic::{AtomicI32, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::vectors::BLOB_VERSION;

/// Slot value meaning "no neighbor".
pub(crate) const EMPTY_SLOT: i32 = -1;

/// Encodes forest node `t` for a back-link slot.
#[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub(crate) fn encode_tree_link(t: usize) -> i32 {
    -2 - t as i32
}

/// Decodes a back-link slot into a forest node index, if it holds one.
#[expect(clippy::cast_sign_loss)]
pub(crate) fn decode_tree_link(value: i32) -> Option<usize> {
    (value < -1).then(|| (-2 - value) as usize)
}

/// Fixed-width neighbor lists, one row per vector.
///
/// Row `i` holds up to `width - 1` neighbor ids sorted by ascending distance
/// from vector `i`, RNG-pruned, with trailing [`EMPTY_SLOT`]s. The final
/// slot is reserved for the tree back-link: [`EMPTY_SLOT`] for most rows, a
/// representative's vector id for duplicate-cluster members, or an encoded
/// forest node index for the representative itself.
///
/// Slots are atomics so the single refining writer may overlap lock-free
/// concurrent readers; a torn row read degrades approximation, never
/// soundness.
pub(crate) struct NeighborGraph {
    /// Row width, including the back-link slot.
    width: usize,
    /// `count × width` slots, row-major.
    rows: Vec<AtomicI32>,
}

impl NeighborGraph {
    /// An empty graph of `count` rows, `width` slots each.
    pub fn new(width: usize, count: usize) -> Self {
        let width = width.max(2);
        let mut rows = Vec::new();
        rows.resize_with(width * count, || AtomicI32::new(EMPTY_SLOT));
        Self { width, rows }
    }

    /// Row width, including the back-link slot.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows.
    pub fn count(&self) -> usize {
        self.rows.len() / self.width
    }

    /// The raw slots of row `i`.
    pub fn row(&self, i: usize) -> &[AtomicI32] {
        &self.rows[i * self.width..(i + 1) * self.width]
    }

    /// Slot `s` of row `i`.
    pub fn slot(&self, i: usize, s: usize) -> i32 {
        self.rows[i * self.width + s].load(Ordering::Relaxed)
    }

    /// Stores `value` into slot `s` of row `i`.
    pub fn set_slot(&self, i: usize, s: usize, value: i32) {
        self.rows[i * self.width + s].store(value, Ordering::Relaxed);
    }

    /// The back-link slot of row `i`.
    pub fn back_link(&self, i: usize) -> i32 {
        self.slot(i, self.width - 1)
    }

    /// Replaces the neighbor slots of row `i`, padding with
    /// [`EMPTY_SLOT`]s. The back-link slot is left untouched.
    pub fn write_neighbors(&self, i: usize, neighbors: &[i32]) {
        for s in 0..self.width - 1 {
            self.set_slot(i, s, neighbors.get(s).copied().unwrap_or(EMPTY_SLOT));
        }
    }

    /// Appends `extra` empty rows.
    ///
    /// # Errors
    ///
    /// [`Error::MemoryOverflow`] when the slot storage cannot grow; the
    /// graph is unchanged in that case.
    pub fn extend(&mut self, extra: usize) -> Result<()> {
        self.rows
            .try_reserve(extra * self.width)
            .map_err(|_| Error::MemoryOverflow)?;
        self.rows
            .resize_with(self.rows.len() + extra * self.width, || {
                AtomicI32::new(EMPTY_SLOT)
            });
        Ok(())
    }

    /// Drops rows back down to `count`; unwinds a partially applied growth.
    pub fn rollback(&mut self, count: usize) {
        self.rows.truncate(count * self.width);
    }

    /// Writes the blob form: version, row count, width, slots.
    ///
    /// # Errors
    ///
    /// [`Error::Fail`] when the writer reports an error.
    #[expect(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut inner = || -> std::io::Result<()> {
            writer.write_u8(BLOB_VERSION)?;
            writer.write_i32::<LittleEndian>(self.count() as i32)?;
            writer.write_i32::<LittleEndian>(self.width as i32)?;
            for slot in &self.rows {
                writer.write_i32::<LittleEndian>(slot.load(Ordering::Relaxed))?;
            }
            Ok(())
        };
        inner().map_err(|_| Error::Fail)
    }

    /// Reads the blob form written by [`NeighborGraph::save`].
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
        let count = reader.read_i32::<LittleEndian>().map_err(|_| parse)?;
        let width = reader.read_i32::<LittleEndian>().map_err(|_| parse)?;
        if count < 0 || width < 2 {
            return Err(parse);
        }
        let total = count as usize * width as usize;
        let mut rows = Vec::with_capacity(total);
        for _ in 0..total {
            let value = reader.read_i32::<LittleEndian>().map_err(|_| parse)?;
            rows.push(AtomicI32::new(value));
        }
        Ok(Self {
            width: width as usize,
            rows,
        })
    }
}
