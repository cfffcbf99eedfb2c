//! Flat storage for the indexed vectors.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::element::Element;
use crate::error::{Error, Result};

/// Version byte leading every persisted blob.
pub(crate) const BLOB_VERSION: u8 = 1;

/// The contiguous `count × dim` table of stored vectors.
///
/// Rows are identified by their append order; ids are never reused within an
/// instance, and a compacted copy is a new instance with new ids.
pub(crate) struct VectorSet<T> {
    /// Row width; fixed at construction.
    dim: usize,
    /// `count × dim` elements, row-major.
    data: Vec<T>,
}

impl<T: Element> VectorSet<T> {
    /// An empty set of `dim`-wide rows.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    /// Wraps pre-shaped row-major data.
    pub fn with_data(dim: usize, data: Vec<T>) -> Self {
        debug_assert!(dim > 0 && data.len() % dim == 0);
        Self { dim, data }
    }

    /// Row width.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of rows, live and deleted alike.
    pub fn count(&self) -> usize {
        self.data.len() / self.dim
    }

    /// Row `i` as a read-only view.
    pub fn get(&self, i: usize) -> &[T] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Row `i` as a mutable view; only normalization writes through this.
    pub fn get_mut(&mut self, i: usize) -> &mut [T] {
        &mut self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Appends whole rows, reporting allocation failure instead of aborting.
    ///
    /// # Errors
    ///
    /// [`Error::MemoryOverflow`] when the backing storage cannot grow; the
    /// set is unchanged in that case.
    pub fn append(&mut self, batch: &[T]) -> Result<()> {
        debug_assert_eq!(batch.len() % self.dim, 0);
        self.data
            .try_reserve(batch.len())
            .map_err(|_| Error::MemoryOverflow)?;
        self.data.extend_from_slice(batch);
        Ok(())
    }

    /// Drops rows back down to `count`; unwinds a partially applied append.
    pub fn rollback(&mut self, count: usize) {
        self.data.truncate(count * self.dim);
    }

    /// A compacted copy holding the given rows, in the given order.
    #[expect(clippy::cast_sign_loss)]
    pub fn refine(&self, keep: &[i32]) -> Self {
        let mut data = Vec::with_capacity(keep.len() * self.dim);
        for &id in keep {
            data.extend_from_slice(self.get(id as usize));
        }
        Self {
            dim: self.dim,
            data,
        }
    }

    /// Writes the blob form: version, count, dimension, row data.
    ///
    /// # Errors
    ///
    /// [`Error::Fail`] when the writer reports an error.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut inner = || -> std::io::Result<()> {
            writer.write_u8(BLOB_VERSION)?;
            writer.write_i32::<LittleEndian>(self.count() as i32)?;
            writer.write_i32::<LittleEndian>(self.dim as i32)?;
            T::write_to(&mut *writer, &self.data)
        };
        inner().map_err(|_| Error::Fail)
    }

    /// Reads the blob form written by [`VectorSet::save`].
    ///
    /// # Errors
    ///
    /// [`Error::FailedParseValue`] on a version mismatch, an implausible
    /// header, or a short read.
    #[expect(clippy::cast_sign_loss)]
    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u8().map_err(|_| Error::FailedParseValue)?;
        if version != BLOB_VERSION {
            return Err(Error::FailedParseValue);
        }
        let count = reader
            .read_i32::<LittleEndian>()
            .map_err(|_| Error::FailedParseValue)?;
        let dim = reader
            .read_i32::<LittleEndian>()
            .map_err(|_| Error::FailedParseValue)?;
        if count < 0 || dim <= 0 {
            return Err(Error::FailedParseValue);
        }
        let data = T::read_from(reader, count as usize * dim as usize)
            .map_err(|_| Error::FailedParseValue)?;
        Ok(Self {
            dim: dim as usize,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VectorSet<f32> {
        VectorSet::with_data(2, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
    }

    #[test]
    fn rows_are_addressable() {
        let set = sample();
        assert_eq!(set.count(), 3);
        assert_eq!(set.get(1), &[2.0, 3.0]);
    }

    #[test]
    fn append_extends_and_rollback_unwinds() -> Result<()> {
        let mut set = sample();
        set.append(&[6.0, 7.0])?;
        assert_eq!(set.count(), 4);
        assert_eq!(set.get(3), &[6.0, 7.0]);
        set.rollback(3);
        assert_eq!(set.count(), 3);
        Ok(())
    }

    #[test]
    fn refine_keeps_rows_in_order() {
        let set = sample();
        let refined = set.refine(&[2, 0]);
        assert_eq!(refined.count(), 2);
        assert_eq!(refined.get(0), &[4.0, 5.0]);
        assert_eq!(refined.get(1), &[0.0, 1.0]);
    }

    #[test]
    fn blob_round_trip() -> Result<()> {
        let set = sample();
        let mut blob = Vec::new();
        set.save(&mut blob)?;
        let back = VectorSet::<f32>::load(&mut blob.as_slice())?;
        assert_eq!(back.dim(), 2);
        assert_eq!(back.count(), 3);
        assert_eq!(back.get(2), set.get(2));
        Ok(())
    }

    #[test]
    fn truncated_blob_fails_to_parse() -> Result<()> {
        let set = sample();
        let mut blob = Vec::new();
        set.save(&mut blob)?;
        blob.truncate(blob.len() - 1);
        assert_eq!(
            VectorSet::<f32>::load(&mut blob.as_slice()).map(|_| ()),
            Err(Error::FailedParseValue)
        );
        Ok(())
    }
}
