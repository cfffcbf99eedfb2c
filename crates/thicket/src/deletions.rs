//! The monotonic membership set of deleted vector ids.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::vectors::BLOB_VERSION;

/// Bits per word of the set.
const WORD: usize = u64::BITS as usize;

/// A set-only bitset of deleted ids, readable without locks.
///
/// Bits are only ever set, never cleared; a compacting refine produces a
/// fresh, empty set for the new instance instead. Reads and inserts go
/// through atomics so queries may run concurrently with deletions.
pub(crate) struct DeletionSet {
    /// One bit per id.
    bits: Vec<AtomicU64>,
    /// Number of ids the set covers.
    len: usize,
    /// Number of set bits.
    count: AtomicUsize,
}

impl DeletionSet {
    /// An empty set covering `len` ids.
    pub fn new(len: usize) -> Self {
        let mut bits = Vec::new();
        bits.resize_with(len.div_ceil(WORD), AtomicU64::default);
        Self {
            bits,
            len,
            count: AtomicUsize::new(0),
        }
    }

    /// Number of ids the set covers.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether `id` has been deleted. Out-of-range ids read as live.
    #[expect(clippy::cast_sign_loss)]
    pub fn contains(&self, id: i32) -> bool {
        if id < 0 {
            return false;
        }
        let i = id as usize;
        if i >= self.len {
            return false;
        }
        self.bits[i / WORD].load(Ordering::Acquire) & (1 << (i % WORD)) != 0
    }

    /// Marks `id` deleted; `true` when the bit was newly set.
    #[expect(clippy::cast_sign_loss)]
    pub fn insert(&self, id: i32) -> bool {
        debug_assert!(id >= 0 && (id as usize) < self.len);
        let i = id as usize;
        let mask = 1 << (i % WORD);
        let previous = self.bits[i / WORD].fetch_or(mask, Ordering::AcqRel);
        if previous & mask == 0 {
            self.count.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Number of deleted ids.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Extends coverage by `extra` new, live ids.
    ///
    /// # Errors
    ///
    /// [`Error::MemoryOverflow`] when the word storage cannot grow; coverage
    /// is unchanged in that case.
    pub fn grow(&mut self, extra: usize) -> Result<()> {
        let words = (self.len + extra).div_ceil(WORD);
        self.bits
            .try_reserve(words.saturating_sub(self.bits.len()))
            .map_err(|_| Error::MemoryOverflow)?;
        self.bits.resize_with(words, AtomicU64::default);
        self.len += extra;
        Ok(())
    }

    /// Shrinks coverage back down to `len`; unwinds a partially applied
    /// growth. The dropped ids were never deletable, so no bits are lost.
    pub fn rollback(&mut self, len: usize) {
        self.bits.truncate(len.div_ceil(WORD));
        self.len = len;
    }

    /// Writes the blob form: version, coverage, words.
    ///
    /// # Errors
    ///
    /// [`Error::Fail`] when the writer reports an error.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut inner = || -> std::io::Result<()> {
            writer.write_u8(BLOB_VERSION)?;
            writer.write_i32::<LittleEndian>(self.len as i32)?;
            for word in &self.bits {
                writer.write_u64::<LittleEndian>(word.load(Ordering::Acquire))?;
            }
            Ok(())
        };
        inner().map_err(|_| Error::Fail)
    }

    /// Reads the blob form written by [`DeletionSet::save`].
    ///
    /// # Errors
    ///
    /// [`Error::FailedParseValue`] on a version mismatch or a short read.
    #[expect(clippy::cast_sign_loss)]
    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u8().map_err(|_| Error::FailedParseValue)?;
        if version != BLOB_VERSION {
            return Err(Error::FailedParseValue);
        }
        let len = reader
            .read_i32::<LittleEndian>()
            .map_err(|_| Error::FailedParseValue)?;
        if len < 0 {
            return Err(Error::FailedParseValue);
        }
        let len = len as usize;
        let mut bits = Vec::with_capacity(len.div_ceil(WORD));
        let mut count = 0;
        for _ in 0..len.div_ceil(WORD) {
            let word = reader
                .read_u64::<LittleEndian>()
                .map_err(|_| Error::FailedParseValue)?;
            count += word.count_ones() as usize;
            bits.push(AtomicU64::new(word));
        }
        Ok(Self {
            bits,
            len,
            count: AtomicUsize::new(count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let set = DeletionSet::new(100);
        assert!(!set.contains(42));
        assert!(set.insert(42));
        assert!(!set.insert(42));
        assert!(set.contains(42));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn growth_keeps_existing_bits() -> Result<()> {
        let mut set = DeletionSet::new(10);
        set.insert(3);
        set.grow(100)?;
        assert_eq!(set.len(), 110);
        assert!(set.contains(3));
        assert!(!set.contains(64));
        Ok(())
    }

    #[test]
    fn blob_round_trip() -> Result<()> {
        let set = DeletionSet::new(130);
        set.insert(0);
        set.insert(64);
        set.insert(129);
        let mut blob = Vec::new();
        set.save(&mut blob)?;
        let back = DeletionSet::load(&mut blob.as_slice())?;
        assert_eq!(back.len(), 130);
        assert_eq!(back.count(), 3);
        assert!(back.contains(0) && back.contains(64) && back.contains(129));
        assert!(!back.contains(1));
        Ok(())
    }
}
