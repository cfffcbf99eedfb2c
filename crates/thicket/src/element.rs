//! The element types vectors may be made of.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// A numeric type the index can store vectors of.
///
/// Distance arithmetic always happens in `f32` regardless of the element
/// type; the trait provides the widening conversion, the rounding narrowing
/// conversion used by normalization, and the little-endian blob form used by
/// persistence.
///
/// The normalization base is the magnitude stored vectors are scaled to when
/// cosine distance is configured: the maximum value of the type for the
/// integer types, and `1.0` for floats, so that `BASE² − <x, y>` stays in a
/// range comparable to squared euclidean distances over the same data.
pub trait Element:
    Copy + PartialOrd + Send + Sync + std::fmt::Debug + num_traits::NumCast + 'static
{
    /// Magnitude stored vectors are scaled to when cosine distance is in use.
    const NORM_BASE: f32;

    /// Widens to `f32` for distance arithmetic.
    #[must_use]
    fn to_f32(self) -> f32 {
        num_traits::NumCast::from(self).unwrap_or(0.0)
    }

    /// Narrows from `f32`, rounding and saturating for the integer types.
    #[must_use]
    fn from_f32(value: f32) -> Self;

    /// Reads `n` elements in little-endian blob form.
    ///
    /// # Errors
    ///
    /// If the reader runs dry before `n` elements have been read.
    fn read_from<R: Read>(reader: &mut R, n: usize) -> std::io::Result<Vec<Self>>;

    /// Writes the elements in little-endian blob form.
    ///
    /// # Errors
    ///
    /// If the writer reports an error.
    fn write_to<W: Write>(writer: &mut W, values: &[Self]) -> std::io::Result<()>;
}

impl Element for f32 {
    const NORM_BASE: f32 = 1.0;

    fn from_f32(value: f32) -> Self {
        value
    }

    fn read_from<R: Read>(reader: &mut R, n: usize) -> std::io::Result<Vec<Self>> {
        let mut values = vec![0.0; n];
        reader.read_f32_into::<LittleEndian>(&mut values)?;
        Ok(values)
    }

    fn write_to<W: Write>(writer: &mut W, values: &[Self]) -> std::io::Result<()> {
        for &v in values {
            writer.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }
}

impl Element for i8 {
    const NORM_BASE: f32 = i8::MAX as f32;

    #[expect(clippy::cast_possible_truncation)]
    fn from_f32(value: f32) -> Self {
        value.round().clamp(Self::MIN as f32, Self::MAX as f32) as Self
    }

    fn read_from<R: Read>(reader: &mut R, n: usize) -> std::io::Result<Vec<Self>> {
        let mut values = vec![0; n];
        reader.read_i8_into(&mut values)?;
        Ok(values)
    }

    fn write_to<W: Write>(writer: &mut W, values: &[Self]) -> std::io::Result<()> {
        for &v in values {
            writer.write_i8(v)?;
        }
        Ok(())
    }
}

impl Element for u8 {
    const NORM_BASE: f32 = u8::MAX as f32;

    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, Self::MAX as f32) as Self
    }

    fn read_from<R: Read>(reader: &mut R, n: usize) -> std::io::Result<Vec<Self>> {
        let mut values = vec![0; n];
        reader.read_exact(&mut values)?;
        Ok(values)
    }

    fn write_to<W: Write>(writer: &mut W, values: &[Self]) -> std::io::Result<()> {
        writer.write_all(values)
    }
}

impl Element for i16 {
    const NORM_BASE: f32 = i16::MAX as f32;

    #[expect(clippy::cast_possible_truncation)]
    fn from_f32(value: f32) -> Self {
        value.round().clamp(Self::MIN as f32, Self::MAX as f32) as Self
    }

    fn read_from<R: Read>(reader: &mut R, n: usize) -> std::io::Result<Vec<Self>> {
        let mut values = vec![0; n];
        reader.read_i16_into::<LittleEndian>(&mut values)?;
        Ok(values)
    }

    fn write_to<W: Write>(writer: &mut W, values: &[Self]) -> std::io::Result<()> {
        for &v in values {
            writer.write_i16::<LittleEndian>(v)?;
        }
        Ok(())
    }
}
