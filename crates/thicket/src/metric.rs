//! Distance selection and vector normalization.

use std::str::FromStr;

use crate::element::Element;
use crate::error::Error;

/// The distance method the index orders candidates by.
///
/// Both methods yield values where smaller means closer, and both are kept on
/// comparable scales so the same termination thresholds work under either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceKind {
    /// Squared euclidean distance.
    L2,
    /// `BASE² − <x, y>` over vectors normalized to magnitude `BASE`.
    ///
    /// Orders identically to the angular distance on normalized inputs;
    /// normalization happens on build and add, not per query candidate.
    #[default]
    Cosine,
}

impl DistanceKind {
    /// Distance between two stored vectors.
    #[must_use]
    pub fn between<T: Element>(self, x: &[T], y: &[T]) -> f32 {
        match self {
            Self::L2 => x
                .iter()
                .zip(y.iter())
                .map(|(&a, &b)| {
                    let d = a.to_f32() - b.to_f32();
                    d * d
                })
                .sum(),
            Self::Cosine => {
                T::NORM_BASE * T::NORM_BASE
                    - x.iter()
                        .zip(y.iter())
                        .map(|(&a, &b)| a.to_f32() * b.to_f32())
                        .sum::<f32>()
            }
        }
    }

    /// Distance from an `f32` centroid to a stored vector.
    ///
    /// The k-means loop keeps virtual centroids in `f32` regardless of the
    /// element type.
    pub(crate) fn from_centroid<T: Element>(self, centroid: &[f32], y: &[T]) -> f32 {
        match self {
            Self::L2 => centroid
                .iter()
                .zip(y.iter())
                .map(|(&c, &b)| {
                    let d = c - b.to_f32();
                    d * d
                })
                .sum(),
            Self::Cosine => {
                T::NORM_BASE * T::NORM_BASE
                    - centroid
                        .iter()
                        .zip(y.iter())
                        .map(|(&c, &b)| c * b.to_f32())
                        .sum::<f32>()
            }
        }
    }
}

impl FromStr for DistanceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("L2") {
            Ok(Self::L2)
        } else if s.eq_ignore_ascii_case("Cosine") {
            Ok(Self::Cosine)
        } else {
            Err(Error::FailedParseValue)
        }
    }
}

impl std::fmt::Display for DistanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::L2 => write!(f, "L2"),
            Self::Cosine => write!(f, "Cosine"),
        }
    }
}

/// Scales `v` to magnitude [`Element::NORM_BASE`] in place.
///
/// Zero vectors are left untouched; there is no direction to preserve.
pub(crate) fn normalize<T: Element>(v: &mut [T]) {
    let norm = v
        .iter()
        .map(|&x| {
            let f = x.to_f32();
            f * f
        })
        .sum::<f32>()
        .sqrt();
    if norm <= f32::EPSILON {
        return;
    }
    let scale = T::NORM_BASE / norm;
    for x in v.iter_mut() {
        *x = T::from_f32(x.to_f32() * scale);
    }
}

/// `f32` twin of [`normalize`], for the k-means centroids.
pub(crate) fn normalize_f32(v: &mut [f32], base: f32) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return;
    }
    let scale = base / norm;
    for x in v.iter_mut() {
        *x *= scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_is_squared_euclidean() {
        let x = [1.0_f32, 2.0, 3.0];
        let y = [4.0_f32, 5.0, 6.0];
        float_cmp::assert_approx_eq!(f32, DistanceKind::L2.between(&x, &y), 27.0);
    }

    #[test]
    fn cosine_of_identical_normalized_vectors_is_zero() {
        let mut x = vec![3.0_f32, 4.0];
        normalize(&mut x);
        let d = DistanceKind::Cosine.between(&x, &x);
        float_cmp::assert_approx_eq!(f32, d, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn integer_normalization_targets_the_type_base() {
        let mut x = vec![10_i8, 0, 0];
        normalize(&mut x);
        assert_eq!(x, vec![127, 0, 0]);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("l2".parse::<DistanceKind>(), Ok(DistanceKind::L2));
        assert_eq!("COSINE".parse::<DistanceKind>(), Ok(DistanceKind::Cosine));
        assert_eq!(
            "manhattan".parse::<DistanceKind>(),
            Err(Error::FailedParseValue)
        );
    }
}
