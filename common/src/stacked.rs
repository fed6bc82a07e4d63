use std::ops::Range;

use nalgebra::{DMatrix, RealField, Scalar};

use crate::{
    error::{KpConvError, Result},
    neighbors::NeighborIndex,
};

/// Several independent clouds concatenated row-wise into one `[N, dim]`
/// matrix. Cloud boundaries are the prefix sums of `lengths`.
#[derive(Debug, Clone, PartialEq)]
pub struct StackedCloud<T: Scalar> {
    points: DMatrix<T>,
    lengths: Vec<usize>,
}

impl<T: Scalar> StackedCloud<T> {
    pub fn new(points: DMatrix<T>, lengths: Vec<usize>) -> Result<Self> {
        let total = lengths.iter().sum::<usize>();
        if total != points.nrows() {
            return Err(KpConvError::BatchLengthMismatch {
                expected: points.nrows(),
                actual: total,
            });
        }
        Ok(StackedCloud { points, lengths })
    }

    #[inline]
    pub fn single(points: DMatrix<T>) -> Self {
        let lengths = vec![points.nrows()];
        StackedCloud { points, lengths }
    }

    #[inline]
    pub fn points(&self) -> &DMatrix<T> {
        &self.points
    }

    #[inline]
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Total number of stacked points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    #[inline]
    pub fn num_clouds(&self) -> usize {
        self.lengths.len()
    }

    pub fn cloud_ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        cloud_ranges(&self.lengths)
    }

    pub fn cloud(&self, index: usize) -> Option<DMatrix<T>> {
        let range = self.cloud_ranges().nth(index)?;
        Some(self.points.rows(range.start, range.len()).into_owned())
    }
}

impl<T: Scalar + num::Zero> StackedCloud<T> {
    pub fn empty(dim: usize) -> Self {
        StackedCloud {
            points: DMatrix::zeros(0, dim),
            lengths: Vec::new(),
        }
    }
}

pub fn cloud_ranges(lengths: &[usize]) -> impl Iterator<Item = Range<usize>> + '_ {
    lengths.iter().scan(0, |start, &len| {
        let range = *start..*start + len;
        *start += len;
        Some(range)
    })
}

/// The cloud id of every stacked point, e.g. `[3, 2, 5]` gives
/// `[0, 0, 0, 1, 1, 2, 2, 2, 2, 2]`.
pub fn batch_inds(lengths: &[usize]) -> Vec<usize> {
    { lengths.iter().enumerate() }
        .flat_map(|(cloud, &len)| std::iter::repeat(cloud).take(len))
        .collect()
}

/// A `[num_clouds, max_len]` matrix listing the stacked indices of every cloud,
/// padded with the shadow index (the total point count). An all-shadow column
/// is appended when no row needs padding.
pub fn stack_batch_inds(lengths: &[usize]) -> NeighborIndex {
    let num_points = lengths.iter().sum::<usize>();
    let max_len = lengths.iter().copied().max().unwrap_or(0);
    let width = if num_points == max_len * lengths.len() {
        max_len + 1
    } else {
        max_len
    };
    NeighborIndex::from_rows_with_width(
        cloud_ranges(lengths).map(|range| range.collect()),
        num_points,
        width,
    )
}

/// Per-point loss weight: the smallest cloud length over the length of the
/// point's own cloud.
pub fn batch_weights<T: RealField + Copy>(lengths: &[usize]) -> Vec<T> {
    let min_len = match lengths.iter().copied().min() {
        Some(min_len) => T::from_usize(min_len).unwrap_or_else(T::zero),
        None => return Vec::new(),
    };
    { lengths.iter() }
        .flat_map(|&len| {
            let weight = min_len / T::from_usize(len).unwrap_or_else(T::one);
            std::iter::repeat(weight).take(len)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_batch_inds() {
        assert_eq!(batch_inds(&[4, 2]), vec![0, 0, 0, 0, 1, 1]);
        assert_eq!(batch_inds(&[3, 2, 5]), vec![0, 0, 0, 1, 1, 2, 2, 2, 2, 2]);
        assert_eq!(batch_inds(&[0, 1]), vec![1]);
    }

    #[test]
    fn test_stack_batch_inds() {
        let inds = stack_batch_inds(&[3, 1]);
        assert_eq!(inds.width(), 3);
        assert_eq!(inds.shadow(), 4);
        assert_eq!(inds.as_slice(), &[0, 1, 2, 3, 4, 4]);

        // No padding needed: a shadow column is appended.
        let inds = stack_batch_inds(&[2, 2]);
        assert_eq!(inds.width(), 3);
        assert_eq!(inds.as_slice(), &[0, 1, 4, 2, 3, 4]);
    }

    #[test]
    fn test_batch_weights() {
        let weights = batch_weights::<f64>(&[2, 4]);
        assert_eq!(weights.len(), 6);
        assert_relative_eq!(weights[0], 1.0);
        assert_relative_eq!(weights[5], 0.5);
    }

    #[test]
    fn test_length_mismatch() {
        let points = DMatrix::<f32>::zeros(5, 3);
        assert!(StackedCloud::new(points.clone(), vec![2, 3]).is_ok());
        assert!(matches!(
            StackedCloud::new(points, vec![2, 2]),
            Err(KpConvError::BatchLengthMismatch {
                expected: 5,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_cloud_rows() {
        let points = DMatrix::from_fn(5, 2, |r, c| (r * 2 + c) as f32);
        let stacked = StackedCloud::new(points, vec![3, 2]).unwrap();
        let second = stacked.cloud(1).unwrap();
        assert_eq!(second.nrows(), 2);
        assert_eq!(second[(0, 0)], 6.0);
        assert!(stacked.cloud(2).is_none());
    }
}
