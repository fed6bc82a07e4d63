use std::ops::Index;

use crate::error::{KpConvError, Result};

/// A `[rows, width]` matrix of support indices. Every row holds exactly
/// `width` entries; slots without a real neighbor hold the shadow index, which
/// equals the number of supports and dereferences to an appended sentinel row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NeighborIndex {
    storage: Vec<usize>,
    rows: usize,
    width: usize,
    shadow: usize,
}

impl NeighborIndex {
    pub fn new(storage: Vec<usize>, rows: usize, width: usize, shadow: usize) -> Result<Self> {
        if storage.len() != rows * width {
            return Err(KpConvError::ShapeMismatch {
                what: "neighbor index storage",
                expected: rows * width,
                actual: storage.len(),
            });
        }
        Ok(NeighborIndex {
            storage,
            rows,
            width,
            shadow,
        })
    }

    /// No query rows. The single column keeps the shape compatible with
    /// layers that carry no neighbors of a given kind.
    #[inline]
    pub fn empty(shadow: usize) -> Self {
        NeighborIndex {
            storage: Vec::new(),
            rows: 0,
            width: 1,
            shadow,
        }
    }

    /// Pads every row with the shadow index up to the longest row, with at
    /// least one column.
    pub fn from_rows<I>(rows: I, shadow: usize) -> Self
    where
        I: IntoIterator<Item = Vec<usize>>,
    {
        let rows = rows.into_iter().collect::<Vec<_>>();
        let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
        Self::from_rows_with_width(rows, shadow, width)
    }

    /// Truncates or pads every row to exactly `width` entries.
    pub fn from_rows_with_width<I>(rows: I, shadow: usize, width: usize) -> Self
    where
        I: IntoIterator<Item = Vec<usize>>,
    {
        let mut storage = Vec::new();
        let mut num = 0;
        for row in rows {
            let start = storage.len();
            storage.extend(row.into_iter().take(width));
            storage.resize(start + width, shadow);
            num += 1;
        }
        NeighborIndex {
            storage,
            rows: num,
            width,
            shadow,
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn shadow(&self) -> usize {
        self.shadow
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    #[inline]
    pub fn is_shadow(&self, value: usize) -> bool {
        value == self.shadow
    }

    #[inline]
    pub fn row(&self, query: usize) -> &[usize] {
        &self.storage[query * self.width..][..self.width]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[usize]> + '_ {
        (0..self.rows).map(move |query| self.row(query))
    }

    #[inline]
    pub fn as_slice(&self) -> &[usize] {
        &self.storage
    }

    pub fn real_count(&self, query: usize) -> usize {
        { self.row(query).iter() }
            .filter(|&&value| value != self.shadow)
            .count()
    }

    /// The nearest neighbor of every row, used by nearest upsampling.
    pub fn first_column(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.rows).map(move |query| self.row(query).first().copied().unwrap_or(self.shadow))
    }

    /// Keeps the first `limit` columns. Rows are ordered nearest first, so
    /// this drops the furthest neighbors of over-dense neighborhoods.
    pub fn crop(&self, limit: usize) -> Self {
        let width = self.width.min(limit.max(1));
        if width == self.width {
            return self.clone();
        }
        let storage = { self.iter_rows() }
            .flat_map(|row| row[..width].iter().copied())
            .collect();
        NeighborIndex {
            storage,
            rows: self.rows,
            width,
            shadow: self.shadow,
        }
    }

    /// Checks that the shadow index matches `num_supports` and that every
    /// entry dereferences either a support or the shadow row.
    pub fn validate(&self, num_supports: usize) -> Result<()> {
        if self.shadow != num_supports {
            return Err(KpConvError::ShapeMismatch {
                what: "neighbor shadow index",
                expected: num_supports,
                actual: self.shadow,
            });
        }
        for (index, &value) in self.storage.iter().enumerate() {
            if value > self.shadow {
                return Err(KpConvError::IndexOutOfRange {
                    row: index / self.width,
                    col: index % self.width,
                    value,
                    max: self.shadow,
                });
            }
        }
        Ok(())
    }
}

impl Index<(usize, usize)> for NeighborIndex {
    type Output = usize;

    #[inline]
    fn index(&self, (query, slot): (usize, usize)) -> &Self::Output {
        &self.storage[query * self.width + slot]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows_pads_with_shadow() {
        let index = NeighborIndex::from_rows(vec![vec![0, 2], vec![1], vec![]], 3);
        assert_eq!(index.rows(), 3);
        assert_eq!(index.width(), 2);
        assert_eq!(index.as_slice(), &[0, 2, 1, 3, 3, 3]);
        assert_eq!(index.real_count(1), 1);
        assert_eq!(index.real_count(2), 0);
        assert_eq!(index[(0, 1)], 2);
    }

    #[test]
    fn test_crop_and_first_column() {
        let index = NeighborIndex::from_rows(vec![vec![4, 1, 2], vec![3, 0]], 5);
        let cropped = index.crop(2);
        assert_eq!(cropped.width(), 2);
        assert_eq!(cropped.as_slice(), &[4, 1, 3, 0]);
        assert_eq!(index.first_column().collect::<Vec<_>>(), vec![4, 3]);
        assert_eq!(index.crop(10), index);
    }

    #[test]
    fn test_validate() {
        let index = NeighborIndex::new(vec![0, 1, 2, 3], 2, 2, 3).unwrap();
        assert!(index.validate(3).is_ok());
        assert!(matches!(
            index.validate(4),
            Err(KpConvError::ShapeMismatch { .. })
        ));

        let index = NeighborIndex::new(vec![0, 7], 1, 2, 3).unwrap();
        assert!(matches!(
            index.validate(3),
            Err(KpConvError::IndexOutOfRange {
                row: 0,
                col: 1,
                value: 7,
                max: 3
            })
        ));
        assert!(NeighborIndex::new(vec![0, 1, 2], 2, 2, 3).is_err());
    }
}
