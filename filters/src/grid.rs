use std::collections::BTreeMap;

use kpconv_common::{KpConvError, Result, StackedCloud};
use nalgebra::{DMatrix, RealField};
use num::ToPrimitive;
use rayon::prelude::*;

/// Regular-grid subsampling: every occupied cell is replaced by the barycenter
/// of its points.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GridSubsampling<T> {
    grid_size: T,
}

/// The outcome of [`GridSubsampling::subsample_with_data`].
#[derive(Debug, Clone, PartialEq)]
pub struct Subsampled<T: RealField> {
    pub points: DMatrix<T>,
    /// Averaged per cell.
    pub features: Option<DMatrix<T>>,
    /// Majority vote per cell, smallest label on ties.
    pub labels: Option<Vec<i32>>,
}

impl<T: RealField + Copy + ToPrimitive> GridSubsampling<T> {
    pub fn new(grid_size: T) -> Result<Self> {
        if grid_size > T::zero() {
            Ok(GridSubsampling { grid_size })
        } else {
            Err(KpConvError::InvalidConfig(format!(
                "grid size must be positive, got {grid_size}"
            )))
        }
    }

    #[inline]
    pub fn grid_size(&self) -> T {
        self.grid_size
    }

    /// Groups the given rows of `points` by cell, in ascending cell order.
    /// Cell coordinates are taken relative to the minimum corner of the rows.
    fn cells(&self, points: &DMatrix<T>, start: usize, len: usize) -> Result<Vec<Vec<usize>>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let rows = points.rows(start, len);
        let min = rows.row_iter().fold(rows.row(0).into_owned(), |acc, row| {
            acc.zip_map(&row, |a, b| a.min(b))
        });

        let mut index_point = { rows.row_iter().enumerate() }
            .map(|(i, row)| {
                let index = { row.iter().zip(min.iter()) }
                    .map(|(&x, &m)| ((x - m) / self.grid_size).floor().to_usize())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        KpConvError::InvalidConfig(format!("non-finite point at row {}", start + i))
                    })?;
                Ok((index, start + i))
            })
            .collect::<Result<Vec<_>>>()?;

        index_point.sort_by(|(i1, _), (i2, _)| i1.cmp(i2));

        Ok({ index_point.chunk_by(|(i1, _), (i2, _)| i1 == i2) }
            .map(|cell| cell.iter().map(|&(_, point)| point).collect())
            .collect())
    }

    fn average(data: &DMatrix<T>, cells: &[Vec<usize>]) -> DMatrix<T> {
        let mut out = DMatrix::zeros(cells.len(), data.ncols());
        for (mut target, cell) in out.row_iter_mut().zip(cells) {
            for &index in cell {
                target += data.row(index);
            }
            target /= nalgebra::convert::<f64, T>(cell.len() as f64);
        }
        out
    }

    /// Subsamples every cloud independently; the new lengths are the numbers
    /// of occupied cells.
    pub fn subsample(&self, cloud: &StackedCloud<T>) -> Result<StackedCloud<T>> {
        let ranges = cloud.cloud_ranges().collect::<Vec<_>>();
        let per_cloud = { ranges.into_par_iter() }
            .map(|range| self.cells(cloud.points(), range.start, range.len()))
            .collect::<Result<Vec<_>>>()?;

        let lengths = per_cloud.iter().map(Vec::len).collect::<Vec<_>>();
        let cells = per_cloud.into_iter().flatten().collect::<Vec<_>>();
        StackedCloud::new(Self::average(cloud.points(), &cells), lengths)
    }

    /// Subsamples a single cloud together with its per-point features and
    /// labels.
    pub fn subsample_with_data(
        &self,
        points: &DMatrix<T>,
        features: Option<&DMatrix<T>>,
        labels: Option<&[i32]>,
    ) -> Result<Subsampled<T>> {
        if let Some(features) = features {
            check_rows("features", points.nrows(), features.nrows())?;
        }
        if let Some(labels) = labels {
            check_rows("labels", points.nrows(), labels.len())?;
        }

        let cells = self.cells(points, 0, points.nrows())?;
        let labels = labels.map(|labels| {
            { cells.iter() }
                .map(|cell| majority(cell.iter().map(|&index| labels[index])))
                .collect()
        });
        Ok(Subsampled {
            points: Self::average(points, &cells),
            features: features.map(|features| Self::average(features, &cells)),
            labels,
        })
    }
}

fn check_rows(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(KpConvError::ShapeMismatch {
            what,
            expected,
            actual,
        })
    }
}

fn majority(labels: impl Iterator<Item = i32>) -> i32 {
    let mut counts = BTreeMap::new();
    labels.for_each(|label| *counts.entry(label).or_insert(0usize) += 1);
    { counts.into_iter() }
        .fold((0, 0), |(best, best_count), (label, count)| {
            if count > best_count {
                (label, count)
            } else {
                (best, best_count)
            }
        })
        .0
}
