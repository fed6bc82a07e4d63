use kpconv_common::{stacked::cloud_ranges, KpConvError, NeighborIndex, Result};
use nalgebra::{DMatrix, RealField, RowDVector};

/// Gathers one row of `x` per index, `shadow_row` standing for the shadow
/// index.
fn gather<'a, T: RealField + Copy>(
    x: &'a DMatrix<T>,
    shadow_row: &'a RowDVector<T>,
    inds: &'a NeighborIndex,
    query: usize,
) -> impl Iterator<Item = RowDVector<T>> + 'a {
    { inds.row(query).iter() }.map(move |&index| {
        if inds.is_shadow(index) {
            shadow_row.clone()
        } else {
            x.row(index).into_owned()
        }
    })
}

/// Max over the pooling neighborhood of every query. Shadow entries resolve to
/// the column-wise minimum of `x`.
pub fn max_pool<T: RealField + Copy>(x: &DMatrix<T>, inds: &NeighborIndex) -> Result<DMatrix<T>> {
    inds.validate(x.nrows())?;
    let shadow_row = if x.nrows() > 0 {
        RowDVector::from_iterator(x.ncols(), x.column_iter().map(|col| col.min()))
    } else {
        RowDVector::zeros(x.ncols())
    };

    let mut out = DMatrix::zeros(inds.rows(), x.ncols());
    for (query, mut target) in out.row_iter_mut().enumerate() {
        let pooled = gather(x, &shadow_row, inds, query)
            .reduce(|acc, row| acc.zip_map(&row, |a, b| a.max(b)))
            .unwrap_or_else(|| shadow_row.clone());
        target.copy_from(&pooled);
    }
    Ok(out)
}

/// Copies the features of the first (nearest) index of every query. Shadow
/// entries give zero rows.
pub fn closest_pool<T: RealField + Copy>(
    x: &DMatrix<T>,
    inds: &NeighborIndex,
) -> Result<DMatrix<T>> {
    inds.validate(x.nrows())?;
    let mut out = DMatrix::zeros(inds.rows(), x.ncols());
    for (mut target, index) in out.row_iter_mut().zip(inds.first_column()) {
        if !inds.is_shadow(index) {
            target.copy_from(&x.row(index));
        }
    }
    Ok(out)
}

/// `[B, C]` mean of the features of every cloud. Empty clouds average to zero.
pub fn global_average<T: RealField + Copy>(
    x: &DMatrix<T>,
    lengths: &[usize],
) -> Result<DMatrix<T>> {
    let total = lengths.iter().sum::<usize>();
    if total != x.nrows() {
        return Err(KpConvError::BatchLengthMismatch {
            expected: x.nrows(),
            actual: total,
        });
    }
    let mut out = DMatrix::zeros(lengths.len(), x.ncols());
    for (mut target, range) in out.row_iter_mut().zip(cloud_ranges(lengths)) {
        if range.is_empty() {
            continue;
        }
        let rows = x.rows(range.start, range.len());
        target.copy_from(&rows.row_mean());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_max_pool() {
        let x = DMatrix::from_row_slice(3, 2, &[1., -4., 3., -2., -1., 0.]);
        let inds = NeighborIndex::from_rows(vec![vec![0, 1], vec![2], vec![]], 3);
        let pooled = max_pool(&x, &inds).unwrap();
        assert_eq!(pooled, DMatrix::from_row_slice(3, 2, &[3., -2., -1., 0., -1., -4.]));
    }

    #[test]
    fn test_closest_pool() {
        let x = DMatrix::from_row_slice(2, 2, &[1., 2., 3., 4.]);
        let inds = NeighborIndex::from_rows(vec![vec![1, 0], vec![0], vec![]], 2);
        let pooled = closest_pool(&x, &inds).unwrap();
        assert_eq!(pooled, DMatrix::from_row_slice(3, 2, &[3., 4., 1., 2., 0., 0.]));

        let bad = NeighborIndex::from_rows(vec![vec![5]], 2);
        assert!(closest_pool(&x, &bad).is_err());
    }

    #[test]
    fn test_global_average() {
        let x = DMatrix::from_fn(10, 2, |r, c| (r * r + c) as f64);
        let out = global_average(&x, &[3, 2, 5]).unwrap();
        assert_eq!(out.shape(), (3, 2));
        assert_relative_eq!(out[(0, 0)], 5. / 3., epsilon = 1e-12);
        assert_relative_eq!(out[(1, 1)], (9. + 16. + 2.) / 2., epsilon = 1e-12);

        let out = global_average(&x, &[0, 10]).unwrap();
        assert_eq!(out.row(0).iter().copied().collect::<Vec<_>>(), vec![0., 0.]);
        assert!(global_average(&x, &[3, 3]).is_err());
    }
}
