use kpconv_common::{config::KpConvConfig, stacked::batch_inds, KpConvError, Result};
use nalgebra::{DMatrix, RealField};
use rand::Rng;

/// Columns of the raw batch colors: rgb followed by the original coordinates.
pub const COLOR_COLUMNS: usize = 6;

/// Builds the network input features from the augmented points and the raw
/// `[rgb | xyz]` colors, according to `cfg.in_features_dim`:
///
/// | dim | features |
/// |---|---|
/// | 1 | ones |
/// | 2 | ones, original z |
/// | 3 | rgb |
/// | 4 | ones, rgb |
/// | 5 | ones, rgb, original z |
/// | 7 | ones, rgb, augmented xyz |
///
/// For dimensions 4 and 5 the colors of a whole cloud are dropped with
/// probability `1 - augment_color`.
pub fn select_features<T: RealField + Copy, R: Rng>(
    points: &DMatrix<T>,
    colors: &DMatrix<T>,
    lengths: &[usize],
    cfg: &KpConvConfig,
    rng: &mut R,
) -> Result<DMatrix<T>> {
    let n = points.nrows();
    if colors.shape() != (n, COLOR_COLUMNS) {
        return Err(KpConvError::ShapeMismatch {
            what: "batch color columns",
            expected: COLOR_COLUMNS,
            actual: colors.ncols(),
        });
    }
    let total = lengths.iter().sum::<usize>();
    if total != n {
        return Err(KpConvError::BatchLengthMismatch {
            expected: n,
            actual: total,
        });
    }

    let mut rgb = colors.columns(0, 3).into_owned();
    if matches!(cfg.in_features_dim, 4 | 5) {
        let keep = { (0..lengths.len()) }
            .map(|_| rng.gen::<f64>() < cfg.augment_color)
            .collect::<Vec<_>>();
        for (mut row, cloud) in rgb.row_iter_mut().zip(batch_inds(lengths)) {
            if !keep[cloud] {
                row.fill(T::zero());
            }
        }
    }

    let ones = DMatrix::from_element(n, 1, T::one());
    let height = colors.columns(5, 1).into_owned();
    let blocks = match cfg.in_features_dim {
        1 => vec![ones],
        2 => vec![ones, height],
        3 => vec![rgb],
        4 => vec![ones, rgb],
        5 => vec![ones, rgb, height],
        7 => vec![ones, rgb, points.clone()],
        dim => return Err(KpConvError::UnsupportedFeatureDim(dim)),
    };

    let width = blocks.iter().map(DMatrix::ncols).sum();
    let mut features = DMatrix::zeros(n, width);
    let mut start = 0;
    for block in &blocks {
        features.columns_mut(start, block.ncols()).copy_from(block);
        start += block.ncols();
    }
    Ok(features)
}
