use kpconv_common::config::{KpConvConfig, OffsetLoss};
use nalgebra::RealField;

use crate::network::DeformationRecord;

const REPULSION_DISTANCE: f64 = 1.5;

fn mean<T: RealField + Copy>(sum: T, count: usize) -> T {
    if count == 0 {
        T::zero()
    } else {
        sum / nalgebra::convert(count as f64)
    }
}

/// Keeps deformed kernel points inside the deformable convolution radius.
fn permissive<T: RealField + Copy>(record: &DeformationRecord<T>, cfg: &KpConvConfig) -> T {
    let conv_radius = nalgebra::convert::<f64, T>(
        cfg.first_subsampling_dl * cfg.density_parameter * 2f64.powi(record.layer as i32),
    );
    let points = &record.deformation.deformed_points;
    let (sum, count) = { points.iter().flat_map(|kernel| kernel.row_iter()) }.fold(
        (T::zero(), 0),
        |(sum, count), kp| {
            let outside = (kp.norm() / conv_radius - T::one()).max(T::zero());
            (sum + outside, count + 1)
        },
    );
    mean(sum, count)
}

/// Pulls every kernel point towards its closest input point and pushes kernel
/// points of a query away from each other.
fn fitting<T: RealField + Copy>(record: &DeformationRecord<T>) -> T {
    let extent = record.extent;
    let min_d2 = &record.deformation.min_d2;
    let fit = mean(min_d2.sum() / (extent * extent), min_d2.len());

    let points = &record.deformation.deformed_points;
    let num_kpoints = points.first().map_or(0, |kernel| kernel.nrows());
    let threshold = nalgebra::convert::<f64, T>(REPULSION_DISTANCE);
    let repulsive = { (0..num_kpoints) }.fold(T::zero(), |acc, i| {
        let sum = { points.iter() }.fold(T::zero(), |acc, kernel| {
            let repulsion = { (0..num_kpoints).filter(|&j| j != i) }.fold(T::zero(), |acc, j| {
                let distance = (kernel.row(i) - kernel.row(j)).norm() / extent;
                let push = (threshold - distance).max(T::zero());
                acc + push * push
            });
            acc + repulsion
        });
        acc + mean(sum, points.len())
    });

    fit + repulsive
}

/// The offset regularization term of all deformable convolutions, scaled by
/// `offsets_decay`.
pub fn offset_loss<T: RealField + Copy>(records: &[DeformationRecord<T>], cfg: &KpConvConfig) -> T {
    let total = match cfg.offsets_loss {
        OffsetLoss::None => return T::zero(),
        OffsetLoss::Permissive => { records.iter() }.fold(T::zero(), |acc, r| acc + permissive(r, cfg)),
        OffsetLoss::Fitting => { records.iter() }.fold(T::zero(), |acc, r| acc + fitting(r)),
    };
    total * nalgebra::convert(cfg.offsets_decay)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    use super::*;
    use crate::kpconv::Deformation;

    fn record() -> DeformationRecord<f64> {
        DeformationRecord {
            block: 0,
            layer: 0,
            extent: 1.0,
            deformation: Deformation {
                deformed_points: vec![
                    DMatrix::from_row_slice(2, 3, &[0., 0., 0., 1., 0., 0.]),
                    DMatrix::from_row_slice(2, 3, &[0., 0., 0., 0., 3., 0.]),
                ],
                min_d2: DMatrix::from_row_slice(2, 2, &[0.5, 1.0, 1.5, 1.0]),
                modulations: None,
            },
        }
    }

    #[test]
    fn test_none() {
        let cfg = KpConvConfig {
            offsets_loss: OffsetLoss::None,
            ..Default::default()
        };
        assert_eq!(offset_loss(&[record()], &cfg), 0.0);
    }

    #[test]
    fn test_fitting() {
        let cfg = KpConvConfig {
            offsets_loss: OffsetLoss::Fitting,
            offsets_decay: 0.1,
            ..Default::default()
        };
        // Mean min_d2 is 1.0. Only the first query has kernel points closer
        // than 1.5 extents: each of the two sees (1.5 - 1)^2, averaged over
        // two queries.
        let expected = 1.0 + 2. * (0.25 / 2.);
        assert_relative_eq!(offset_loss(&[record()], &cfg), 0.1 * expected, epsilon = 1e-12);
    }

    #[test]
    fn test_permissive() {
        let cfg = KpConvConfig {
            offsets_loss: OffsetLoss::Permissive,
            offsets_decay: 1.0,
            first_subsampling_dl: 0.2,
            density_parameter: 5.0,
            ..Default::default()
        };
        // Radius 1.0: only the point at distance 3 lies outside, by 2.
        assert_relative_eq!(offset_loss(&[record()], &cfg), 2. / 4., epsilon = 1e-12);
    }
}
