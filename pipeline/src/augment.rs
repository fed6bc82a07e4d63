use std::f64::consts::PI;

use kpconv_common::{
    config::{KpConvConfig, RotationAugment},
    stacked::batch_inds,
    KpConvError, Result, StackedCloud,
};
use nalgebra::{DMatrix, Matrix3, RealField, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// The random transformation drawn for every cloud of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Augmentation<T: RealField> {
    /// `[num_clouds, 3]`, symmetries folded in as negative scales.
    pub scales: DMatrix<T>,
    /// Applied as `p' = p R` on row vectors.
    pub rotations: Vec<Matrix3<T>>,
}

impl<T: RealField + Copy> Augmentation<T> {
    pub fn identity(num_clouds: usize) -> Self {
        Augmentation {
            scales: DMatrix::from_element(num_clouds, 3, T::one()),
            rotations: vec![Matrix3::identity(); num_clouds],
        }
    }

    pub fn draw<R: Rng>(num_clouds: usize, cfg: &KpConvConfig, rng: &mut R) -> Self {
        let rotations = { (0..num_clouds) }
            .map(|_| match cfg.augment_rotation {
                RotationAugment::Vertical => vertical_rotation(rng.gen_range(0.0..2. * PI)),
                RotationAugment::None => Matrix3::identity(),
            })
            .collect();

        let (min, max) = (cfg.augment_scale_min, cfg.augment_scale_max);
        let draw_scale = |rng: &mut R| if min < max { rng.gen_range(min..max) } else { min };
        let mut scales = DMatrix::<T>::zeros(num_clouds, 3);
        for mut row in scales.row_iter_mut() {
            if cfg.augment_scale_anisotropic {
                row.iter_mut()
                    .for_each(|s: &mut T| *s = nalgebra::convert(draw_scale(rng)));
            } else {
                row.fill(nalgebra::convert(draw_scale(rng)));
            }
            for (s, &symmetric) in row.iter_mut().zip(&cfg.augment_symmetries) {
                if symmetric && rng.gen_bool(0.5) {
                    *s = -*s;
                }
            }
        }

        Augmentation { scales, rotations }
    }

    /// Rotates, scales and jitters every point with the transformation of its
    /// cloud.
    pub fn apply<R: Rng>(
        &self,
        cloud: &StackedCloud<T>,
        noise: f64,
        rng: &mut R,
    ) -> Result<StackedCloud<T>> {
        if cloud.dim() != 3 {
            return Err(KpConvError::ShapeMismatch {
                what: "augmented point dimension",
                expected: 3,
                actual: cloud.dim(),
            });
        }
        if cloud.num_clouds() != self.rotations.len() {
            return Err(KpConvError::ShapeMismatch {
                what: "number of augmented clouds",
                expected: self.rotations.len(),
                actual: cloud.num_clouds(),
            });
        }
        let normal = Normal::new(0., noise).map_err(|err| {
            KpConvError::InvalidConfig(format!("augment_noise {noise}: {err}"))
        })?;

        let mut points = cloud.points().clone();
        for (mut row, cloud_i) in points.row_iter_mut().zip(batch_inds(cloud.lengths())) {
            let p = Vector3::new(row[0], row[1], row[2]);
            let rotated = self.rotations[cloud_i].tr_mul(&p);
            for d in 0..3 {
                let jitter = nalgebra::convert::<f64, T>(normal.sample(rng));
                row[d] = rotated[d] * self.scales[(cloud_i, d)] + jitter;
            }
        }
        StackedCloud::new(points, cloud.lengths().to_vec())
    }
}

fn vertical_rotation<T: RealField + Copy>(theta: f64) -> Matrix3<T> {
    let (s, c) = theta.sin_cos();
    Matrix3::new(c, -s, 0., s, c, 0., 0., 0., 1.).map(nalgebra::convert)
}

/// Draws one transformation per cloud and applies it.
pub fn augment_input<T: RealField + Copy, R: Rng>(
    cloud: &StackedCloud<T>,
    cfg: &KpConvConfig,
    rng: &mut R,
) -> Result<(StackedCloud<T>, Augmentation<T>)> {
    let augmentation = Augmentation::draw(cloud.num_clouds(), cfg, rng);
    let augmented = augmentation.apply(cloud, cfg.augment_noise, rng)?;
    Ok((augmented, augmentation))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn cloud() -> StackedCloud<f64> {
        let points = DMatrix::from_fn(7, 3, |r, c| (r as f64 - 3.) * (c as f64 + 1.) * 0.1);
        StackedCloud::new(points, vec![4, 3]).unwrap()
    }

    #[test]
    fn test_identity_without_randomness() {
        let cfg = KpConvConfig {
            augment_rotation: RotationAugment::None,
            augment_scale_min: 1.,
            augment_scale_max: 1.,
            augment_symmetries: [false; 3],
            augment_noise: 0.,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let (augmented, aug) = augment_input(&cloud(), &cfg, &mut rng).unwrap();
        assert_eq!(aug, Augmentation::identity(2));
        assert_relative_eq!(augmented.points(), cloud().points());
    }

    #[test]
    fn test_vertical_rotation_keeps_height_and_norm() {
        let cfg = KpConvConfig {
            augment_scale_min: 1.,
            augment_scale_max: 1.,
            augment_symmetries: [false; 3],
            augment_noise: 0.,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let (augmented, aug) = augment_input(&cloud(), &cfg, &mut rng).unwrap();
        assert_eq!(aug.rotations.len(), 2);
        for (before, after) in cloud().points().row_iter().zip(augmented.points().row_iter()) {
            assert_relative_eq!(before[2], after[2], epsilon = 1e-12);
            assert_relative_eq!(before.norm(), after.norm(), epsilon = 1e-12);
        }
        for rotation in &aug.rotations {
            assert_relative_eq!(rotation.determinant(), 1., epsilon = 1e-12);
            assert_relative_eq!(rotation[(2, 2)], 1.);
        }
    }

    #[test]
    fn test_scales_and_symmetries() {
        let cfg = KpConvConfig {
            augment_rotation: RotationAugment::None,
            augment_scale_anisotropic: false,
            augment_symmetries: [true, false, false],
            augment_noise: 0.,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        let aug = Augmentation::<f64>::draw(64, &cfg, &mut rng);
        let mut flipped = 0;
        for row in aug.scales.row_iter() {
            assert_relative_eq!(row[0].abs(), row[1]);
            assert_relative_eq!(row[1], row[2]);
            assert!((0.9..1.1).contains(&row[1]));
            flipped += (row[0] < 0.) as usize;
        }
        assert!(flipped > 0 && flipped < 64);
    }

    #[test]
    fn test_rejects_2d_points() {
        let cfg = KpConvConfig::default();
        let cloud = StackedCloud::single(DMatrix::<f64>::zeros(3, 2));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            augment_input(&cloud, &cfg, &mut rng),
            Err(KpConvError::ShapeMismatch { expected: 3, actual: 2, .. })
        ));
    }
}
