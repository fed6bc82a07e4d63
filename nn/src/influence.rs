use kpconv_common::config::{Aggregation, Influence};
use nalgebra::RealField;

const GAUSSIAN_EPSILON: f64 = 1e-9;

/// Weight of a neighbor at squared distance `sq_distance` from a kernel point.
#[inline]
pub fn influence<T: RealField + Copy>(kind: Influence, sq_distance: T, extent: T) -> T {
    match kind {
        Influence::Constant => T::one(),
        Influence::Linear => (T::one() - sq_distance.sqrt() / extent).max(T::zero()),
        Influence::Gaussian => {
            let sigma = extent * nalgebra::convert(0.3);
            let denominator = sigma * sigma * nalgebra::convert(2.) + nalgebra::convert(GAUSSIAN_EPSILON);
            (-sq_distance / denominator).exp()
        }
    }
}

/// Fills `weights` with the influence of every kernel point on one neighbor,
/// given its squared distances to the kernel points.
///
/// In `closest` mode only the nearest kernel point (first one on ties) keeps
/// its weight.
pub fn kernel_weights<T: RealField + Copy>(
    kind: Influence,
    aggregation: Aggregation,
    sq_distances: &[T],
    extent: T,
    weights: &mut [T],
) {
    debug_assert_eq!(sq_distances.len(), weights.len());
    match aggregation {
        Aggregation::Sum => {
            for (w, &d2) in weights.iter_mut().zip(sq_distances) {
                *w = influence(kind, d2, extent);
            }
        }
        Aggregation::Closest => {
            weights.fill(T::zero());
            let nearest = { sq_distances.iter().enumerate() }.fold(None, |acc, (k, &d2)| match acc {
                Some((_, best)) if d2 >= best => acc,
                _ => Some((k, d2)),
            });
            if let Some((k, d2)) = nearest {
                weights[k] = influence(kind, d2, extent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_linear() {
        let extent = 1.5f64;
        assert_eq!(influence(Influence::Linear, 0.0, extent), 1.0);
        assert_eq!(influence(Influence::Linear, extent * extent, extent), 0.0);
        assert_eq!(influence(Influence::Linear, 9.0, extent), 0.0);

        let mut last = 1.0;
        for i in 1..15 {
            let d = i as f64 * 0.1;
            let w = influence(Influence::Linear, d * d, extent);
            assert!(w < last);
            assert_relative_eq!(w, 1.0 - d / extent, epsilon = 1e-12);
            last = w;
        }
    }

    #[test]
    fn test_gaussian_and_constant() {
        assert_eq!(influence(Influence::Gaussian, 0.0f64, 1.0), 1.0);
        let sigma: f64 = 0.3;
        assert_relative_eq!(
            influence(Influence::Gaussian, 0.25f64, 1.0),
            (-0.25 / (2. * sigma * sigma + 1e-9)).exp(),
            epsilon = 1e-12
        );
        assert_eq!(influence(Influence::Constant, 1e12f64, 1.0), 1.0);
    }

    #[test]
    fn test_closest_keeps_one() {
        let d2 = [0.5f64, 0.1, 0.3, 0.1];
        let mut weights = [0.0; 4];
        kernel_weights(Influence::Linear, Aggregation::Closest, &d2, 1.0, &mut weights);
        assert_eq!(weights.iter().filter(|&&w| w != 0.0).count(), 1);
        assert_relative_eq!(weights[1], 1.0 - 0.1f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(weights.iter().sum::<f64>(), weights[1]);

        kernel_weights(Influence::Linear, Aggregation::Sum, &d2, 1.0, &mut weights);
        assert!(weights.iter().all(|&w| w > 0.0));
    }
}
