use nalgebra::{DMatrix, RealField, RowDVector};
use rand::Rng;

pub const LEAKY_SLOPE: f64 = 0.1;
pub const BATCH_NORM_EPSILON: f64 = 1e-3;

pub fn leaky_relu<T: RealField + Copy>(x: DMatrix<T>) -> DMatrix<T> {
    let slope = nalgebra::convert::<f64, T>(LEAKY_SLOPE);
    x.map(|v| if v < T::zero() { v * slope } else { v })
}

/// Dense layer without bias.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear<T: RealField + Copy> {
    /// `[in, out]`
    pub weights: DMatrix<T>,
}

impl<T: RealField + Copy> Linear<T> {
    /// Glorot-uniform initialization.
    pub fn new<R: Rng>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        let fan = in_dim + out_dim;
        let limit = if fan > 0 { (6. / fan as f64).sqrt() } else { 0. };
        let weights = DMatrix::from_fn(in_dim, out_dim, |_, _| {
            nalgebra::convert((rng.gen::<f64>() * 2. - 1.) * limit)
        });
        Linear { weights }
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.weights.nrows()
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&self, x: &DMatrix<T>) -> DMatrix<T> {
        x * &self.weights
    }
}

/// Batch normalization in inference form, or a plain bias when disabled.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchNormBlock<T: RealField + Copy> {
    Norm {
        gamma: RowDVector<T>,
        beta: RowDVector<T>,
        running_mean: RowDVector<T>,
        running_var: RowDVector<T>,
        momentum: T,
    },
    Bias(RowDVector<T>),
}

impl<T: RealField + Copy> BatchNormBlock<T> {
    pub fn new(dim: usize, use_bn: bool, momentum: T) -> Self {
        if use_bn {
            BatchNormBlock::Norm {
                gamma: RowDVector::from_element(dim, T::one()),
                beta: RowDVector::zeros(dim),
                running_mean: RowDVector::zeros(dim),
                running_var: RowDVector::from_element(dim, T::one()),
                momentum,
            }
        } else {
            BatchNormBlock::Bias(RowDVector::zeros(dim))
        }
    }

    pub fn forward(&self, mut x: DMatrix<T>) -> DMatrix<T> {
        match self {
            BatchNormBlock::Norm {
                gamma,
                beta,
                running_mean,
                running_var,
                ..
            } => {
                let eps = nalgebra::convert::<f64, T>(BATCH_NORM_EPSILON);
                for mut row in x.row_iter_mut() {
                    for (c, v) in row.iter_mut().enumerate() {
                        *v = gamma[c] * (*v - running_mean[c]) / (running_var[c] + eps).sqrt()
                            + beta[c];
                    }
                }
                x
            }
            BatchNormBlock::Bias(bias) => {
                for mut row in x.row_iter_mut() {
                    row += bias;
                }
                x
            }
        }
    }

    /// Moves the running statistics towards those of `x`.
    pub fn update_statistics(&mut self, x: &DMatrix<T>) {
        if let BatchNormBlock::Norm {
            running_mean,
            running_var,
            momentum,
            ..
        } = self
        {
            if x.nrows() == 0 {
                return;
            }
            let mean = x.row_mean();
            let var = x.row_variance();
            let rest = T::one() - *momentum;
            *running_mean = &*running_mean * *momentum + mean * rest;
            *running_var = &*running_var * *momentum + var * rest;
        }
    }
}

/// Dense layer, normalization and an optional leaky ReLU.
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryBlock<T: RealField + Copy> {
    pub mlp: Linear<T>,
    pub batch_norm: BatchNormBlock<T>,
    pub no_relu: bool,
}

impl<T: RealField + Copy> UnaryBlock<T> {
    pub fn new<R: Rng>(
        in_dim: usize,
        out_dim: usize,
        use_bn: bool,
        momentum: T,
        no_relu: bool,
        rng: &mut R,
    ) -> Self {
        UnaryBlock {
            mlp: Linear::new(in_dim, out_dim, rng),
            batch_norm: BatchNormBlock::new(out_dim, use_bn, momentum),
            no_relu,
        }
    }

    pub fn forward(&self, x: &DMatrix<T>) -> DMatrix<T> {
        let x = self.batch_norm.forward(self.mlp.forward(x));
        if self.no_relu {
            x
        } else {
            leaky_relu(x)
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn test_leaky_relu() {
        let x = DMatrix::from_row_slice(1, 3, &[-2.0f64, 0., 3.]);
        assert_eq!(leaky_relu(x), DMatrix::from_row_slice(1, 3, &[-0.2, 0., 3.]));
    }

    #[test]
    fn test_linear_glorot() {
        let linear = Linear::<f64>::new(10, 14, &mut StdRng::seed_from_u64(0));
        let limit = (6.0f64 / 24.).sqrt();
        assert!(linear.weights.iter().all(|w| w.abs() <= limit));
        let x = DMatrix::from_element(3, 10, 1.);
        assert_eq!(linear.forward(&x).shape(), (3, 14));
    }

    #[test]
    fn test_batch_norm() {
        let x = DMatrix::from_row_slice(2, 2, &[1.0f64, 2., 3., 4.]);
        let bn = BatchNormBlock::new(2, true, 0.99);
        let y = bn.forward(x.clone());
        assert_relative_eq!(y[(1, 1)], 4. / (1.0f64 + 1e-3).sqrt(), epsilon = 1e-12);

        let mut bn = BatchNormBlock::new(2, true, 0.5);
        bn.update_statistics(&DMatrix::from_row_slice(2, 2, &[1., 0., 5., 0.]));
        if let BatchNormBlock::Norm {
            running_mean,
            running_var,
            ..
        } = &bn
        {
            assert_relative_eq!(running_mean[0], 1.5, epsilon = 1e-12);
            assert_relative_eq!(running_var[0], 2.5, epsilon = 1e-12);
            assert_relative_eq!(running_var[1], 0.5, epsilon = 1e-12);
        }

        let bias = BatchNormBlock::<f64>::new(2, false, 0.99);
        assert_eq!(bias.forward(x.clone()), x);
    }
}
