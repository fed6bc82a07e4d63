use kpconv_common::{
    config::{Aggregation, FixedKernelPoints, Influence},
    filter::Filter,
    KpConvError, NeighborIndex, Result,
};
use nalgebra::{DMatrix, RealField, RowDVector};
use rand::Rng;

use crate::{influence::kernel_weights, kernel_points};

/// Coordinate of the sentinel support row that shadow indices resolve to.
const SHADOW_COORDINATE: f64 = 1e6;

#[derive(Debug, Clone, PartialEq)]
pub struct KpConvParams<T> {
    pub num_kpoints: usize,
    pub point_dim: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    /// Influence distance of a single kernel point.
    pub extent: T,
    /// Radius of the ball the kernel points live in.
    pub radius: T,
    pub fixed: FixedKernelPoints,
    pub influence: Influence,
    pub aggregation: Aggregation,
    pub deformable: bool,
    pub modulated: bool,
}

/// Predicts per-query kernel point offsets (and modulations) with a rigid
/// convolution sharing the kernel points of its parent.
#[derive(Debug, Clone, PartialEq)]
struct OffsetPredictor<T: RealField + Copy> {
    conv: Box<KpConv<T>>,
    bias: RowDVector<T>,
    modulated: bool,
}

/// Kernel point convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct KpConv<T: RealField + Copy> {
    kernel_points: DMatrix<T>,
    /// The `K` weight matrices `[Cin, Cout]` stacked into `[K * Cin, Cout]`.
    weights: DMatrix<T>,
    in_channels: usize,
    extent: T,
    radius: T,
    influence: Influence,
    aggregation: Aggregation,
    offsets: Option<OffsetPredictor<T>>,
}

/// Per-query state of the deformed kernel, returned for regularization.
#[derive(Debug, Clone, PartialEq)]
pub struct Deformation<T: RealField> {
    /// `[K, dim]` deformed kernel points of every query.
    pub deformed_points: Vec<DMatrix<T>>,
    /// `[Nq, K]` smallest squared distance from each kernel point to a
    /// neighbor of the query.
    pub min_d2: DMatrix<T>,
    /// `[Nq, K]` in `[0, 2]`, when modulated.
    pub modulations: Option<DMatrix<T>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KpConvOutput<T: RealField> {
    /// `[Nq, Cout]`
    pub features: DMatrix<T>,
    pub deformation: Option<Deformation<T>>,
}

fn he_uniform<T: RealField + Copy, R: Rng>(
    rows: usize,
    cols: usize,
    fan_in: usize,
    rng: &mut R,
) -> DMatrix<T> {
    let limit = if fan_in > 0 {
        (6. / fan_in as f64).sqrt()
    } else {
        0.
    };
    DMatrix::from_fn(rows, cols, |_, _| {
        nalgebra::convert((rng.gen::<f64>() * 2. - 1.) * limit)
    })
}

#[inline]
fn sigmoid<T: RealField + Copy>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

impl<T: RealField + Copy> KpConv<T> {
    /// Generates the kernel points and initializes the weights from `rng`.
    pub fn new<R: Rng>(params: &KpConvParams<T>, rng: &mut R) -> Result<Self> {
        let kernel_points = kernel_points::generate(
            params.radius,
            params.num_kpoints,
            params.point_dim,
            params.fixed,
            rng,
        )?;
        let weights = he_uniform(
            params.num_kpoints * params.in_channels,
            params.out_channels,
            params.num_kpoints * params.in_channels,
            rng,
        );
        let mut conv = KpConv::from_parts(
            kernel_points,
            weights,
            params.in_channels,
            params.extent,
            params.radius,
            params.influence,
            params.aggregation,
        )?;
        if params.deformable {
            conv = conv.with_offsets(params.modulated);
        }
        Ok(conv)
    }

    /// A rigid convolution from explicit kernel points `[K, dim]` and stacked
    /// weights `[K * in_channels, Cout]`.
    pub fn from_parts(
        kernel_points: DMatrix<T>,
        weights: DMatrix<T>,
        in_channels: usize,
        extent: T,
        radius: T,
        influence: Influence,
        aggregation: Aggregation,
    ) -> Result<Self> {
        let expected = kernel_points.nrows() * in_channels;
        if weights.nrows() != expected {
            return Err(KpConvError::ShapeMismatch {
                what: "stacked kernel weights",
                expected,
                actual: weights.nrows(),
            });
        }
        Ok(KpConv {
            kernel_points,
            weights,
            in_channels,
            extent,
            radius,
            influence,
            aggregation,
            offsets: None,
        })
    }

    /// Makes the convolution deformable. The offset predictor starts with zero
    /// weights and bias, so the kernel is initially rigid.
    pub fn with_offsets(mut self, modulated: bool) -> Self {
        let (k, dim) = self.kernel_points.shape();
        let offset_dim = if modulated { (dim + 1) * k } else { dim * k };
        let conv = KpConv {
            kernel_points: self.kernel_points.clone(),
            weights: DMatrix::zeros(k * self.in_channels, offset_dim),
            in_channels: self.in_channels,
            extent: self.extent,
            radius: self.radius,
            influence: self.influence,
            aggregation: self.aggregation,
            offsets: None,
        };
        self.offsets = Some(OffsetPredictor {
            conv: Box::new(conv),
            bias: RowDVector::zeros(offset_dim),
            modulated,
        });
        self
    }

    #[inline]
    pub fn kernel_points(&self) -> &DMatrix<T> {
        &self.kernel_points
    }

    #[inline]
    pub fn num_kpoints(&self) -> usize {
        self.kernel_points.nrows()
    }

    #[inline]
    pub fn point_dim(&self) -> usize {
        self.kernel_points.ncols()
    }

    #[inline]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    #[inline]
    pub fn out_channels(&self) -> usize {
        self.weights.ncols()
    }

    #[inline]
    pub fn extent(&self) -> T {
        self.extent
    }

    #[inline]
    pub fn radius(&self) -> T {
        self.radius
    }

    #[inline]
    pub fn is_deformable(&self) -> bool {
        self.offsets.is_some()
    }

    #[inline]
    pub fn weights(&self) -> &DMatrix<T> {
        &self.weights
    }

    pub fn set_weights(&mut self, weights: DMatrix<T>) -> Result<()> {
        if weights.shape() != self.weights.shape() {
            return Err(KpConvError::ShapeMismatch {
                what: "stacked kernel weights",
                expected: self.weights.len(),
                actual: weights.len(),
            });
        }
        self.weights = weights;
        Ok(())
    }

    /// Weights and bias of the offset predictor, if deformable.
    pub fn offset_parameters_mut(&mut self) -> Option<(&mut DMatrix<T>, &mut RowDVector<T>)> {
        { self.offsets.as_mut() }.map(|offsets| (&mut offsets.conv.weights, &mut offsets.bias))
    }

    fn check_inputs(
        &self,
        queries: &DMatrix<T>,
        supports: &DMatrix<T>,
        neighbors: &NeighborIndex,
        features: &DMatrix<T>,
    ) -> Result<()> {
        let checks = [
            ("query dimension", self.point_dim(), queries.ncols()),
            ("support dimension", self.point_dim(), supports.ncols()),
            ("feature rows", supports.nrows(), features.nrows()),
            ("feature channels", self.in_channels, features.ncols()),
            ("neighbor rows", queries.nrows(), neighbors.rows()),
        ];
        for (what, expected, actual) in checks {
            if expected != actual {
                return Err(KpConvError::ShapeMismatch {
                    what,
                    expected,
                    actual,
                });
            }
        }
        neighbors.validate(supports.nrows())
    }

    /// Squared distances `[M * K]` (slot-major) from the centered neighbors
    /// of `query` to `kernel`.
    fn sq_distances(
        query: usize,
        kernel: &DMatrix<T>,
        queries: &DMatrix<T>,
        supports: &DMatrix<T>,
        neighbors: &NeighborIndex,
    ) -> Vec<T> {
        let shadow = nalgebra::convert::<f64, T>(SHADOW_COORDINATE);
        let (k, dim) = kernel.shape();
        let mut out = Vec::with_capacity(neighbors.width() * k);
        for &index in neighbors.row(query) {
            for kp in 0..k {
                let d2 = { (0..dim) }.fold(T::zero(), |acc, d| {
                    let coord = if neighbors.is_shadow(index) {
                        shadow
                    } else {
                        supports[(index, d)]
                    };
                    let diff = coord - queries[(query, d)] - kernel[(kp, d)];
                    acc + diff * diff
                });
                out.push(d2);
            }
        }
        out
    }

    pub fn forward(
        &self,
        queries: &DMatrix<T>,
        supports: &DMatrix<T>,
        neighbors: &NeighborIndex,
        features: &DMatrix<T>,
    ) -> Result<KpConvOutput<T>> {
        self.check_inputs(queries, supports, neighbors, features)?;

        let (num_kpoints, dim) = self.kernel_points.shape();
        let num_queries = queries.nrows();

        let (kernels, modulations) = match &self.offsets {
            Some(offsets) => {
                let mut raw = offsets
                    .conv
                    .forward(queries, supports, neighbors, features)?
                    .features;
                for mut row in raw.row_iter_mut() {
                    row += &offsets.bias;
                }
                let kernels = { (0..num_queries) }
                    .map(|q| {
                        DMatrix::from_fn(num_kpoints, dim, |kp, d| {
                            self.kernel_points[(kp, d)] + raw[(q, kp * dim + d)] * self.extent
                        })
                    })
                    .collect::<Vec<_>>();
                let modulations = offsets.modulated.then(|| {
                    DMatrix::from_fn(num_queries, num_kpoints, |q, kp| {
                        sigmoid(raw[(q, dim * num_kpoints + kp)]) * nalgebra::convert(2.)
                    })
                });
                (Some(kernels), modulations)
            }
            None => (None, None),
        };

        let all_d2 = { (0..num_queries) }
            .map(|q| {
                let kernel = match &kernels {
                    Some(kernels) => &kernels[q],
                    None => &self.kernel_points,
                };
                Self::sq_distances(q, kernel, queries, supports, neighbors)
            })
            .collect::<Vec<_>>();

        // Slots (into each neighbor row) that take part in the convolution,
        // with the support index each one dereferences.
        let (slots, deformed) = if let Some(kernels) = kernels {
            let extent2 = self.extent * self.extent;
            let far = T::max_value().unwrap_or_else(T::one);
            let mut mins = DMatrix::from_element(num_queries, num_kpoints, far);
            let ranked = { all_d2.iter().enumerate() }
                .map(|(q, d2)| {
                    let in_range = { d2.chunks(num_kpoints.max(1)) }
                        .map(|slot| {
                            slot.iter().zip(mins.row_mut(q).iter_mut()).for_each(|(&d, m)| {
                                if d < *m {
                                    *m = d
                                }
                            });
                            slot.iter().any(|&d| d < extent2)
                        })
                        .collect::<Vec<_>>();
                    { |&hit: &bool| hit }.filter_all_indices(&in_range[..])
                })
                .collect::<Vec<_>>();

            let new_max = ranked.iter().map(|(kept, _)| kept.len()).max().unwrap_or(0);
            let slots = { ranked.into_iter().enumerate() }
                .map(|(q, (kept, removed))| {
                    let row = neighbors.row(q);
                    let in_range = kept.len();
                    { kept.into_iter().chain(removed).take(new_max).enumerate() }
                        .map(|(rank, slot)| {
                            let index = if rank < in_range {
                                row[slot]
                            } else {
                                neighbors.shadow()
                            };
                            (slot, index)
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>();
            (slots, Some((kernels, mins)))
        } else {
            let slots = { (0..num_queries) }
                .map(|q| neighbors.row(q).iter().copied().enumerate().collect())
                .collect::<Vec<Vec<_>>>();
            (slots, None)
        };

        let mut weighted = DMatrix::zeros(num_queries, num_kpoints * self.in_channels);
        let mut weights = vec![T::zero(); num_kpoints];
        for (q, slots) in slots.iter().enumerate() {
            for &(slot, index) in slots {
                if neighbors.is_shadow(index) {
                    continue;
                }
                let d2 = &all_d2[q][slot * num_kpoints..][..num_kpoints];
                kernel_weights(self.influence, self.aggregation, d2, self.extent, &mut weights);
                for (kp, &w) in weights.iter().enumerate() {
                    if w == T::zero() {
                        continue;
                    }
                    let scale = modulations.as_ref().map_or(w, |m| w * m[(q, kp)]);
                    for c in 0..self.in_channels {
                        weighted[(q, kp * self.in_channels + c)] += scale * features[(index, c)];
                    }
                }
            }
        }

        let deformation = deformed.map(|(deformed_points, min_d2)| Deformation {
            deformed_points,
            min_d2,
            modulations,
        });
        Ok(KpConvOutput {
            features: weighted * &self.weights,
            deformation,
        })
    }
}
