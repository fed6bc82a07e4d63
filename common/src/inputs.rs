use nalgebra::{DMatrix, Matrix3, Scalar};

use crate::{
    error::{KpConvError, Result},
    neighbors::NeighborIndex,
    stacked::StackedCloud,
};

/// One resolution of the pyramid.
///
/// * `neighbors` - queries and supports are both `points`.
/// * `pools` - the next coarser layer's points over this layer's points.
/// * `upsamples` - this layer's points over the next coarser layer's points.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer<T: Scalar> {
    pub points: StackedCloud<T>,
    pub neighbors: NeighborIndex,
    pub pools: NeighborIndex,
    pub upsamples: NeighborIndex,
}

/// Everything a forward pass of the network consumes for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationInputs<T: Scalar> {
    pub layers: Vec<Layer<T>>,
    pub features: DMatrix<T>,
    pub batch_weights: Vec<T>,
    pub in_batches: NeighborIndex,
    pub out_batches: NeighborIndex,
    pub point_labels: Vec<i32>,
    /// `[num_clouds, 3]`
    pub augment_scales: DMatrix<T>,
    pub augment_rotations: Vec<Matrix3<T>>,
    pub point_inds: Vec<usize>,
    pub cloud_inds: Vec<usize>,
}

impl<T: Scalar> SegmentationInputs<T> {
    #[inline]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Result<&Layer<T>> {
        self.layers.get(index).ok_or(KpConvError::LayerCount {
            expected: index + 1,
            actual: self.layers.len(),
        })
    }

    pub fn last_layer(&self) -> Result<&Layer<T>> {
        self.layers.last().ok_or(KpConvError::LayerCount {
            expected: 1,
            actual: 0,
        })
    }
}
