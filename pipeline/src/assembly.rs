use kpconv_common::{
    config::KpConvConfig,
    inputs::{Layer, SegmentationInputs},
    stacked::{batch_weights, stack_batch_inds},
    KpConvError, NeighborIndex, Result, StackedCloud,
};
use kpconv_filters::GridSubsampling;
use kpconv_search::batch_neighbors_capped;
use log::debug;
use nalgebra::RealField;
use num::ToPrimitive;
use rand::Rng;

use crate::{augment::augment_input, features::select_features, generator::SpatialBatch};

/// The geometric part of the network inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Pyramid<T: RealField> {
    pub layers: Vec<Layer<T>>,
    pub batch_weights: Vec<T>,
    /// Stacked indices of every cloud in the first layer.
    pub in_batches: NeighborIndex,
    /// Stacked indices of every cloud in the last layer.
    pub out_batches: NeighborIndex,
}

fn is_pooling(block: &str) -> bool {
    block.contains("pool") || block.contains("strided")
}

fn ends_encoder(block: &str) -> bool {
    block.contains("upsample") || block.contains("global")
}

/// Walks the encoder part of `cfg.architecture` and builds, for every layer,
/// the convolution neighbors and, when the layer ends with a pooling block,
/// the subsampled points with their pooling and upsampling neighbors.
pub fn segmentation_inputs<T: RealField + Copy + ToPrimitive>(
    points: StackedCloud<T>,
    cfg: &KpConvConfig,
) -> Result<Pyramid<T>> {
    let convert = nalgebra::convert::<f64, T>;
    let architecture = &cfg.architecture;
    let limits = cfg.neighborhood_limits();
    let deformable_radius = |r: f64| r * cfg.density_parameter / cfg.conv_radius;

    let mut r_normal = cfg.first_radius();
    let mut points = points;
    let mut layer_blocks = Vec::new();
    let mut layers = Vec::new();

    for (block_i, block) in architecture.iter().enumerate() {
        if ends_encoder(block) {
            break;
        }
        if !is_pooling(block) {
            layer_blocks.push(block.as_str());
            let last = block_i + 1 == architecture.len();
            if !last && !ends_encoder(&architecture[block_i + 1]) {
                continue;
            }
        }

        let limit = limits.get(layers.len()).copied().ok_or(KpConvError::LayerCount {
            expected: cfg.num_layers,
            actual: layers.len() + 1,
        })?;

        let neighbors = if layer_blocks.is_empty() {
            NeighborIndex::empty(points.len())
        } else {
            let deformable = { layer_blocks.iter().rev().skip(1) }.any(|b| b.contains("deformable"));
            let r = if deformable {
                deformable_radius(r_normal)
            } else {
                r_normal
            };
            batch_neighbors_capped(&points, &points, convert(r), limit)?
        };

        let (next, pools, upsamples) = if is_pooling(block) {
            let dl = 2. * r_normal / cfg.conv_radius;
            let pooled = GridSubsampling::new(convert(dl))?.subsample(&points)?;
            let r = if block.contains("deformable") {
                deformable_radius(r_normal)
            } else {
                r_normal
            };
            let pools = batch_neighbors_capped(&pooled, &points, convert(r), limit)?;
            let upsamples = batch_neighbors_capped(&points, &pooled, convert(2. * r), limit)?;
            (pooled, pools, upsamples)
        } else {
            (
                StackedCloud::empty(points.dim()),
                NeighborIndex::empty(points.len()),
                NeighborIndex::empty(0),
            )
        };

        debug!(
            "layer {}: {} points in {} clouds, radius {r_normal}, neighbors {}x{}, pools {}x{}, upsamples {}x{}",
            layers.len(),
            points.len(),
            points.num_clouds(),
            neighbors.rows(),
            neighbors.width(),
            pools.rows(),
            pools.width(),
            upsamples.rows(),
            upsamples.width(),
        );

        let layer_points = std::mem::replace(&mut points, next);
        layers.push(Layer {
            points: layer_points,
            neighbors,
            pools,
            upsamples,
        });

        r_normal *= 2.;
        layer_blocks.clear();
    }

    if layers.len() != cfg.num_layers {
        return Err(KpConvError::LayerCount {
            expected: cfg.num_layers,
            actual: layers.len(),
        });
    }

    let (first, last) = match (layers.first(), layers.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(KpConvError::LayerCount {
                expected: cfg.num_layers,
                actual: 0,
            })
        }
    };
    let batch_weights = batch_weights(first.points.lengths());
    let in_batches = stack_batch_inds(first.points.lengths());
    let out_batches = stack_batch_inds(last.points.lengths());

    Ok(Pyramid {
        layers,
        batch_weights,
        in_batches,
        out_batches,
    })
}

/// Turns a raw batch into network inputs: augmentation, feature selection and
/// the layer pyramid.
pub fn transform<T: RealField + Copy + ToPrimitive, R: Rng>(
    batch: &SpatialBatch<T>,
    cfg: &KpConvConfig,
    rng: &mut R,
) -> Result<SegmentationInputs<T>> {
    let (points, augmentation) = augment_input(&batch.points, cfg, rng)?;
    let features = select_features(points.points(), &batch.colors, points.lengths(), cfg, rng)?;
    let pyramid = segmentation_inputs(points, cfg)?;

    Ok(SegmentationInputs {
        layers: pyramid.layers,
        features,
        batch_weights: pyramid.batch_weights,
        in_batches: pyramid.in_batches,
        out_batches: pyramid.out_batches,
        point_labels: batch.labels.clone(),
        augment_scales: augmentation.scales,
        augment_rotations: augmentation.rotations,
        point_inds: batch.point_inds.clone(),
        cloud_inds: batch.cloud_inds.clone(),
    })
}
