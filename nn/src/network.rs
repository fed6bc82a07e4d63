use kpconv_common::{config::KpConvConfig, inputs::SegmentationInputs, KpConvError, Result};
use log::debug;
use nalgebra::{DMatrix, RealField};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    blocks::{block_decider, Block, BlockKind},
    kpconv::Deformation,
    layers::UnaryBlock,
};

/// A kernel point convolution of the network, registered at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelEntry<T: RealField> {
    /// Position of the block in the architecture.
    pub block: usize,
    pub layer: usize,
    pub radius: T,
    pub extent: T,
    pub deformable: bool,
    pub kernel_points: DMatrix<T>,
}

/// The deformation produced by one deformable convolution during a forward
/// pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DeformationRecord<T: RealField> {
    pub block: usize,
    pub layer: usize,
    pub extent: T,
    pub deformation: Deformation<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkOutput<T: RealField> {
    /// `[N, num_classes - ignored]`
    pub logits: DMatrix<T>,
    pub deformations: Vec<DeformationRecord<T>>,
}

/// Fully convolutional KPConv segmentation network.
#[derive(Debug, Clone, PartialEq)]
pub struct Kpfcnn<T: RealField + Copy> {
    in_features_dim: usize,
    num_layers: usize,
    encoder: Vec<Block<T>>,
    /// Encoder positions whose input is kept for the decoder.
    encoder_skips: Vec<usize>,
    decoder: Vec<Block<T>>,
    /// Decoder positions whose input is concatenated with a kept skip.
    decoder_concats: Vec<usize>,
    head_mlp: UnaryBlock<T>,
    head_softmax: UnaryBlock<T>,
    kernels: Vec<KernelEntry<T>>,
}

impl<T: RealField + Copy> Kpfcnn<T> {
    /// Builds the network with parameters initialized from `cfg.seed`.
    pub fn new(cfg: &KpConvConfig) -> Result<Self> {
        Self::with_rng(cfg, &mut StdRng::seed_from_u64(cfg.seed))
    }

    pub fn with_rng<R: Rng>(cfg: &KpConvConfig, rng: &mut R) -> Result<Self> {
        cfg.validate()?;
        let kinds = { cfg.architecture.iter() }
            .map(|token| token.parse::<BlockKind>())
            .collect::<Result<Vec<_>>>()?;

        let mut layer = 0;
        let mut r = nalgebra::convert::<f64, T>(cfg.first_radius());
        let mut in_dim = cfg.in_features_dim;
        let mut out_dim = cfg.first_features_dim;
        let mut kernels = Vec::new();

        let mut encoder = Vec::new();
        let mut encoder_skips = Vec::new();
        let mut skip_dims = Vec::new();
        let mut decoder_start = kinds.len();

        for (block_i, (token, kind)) in cfg.architecture.iter().zip(&kinds).enumerate() {
            if kind.is_equivariant() && out_dim % 3 != 0 {
                return Err(KpConvError::EquivariantWidth(out_dim));
            }
            if kind.is_pooling() || kind.is_upsample() || kind.is_global() {
                encoder_skips.push(block_i);
                skip_dims.push(in_dim);
            }
            if kind.is_upsample() {
                decoder_start = block_i;
                break;
            }

            let block = block_decider(token, r, in_dim, out_dim, layer, cfg, rng)?;
            debug!("encoder block {block_i}: {block}");
            register(&mut kernels, block_i, layer, &block);
            encoder.push(block);

            in_dim = if kind.is_simple() { out_dim / 2 } else { out_dim };
            if kind.is_pooling() {
                layer += 1;
                r *= nalgebra::convert(2.);
                out_dim *= 2;
            }
        }

        let mut decoder = Vec::new();
        let mut decoder_concats = Vec::new();
        for (block_i, token) in cfg.architecture[decoder_start..].iter().enumerate() {
            if block_i > 0 && kinds[decoder_start + block_i - 1].is_upsample() {
                in_dim += skip_dims.get(layer).copied().ok_or(KpConvError::LayerCount {
                    expected: layer + 1,
                    actual: skip_dims.len(),
                })?;
                decoder_concats.push(block_i);
            }

            let block = block_decider(token, r, in_dim, out_dim, layer, cfg, rng)?;
            debug!("decoder block {block_i}: {block}");
            register(&mut kernels, decoder_start + block_i, layer, &block);
            decoder.push(block);

            in_dim = out_dim;
            if kinds[decoder_start + block_i].is_upsample() {
                layer = layer.checked_sub(1).ok_or(KpConvError::LayerCount {
                    expected: 2,
                    actual: 1,
                })?;
                r *= nalgebra::convert(0.5);
                out_dim /= 2;
            }
        }

        let head_mlp = UnaryBlock::new(out_dim, cfg.first_features_dim, false, T::zero(), false, rng);
        let head_softmax = UnaryBlock::new(
            cfg.first_features_dim,
            cfg.num_output_classes(),
            false,
            T::zero(),
            true,
            rng,
        );

        Ok(Kpfcnn {
            in_features_dim: cfg.in_features_dim,
            num_layers: cfg.num_layers,
            encoder,
            encoder_skips,
            decoder,
            decoder_concats,
            head_mlp,
            head_softmax,
            kernels,
        })
    }

    /// Every kernel point convolution of the network.
    #[inline]
    pub fn kernels(&self) -> &[KernelEntry<T>] {
        &self.kernels
    }

    #[inline]
    pub fn encoder(&self) -> &[Block<T>] {
        &self.encoder
    }

    #[inline]
    pub fn decoder(&self) -> &[Block<T>] {
        &self.decoder
    }

    pub fn forward(&self, inputs: &SegmentationInputs<T>) -> Result<NetworkOutput<T>> {
        if inputs.num_layers() != self.num_layers {
            return Err(KpConvError::LayerCount {
                expected: self.num_layers,
                actual: inputs.num_layers(),
            });
        }
        if inputs.features.ncols() != self.in_features_dim {
            return Err(KpConvError::ShapeMismatch {
                what: "input feature channels",
                expected: self.in_features_dim,
                actual: inputs.features.ncols(),
            });
        }

        let mut deformations = Vec::new();
        let mut record = |block: usize, layer: usize, b: &Block<T>, deformation| {
            if let (Some(deformation), Some(conv)) = (deformation, b.conv()) {
                deformations.push(DeformationRecord {
                    block,
                    layer,
                    extent: conv.extent(),
                    deformation,
                });
            }
        };

        let mut x = inputs.features.clone();
        let mut skip_x = Vec::new();
        for (block_i, block) in self.encoder.iter().enumerate() {
            if self.encoder_skips.contains(&block_i) {
                skip_x.push(x.clone());
            }
            let out = block.forward(&x, inputs)?;
            record(block_i, block_layer(block), block, out.deformation);
            x = out.features;
        }

        let decoder_start = self.encoder.len();
        for (block_i, block) in self.decoder.iter().enumerate() {
            if self.decoder_concats.contains(&block_i) {
                let skip = skip_x.pop().ok_or(KpConvError::LayerCount {
                    expected: self.decoder_concats.len(),
                    actual: 0,
                })?;
                x = concat_columns(&x, &skip)?;
            }
            let out = block.forward(&x, inputs)?;
            record(decoder_start + block_i, block_layer(block), block, out.deformation);
            x = out.features;
        }

        let logits = self.head_softmax.forward(&self.head_mlp.forward(&x));
        Ok(NetworkOutput {
            logits,
            deformations,
        })
    }
}

fn block_layer<T: RealField + Copy>(block: &Block<T>) -> usize {
    match block {
        Block::Simple(simple) => simple.layer,
        Block::Resnetb(resnetb) => resnetb.layer,
        Block::MaxPool(pool) => pool.layer,
        Block::NearestUpsample(upsample) => upsample.layer,
        Block::Unary(_) | Block::GlobalAverage(_) => 0,
    }
}

fn register<T: RealField + Copy>(
    kernels: &mut Vec<KernelEntry<T>>,
    block_i: usize,
    layer: usize,
    block: &Block<T>,
) {
    if let Some(conv) = block.conv() {
        kernels.push(KernelEntry {
            block: block_i,
            layer,
            radius: conv.radius(),
            extent: conv.extent(),
            deformable: conv.is_deformable(),
            kernel_points: conv.kernel_points().clone(),
        });
    }
}

fn concat_columns<T: RealField + Copy>(a: &DMatrix<T>, b: &DMatrix<T>) -> Result<DMatrix<T>> {
    if a.nrows() != b.nrows() {
        return Err(KpConvError::ShapeMismatch {
            what: "skip connection rows",
            expected: a.nrows(),
            actual: b.nrows(),
        });
    }
    Ok(DMatrix::from_fn(a.nrows(), a.ncols() + b.ncols(), |r, c| {
        if c < a.ncols() {
            a[(r, c)]
        } else {
            b[(r, c - a.ncols())]
        }
    }))
}
