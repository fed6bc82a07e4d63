use std::{fmt, str::FromStr};

use kpconv_common::{
    config::KpConvConfig, inputs::SegmentationInputs, KpConvError, NeighborIndex, Result,
};
use nalgebra::{DMatrix, RealField};
use rand::Rng;

use crate::{
    kpconv::{Deformation, KpConv, KpConvParams},
    layers::{leaky_relu, BatchNormBlock, UnaryBlock},
    ops::{closest_pool, global_average, max_pool},
};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConvModifiers {
    pub strided: bool,
    pub deformable: bool,
    pub invariant: bool,
    pub equivariant: bool,
}

impl ConvModifiers {
    fn parse(modifiers: &[&str]) -> Option<Self> {
        let mut ret = ConvModifiers::default();
        let (last, rest) = match modifiers.split_last() {
            Some((&"strided", rest)) => {
                ret.strided = true;
                (rest.first().copied(), rest)
            }
            _ => (modifiers.first().copied(), modifiers),
        };
        if rest.len() > 1 {
            return None;
        }
        match last {
            None => {}
            Some("deformable") => ret.deformable = true,
            Some("invariant") => ret.invariant = true,
            Some("equivariant") => ret.equivariant = true,
            Some(_) => return None,
        }
        Some(ret)
    }
}

/// A parsed architecture token.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Unary,
    Simple(ConvModifiers),
    Resnetb(ConvModifiers),
    MaxPool { wide: bool },
    GlobalAverage,
    NearestUpsample,
}

impl FromStr for BlockKind {
    type Err = KpConvError;

    fn from_str(s: &str) -> Result<Self> {
        let unknown = || KpConvError::UnknownBlock(s.to_owned());
        Ok(match s {
            "unary" => BlockKind::Unary,
            "max_pool" => BlockKind::MaxPool { wide: false },
            "max_pool_wide" => BlockKind::MaxPool { wide: true },
            "global_average" => BlockKind::GlobalAverage,
            "nearest_upsample" => BlockKind::NearestUpsample,
            _ => {
                let parts = s.split('_').collect::<Vec<_>>();
                let modifiers = ConvModifiers::parse(&parts[1..]).ok_or_else(unknown)?;
                match parts[0] {
                    "simple" => BlockKind::Simple(modifiers),
                    "resnetb" => BlockKind::Resnetb(modifiers),
                    _ => return Err(unknown()),
                }
            }
        })
    }
}

impl BlockKind {
    pub fn modifiers(&self) -> Option<ConvModifiers> {
        match self {
            BlockKind::Simple(m) | BlockKind::Resnetb(m) => Some(*m),
            _ => None,
        }
    }

    /// The block moves features to the next coarser layer.
    pub fn is_pooling(&self) -> bool {
        matches!(self, BlockKind::MaxPool { .. })
            || self.modifiers().map_or(false, |m| m.strided)
    }

    pub fn is_deformable(&self) -> bool {
        self.modifiers().map_or(false, |m| m.deformable)
    }

    pub fn is_equivariant(&self) -> bool {
        self.modifiers().map_or(false, |m| m.equivariant)
    }

    #[inline]
    pub fn is_upsample(&self) -> bool {
        matches!(self, BlockKind::NearestUpsample)
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        matches!(self, BlockKind::GlobalAverage)
    }

    #[inline]
    pub fn is_simple(&self) -> bool {
        matches!(self, BlockKind::Simple(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutput<T: RealField> {
    pub features: DMatrix<T>,
    pub deformation: Option<Deformation<T>>,
}

impl<T: RealField> From<DMatrix<T>> for BlockOutput<T> {
    fn from(features: DMatrix<T>) -> Self {
        BlockOutput {
            features,
            deformation: None,
        }
    }
}

/// Queries, supports and neighbors of a convolution at `layer`. Strided
/// convolutions query the next layer through the pooling indices.
fn conv_geometry<T: RealField + Copy>(
    inputs: &SegmentationInputs<T>,
    layer: usize,
    strided: bool,
) -> Result<(&DMatrix<T>, &DMatrix<T>, &NeighborIndex)> {
    let current = inputs.layer(layer)?;
    if strided {
        let next = inputs.layer(layer + 1)?;
        Ok((next.points.points(), current.points.points(), &current.pools))
    } else {
        Ok((current.points.points(), current.points.points(), &current.neighbors))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleBlock<T: RealField + Copy> {
    pub modifiers: ConvModifiers,
    pub layer: usize,
    pub conv: KpConv<T>,
    pub batch_norm: BatchNormBlock<T>,
}

impl<T: RealField + Copy> SimpleBlock<T> {
    pub fn forward(&self, x: &DMatrix<T>, inputs: &SegmentationInputs<T>) -> Result<BlockOutput<T>> {
        let (queries, supports, neighbors) = conv_geometry(inputs, self.layer, self.modifiers.strided)?;
        let out = self.conv.forward(queries, supports, neighbors, x)?;
        Ok(BlockOutput {
            features: leaky_relu(self.batch_norm.forward(out.features)),
            deformation: out.deformation,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResnetBottleneckBlock<T: RealField + Copy> {
    pub modifiers: ConvModifiers,
    pub layer: usize,
    /// Downscaling to a quarter of the output width, unless already there.
    pub unary1: Option<UnaryBlock<T>>,
    pub conv: KpConv<T>,
    pub batch_norm_conv: BatchNormBlock<T>,
    pub unary2: UnaryBlock<T>,
    pub unary_shortcut: Option<UnaryBlock<T>>,
}

impl<T: RealField + Copy> ResnetBottleneckBlock<T> {
    pub fn forward(
        &self,
        features: &DMatrix<T>,
        inputs: &SegmentationInputs<T>,
    ) -> Result<BlockOutput<T>> {
        let (queries, supports, neighbors) = conv_geometry(inputs, self.layer, self.modifiers.strided)?;

        let x = match &self.unary1 {
            Some(unary1) => unary1.forward(features),
            None => features.clone(),
        };
        let out = self.conv.forward(queries, supports, neighbors, &x)?;
        let x = leaky_relu(self.batch_norm_conv.forward(out.features));
        let x = self.unary2.forward(&x);

        let shortcut = if self.modifiers.strided {
            max_pool(features, neighbors)?
        } else {
            features.clone()
        };
        let shortcut = match &self.unary_shortcut {
            Some(unary) => unary.forward(&shortcut),
            None => shortcut,
        };

        Ok(BlockOutput {
            features: leaky_relu(x + shortcut),
            deformation: out.deformation,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MaxPoolBlock {
    pub layer: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NearestUpsampleBlock {
    /// The coarse layer features come from.
    pub layer: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GlobalAverageBlock;

#[derive(Debug, Clone, PartialEq)]
pub enum Block<T: RealField + Copy> {
    Unary(UnaryBlock<T>),
    Simple(SimpleBlock<T>),
    Resnetb(ResnetBottleneckBlock<T>),
    MaxPool(MaxPoolBlock),
    GlobalAverage(GlobalAverageBlock),
    NearestUpsample(NearestUpsampleBlock),
}

impl<T: RealField + Copy> Block<T> {
    pub fn forward(&self, x: &DMatrix<T>, inputs: &SegmentationInputs<T>) -> Result<BlockOutput<T>> {
        match self {
            Block::Unary(unary) => Ok(unary.forward(x).into()),
            Block::Simple(simple) => simple.forward(x, inputs),
            Block::Resnetb(resnetb) => resnetb.forward(x, inputs),
            Block::MaxPool(MaxPoolBlock { layer }) => {
                Ok(max_pool(x, &inputs.layer(*layer)?.pools)?.into())
            }
            Block::GlobalAverage(_) => {
                let lengths = inputs.last_layer()?.points.lengths();
                Ok(global_average(x, lengths)?.into())
            }
            Block::NearestUpsample(NearestUpsampleBlock { layer }) => {
                let finer = layer.checked_sub(1).ok_or(KpConvError::LayerCount {
                    expected: 2,
                    actual: 1,
                })?;
                Ok(closest_pool(x, &inputs.layer(finer)?.upsamples)?.into())
            }
        }
    }

    /// The kernel point convolution of the block, if any.
    pub fn conv(&self) -> Option<&KpConv<T>> {
        match self {
            Block::Simple(simple) => Some(&simple.conv),
            Block::Resnetb(resnetb) => Some(&resnetb.conv),
            _ => None,
        }
    }
}

impl<T: RealField + Copy> fmt::Display for Block<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Block::Unary(unary) => write!(
                f,
                "UnaryBlock(in_feat: {}, out_feat: {}, ReLU: {})",
                unary.mlp.in_dim(),
                unary.mlp.out_dim(),
                !unary.no_relu
            ),
            Block::Simple(SimpleBlock { layer, conv, .. })
            | Block::Resnetb(ResnetBottleneckBlock { layer, conv, .. }) => write!(
                f,
                "{}(layer: {layer}, KPConv(radius: {:.3}, in_feat: {}, out_feat: {}, deformable: {}))",
                if matches!(self, Block::Simple(_)) {
                    "SimpleBlock"
                } else {
                    "ResnetBottleneckBlock"
                },
                conv.radius(),
                conv.in_channels(),
                conv.out_channels(),
                conv.is_deformable()
            ),
            Block::MaxPool(MaxPoolBlock { layer }) => write!(f, "MaxPoolBlock(layer: {layer})"),
            Block::GlobalAverage(_) => write!(f, "GlobalAverageBlock"),
            Block::NearestUpsample(NearestUpsampleBlock { layer }) => {
                write!(f, "NearestUpsampleBlock(layer: {layer} -> {})", layer.saturating_sub(1))
            }
        }
    }
}

/// Builds the block named by `token` for a layer of convolution `radius`.
pub fn block_decider<T: RealField + Copy, R: Rng>(
    token: &str,
    radius: T,
    in_dim: usize,
    out_dim: usize,
    layer: usize,
    cfg: &KpConvConfig,
    rng: &mut R,
) -> Result<Block<T>> {
    let kind = token.parse::<BlockKind>()?;
    let momentum = nalgebra::convert::<f64, T>(cfg.batch_norm_momentum);
    let extent = radius * nalgebra::convert(cfg.kp_extent / cfg.conv_radius);
    let params = |in_channels, out_channels, deformable| KpConvParams {
        num_kpoints: cfg.num_kernel_points,
        point_dim: cfg.in_points_dim,
        in_channels,
        out_channels,
        extent,
        radius,
        fixed: cfg.fixed_kernel_points,
        influence: cfg.kp_influence,
        aggregation: cfg.aggregation_mode,
        deformable,
        modulated: cfg.modulated,
    };

    Ok(match kind {
        BlockKind::Unary => Block::Unary(UnaryBlock::new(
            in_dim,
            out_dim,
            cfg.use_batch_norm,
            momentum,
            false,
            rng,
        )),
        BlockKind::Simple(modifiers) => Block::Simple(SimpleBlock {
            modifiers,
            layer,
            conv: KpConv::new(&params(in_dim, out_dim / 2, modifiers.deformable), rng)?,
            batch_norm: BatchNormBlock::new(out_dim / 2, cfg.use_batch_norm, momentum),
        }),
        BlockKind::Resnetb(modifiers) => {
            let unary1 = (in_dim != out_dim / 4).then(|| {
                UnaryBlock::new(in_dim, out_dim / 4, cfg.use_batch_norm, momentum, false, rng)
            });
            let conv = KpConv::new(&params(out_dim / 4, out_dim / 4, modifiers.deformable), rng)?;
            let unary2 =
                UnaryBlock::new(out_dim / 4, out_dim, cfg.use_batch_norm, momentum, true, rng);
            let unary_shortcut = (in_dim != out_dim).then(|| {
                UnaryBlock::new(in_dim, out_dim, cfg.use_batch_norm, momentum, true, rng)
            });
            Block::Resnetb(ResnetBottleneckBlock {
                modifiers,
                layer,
                unary1,
                conv,
                batch_norm_conv: BatchNormBlock::new(out_dim / 4, cfg.use_batch_norm, momentum),
                unary2,
                unary_shortcut,
            })
        }
        BlockKind::MaxPool { .. } => Block::MaxPool(MaxPoolBlock { layer }),
        BlockKind::GlobalAverage => Block::GlobalAverage(GlobalAverageBlock),
        BlockKind::NearestUpsample => Block::NearestUpsample(NearestUpsampleBlock { layer }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_block_kind() {
        assert_eq!("unary".parse::<BlockKind>().unwrap(), BlockKind::Unary);
        assert_eq!(
            "resnetb_deformable_strided".parse::<BlockKind>().unwrap(),
            BlockKind::Resnetb(ConvModifiers {
                strided: true,
                deformable: true,
                ..Default::default()
            })
        );
        assert_eq!(
            "simple".parse::<BlockKind>().unwrap(),
            BlockKind::Simple(ConvModifiers::default())
        );
        assert!("simple_equivariant".parse::<BlockKind>().unwrap().is_equivariant());
        assert!("max_pool_wide".parse::<BlockKind>().unwrap().is_pooling());
        assert!("nearest_upsample".parse::<BlockKind>().unwrap().is_upsample());

        for bad in [
            "resnet",
            "simple_strided_deformable",
            "simple_deformable_invariant",
            "resnetb_",
            "upsample",
            "",
        ] {
            assert!(
                matches!(bad.parse::<BlockKind>(), Err(KpConvError::UnknownBlock(ref name)) if name == bad),
                "{bad}"
            );
        }
    }
}
