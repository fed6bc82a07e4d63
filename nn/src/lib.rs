pub mod blocks;
pub mod influence;
pub mod kernel_points;
pub mod kpconv;
pub mod layers;
pub mod network;
pub mod ops;
pub mod regularization;

pub use self::{
    blocks::{block_decider, Block, BlockKind, BlockOutput},
    kpconv::{Deformation, KpConv, KpConvOutput, KpConvParams},
    network::{DeformationRecord, KernelEntry, Kpfcnn, NetworkOutput},
    regularization::offset_loss,
};
