pub mod config;
pub mod error;
pub mod filter;
pub mod inputs;
pub mod neighbors;
pub mod search;
pub mod stacked;

pub use self::{
    error::{KpConvError, Result},
    neighbors::NeighborIndex,
    stacked::StackedCloud,
};
