mod grid;
mod random;

pub use self::{
    grid::{GridSubsampling, Subsampled},
    random::Random,
};
