mod assembly;
mod augment;
mod dataset;
mod features;
mod generator;

pub use self::{
    assembly::{segmentation_inputs, transform, Pyramid},
    augment::{augment_input, Augmentation},
    dataset::{preprocess, CloudData, Dataset, InMemoryDataset, RawCloud, Split},
    features::{select_features, COLOR_COLUMNS},
    generator::{SpatialBatch, SpatialBatchGenerator},
};
