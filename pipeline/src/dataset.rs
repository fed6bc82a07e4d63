use std::{fmt, str::FromStr};

use kpconv_common::{config::KpConvConfig, KpConvError, Result};
use kpconv_filters::GridSubsampling;
use kpconv_search::{project_nearest, KdTree};
use log::debug;
use nalgebra::{DMatrix, RealField};
use num::ToPrimitive;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Split {
    Training,
    Validation,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Training => "training",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

impl FromStr for Split {
    type Err = KpConvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "training" | "train" => Ok(Split::Training),
            "validation" | "val" => Ok(Split::Validation),
            "test" => Ok(Split::Test),
            _ => Err(KpConvError::InvalidConfig(format!("unknown split: {s}"))),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cloud after preprocessing, as read by the batch generator.
#[derive(Debug, Clone)]
pub struct CloudData<T: RealField + Copy> {
    /// Subsampled points; the tree is built over the same rows.
    pub tree: KdTree<T>,
    /// `[N, 3]` subsampled colors, if the cloud has any.
    pub features: Option<DMatrix<T>>,
    pub labels: Vec<i32>,
    /// For every original point, its nearest subsampled point. Only kept for
    /// the splits that are evaluated on the original points.
    pub proj_inds: Option<Vec<usize>>,
}

impl<T: RealField + Copy> CloudData<T> {
    #[inline]
    pub fn points(&self) -> &DMatrix<T> {
        self.tree.points()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// A source of clouds for one split.
pub trait Dataset<T: RealField + Copy> {
    fn split(&self) -> Split;

    fn num_clouds(&self) -> usize;

    fn read_data(&self, cloud_index: usize) -> Result<&CloudData<T>>;
}

/// Grid-subsamples a raw cloud at `first_subsampling_dl` and builds its
/// search tree. `points` may carry extra columns past xyz and `features` past
/// rgb; both are cut to three. Missing labels count as class 0.
pub fn preprocess<T: RealField + Copy + ToPrimitive>(
    points: &DMatrix<T>,
    features: Option<&DMatrix<T>>,
    labels: Option<&[i32]>,
    split: Split,
    cfg: &KpConvConfig,
) -> Result<CloudData<T>> {
    let xyz = first_columns("point columns", points)?;
    let features = features.map(|f| first_columns("feature columns", f)).transpose()?;

    let grid = GridSubsampling::new(nalgebra::convert::<f64, T>(cfg.first_subsampling_dl))?;
    let sub = grid.subsample_with_data(&xyz, features.as_ref(), labels)?;
    debug!(
        "{split} cloud subsampled from {} to {} points",
        xyz.nrows(),
        sub.points.nrows()
    );

    let labels = sub.labels.unwrap_or_else(|| vec![0; sub.points.nrows()]);
    let tree = KdTree::new(sub.points);
    let proj_inds = match split {
        Split::Training => None,
        Split::Validation | Split::Test => Some(project_nearest(&tree, &xyz)?),
    };

    Ok(CloudData {
        tree,
        features: sub.features,
        labels,
        proj_inds,
    })
}

fn first_columns<T: RealField + Copy>(what: &'static str, m: &DMatrix<T>) -> Result<DMatrix<T>> {
    if m.ncols() < 3 {
        return Err(KpConvError::ShapeMismatch {
            what,
            expected: 3,
            actual: m.ncols(),
        });
    }
    Ok(m.columns(0, 3).into_owned())
}

/// Preprocessed clouds held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset<T: RealField + Copy> {
    split: Split,
    clouds: Vec<CloudData<T>>,
}

/// A cloud before preprocessing.
#[derive(Debug, Clone)]
pub struct RawCloud<T: RealField> {
    pub points: DMatrix<T>,
    pub features: Option<DMatrix<T>>,
    pub labels: Option<Vec<i32>>,
}

impl<T: RealField + Copy + ToPrimitive> InMemoryDataset<T> {
    pub fn new(split: Split, clouds: Vec<CloudData<T>>) -> Self {
        InMemoryDataset { split, clouds }
    }

    pub fn preprocess(split: Split, raw: &[RawCloud<T>], cfg: &KpConvConfig) -> Result<Self> {
        let clouds = { raw.iter() }
            .map(|cloud| {
                preprocess(
                    &cloud.points,
                    cloud.features.as_ref(),
                    cloud.labels.as_deref(),
                    split,
                    cfg,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(InMemoryDataset { split, clouds })
    }
}

impl<T: RealField + Copy> Dataset<T> for InMemoryDataset<T> {
    fn split(&self) -> Split {
        self.split
    }

    fn num_clouds(&self) -> usize {
        self.clouds.len()
    }

    fn read_data(&self, cloud_index: usize) -> Result<&CloudData<T>> {
        self.clouds.get(cloud_index).ok_or(KpConvError::ShapeMismatch {
            what: "cloud index",
            expected: self.clouds.len(),
            actual: cloud_index,
        })
    }
}
