use std::mem;

use kpconv_common::{config::KpConvConfig, filter::Filter, KpConvError, Result, StackedCloud};
use kpconv_filters::Random;
use log::{trace, warn};
use nalgebra::{DMatrix, RealField};
use num::ToPrimitive;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    dataset::{Dataset, Split},
    features::COLOR_COLUMNS,
};

/// Initial potentials are drawn uniformly below this value.
const POTENTIAL_NOISE: f64 = 1e-3;

/// Spherical regions stacked into one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialBatch<T: RealField> {
    /// Region points, relative to the region centers.
    pub points: StackedCloud<T>,
    /// `[N, 6]`: colors, then the absolute coordinates.
    pub colors: DMatrix<T>,
    pub labels: Vec<i32>,
    /// Index of every point in its preprocessed cloud.
    pub point_inds: Vec<usize>,
    /// The cloud of every region.
    pub cloud_inds: Vec<usize>,
}

#[derive(Debug)]
struct Region<T: RealField> {
    points: DMatrix<T>,
    colors: DMatrix<T>,
    labels: Vec<i32>,
    inds: Vec<usize>,
    cloud: usize,
}

struct Potentials {
    values: Vec<Vec<f64>>,
    minima: Vec<f64>,
}

impl Potentials {
    fn new<R: Rng>(sizes: impl Iterator<Item = usize>, rng: &mut R) -> Self {
        let values = { sizes }
            .map(|len| (0..len).map(|_| rng.gen::<f64>() * POTENTIAL_NOISE).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let minima = values.iter().map(|v| min(v)).collect();
        Potentials { values, minima }
    }

    /// The cloud holding the lowest potential, and its lowest point.
    fn pick(&self) -> Option<(usize, usize)> {
        let cloud = argmin(&self.minima)?;
        Some((cloud, argmin(&self.values[cloud])?))
    }

    /// Tukey weights of the squared distances to the region center.
    fn update(&mut self, cloud: usize, found: &[(usize, f64)], radius2: f64) {
        let values = &mut self.values[cloud];
        for &(index, d2) in found {
            if d2 < radius2 {
                let t = 1. - d2 / radius2;
                values[index] += t * t;
            }
        }
        self.minima[cloud] = min(values);
    }
}

fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn argmin(values: &[f64]) -> Option<usize> {
    { values.iter().enumerate() }
        .filter(|(_, v)| v.is_finite())
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index)
}

/// Streams batches of spherical regions picked in the clouds of a dataset.
///
/// One epoch makes `epoch_steps * batch_num` picks. Regions are accumulated
/// until the next one would push the batch past `batch_limit` points.
pub struct SpatialBatchGenerator<'a, T: RealField + Copy, D: Dataset<T>, R: Rng = StdRng> {
    dataset: &'a D,
    rng: R,
    in_radius: T,
    batch_limit: usize,
    num_steps: usize,
    step: usize,
    potentials: Option<Potentials>,
    pending: Vec<Region<T>>,
    pending_points: usize,
}

impl<'a, T, D> SpatialBatchGenerator<'a, T, D>
where
    T: RealField + Copy + ToPrimitive,
    D: Dataset<T>,
{
    pub fn new(dataset: &'a D, cfg: &KpConvConfig) -> Result<Self> {
        Self::with_rng(dataset, cfg, StdRng::seed_from_u64(cfg.augment_seed))
    }
}

impl<'a, T, D, R> SpatialBatchGenerator<'a, T, D, R>
where
    T: RealField + Copy + ToPrimitive,
    D: Dataset<T>,
    R: Rng,
{
    pub fn with_rng(dataset: &'a D, cfg: &KpConvConfig, mut rng: R) -> Result<Self> {
        if !(cfg.in_radius > 0.) || cfg.batch_limit == 0 {
            return Err(KpConvError::InvalidConfig(format!(
                "in_radius {} and batch_limit {} must be positive",
                cfg.in_radius, cfg.batch_limit
            )));
        }
        let potentials = if cfg.use_potentials {
            let sizes = { (0..dataset.num_clouds()) }
                .map(|cloud| Ok(dataset.read_data(cloud)?.len()))
                .collect::<Result<Vec<_>>>()?;
            Some(Potentials::new(sizes.into_iter(), &mut rng))
        } else {
            None
        };

        Ok(SpatialBatchGenerator {
            dataset,
            rng,
            in_radius: nalgebra::convert(cfg.in_radius),
            batch_limit: cfg.batch_limit,
            num_steps: cfg.epoch_steps * cfg.batch_num,
            step: 0,
            potentials,
            pending: Vec::new(),
            pending_points: 0,
        })
    }

    /// Number of picks per epoch.
    #[inline]
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Starts a new epoch. Potentials carry over.
    pub fn restart(&mut self) {
        self.step = 0;
        self.pending.clear();
        self.pending_points = 0;
    }

    fn pick(&mut self) -> Result<Option<(usize, usize)>> {
        if let Some(potentials) = &self.potentials {
            return Ok(potentials.pick());
        }
        let num_clouds = self.dataset.num_clouds();
        if num_clouds == 0 {
            return Ok(None);
        }
        let cloud = self.rng.gen_range(0..num_clouds);
        let len = self.dataset.read_data(cloud)?.len();
        Ok((len > 0).then(|| (cloud, self.rng.gen_range(0..len))))
    }

    fn next_region(&mut self) -> Result<Option<Region<T>>> {
        let Some((cloud, point)) = self.pick()? else {
            return Ok(None);
        };
        let dataset = self.dataset;
        let data = dataset.read_data(cloud)?;
        let points = data.points();
        if points.ncols() != 3 {
            return Err(KpConvError::ShapeMismatch {
                what: "cloud point dimension",
                expected: 3,
                actual: points.ncols(),
            });
        }
        if data.labels.len() != data.len() {
            return Err(KpConvError::ShapeMismatch {
                what: "cloud labels",
                expected: data.len(),
                actual: data.labels.len(),
            });
        }

        let center = points.row(point).into_owned();
        let pivot = center.iter().copied().collect::<Vec<_>>();
        let found = data.tree.radius(&pivot, self.in_radius);

        if let Some(potentials) = &mut self.potentials {
            let radius = self.in_radius.to_f64().unwrap_or(f64::INFINITY);
            let found = { found.iter() }
                .map(|&(index, d2)| (index, d2.to_f64().unwrap_or(f64::INFINITY)))
                .collect::<Vec<_>>();
            potentials.update(cloud, &found, radius * radius);
        }

        let mut inds = found.into_iter().map(|(index, _)| index).collect::<Vec<_>>();
        if inds.len() > self.batch_limit {
            warn!(
                "region of {} points around point {point} of cloud {cloud} is thinned to {}",
                inds.len(),
                self.batch_limit - 1
            );
            let keep = Random::new(&mut self.rng, self.batch_limit - 1).filter_indices(&inds[..]);
            inds = keep.into_iter().map(|k| inds[k]).collect();
        }

        let n = inds.len();
        let centered = DMatrix::from_fn(n, 3, |r, c| points[(inds[r], c)] - center[c]);
        let mut colors = DMatrix::zeros(n, COLOR_COLUMNS);
        for (r, &index) in inds.iter().enumerate() {
            if let Some(features) = &data.features {
                for c in 0..3 {
                    colors[(r, c)] = features[(index, c)];
                }
            }
            for c in 0..3 {
                colors[(r, 3 + c)] = points[(index, c)];
            }
        }
        let labels = match dataset.split() {
            Split::Test => vec![0; n],
            Split::Training | Split::Validation => inds.iter().map(|&i| data.labels[i]).collect(),
        };

        trace!("step {}: cloud {cloud}, point {point}, {n} points", self.step);
        Ok(Some(Region {
            points: centered,
            colors,
            labels,
            inds,
            cloud,
        }))
    }

    fn flush(&mut self) -> Result<SpatialBatch<T>> {
        let regions = mem::take(&mut self.pending);
        let total = mem::take(&mut self.pending_points);

        let mut points = DMatrix::zeros(total, 3);
        let mut colors = DMatrix::zeros(total, COLOR_COLUMNS);
        let mut labels = Vec::with_capacity(total);
        let mut point_inds = Vec::with_capacity(total);
        let mut lengths = Vec::with_capacity(regions.len());
        let mut cloud_inds = Vec::with_capacity(regions.len());

        let mut start = 0;
        for region in regions {
            let n = region.inds.len();
            points.rows_mut(start, n).copy_from(&region.points);
            colors.rows_mut(start, n).copy_from(&region.colors);
            labels.extend(region.labels);
            point_inds.extend(region.inds);
            lengths.push(n);
            cloud_inds.push(region.cloud);
            start += n;
        }

        Ok(SpatialBatch {
            points: StackedCloud::new(points, lengths)?,
            colors,
            labels,
            point_inds,
            cloud_inds,
        })
    }
}

impl<'a, T, D, R> Iterator for SpatialBatchGenerator<'a, T, D, R>
where
    T: RealField + Copy + ToPrimitive,
    D: Dataset<T>,
    R: Rng,
{
    type Item = Result<SpatialBatch<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.step < self.num_steps {
            let region = match self.next_region() {
                Ok(Some(region)) => region,
                Ok(None) => {
                    self.step += 1;
                    continue;
                }
                Err(err) => {
                    self.step += 1;
                    return Some(Err(err));
                }
            };
            self.step += 1;

            let n = region.inds.len();
            let full = self.pending_points > 0 && self.pending_points + n > self.batch_limit;
            let batch = full.then(|| self.flush());
            if n > 0 {
                self.pending_points += n;
                self.pending.push(region);
            }
            if batch.is_some() {
                return batch;
            }
        }
        (!self.pending.is_empty()).then(|| self.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{preprocess, InMemoryDataset};

    fn grid(side: usize, offset: f64) -> DMatrix<f64> {
        DMatrix::from_fn(side * side * side, 3, |r, c| {
            let coord = [r / (side * side), (r / side) % side, r % side][c];
            coord as f64 * 0.1 + offset
        })
    }

    fn dataset(split: Split, cfg: &KpConvConfig) -> InMemoryDataset<f64> {
        let clouds = [grid(4, 0.), grid(3, 10.)]
            .iter()
            .map(|points| {
                let labels = (0..points.nrows() as i32).collect::<Vec<_>>();
                let features = points.map(|x| x * 2.);
                preprocess(points, Some(&features), Some(&labels[..]), split, cfg).unwrap()
            })
            .collect();
        InMemoryDataset::new(split, clouds)
    }

    fn cfg() -> KpConvConfig {
        KpConvConfig {
            first_subsampling_dl: 0.01,
            epoch_steps: 10,
            batch_num: 3,
            in_radius: 0.15,
            batch_limit: 40,
            ..Default::default()
        }
    }

    #[test]
    fn test_batches() {
        let cfg = cfg();
        let dataset = dataset(Split::Training, &cfg);
        let batches = SpatialBatchGenerator::new(&dataset, &cfg)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let regions = batches.iter().map(|b| b.cloud_inds.len()).sum::<usize>();
        assert_eq!(regions, 30);

        for batch in &batches {
            assert!(batch.points.len() <= cfg.batch_limit);
            assert_eq!(batch.points.num_clouds(), batch.cloud_inds.len());
            assert_eq!(batch.colors.nrows(), batch.points.len());
            assert_eq!(batch.labels.len(), batch.points.len());

            for (range, &cloud) in batch.points.cloud_ranges().zip(&batch.cloud_inds) {
                let data = dataset.read_data(cloud).unwrap();
                for row in range {
                    let index = batch.point_inds[row];
                    assert!(batch.points.points().row(row).norm() < 0.15);
                    for c in 0..3 {
                        assert_eq!(batch.colors[(row, 3 + c)], data.points()[(index, c)]);
                        assert_eq!(batch.colors[(row, c)], data.points()[(index, c)] * 2.);
                    }
                    assert_eq!(batch.labels[row], data.labels[index]);
                }
            }
        }
    }

    #[test]
    fn test_restart_and_test_labels() {
        let cfg = cfg();
        let dataset = dataset(Split::Test, &cfg);
        let mut generator = SpatialBatchGenerator::new(&dataset, &cfg).unwrap();
        let first = generator.by_ref().count();
        assert!(first > 0);
        assert!(generator.next().is_none());

        generator.restart();
        let batches = generator.collect::<Result<Vec<_>>>().unwrap();
        assert!(!batches.is_empty());
        assert!(batches.iter().all(|b| b.labels.iter().all(|&l| l == 0)));
    }

    #[test]
    fn test_potentials_cover_every_point() {
        let cfg = KpConvConfig {
            use_potentials: true,
            in_radius: 0.05,
            epoch_steps: 91,
            batch_num: 1,
            ..cfg()
        };
        let dataset = dataset(Split::Validation, &cfg);
        let batches = SpatialBatchGenerator::new(&dataset, &cfg)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let mut picked = { batches.iter() }
            .flat_map(|b| b.cloud_inds.iter().copied().zip(b.point_inds.iter().copied()))
            .collect::<Vec<_>>();
        assert_eq!(picked.len(), 91);
        picked.sort_unstable();
        picked.dedup();
        assert_eq!(picked.len(), 91);
    }

    #[test]
    fn test_dense_regions_are_thinned() {
        let cfg = KpConvConfig {
            in_radius: 10.,
            batch_limit: 10,
            epoch_steps: 4,
            batch_num: 1,
            ..cfg()
        };
        let dataset = dataset(Split::Training, &cfg);
        let batches = SpatialBatchGenerator::new(&dataset, &cfg)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 4);
        for batch in &batches {
            assert_eq!(batch.points.lengths(), &[9]);
            let mut inds = batch.point_inds.clone();
            inds.sort_unstable();
            inds.dedup();
            assert_eq!(inds.len(), 9);
        }
    }
}
