use std::io::Write;

use kpconv_common::{
    config::KpConvConfig, stacked::batch_inds, NeighborIndex, StackedCloud,
};
use kpconv_filters::GridSubsampling;
use kpconv_nn::Kpfcnn;
use kpconv_pipeline::{
    preprocess, transform, Dataset, InMemoryDataset, SpatialBatch, SpatialBatchGenerator, Split,
};
use nalgebra::DMatrix;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn grid(side: usize, spacing: f64) -> DMatrix<f64> {
    DMatrix::from_fn(side * side * side, 3, |r, c| {
        let coord = [r / (side * side), (r / side) % side, r % side][c];
        coord as f64 * spacing
    })
}

#[test]
fn subsampling_is_near_idempotent() {
    // Clusters 0.5 apart fall at 1.25 cells from each other, away from the
    // cell borders.
    let grid_size = 0.4;
    let mut rng = StdRng::seed_from_u64(17);
    let centers = grid(4, 0.5).add_scalar(0.25);
    let mut points = DMatrix::zeros(centers.nrows() * 5, 3);
    for (i, mut row) in points.row_iter_mut().enumerate() {
        for c in 0..3 {
            row[c] = centers[(i / 5, c)] + rng.gen_range(-0.01..0.01);
        }
    }
    let cloud = StackedCloud::new(points, vec![100, 220]).unwrap();

    let subsampling = GridSubsampling::new(grid_size).unwrap();
    let once = subsampling.subsample(&cloud).unwrap();
    let twice = subsampling.subsample(&once).unwrap();
    assert_eq!(once.lengths(), &[20, 44]);
    assert_eq!(twice.lengths(), once.lengths());
}

fn check_same_cloud(what: &str, index: &NeighborIndex, queries: &[usize], supports: &[usize]) {
    assert_eq!(index.rows(), queries.len(), "{what}");
    for (query, row) in index.iter_rows().enumerate() {
        for &support in row.iter().filter(|&&s| !index.is_shadow(s)) {
            assert_eq!(queries[query], supports[support], "{what}: query {query}");
        }
    }
}

fn overlapping_batch() -> SpatialBatch<f64> {
    // Three clouds on the same coordinates.
    let cloud = grid(4, 0.1);
    let n = cloud.nrows();
    let mut points = DMatrix::zeros(3 * n, 3);
    for i in 0..3 {
        points.rows_mut(i * n, n).copy_from(&cloud);
    }
    let colors = DMatrix::from_fn(3 * n, 6, |r, c| if c < 3 { 0.5 } else { points[(r, c - 3)] });
    SpatialBatch {
        points: StackedCloud::new(points, vec![n; 3]).unwrap(),
        colors,
        labels: vec![1; 3 * n],
        point_inds: (0..3 * n).map(|i| i % n).collect(),
        cloud_inds: vec![0, 0, 0],
    }
}

fn small_config() -> KpConvConfig {
    KpConvConfig {
        architecture: ["simple", "resnetb", "resnetb_strided", "resnetb", "nearest_upsample", "unary"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        num_layers: 2,
        num_kernel_points: 5,
        first_features_dim: 8,
        first_subsampling_dl: 0.1,
        in_features_dim: 4,
        num_classes: 3,
        epoch_steps: 4,
        batch_num: 2,
        in_radius: 0.35,
        batch_limit: 150,
        ..Default::default()
    }
}

#[test]
fn assembled_layers_stay_within_their_cloud() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert_eq!(batch_inds(&[4, 2]), vec![0, 0, 0, 0, 1, 1]);

    let cfg = small_config();
    let batch = overlapping_batch();
    let inputs = transform(&batch, &cfg, &mut StdRng::seed_from_u64(1)).unwrap();
    assert_eq!(inputs.num_layers(), 2);
    assert_eq!(inputs.features.shape(), (192, 4));
    assert_eq!(inputs.augment_rotations.len(), 3);
    assert_eq!(inputs.point_labels.len(), 192);

    for (i, layer) in inputs.layers.iter().enumerate() {
        let fine = batch_inds(layer.points.lengths());
        check_same_cloud("neighbors", &layer.neighbors, &fine, &fine);
        if let Some(next) = inputs.layers.get(i + 1) {
            let coarse = batch_inds(next.points.lengths());
            check_same_cloud("pools", &layer.pools, &coarse, &fine);
            check_same_cloud("upsamples", &layer.upsamples, &fine, &coarse);
        }
    }
}

#[test]
fn generated_batches_run_through_the_network() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    let json = small_config().to_json_string().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    let cfg = KpConvConfig::from_path(file.path()).unwrap();
    assert_eq!(cfg, small_config());

    let clouds = [grid(6, 0.1), grid(5, 0.1).add_scalar(3.)]
        .iter()
        .map(|points| {
            let labels = { (0..points.nrows()) }
                .map(|i| (i % 3) as i32)
                .collect::<Vec<_>>();
            let colors = points.map(|x| x.fract());
            preprocess(points, Some(&colors), Some(&labels[..]), Split::Training, &cfg).unwrap()
        })
        .collect();
    let dataset = InMemoryDataset::new(Split::Training, clouds);
    assert_eq!(dataset.num_clouds(), 2);

    let network = Kpfcnn::<f64>::new(&cfg).unwrap();
    let mut rng = StdRng::seed_from_u64(cfg.augment_seed);
    let mut count = 0;
    for batch in SpatialBatchGenerator::new(&dataset, &cfg).unwrap() {
        let batch = batch.unwrap();
        assert!(batch.points.len() <= cfg.batch_limit);

        let inputs = transform(&batch, &cfg, &mut rng).unwrap();
        let output = network.forward(&inputs).unwrap();
        assert_eq!(output.logits.shape(), (batch.points.len(), cfg.num_output_classes()));
        assert!(output.logits.iter().all(|x| x.is_finite()));
        assert!(output.deformations.is_empty());
        count += 1;
    }
    assert!(count > 0);
}
