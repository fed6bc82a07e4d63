use kpconv_common::{
    search::{SearchType, Searcher},
    stacked::batch_inds,
    KpConvError, NeighborIndex, Result, StackedCloud,
};
use kpconv_kdtree::KdTree;
use nalgebra::{DMatrix, RealField};
use rayon::prelude::*;

fn check_compatible<T: RealField + Copy>(
    queries: &StackedCloud<T>,
    supports: &StackedCloud<T>,
) -> Result<()> {
    if queries.num_clouds() != supports.num_clouds() {
        return Err(KpConvError::ShapeMismatch {
            what: "number of clouds",
            expected: supports.num_clouds(),
            actual: queries.num_clouds(),
        });
    }
    if queries.dim() != supports.dim() {
        return Err(KpConvError::ShapeMismatch {
            what: "point dimension",
            expected: supports.dim(),
            actual: queries.dim(),
        });
    }
    Ok(())
}

/// One tree per support cloud, with the stacked offset of its first point.
fn cloud_trees<T: RealField + Copy>(supports: &StackedCloud<T>) -> Vec<(usize, KdTree<T>)> {
    { supports.cloud_ranges() }
        .map(|range| {
            let points = supports.points().rows(range.start, range.len()).into_owned();
            (range.start, KdTree::new(points))
        })
        .collect()
}

/// For every query, the supports of the same cloud strictly closer than
/// `radius`, nearest first (ties by index). Rows are padded with the shadow
/// index `supports.len()` up to the longest row.
pub fn batch_neighbors<T: RealField + Copy>(
    queries: &StackedCloud<T>,
    supports: &StackedCloud<T>,
    radius: T,
) -> Result<NeighborIndex> {
    check_compatible(queries, supports)?;

    let trees = cloud_trees(supports);
    let clouds = batch_inds(queries.lengths());
    let points = queries.points();

    let rows = { (0..queries.len()).into_par_iter() }
        .map(|query| {
            let (offset, tree) = &trees[clouds[query]];
            let pivot = points.row(query).iter().copied().collect::<Vec<_>>();
            { tree.radius(&pivot, radius).into_iter() }
                .map(|(index, _)| index + offset)
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    Ok(NeighborIndex::from_rows(rows, supports.len()))
}

/// [`batch_neighbors`] cropped to the nearest `limit` supports per query.
pub fn batch_neighbors_capped<T: RealField + Copy>(
    queries: &StackedCloud<T>,
    supports: &StackedCloud<T>,
    radius: T,
    limit: usize,
) -> Result<NeighborIndex> {
    let neighbors = batch_neighbors(queries, supports, radius)?;
    if neighbors.width() > limit {
        let truncated = { (0..neighbors.rows()) }
            .filter(|&query| neighbors.real_count(query) > limit)
            .count();
        log::warn!(
            "{truncated} of {} neighborhoods exceed the cap of {limit} (widest: {})",
            neighbors.rows(),
            neighbors.width()
        );
    }
    Ok(neighbors.crop(limit))
}

/// The nearest point of `searcher` for every row of `points`.
pub fn project_nearest<T, S>(searcher: &S, points: &DMatrix<T>) -> Result<Vec<usize>>
where
    T: RealField + Copy,
    S: Searcher<T> + Sync,
{
    let supports = searcher.points();
    if points.ncols() != supports.ncols() {
        return Err(KpConvError::ShapeMismatch {
            what: "point dimension",
            expected: supports.ncols(),
            actual: points.ncols(),
        });
    }
    if supports.nrows() == 0 && points.nrows() > 0 {
        return Err(KpConvError::ShapeMismatch {
            what: "projection support count",
            expected: 1,
            actual: 0,
        });
    }
    let inds = { (0..points.nrows()).into_par_iter() }
        .map(|row| {
            let pivot = points.row(row).iter().copied().collect::<Vec<_>>();
            let mut result = Vec::with_capacity(1);
            searcher.search(&pivot, SearchType::Knn(1), &mut result);
            result.first().map_or(0, |&(index, _)| index)
        })
        .collect();
    Ok(inds)
}
