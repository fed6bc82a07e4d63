mod node;
mod result;

use kpconv_common::search::{SearchType, Searcher};
use nalgebra::{DMatrix, RealField};
use node::Node;

pub use self::result::*;

pub const DEFAULT_LEAF_SIZE: usize = 16;

/// An exact kd-tree over the rows of a `[N, dim]` matrix. Distances are
/// reported squared.
#[derive(Debug, Clone)]
pub struct KdTree<T: RealField + Copy> {
    points: DMatrix<T>,
    root: Option<Node<T>>,
    indices: Vec<usize>,
}

impl<T: RealField + Copy> KdTree<T> {
    pub fn new(points: DMatrix<T>) -> Self {
        Self::with_leaf_size(points, DEFAULT_LEAF_SIZE)
    }

    pub fn with_leaf_size(points: DMatrix<T>, leaf_size: usize) -> Self {
        let mut indices = (0..points.nrows()).collect::<Vec<_>>();
        let root = (!indices.is_empty())
            .then(|| Node::build(0, &points, &mut indices, leaf_size.max(1)));
        KdTree {
            points,
            root,
            indices,
        }
    }

    #[inline]
    pub fn points(&self) -> &DMatrix<T> {
        &self.points
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    pub fn search_exact(&self, pivot: &[T], result: &mut impl ResultSet<Key = T, Value = usize>) {
        assert_eq!(pivot.len(), self.dim(), "pivot dimension mismatch");
        if let Some(root) = &self.root {
            root.search_exact(&self.points, &self.indices, pivot, result)
        }
    }

    /// The `num` nearest points as `(index, squared distance)`.
    pub fn knn(&self, pivot: &[T], num: usize) -> Vec<(usize, T)> {
        let mut rs = KnnResultSet::new(num);
        self.search_exact(pivot, &mut rs);
        { rs.into_sorted_vec().into_iter() }
            .map(|(k, v)| (v, k))
            .collect()
    }

    /// Every point strictly closer than `radius`, nearest first.
    pub fn radius(&self, pivot: &[T], radius: T) -> Vec<(usize, T)> {
        let mut rs = RadiusResultSet::new(radius * radius);
        self.search_exact(pivot, &mut rs);
        { rs.into_sorted_vec().into_iter() }
            .map(|(k, v)| (v, k))
            .collect()
    }
}

impl<T: RealField + Copy> Searcher<T> for KdTree<T> {
    fn points(&self) -> &DMatrix<T> {
        &self.points
    }

    fn search(&self, pivot: &[T], ty: SearchType<T>, result: &mut Vec<(usize, T)>) {
        result.clear();
        match ty {
            SearchType::Knn(num) => result.extend(self.knn(pivot, num)),
            SearchType::Radius(radius) => result.extend(self.radius(pivot, radius)),
        }
    }
}
