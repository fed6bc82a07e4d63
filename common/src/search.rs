use nalgebra::{DMatrix, Scalar};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SearchType<T> {
    Knn(usize),
    Radius(T),
}

/// A spatial index over the rows of a `[N, dim]` point matrix.
pub trait Searcher<T: Scalar> {
    fn points(&self) -> &DMatrix<T>;

    /// Replaces `result` with `(index, squared distance)` pairs, nearest first.
    fn search(&self, pivot: &[T], ty: SearchType<T>, result: &mut Vec<(usize, T)>);
}
