use nalgebra::{DMatrix, RealField};

use crate::ResultSet;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node<T> {
    /// A bucket of `indices[start..end]`.
    Leaf { start: usize, end: usize },
    Branch {
        children: Box<[Node<T>; 2]>,
        dim: usize,
        value: T,
    },
}

/// Moves the indices with `pred` to the front, returning how many there are.
fn partition(indices: &mut [usize], mut pred: impl FnMut(usize) -> bool) -> usize {
    let mut split = 0;
    for i in 0..indices.len() {
        if pred(indices[i]) {
            indices.swap(split, i);
            split += 1;
        }
    }
    split
}

/// Splits `indices` into `< value`, `== value`, `> value` along `dim`,
/// returning the bounds of the middle run.
fn cut_split<T: RealField + Copy>(
    coords: &DMatrix<T>,
    indices: &mut [usize],
    dim: usize,
    value: T,
) -> (usize, usize) {
    let limit_left = partition(indices, |i| coords[(i, dim)] < value);
    let limit_right =
        limit_left + partition(&mut indices[limit_left..], |i| coords[(i, dim)] <= value);
    (limit_left, limit_right)
}

/// Chooses the dimension of largest spread and cuts at its mean. Returns
/// `None` when every point coincides.
fn cut<T: RealField + Copy>(coords: &DMatrix<T>, indices: &mut [usize]) -> Option<(usize, usize, T)> {
    let dims = coords.ncols();
    let count = T::from_usize(indices.len())?;

    let mut mean = vec![T::zero(); dims];
    for &i in indices.iter() {
        mean.iter_mut()
            .enumerate()
            .for_each(|(d, m)| *m += coords[(i, d)]);
    }
    mean.iter_mut().for_each(|m| *m /= count);

    let mut var = vec![T::zero(); dims];
    for &i in indices.iter() {
        var.iter_mut().enumerate().for_each(|(d, v)| {
            let diff = coords[(i, d)] - mean[d];
            *v += diff * diff
        });
    }

    let (dim, max_var) = { var.iter().copied().enumerate() }.fold(
        (0, T::zero()),
        |(max_dim, max_var), (dim, var)| {
            if var > max_var {
                (dim, var)
            } else {
                (max_dim, max_var)
            }
        },
    );
    if max_var <= T::zero() {
        return None;
    }

    let value = mean[dim];
    let (limit_left, limit_right) = cut_split(coords, indices, dim, value);

    let mid = indices.len() / 2;
    let split = if limit_left > mid {
        limit_left
    } else if limit_right < mid {
        limit_right
    } else {
        mid
    };

    // A spread dimension always has points on both sides of its mean.
    (0 < split && split < indices.len()).then_some((split, dim, value))
}

impl<T: RealField + Copy> Node<T> {
    pub fn build(
        start_index: usize,
        coords: &DMatrix<T>,
        indices: &mut [usize],
        leaf_size: usize,
    ) -> Self {
        let end = start_index + indices.len();
        if indices.len() <= leaf_size {
            return Node::Leaf {
                start: start_index,
                end,
            };
        }
        match cut(coords, indices) {
            None => Node::Leaf {
                start: start_index,
                end,
            },
            Some((split, dim, value)) => {
                let (left, right) = indices.split_at_mut(split);

                let left = Node::build(start_index, coords, left, leaf_size);
                let right = Node::build(start_index + split, coords, right, leaf_size);

                Node::Branch {
                    children: Box::new([left, right]),
                    dim,
                    value,
                }
            }
        }
    }

    pub fn search_exact(
        &self,
        coords: &DMatrix<T>,
        indices: &[usize],
        pivot: &[T],
        result: &mut impl ResultSet<Key = T, Value = usize>,
    ) {
        match self {
            Node::Leaf { start, end } => {
                for &index in &indices[*start..*end] {
                    let distance = { pivot.iter().enumerate() }.fold(T::zero(), |acc, (d, &p)| {
                        let diff = coords[(index, d)] - p;
                        acc + diff * diff
                    });
                    result.push(distance, index);
                }
            }
            Node::Branch {
                children,
                dim,
                value,
            } => {
                let [left, right] = &**children;
                let (next, other) = if pivot[*dim] < *value {
                    (left, right)
                } else {
                    (right, left)
                };

                next.search_exact(coords, indices, pivot, result);

                let diff = pivot[*dim] - *value;
                let min_distance = diff * diff;
                let visit = !result.is_full()
                    || matches!(result.max_key(), Some(max) if min_distance <= *max);
                if visit {
                    other.search_exact(coords, indices, pivot, result)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_split() {
        let coords = DMatrix::from_column_slice(6, 1, &[3.0, 1.0, 2.0, 2.0, 0.0, 5.0]);
        let mut indices = (0..6).collect::<Vec<_>>();
        let (left, right) = cut_split(&coords, &mut indices, 0, 2.0);
        assert_eq!((left, right), (2, 4));
        assert!(indices[..2].iter().all(|&i| coords[(i, 0)] < 2.0));
        assert!(indices[2..4].iter().all(|&i| coords[(i, 0)] == 2.0));
        assert!(indices[4..].iter().all(|&i| coords[(i, 0)] > 2.0));
    }

    #[test]
    fn test_coincident_points_make_a_leaf() {
        let coords = DMatrix::from_element(40, 3, 1.5f64);
        let mut indices = (0..40).collect::<Vec<_>>();
        let node = Node::build(0, &coords, &mut indices, 4);
        assert_eq!(node, Node::Leaf { start: 0, end: 40 });
    }
}
