use std::mem;

use kpconv_common::filter::Filter;
use rand::{rngs::ThreadRng, Rng};

/// Uniform reservoir selection of `select_num` elements.
pub struct Random<R: Rng = ThreadRng> {
    pub rng: R,
    pub select_num: usize,
}

impl<R: Rng> Random<R> {
    pub fn new(rng: R, select_num: usize) -> Random<R> {
        Random { rng, select_num }
    }
}

impl<R: Rng, T> Filter<[T]> for Random<R> {
    fn filter_indices(&mut self, input: &[T]) -> Vec<usize> {
        self.filter_all_indices(input).0
    }

    fn filter_all_indices(&mut self, input: &[T]) -> (Vec<usize>, Vec<usize>) {
        if input.len() <= self.select_num {
            ((0..input.len()).collect(), Vec::new())
        } else {
            let mut indices = (0..self.select_num).collect::<Vec<_>>();
            let mut removed = (self.select_num..input.len()).collect::<Vec<_>>();

            for index in removed.iter_mut() {
                let slot = self.rng.gen_range(0..=*index);
                if slot < self.select_num {
                    mem::swap(&mut indices[slot], index);
                }
            }

            (indices, removed)
        }
    }
}
