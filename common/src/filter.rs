/// A filter that keeps some elements of its input and reports the kept
/// indices instead of copying the elements out.
pub trait Filter<T: ?Sized> {
    fn filter_indices(&mut self, input: &T) -> Vec<usize>;

    /// The kept indices and the removed ones. The removed list may be left
    /// empty by filters that do not track it.
    fn filter_all_indices(&mut self, input: &T) -> (Vec<usize>, Vec<usize>) {
        (self.filter_indices(input), Vec::new())
    }
}

impl<T, F: FnMut(&T) -> bool> Filter<[T]> for F {
    fn filter_indices(&mut self, input: &[T]) -> Vec<usize> {
        let mut indices = (0..input.len()).collect::<Vec<_>>();
        indices.retain(|&index| (self)(&input[index]));
        indices
    }

    fn filter_all_indices(&mut self, input: &[T]) -> (Vec<usize>, Vec<usize>) {
        let mut indices = (0..input.len()).collect::<Vec<_>>();
        let mut removed = Vec::with_capacity(indices.len());
        indices.retain(|&index| {
            let ret = (self)(&input[index]);
            if !ret {
                removed.push(index)
            }
            ret
        });
        (indices, removed)
    }
}
