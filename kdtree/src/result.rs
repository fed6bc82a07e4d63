use std::{cmp::Ordering, collections::BinaryHeap};

#[derive(Debug, Copy, Clone)]
struct Node<K, V> {
    key: K,
    value: V,
}

impl<K: PartialEq, V: PartialEq> PartialEq for Node<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

impl<K: PartialEq, V: PartialEq> Eq for Node<K, V> {}

impl<K: PartialOrd, V: PartialOrd> PartialOrd for Node<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: PartialOrd, V: PartialOrd> Ord for Node<K, V> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.partial_cmp(&other.key) {
            Some(Ordering::Equal) | None => {}
            Some(ord) => return ord,
        }
        self.value
            .partial_cmp(&other.value)
            .unwrap_or(Ordering::Equal)
    }
}

pub trait ResultSet {
    type Key;
    type Value;

    fn push(&mut self, key: Self::Key, value: Self::Value);

    fn is_full(&self) -> bool;

    /// The largest key that can still be accepted.
    fn max_key(&self) -> Option<&Self::Key>;
}

/// Keeps the `num` smallest keys seen so far. Ties on the key are broken by
/// the smaller value.
pub struct KnnResultSet<K, V> {
    data: BinaryHeap<Node<K, V>>,
    num: usize,
}

impl<K: PartialOrd, V: PartialOrd> KnnResultSet<K, V> {
    pub fn new(num: usize) -> Self {
        KnnResultSet {
            data: BinaryHeap::with_capacity(num.min(128)),
            num,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.data.iter().map(|node| (&node.key, &node.value))
    }

    /// Ascending by key.
    pub fn into_sorted_vec(self) -> Vec<(K, V)> {
        { self.data.into_sorted_vec().into_iter() }
            .map(|node| (node.key, node.value))
            .collect()
    }
}

impl<K: PartialOrd, V: PartialOrd> ResultSet for KnnResultSet<K, V> {
    type Key = K;
    type Value = V;

    fn push(&mut self, key: K, value: V) {
        let node = Node { key, value };
        if self.is_full() {
            match self.data.peek() {
                Some(max) if node < *max => {
                    self.data.pop();
                }
                _ => return,
            }
        }
        self.data.push(node);
    }

    fn is_full(&self) -> bool {
        self.data.len() >= self.num
    }

    fn max_key(&self) -> Option<&K> {
        self.data.peek().map(|node| &node.key)
    }
}

/// Keeps every key strictly smaller than `radius`.
pub struct RadiusResultSet<K, V> {
    data: Vec<Node<K, V>>,
    radius: K,
}

impl<K: PartialOrd, V: PartialOrd> RadiusResultSet<K, V> {
    pub fn new(radius: K) -> Self {
        RadiusResultSet {
            data: Vec::with_capacity(128),
            radius,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.data.iter().map(|node| (&node.key, &node.value))
    }

    /// Ascending by key, then by value.
    pub fn into_sorted_vec(mut self) -> Vec<(K, V)> {
        self.data.sort_unstable();
        { self.data.into_iter() }
            .map(|node| (node.key, node.value))
            .collect()
    }
}

impl<K: PartialOrd, V: PartialOrd> ResultSet for RadiusResultSet<K, V> {
    type Key = K;
    type Value = V;

    fn push(&mut self, key: K, value: V) {
        if key < self.radius {
            self.data.push(Node { key, value });
        }
    }

    fn is_full(&self) -> bool {
        true
    }

    fn max_key(&self) -> Option<&K> {
        Some(&self.radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_traits() {
        let node1 = Node {
            key: 0.0f32,
            value: 0,
        };
        let node2 = Node {
            key: 1.0f32,
            value: 1,
        };
        assert!(node1.cmp(&node2) == Ordering::Less);
        let node3 = Node {
            key: 0.0f32,
            value: 2,
        };
        assert!(node1 < node3);
    }

    #[test]
    fn test_knn_keeps_smallest() {
        let mut rs = KnnResultSet::new(2);
        for (key, value) in [(3.0, 0), (1.0, 1), (2.0, 2), (1.0, 3), (0.5, 4)] {
            rs.push(key, value);
        }
        assert!(rs.is_full());
        assert_eq!(rs.into_sorted_vec(), vec![(0.5, 4), (1.0, 1)]);

        let mut rs = KnnResultSet::new(0);
        rs.push(1.0, 0);
        assert!(rs.is_empty());
    }

    #[test]
    fn test_radius_is_strict() {
        let mut rs = RadiusResultSet::new(1.0);
        rs.push(1.0, 0);
        rs.push(0.25, 1);
        rs.push(0.0, 2);
        assert_eq!(rs.into_sorted_vec(), vec![(0.0, 2), (0.25, 1)]);
    }
}
