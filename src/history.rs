use std::collections::VecDeque;

/// Fixed-capacity ring of samples; the oldest entry falls out once the
/// capacity is reached.
///
/// Every monitor keeps its snapshots in one of these, so a reader always sees
/// either the history before a push or after it, never something in between.
#[derive(Debug, Clone)]
pub struct RollingHistory<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingHistory<T> {
    /// A capacity of zero is bumped to one so `latest` stays meaningful.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, returning the evicted one if the history was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.items.front()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// The last `n` samples, oldest first.
    pub fn window(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip)
    }

    /// Drops samples from the front while `predicate` holds.
    pub fn prune_front(&mut self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let mut removed = 0;
        while let Some(front) = self.items.front() {
            if !predicate(front) {
                break;
            }
            self.items.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RollingHistory<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut history = RollingHistory::new(3);
        assert_eq!(history.push(1), None);
        assert_eq!(history.push(2), None);
        assert_eq!(history.push(3), None);
        assert_eq!(history.push(4), Some(1));
        assert_eq!(history.to_vec(), vec![2, 3, 4]);
        assert_eq!(history.latest(), Some(&4));
        assert_eq!(history.oldest(), Some(&2));
    }

    #[test]
    fn test_window_returns_tail() {
        let mut history = RollingHistory::new(10);
        for i in 0..6 {
            history.push(i);
        }
        let tail: Vec<_> = history.window(3).copied().collect();
        assert_eq!(tail, vec![3, 4, 5]);

        let all: Vec<_> = history.window(100).copied().collect();
        assert_eq!(all.len(), 6);
    }

    #[test]
    fn test_prune_front() {
        let mut history = RollingHistory::new(10);
        for i in 0..5 {
            history.push(i);
        }
        assert_eq!(history.prune_front(|&i| i < 2), 2);
        assert_eq!(history.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let mut history = RollingHistory::new(0);
        history.push("a");
        history.push("b");
        assert_eq!(history.len(), 1);
        assert_eq!(history.capacity(), 1);
    }
}
