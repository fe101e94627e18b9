use std::collections::VecDeque;

/// Fixed-capacity window of the most recent samples.
///
/// Pushing into a full window evicts the oldest sample. Predicates over the
/// window only hold once it is full, so a handful of early readings never
/// count as a sustained trend.
#[derive(Debug, Clone)]
pub struct SampleWindow<T> {
    inner: VecDeque<T>,
    capacity: usize,
}

impl<T> SampleWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.inner.len() == self.capacity {
            self.inner.pop_front();
        }
        self.inner.push_back(value);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.inner.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    /// True only when the window is full and every sample satisfies `f`.
    pub fn full_and_all<F: FnMut(&T) -> bool>(&self, f: F) -> bool {
        self.is_full() && self.inner.iter().all(f)
    }
}

impl SampleWindow<u64> {
    pub fn mean(&self) -> Option<u64> {
        if self.inner.is_empty() {
            return None;
        }
        let sum: u128 = self.inner.iter().map(|&v| v as u128).sum();
        Some((sum / self.inner.len() as u128) as u64)
    }
}

/// Remaining room under an optional cap; `None` means unbounded.
#[inline]
pub fn remaining(cap: Option<std::num::NonZeroUsize>, used: usize) -> usize {
    cap.map_or(usize::MAX, |cap| cap.get().saturating_sub(used))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod sample_window {
        use super::*;

        #[test]
        fn test_push_evicts_oldest() {
            let mut window = SampleWindow::new(3);
            for v in 1..=5 {
                window.push(v);
            }
            let items: Vec<_> = window.iter().copied().collect();
            assert_eq!(items, vec![3, 4, 5]);
            assert_eq!(window.latest(), Some(&5));
        }

        #[test]
        fn test_full_and_all_requires_full() {
            let mut window = SampleWindow::new(3);
            window.push(0);
            window.push(0);
            assert!(!window.is_full());
            assert!(!window.full_and_all(|&v| v == 0));

            window.push(0);
            assert!(window.full_and_all(|&v| v == 0));

            window.push(1);
            assert!(!window.full_and_all(|&v| v == 0));
        }

        #[test]
        fn test_zero_capacity_is_clamped() {
            let mut window = SampleWindow::new(0);
            window.push(7);
            assert!(window.is_full());
            assert_eq!(window.len(), 1);
        }

        #[test]
        fn test_mean() {
            let mut window: SampleWindow<u64> = SampleWindow::new(4);
            assert_eq!(window.mean(), None);
            window.push(10);
            window.push(20);
            window.push(30);
            assert_eq!(window.mean(), Some(20));
        }
    }

    #[test]
    fn test_remaining() {
        use std::num::NonZeroUsize;

        assert_eq!(remaining(None, 100), usize::MAX);
        assert_eq!(remaining(NonZeroUsize::new(3), 1), 2);
        assert_eq!(remaining(NonZeroUsize::new(3), 5), 0);
    }
}
