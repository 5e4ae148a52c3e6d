use crate::buffer::Key;

/// Where the cursor goes after the caller has looked at a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextKey {
    /// Keep reading tuples in order.
    Continue,
    /// Skip every tuple whose key is below the given one.
    Seek(Key),
    /// Nothing else on the current leaf is of interest.
    SkipPage,
}

/// Hooks for index-only and filtered scans.
pub trait ScanCallbacks: Send {
    /// Called with the key range of a downlink before its subtree is read.
    /// Returning `false` skips the subtree without any I/O. `None` bounds are
    /// open.
    fn is_range_valid(&mut self, _low: Option<&Key>, _high: Option<&Key>) -> bool {
        true
    }

    /// Called with the smallest key the cursor is about to consider.
    fn next_key(&mut self, _current: &Key) -> NextKey {
        NextKey::Continue
    }
}

/// Source of the downlink ordinals to read in a sampling scan. Ordinals must
/// be handed out in increasing order.
pub trait BlockSampler: Send {
    fn has_more(&mut self) -> bool;

    fn next(&mut self) -> u64;
}

/// Admission state of a sampling scan: every downlink the walk yields gets
/// the next ordinal, and only ordinals picked by the sampler are read.
pub(crate) struct Sampling {
    sampler: Box<dyn BlockSampler>,
    number: u64,
    next: Option<u64>,
}

impl Sampling {
    pub(crate) fn new(mut sampler: Box<dyn BlockSampler>) -> Self {
        let next = sampler.has_more().then(|| sampler.next());
        Self {
            sampler,
            number: 0,
            next,
        }
    }

    pub(crate) fn admit(&mut self) -> bool {
        let admitted = self.next.is_some_and(|next| self.number >= next);
        if admitted {
            self.next = self.sampler.has_more().then(|| self.sampler.next());
        }
        self.number += 1;
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Every(u64, u64, u64);

    impl BlockSampler for Every {
        fn has_more(&mut self) -> bool {
            self.0 < self.2
        }

        fn next(&mut self) -> u64 {
            let n = self.0;
            self.0 += self.1;
            n
        }
    }

    #[test]
    fn sampling_admits_picked_ordinals() {
        let mut sampling = Sampling::new(Box::new(Every(1, 3, 8)));
        let admitted: Vec<bool> = (0..10).map(|_| sampling.admit()).collect();
        assert_eq!(
            admitted,
            vec![false, true, false, false, true, false, false, true, false, false]
        );
    }

    #[test]
    fn empty_sampler_admits_nothing() {
        let mut sampling = Sampling::new(Box::new(Every(0, 1, 0)));
        assert!((0..4).all(|_| !sampling.admit()));
    }
}
