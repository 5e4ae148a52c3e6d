use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use log::debug;

/// Claim held by an open scan on the on-disk pages of one checkpoint
/// generation. Released through [`CheckpointState::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetentionToken {
    generation: u64,
}

impl RetentionToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Checkpoint generation bookkeeping of one tree.
///
/// Every open scan increments the live-scan counter of the generation that
/// was current when it started. The space of a generation can be reclaimed
/// only once its counter drops back to zero.
#[derive(Debug, Default)]
pub struct CheckpointState {
    generation: AtomicU64,
    switching: AtomicBool,
    live_scans: DashMap<u64, u32>,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current generation together with a flag telling whether a
    /// switch to the next generation is in flight.
    pub fn current_generation(&self) -> (u64, bool) {
        let switching = self.switching.load(Ordering::Acquire);
        (self.generation.load(Ordering::Acquire), switching)
    }

    /// Registers a live scan against the current generation.
    ///
    /// The generation can move while the counter is being bumped, so the
    /// generation is re-read after the increment and the claim is moved until
    /// both reads agree.
    pub fn register_scan(&self) -> RetentionToken {
        let (mut before, _) = self.current_generation();
        loop {
            self.increment(before);
            let (after, _) = self.current_generation();
            if after == before {
                return RetentionToken { generation: before };
            }
            debug!(
                "checkpoint generation moved {} -> {} during scan registration",
                before, after
            );
            self.decrement(before);
            before = after;
        }
    }

    pub fn release(&self, token: RetentionToken) {
        self.decrement(token.generation);
    }

    pub fn live_scans(&self, generation: u64) -> u32 {
        self.live_scans
            .get(&generation)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn can_reclaim(&self, generation: u64) -> bool {
        self.live_scans(generation) == 0
    }

    pub fn begin_checkpoint(&self) {
        self.switching.store(true, Ordering::Release);
    }

    /// Finishes the in-flight checkpoint and returns the new generation.
    pub fn complete_checkpoint(&self) -> u64 {
        let next = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.switching.store(false, Ordering::Release);
        next
    }

    fn increment(&self, generation: u64) {
        *self.live_scans.entry(generation).or_insert(0) += 1;
    }

    fn decrement(&self, generation: u64) {
        let drained = match self.live_scans.get_mut(&generation) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if drained {
            self.live_scans.remove_if(&generation, |_, count| *count == 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_release_balance() {
        let state = CheckpointState::new();
        let a = state.register_scan();
        let b = state.register_scan();
        assert_eq!(a.generation(), 0);
        assert_eq!(state.live_scans(0), 2);
        assert!(!state.can_reclaim(0));

        state.release(a);
        state.release(b);
        assert!(state.can_reclaim(0));
    }

    #[test]
    fn scans_pin_the_generation_they_started_in() {
        let state = CheckpointState::new();
        let old = state.register_scan();
        state.begin_checkpoint();
        assert!(state.current_generation().1);
        assert_eq!(state.complete_checkpoint(), 1);

        let new = state.register_scan();
        assert_eq!(new.generation(), 1);
        assert!(!state.can_reclaim(0));
        state.release(old);
        assert!(state.can_reclaim(0));
        assert!(!state.can_reclaim(1));
        state.release(new);
        assert!(state.can_reclaim(1));
    }
}
