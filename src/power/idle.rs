use std::sync::atomic::{AtomicU32, Ordering};

/// Value every slot holds after [`IdleStateCache::reset`].
pub const IDLE_STATE_RESET: u32 = 0;

/// Outcome of recording an idle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleUpdate {
    /// Same state as the previous event on this core.
    Unchanged,
    /// State differs from the previous one; the slot now holds the new state.
    Transition,
    /// Core index beyond the cache.
    OutOfRange,
}

/// Last reported idle state, one slot per physical core.
///
/// Each slot has a single writer (the host delivers one core's idle events
/// sequentially), so plain relaxed load/store is enough.
#[derive(Debug)]
pub struct IdleStateCache {
    slots: Box<[AtomicU32]>,
}

impl IdleStateCache {
    pub fn new(cores: usize) -> Self {
        Self {
            slots: (0..cores)
                .map(|_| AtomicU32::new(IDLE_STATE_RESET))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Last recorded state for `core`.
    pub fn last(&self, core: u32) -> Option<u32> {
        self.slots
            .get(core as usize)
            .map(|slot| slot.load(Ordering::Relaxed))
    }

    /// Record `state` for `core`.
    #[inline]
    pub fn record(&self, core: u32, state: u32) -> IdleUpdate {
        let Some(slot) = self.slots.get(core as usize) else {
            return IdleUpdate::OutOfRange;
        };

        if slot.load(Ordering::Relaxed) == state {
            return IdleUpdate::Unchanged;
        }

        slot.store(state, Ordering::Relaxed);
        IdleUpdate::Transition
    }

    /// Put the given cores back to [`IDLE_STATE_RESET`].
    pub fn reset(&self, cores: &[u32]) {
        for &core in cores {
            if let Some(slot) = self.slots.get(core as usize) {
                slot.store(IDLE_STATE_RESET, Ordering::Relaxed);
            }
        }
    }
}
