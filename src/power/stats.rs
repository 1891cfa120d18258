use std::sync::atomic::{AtomicU64, Ordering};

use crate::sink::{SampleKind, SAMPLE_KIND_COUNT};

use super::event::{ProbeKind, PROBE_KIND_COUNT};

/// Lock-free counters for the probe and resync paths.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
#[derive(Debug)]
pub struct ProbeStats {
    events: [AtomicU64; PROBE_KIND_COUNT],
    emitted: [AtomicU64; SAMPLE_KIND_COUNT],
    idle_duplicates: AtomicU64,
    idle_unreported: AtomicU64,
    idle_out_of_range: AtomicU64,
    resync_ticks: AtomicU64,
    resync_ns: AtomicU64,
}

/// Counter values taken by [`ProbeStats::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Non-zero event counts per probe.
    pub events: Vec<(ProbeKind, u64)>,
    /// Non-zero sample counts per emission path.
    pub emitted: Vec<(SampleKind, u64)>,
    /// Idle events equal to the cached state.
    pub idle_duplicates: u64,
    /// Idle transitions recorded but not emitted (no wfi reporting).
    pub idle_unreported: u64,
    pub idle_out_of_range: u64,
    pub resync_ticks: u64,
    /// Total time spent in resync sweeps.
    pub resync_ns: u64,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.emitted.is_empty()
            && self.idle_duplicates == 0
            && self.idle_unreported == 0
            && self.idle_out_of_range == 0
            && self.resync_ticks == 0
    }

    /// Events seen for `kind`.
    pub fn events_for(&self, kind: ProbeKind) -> u64 {
        self.events
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, v)| *v)
    }

    /// Samples emitted through `kind`.
    pub fn emitted_for(&self, kind: SampleKind) -> u64 {
        self.emitted
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, v)| *v)
    }
}

impl ProbeStats {
    pub fn new() -> Self {
        Self {
            events: std::array::from_fn(|_| AtomicU64::new(0)),
            emitted: std::array::from_fn(|_| AtomicU64::new(0)),
            idle_duplicates: AtomicU64::new(0),
            idle_unreported: AtomicU64::new(0),
            idle_out_of_range: AtomicU64::new(0),
            resync_ticks: AtomicU64::new(0),
            resync_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_event(&self, kind: ProbeKind) {
        self.events[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_emit(&self, kind: SampleKind) {
        self.emitted[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_idle_duplicate(&self) {
        self.idle_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_idle_unreported(&self) {
        self.idle_unreported.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_idle_out_of_range(&self) {
        self.idle_out_of_range.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one completed resync sweep that took `elapsed_ns`.
    pub fn record_resync(&self, elapsed_ns: u64) {
        self.resync_ticks.fetch_add(1, Ordering::Relaxed);
        self.resync_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snap = StatsSnapshot::default();

        for (i, counter) in self.events.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = ProbeKind::from_u8(i as u8) {
                    snap.events.push((kind, v));
                }
            }
        }

        for kind in SampleKind::all() {
            let v = self.emitted[*kind as usize].swap(0, Ordering::Relaxed);
            if v > 0 {
                snap.emitted.push((*kind, v));
            }
        }

        snap.idle_duplicates = self.idle_duplicates.swap(0, Ordering::Relaxed);
        snap.idle_unreported = self.idle_unreported.swap(0, Ordering::Relaxed);
        snap.idle_out_of_range = self.idle_out_of_range.swap(0, Ordering::Relaxed);
        snap.resync_ticks = self.resync_ticks.swap(0, Ordering::Relaxed);
        snap.resync_ns = self.resync_ns.swap(0, Ordering::Relaxed);

        snap
    }
}

impl Default for ProbeStats {
    fn default() -> Self {
        Self::new()
    }
}
