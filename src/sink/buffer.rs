use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Marshal, Sample, SampleKind, SAMPLE_KIND_COUNT};

/// Fixed-capacity sample ring.
///
/// Storage is allocated once in [`TraceBuffer::new`]; emission never grows it.
/// When the ring is full new samples are dropped and counted.
pub struct TraceBuffer {
    ring: parking_lot::Mutex<VecDeque<Sample>>,
    capacity: usize,
    written: [AtomicU64; SAMPLE_KIND_COUNT],
    dropped: AtomicU64,
}

impl std::fmt::Debug for TraceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            written: std::array::from_fn(|_| AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples currently buffered.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Total samples accepted through the given path.
    pub fn written(&self, kind: SampleKind) -> u64 {
        self.written[kind as usize].load(Ordering::Relaxed)
    }

    /// Total samples dropped because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Move every buffered sample into `out`, oldest first.
    pub fn drain_into(&self, out: &mut Vec<Sample>) -> usize {
        let mut ring = self.ring.lock();
        let n = ring.len();
        out.extend(ring.drain(..));
        n
    }

    #[inline]
    fn push(&self, core: u32, key: Option<u32>, kind: SampleKind, value: i64) {
        let sample = Sample {
            ts_ns: monotonic_ns(),
            core,
            key,
            kind,
            value,
        };

        {
            let mut ring = self.ring.lock();
            if ring.len() >= self.capacity {
                drop(ring);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            ring.push_back(sample);
        }

        self.written[kind as usize].fetch_add(1, Ordering::Relaxed);
    }
}

impl Marshal for TraceBuffer {
    fn emit_single(&self, core: u32, key: u32, value: i32) {
        self.push(core, Some(key), SampleKind::Single, i64::from(value));
    }

    fn emit_single64(&self, core: u32, key: u32, value: i64) {
        self.push(core, Some(key), SampleKind::Single64, value);
    }

    fn emit_idle(&self, core: u32, state: u32) {
        self.push(core, None, SampleKind::Idle, i64::from(state));
    }
}

/// Returns current monotonic clock value in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does not
    // require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}
