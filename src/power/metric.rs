use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Operator-visible power metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Metric {
    CpuFrequency = 0,
    GpuFrequency = 1,
}

/// Number of Metric variants, used for array sizing.
pub const METRIC_COUNT: usize = 2;

impl Metric {
    /// Returns the counter name exposed to the operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CpuFrequency => "Linux_power_cpu_freq",
            Self::GpuFrequency => "Linux_power_gpu_freq",
        }
    }

    /// Convert from the counter name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Linux_power_cpu_freq" => Some(Self::CpuFrequency),
            "Linux_power_gpu_freq" => Some(Self::GpuFrequency),
            _ => None,
        }
    }

    /// Return all metrics in key allocation order.
    pub fn all() -> &'static [Self] {
        &[Self::CpuFrequency, Self::GpuFrequency]
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of opaque reporting keys.
pub trait KeyAllocator {
    /// Return a key not handed out before in this process.
    fn allocate_key(&self) -> u32;
}

/// Hands out consecutive keys starting at a base value.
#[derive(Debug)]
pub struct SequentialKeys {
    next: AtomicU32,
}

impl SequentialKeys {
    pub fn new(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }
}

impl Default for SequentialKeys {
    fn default() -> Self {
        Self::new(1)
    }
}

impl KeyAllocator for SequentialKeys {
    fn allocate_key(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct MetricSlot {
    enabled: AtomicBool,
    key: u32,
}

/// Enable flags and keys for every [`Metric`].
///
/// Keys are fixed at construction. Flags are written by the configuration
/// side and only read by probes and the resync task.
#[derive(Debug)]
pub struct Metrics {
    slots: [MetricSlot; METRIC_COUNT],
}

impl Metrics {
    /// Allocate one key per metric, in [`Metric::all`] order, with every
    /// metric disabled.
    pub fn new(keys: &dyn KeyAllocator) -> Self {
        Self {
            slots: std::array::from_fn(|_| MetricSlot {
                enabled: AtomicBool::new(false),
                key: keys.allocate_key(),
            }),
        }
    }

    fn slot(&self, metric: Metric) -> &MetricSlot {
        &self.slots[metric as usize]
    }

    /// The opaque key tagging samples of `metric`.
    #[inline]
    pub fn key(&self, metric: Metric) -> u32 {
        self.slot(metric).key
    }

    #[inline]
    pub fn is_enabled(&self, metric: Metric) -> bool {
        self.slot(metric).enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, metric: Metric, enabled: bool) {
        self.slot(metric).enabled.store(enabled, Ordering::Relaxed);
    }

    /// Disable every metric.
    pub fn clear_enabled(&self) {
        for slot in &self.slots {
            slot.enabled.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        for metric in Metric::all() {
            assert_eq!(Metric::from_name(metric.as_str()), Some(*metric));
        }
        assert_eq!(Metric::from_name("Linux_power_cpu_idle"), None);
    }

    #[test]
    fn test_sequential_keys_are_unique() {
        let keys = SequentialKeys::new(40);
        assert_eq!(keys.allocate_key(), 40);
        assert_eq!(keys.allocate_key(), 41);
        assert_eq!(keys.allocate_key(), 42);
    }

    #[test]
    fn test_metrics_keys_allocated_in_order() {
        let keys = SequentialKeys::new(7);
        let metrics = Metrics::new(&keys);

        assert_eq!(metrics.key(Metric::CpuFrequency), 7);
        assert_eq!(metrics.key(Metric::GpuFrequency), 8);
        assert_eq!(keys.allocate_key(), 9);
    }

    #[test]
    fn test_metrics_start_disabled() {
        let metrics = Metrics::new(&SequentialKeys::default());
        for metric in Metric::all() {
            assert!(!metrics.is_enabled(*metric));
        }
    }

    #[test]
    fn test_clear_enabled_keeps_keys() {
        let metrics = Metrics::new(&SequentialKeys::default());
        metrics.set_enabled(Metric::CpuFrequency, true);
        metrics.set_enabled(Metric::GpuFrequency, true);
        let cpu_key = metrics.key(Metric::CpuFrequency);

        metrics.clear_enabled();

        assert!(!metrics.is_enabled(Metric::CpuFrequency));
        assert!(!metrics.is_enabled(Metric::GpuFrequency));
        assert_eq!(metrics.key(Metric::CpuFrequency), cpu_key);
    }
}
