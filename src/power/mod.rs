//! Power event capture and frequency reconciliation.
//!
//! The host side (event delivery, core topology, frequency queries, the trace
//! buffer) is consumed through the traits in this module. Linux-backed
//! implementations live in [`crate::host`] and [`crate::sink`].

pub mod event;
pub mod idle;
pub mod lifecycle;
pub mod metric;
pub mod probe;
pub mod resync;
pub mod stats;

use std::sync::Arc;

use thiserror::Error;

use crate::sink::Marshal;

use self::event::{PowerEvent, ProbeKind};

pub use self::lifecycle::{HotplugHandle, LifecycleError, PowerTracer, TracerOptions, TracerState};
pub use self::metric::{KeyAllocator, Metric, Metrics, SequentialKeys};

/// Callback attached to a host probe.
pub type ProbeHandler = Arc<dyn Fn(&PowerEvent) + Send + Sync>;

/// Token returned by [`EventBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: ProbeKind,
    id: u64,
}

impl Subscription {
    pub fn new(kind: ProbeKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Errors returned when the host declines to attach a probe.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("probe {probe} is not available on this host")]
    Unavailable { probe: ProbeKind },

    #[error("enabling probe {probe}: {source}")]
    Io {
        probe: ProbeKind,
        #[source]
        source: std::io::Error,
    },

    #[error("probe {probe} rejected: {reason}")]
    Rejected { probe: ProbeKind, reason: String },
}

impl RegisterError {
    /// The probe that failed to register.
    pub fn probe(&self) -> ProbeKind {
        match self {
            Self::Unavailable { probe } | Self::Io { probe, .. } | Self::Rejected { probe, .. } => {
                *probe
            }
        }
    }
}

/// Host event broadcaster: attaches handlers to named power probes.
pub trait EventBroadcaster: Send + Sync {
    /// Attach `handler` to the probe `kind`.
    fn subscribe(
        &self,
        kind: ProbeKind,
        handler: ProbeHandler,
    ) -> Result<Subscription, RegisterError>;

    /// Detach a previously attached handler.
    ///
    /// Must not return while the handler is still executing; after return the
    /// handler is never invoked again.
    fn unsubscribe(&self, subscription: Subscription);
}

/// Core topology queries.
pub trait Topology: Send + Sync {
    /// Translate a logical core index to the physical index used for emission.
    fn to_physical(&self, cpu: u32) -> u32;

    /// Cores with a reserved number, online or not.
    fn present_cpus(&self) -> Vec<u32>;

    /// Whether `cpu` is currently online.
    fn is_online(&self, cpu: u32) -> bool;

    /// Upper bound on core indices (physical indices are `< cpu_count()`).
    fn cpu_count(&self) -> usize;
}

/// Frequency policy state captured by [`FrequencySource::acquire_policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySnapshot {
    /// Current frequency in kHz.
    pub cur_khz: u32,
}

/// Frequency query primitives.
pub trait FrequencySource: Send + Sync {
    /// Non-blocking frequency read in kHz. `None` when unknown.
    fn quick_get(&self, cpu: u32) -> Option<u32>;

    /// Take a reference on the core's frequency policy. May block.
    fn acquire_policy(&self, cpu: u32) -> Option<PolicySnapshot>;

    /// Drop the reference taken by `acquire_policy`.
    fn release_policy(&self, policy: PolicySnapshot);
}

/// Scoped policy reference, released on drop.
pub struct PolicyGuard<'a> {
    source: &'a dyn FrequencySource,
    policy: Option<PolicySnapshot>,
}

impl<'a> PolicyGuard<'a> {
    /// Acquire the policy for `cpu`, if the core has one.
    pub fn acquire(source: &'a dyn FrequencySource, cpu: u32) -> Option<Self> {
        let policy = source.acquire_policy(cpu)?;
        Some(Self {
            source,
            policy: Some(policy),
        })
    }

    /// Current frequency in kHz.
    pub fn cur_khz(&self) -> u32 {
        self.policy.map_or(0, |p| p.cur_khz)
    }
}

impl Drop for PolicyGuard<'_> {
    fn drop(&mut self) {
        if let Some(policy) = self.policy.take() {
            self.source.release_policy(policy);
        }
    }
}

/// The external collaborators a [`PowerTracer`] runs against.
#[derive(Clone)]
pub struct Host {
    pub broadcaster: Arc<dyn EventBroadcaster>,
    pub topology: Arc<dyn Topology>,
    pub frequency: Arc<dyn FrequencySource>,
    pub sink: Arc<dyn Marshal>,
}

/// Scale a kHz reading to the emitted frequency unit.
#[inline]
pub fn scale_frequency(khz: u32) -> i64 {
    i64::from(khz) * 1000
}
