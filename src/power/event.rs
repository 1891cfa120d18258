use std::fmt;

/// Idle state reported by `cpu_idle` when a core leaves idle (`PWR_EVENT_EXIT`).
pub const IDLE_EXIT: u32 = u32::MAX;

/// ProbeKind identifies one of the host power tracepoints.
/// Names match the tracepoints under `events/power/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProbeKind {
    CpuFrequency = 0,
    GpuFrequency = 1,
    CpuIdle = 2,
}

/// Number of ProbeKind variants, used for array sizing.
pub const PROBE_KIND_COUNT: usize = 3;

impl ProbeKind {
    /// Returns the tracepoint name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CpuFrequency => "cpu_frequency",
            Self::GpuFrequency => "gpu_frequency",
            Self::CpuIdle => "cpu_idle",
        }
    }

    /// Convert from the tracepoint name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cpu_frequency" => Some(Self::CpuFrequency),
            "gpu_frequency" => Some(Self::GpuFrequency),
            "cpu_idle" => Some(Self::CpuIdle),
            _ => None,
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::CpuFrequency),
            1 => Some(Self::GpuFrequency),
            2 => Some(Self::CpuIdle),
            _ => None,
        }
    }

    /// Return all probe kinds in registration order.
    pub fn all() -> &'static [Self] {
        &[Self::CpuFrequency, Self::GpuFrequency, Self::CpuIdle]
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A power event as delivered by the host broadcaster.
///
/// `cpu` fields carry a logical core index. For CPU events it names the core
/// the event is about, which is not necessarily the core that raised it. The
/// GPU event has no core of its own and carries the core that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// `frequency` in kHz.
    CpuFrequency { frequency: u32, cpu: u32 },
    /// `frequency` in kHz.
    GpuFrequency { frequency: u32, cpu: u32 },
    CpuIdle { state: u32, cpu: u32 },
}

impl PowerEvent {
    /// The probe this event is delivered to.
    pub const fn kind(&self) -> ProbeKind {
        match self {
            Self::CpuFrequency { .. } => ProbeKind::CpuFrequency,
            Self::GpuFrequency { .. } => ProbeKind::GpuFrequency,
            Self::CpuIdle { .. } => ProbeKind::CpuIdle,
        }
    }
}
