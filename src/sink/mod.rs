pub mod buffer;
pub mod writer;

use std::fmt;

use serde::Serialize;

/// Emission path a sample was written through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SampleKind {
    /// 32-bit value.
    Single = 0,
    /// 64-bit value.
    Single64 = 1,
    /// Idle transition; carries no key.
    Idle = 2,
}

/// Number of SampleKind variants, used for array sizing.
pub const SAMPLE_KIND_COUNT: usize = 3;

impl SampleKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Single64 => "single64",
            Self::Idle => "idle",
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Single, Self::Single64, Self::Idle]
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped record in the trace buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// CLOCK_MONOTONIC nanoseconds at emission.
    pub ts_ns: u64,
    pub core: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<u32>,
    pub kind: SampleKind,
    pub value: i64,
}

/// Trace buffer writer ("marshal") consumed by the power probes.
///
/// Calls never block and never fail from the caller's point of view; the
/// timestamp is taken by the implementation at emission time.
pub trait Marshal: Send + Sync {
    /// Emit a 32-bit `(core, key, value)` sample.
    fn emit_single(&self, core: u32, key: u32, value: i32);

    /// Emit a 64-bit `(core, key, value)` sample.
    fn emit_single64(&self, core: u32, key: u32, value: i64);

    /// Emit an idle transition for `core`.
    fn emit_idle(&self, core: u32, state: u32);
}
