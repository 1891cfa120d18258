//! Linux implementations of the host traits consumed by [`crate::power`].
//!
//! - [`tracefs`]: event delivery from the `power` trace events.
//! - [`sysfs`]: core topology and cpufreq readings.
//! - [`parse`]: `trace_pipe` line decoding.

pub mod parse;
pub mod sysfs;
pub mod tracefs;
