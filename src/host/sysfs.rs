//! Core topology and cpufreq access through `/sys/devices/system/cpu`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{bail, Context, Result};

use crate::power::{FrequencySource, PolicySnapshot, Topology};

/// Default sysfs CPU directory.
pub const DEFAULT_SYSFS_CPU_PATH: &str = "/sys/devices/system/cpu";

/// Parse a kernel cpulist (`0-3,6,8-9`) into sorted core indices.
pub fn parse_cpu_list(text: &str) -> Option<Vec<u32>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let mut cpus = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let start = start.trim().parse::<u32>().ok()?;
            let end = end.trim().parse::<u32>().ok()?;
            if end < start {
                return None;
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(part.parse::<u32>().ok()?);
        }
    }

    if cpus.is_empty() {
        return None;
    }

    cpus.sort_unstable();
    cpus.dedup();
    Some(cpus)
}

fn read_cpu_list(path: &Path) -> Result<Vec<u32>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_cpu_list(&raw).with_context(|| format!("parsing cpulist {:?}", raw.trim()))
}

/// [`Topology`] read from sysfs.
///
/// The present and possible sets are read once at construction; online
/// state is read on every query.
#[derive(Debug)]
pub struct SysfsTopology {
    root: PathBuf,
    present: Vec<u32>,
    cpu_count: usize,
    physical_map: Vec<u32>,
}

impl SysfsTopology {
    /// Load the topology under `root`. `physical_map[logical]` overrides the
    /// identity translation when non-empty.
    pub fn load(root: impl Into<PathBuf>, physical_map: Vec<u32>) -> Result<Self> {
        let root = root.into();

        let present = read_cpu_list(&root.join("present"))?;
        let possible = read_cpu_list(&root.join("possible")).unwrap_or_else(|_| present.clone());

        let highest = possible
            .iter()
            .chain(present.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let cpu_count = highest as usize + 1;

        if !physical_map.is_empty() && physical_map.len() != cpu_count {
            bail!(
                "physical_map has {} entries but the host has {} cores",
                physical_map.len(),
                cpu_count
            );
        }

        Ok(Self {
            root,
            present,
            cpu_count,
            physical_map,
        })
    }

    fn cpu_dir(&self, cpu: u32) -> PathBuf {
        self.root.join(format!("cpu{cpu}"))
    }
}

impl Topology for SysfsTopology {
    fn to_physical(&self, cpu: u32) -> u32 {
        self.physical_map
            .get(cpu as usize)
            .copied()
            .unwrap_or(cpu)
    }

    fn present_cpus(&self) -> Vec<u32> {
        self.present.clone()
    }

    fn is_online(&self, cpu: u32) -> bool {
        let dir = self.cpu_dir(cpu);
        match std::fs::read_to_string(dir.join("online")) {
            Ok(raw) => raw.trim() == "1",
            // cpu0 commonly has no online file because it cannot be unplugged.
            Err(_) => dir.is_dir(),
        }
    }

    fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}

/// [`FrequencySource`] over `cpuN/cpufreq/scaling_cur_freq`.
#[derive(Debug)]
pub struct SysfsFrequency {
    root: PathBuf,
    held: AtomicI64,
}

impl SysfsFrequency {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            held: AtomicI64::new(0),
        }
    }

    /// Policies acquired and not yet released.
    pub fn held(&self) -> i64 {
        self.held.load(Ordering::Relaxed)
    }

    fn read_cur_khz(&self, cpu: u32) -> Option<u32> {
        let path = self
            .root
            .join(format!("cpu{cpu}"))
            .join("cpufreq/scaling_cur_freq");
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl FrequencySource for SysfsFrequency {
    fn quick_get(&self, cpu: u32) -> Option<u32> {
        self.read_cur_khz(cpu)
    }

    fn acquire_policy(&self, cpu: u32) -> Option<PolicySnapshot> {
        let cur_khz = self.read_cur_khz(cpu)?;
        self.held.fetch_add(1, Ordering::Relaxed);
        Some(PolicySnapshot { cur_khz })
    }

    fn release_policy(&self, _policy: PolicySnapshot) {
        self.held.fetch_sub(1, Ordering::Relaxed);
    }
}
