use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::host::sysfs::DEFAULT_SYSFS_CPU_PATH;
use crate::power::probe::platform_reports_idle;
use crate::power::Metric;

/// Top-level configuration for the powertrace agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// tracefs mount point. Empty means auto-detect.
    #[serde(default)]
    pub tracefs_path: String,

    /// sysfs CPU directory. Default: "/sys/devices/system/cpu".
    #[serde(default = "default_sysfs_cpu_path")]
    pub sysfs_cpu_path: String,

    /// Metric enable flags keyed by counter name.
    #[serde(default = "default_metrics")]
    pub metrics: HashMap<String, bool>,

    /// Idle transition reporting.
    #[serde(default)]
    pub idle: IdleConfig,

    /// Period of the frequency resync sweep. Default: 500ms.
    #[serde(default = "default_resync_interval", with = "humantime_serde")]
    pub resync_interval: Duration,

    /// How often core online state is polled. Default: 1s.
    #[serde(default = "default_hotplug_poll_interval", with = "humantime_serde")]
    pub hotplug_poll_interval: Duration,

    /// First metric key handed out. Default: 1.
    #[serde(default = "default_first_key")]
    pub first_key: u32,

    /// Core topology overrides.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Sample output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Idle transition reporting.
#[derive(Debug, Default, Deserialize)]
pub struct IdleConfig {
    /// Emit idle transitions. Unset uses the platform default.
    #[serde(default)]
    pub report_transitions: Option<bool>,
}

/// Core topology overrides.
#[derive(Debug, Default, Deserialize)]
pub struct TopologyConfig {
    /// `physical_map[logical]` is the physical index of that core. Empty
    /// means identity.
    #[serde(default)]
    pub physical_map: Vec<u32>,
}

/// Sample output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// "-" for stdout, otherwise an NDJSON file path. Default: "-".
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Trace buffer capacity in samples. Default: 65536.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// How often the buffer is drained to the output. Default: 100ms.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sysfs_cpu_path() -> String {
    DEFAULT_SYSFS_CPU_PATH.to_string()
}

fn default_metrics() -> HashMap<String, bool> {
    HashMap::from([
        (Metric::CpuFrequency.as_str().to_string(), true),
        (Metric::GpuFrequency.as_str().to_string(), false),
    ])
}

fn default_resync_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_hotplug_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_first_key() -> u32 {
    1
}

fn default_output_path() -> String {
    "-".to_string()
}

fn default_buffer_capacity() -> usize {
    65_536
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tracefs_path: String::new(),
            sysfs_cpu_path: default_sysfs_cpu_path(),
            metrics: default_metrics(),
            idle: IdleConfig::default(),
            resync_interval: default_resync_interval(),
            hotplug_poll_interval: default_hotplug_poll_interval(),
            first_key: default_first_key(),
            topology: TopologyConfig::default(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            buffer_capacity: default_buffer_capacity(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration, returning an error for invalid values.
    pub fn validate(&self) -> Result<()> {
        for name in self.metrics.keys() {
            if Metric::from_name(name).is_none() {
                bail!("unknown metric: {name}");
            }
        }

        if self.resync_interval.is_zero() {
            bail!("resync_interval must be positive");
        }

        if self.hotplug_poll_interval.is_zero() {
            bail!("hotplug_poll_interval must be positive");
        }

        if self.first_key == 0 {
            bail!("first_key must be positive");
        }

        if self.output.buffer_capacity == 0 {
            bail!("output.buffer_capacity must be positive");
        }

        if self.output.flush_interval.is_zero() {
            bail!("output.flush_interval must be positive");
        }

        if self.output.path.is_empty() {
            bail!("output.path is required");
        }

        let map = &self.topology.physical_map;
        if !map.is_empty() {
            let mut seen = vec![false; map.len()];
            for &pcpu in map {
                match seen.get_mut(pcpu as usize) {
                    Some(slot) if !*slot => *slot = true,
                    _ => bail!("topology.physical_map must be a permutation of 0..{}", map.len()),
                }
            }
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }

    /// Whether `metric` should be enabled. Metrics missing from the map are
    /// disabled.
    pub fn metric_enabled(&self, metric: Metric) -> bool {
        self.metrics.get(metric.as_str()).copied().unwrap_or(false)
    }

    /// Resolved idle reporting setting.
    pub fn report_idle(&self) -> bool {
        self.idle
            .report_transitions
            .unwrap_or_else(platform_reports_idle)
    }
}
