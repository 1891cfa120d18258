use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use super::event::ProbeKind;
use super::idle::IdleStateCache;
use super::metric::{KeyAllocator, Metric, Metrics};
use super::probe::{platform_reports_idle, ProbeContext};
use super::resync::{ResyncTask, DEFAULT_RESYNC_INTERVAL};
use super::stats::ProbeStats;
use super::{EventBroadcaster, FrequencySource, Host, ProbeHandler, RegisterError, Subscription, Topology};

/// Tunables fixed at [`PowerTracer::init`].
#[derive(Debug, Clone)]
pub struct TracerOptions {
    /// Period between resync sweeps.
    pub resync_interval: Duration,
    /// Emit idle transitions. When false the idle cache is still maintained.
    pub report_idle: bool,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            report_idle: platform_reports_idle(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    Stopped,
    Starting,
    Running,
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("power tracer is already running")]
    AlreadyRunning,

    #[error("power tracer is not running")]
    NotRunning,

    #[error("power tracer must be started inside a tokio runtime")]
    NoRuntime,

    #[error("registering power probes: {0}")]
    Register(#[from] RegisterError),
}

/// Subscriptions acquired during start.
///
/// Dropping the set unsubscribes everything in reverse order;
/// [`ProbeSet::commit`] hands the subscriptions over instead.
struct ProbeSet<'a> {
    broadcaster: &'a dyn EventBroadcaster,
    acquired: Vec<Subscription>,
}

impl<'a> ProbeSet<'a> {
    fn new(broadcaster: &'a dyn EventBroadcaster) -> Self {
        Self {
            broadcaster,
            acquired: Vec::with_capacity(ProbeKind::all().len()),
        }
    }

    fn subscribe(&mut self, kind: ProbeKind, handler: ProbeHandler) -> Result<(), RegisterError> {
        let subscription = self.broadcaster.subscribe(kind, handler)?;
        self.acquired.push(subscription);
        Ok(())
    }

    fn commit(mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.acquired)
    }
}

impl Drop for ProbeSet<'_> {
    fn drop(&mut self) {
        for subscription in self.acquired.drain(..).rev() {
            self.broadcaster.unsubscribe(subscription);
        }
    }
}

/// Cloneable access to the hotplug hooks of a [`PowerTracer`].
#[derive(Clone)]
pub struct HotplugHandle {
    ctx: Arc<ProbeContext>,
}

impl HotplugHandle {
    /// Logical core `cpu` came online.
    pub fn online(&self, cpu: u32) {
        self.ctx.online(cpu);
    }

    /// Logical core `cpu` went offline.
    pub fn offline(&self, cpu: u32) {
        self.ctx.offline(cpu);
    }
}

/// Owns the power probes and the resync task.
///
/// Dropping a running tracer unregisters its probes in reverse order and
/// cancels the resync task. Unlike [`PowerTracer::stop`] it does not wait for
/// an in-flight sweep.
pub struct PowerTracer {
    broadcaster: Arc<dyn EventBroadcaster>,
    ctx: Arc<ProbeContext>,
    resync_interval: Duration,
    state: TracerState,
    subscriptions: Vec<Subscription>,
    resync: Option<ResyncTask>,
}

impl PowerTracer {
    /// Allocate metric keys (CPU frequency first, then GPU frequency), with
    /// every metric disabled, and size the idle cache from the topology.
    pub fn init(host: Host, keys: &dyn KeyAllocator, options: TracerOptions) -> Self {
        let metrics = Metrics::new(keys);
        let ctx = Arc::new(ProbeContext::new(&host, metrics, options.report_idle));

        info!(
            cpu_key = ctx.metrics().key(Metric::CpuFrequency),
            gpu_key = ctx.metrics().key(Metric::GpuFrequency),
            cores = ctx.idle_cache().len(),
            report_idle = options.report_idle,
            "power tracer initialised"
        );

        Self {
            broadcaster: host.broadcaster,
            ctx,
            resync_interval: options.resync_interval,
            state: TracerState::Stopped,
            subscriptions: Vec::new(),
            resync: None,
        }
    }

    pub fn state(&self) -> TracerState {
        self.state
    }

    pub fn metrics(&self) -> &Metrics {
        self.ctx.metrics()
    }

    pub fn idle_cache(&self) -> &IdleStateCache {
        self.ctx.idle_cache()
    }

    pub fn stats(&self) -> Arc<ProbeStats> {
        self.ctx.shared_stats()
    }

    pub fn hotplug(&self) -> HotplugHandle {
        HotplugHandle {
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Whether any online core reports a non-zero frequency. Without one the
    /// CPU frequency metric carries no information.
    pub fn cpu_frequency_available(&self) -> bool {
        cpu_frequency_available(self.ctx.topology(), self.ctx.frequency())
    }

    /// Register the probes and arm the resync task.
    ///
    /// Probes are registered CPU frequency (if enabled), GPU frequency (if
    /// enabled), then CPU idle. If any registration fails the ones already
    /// made are undone in reverse order and the tracer stays stopped.
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        if self.state != TracerState::Stopped {
            return Err(LifecycleError::AlreadyRunning);
        }
        tokio::runtime::Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;

        self.state = TracerState::Starting;

        let subscriptions = match self.register_probes() {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                self.state = TracerState::Stopped;
                error!(probe = %e.probe(), error = %e, "power probe registration failed");
                return Err(e.into());
            }
        };

        self.ctx.idle_cache().reset(&self.ctx.topology().present_cpus());

        self.resync = Some(ResyncTask::spawn(
            Arc::clone(&self.ctx),
            self.resync_interval,
        ));

        info!(
            probes = subscriptions.len(),
            cpu_freq = self.metrics().is_enabled(Metric::CpuFrequency),
            gpu_freq = self.metrics().is_enabled(Metric::GpuFrequency),
            resync_interval = ?self.resync_interval,
            "power tracer started"
        );

        self.subscriptions = subscriptions;
        self.state = TracerState::Running;

        Ok(())
    }

    fn register_probes(&self) -> Result<Vec<Subscription>, RegisterError> {
        let mut set = ProbeSet::new(self.broadcaster.as_ref());
        let metrics = self.ctx.metrics();

        if metrics.is_enabled(Metric::CpuFrequency) {
            set.subscribe(ProbeKind::CpuFrequency, ProbeContext::handler(&self.ctx))?;
        }
        if metrics.is_enabled(Metric::GpuFrequency) {
            set.subscribe(ProbeKind::GpuFrequency, ProbeContext::handler(&self.ctx))?;
        }
        set.subscribe(ProbeKind::CpuIdle, ProbeContext::handler(&self.ctx))?;

        Ok(set.commit())
    }

    /// Unregister the probes, stop the resync task and disable every metric.
    ///
    /// On return no handler or sweep is running.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        if self.state != TracerState::Running {
            return Err(LifecycleError::NotRunning);
        }

        for subscription in self.subscriptions.drain(..).rev() {
            self.broadcaster.unsubscribe(subscription);
        }

        match self.resync.take() {
            Some(task) => task.stop().await,
            None => warn!("power tracer running without a resync task"),
        }

        self.ctx.metrics().clear_enabled();
        self.state = TracerState::Stopped;

        info!("power tracer stopped");

        Ok(())
    }

    /// Logical core `cpu` came online.
    pub fn online(&self, cpu: u32) {
        self.ctx.online(cpu);
    }

    /// Logical core `cpu` went offline.
    pub fn offline(&self, cpu: u32) {
        self.ctx.offline(cpu);
    }
}

impl Drop for PowerTracer {
    fn drop(&mut self) {
        if self.state != TracerState::Running {
            return;
        }

        for subscription in self.subscriptions.drain(..).rev() {
            self.broadcaster.unsubscribe(subscription);
        }
        drop(self.resync.take());

        warn!("power tracer dropped while running");
    }
}

fn cpu_frequency_available(topology: &dyn Topology, frequency: &dyn FrequencySource) -> bool {
    topology
        .present_cpus()
        .into_iter()
        .filter(|&cpu| topology.is_online(cpu))
        .any(|cpu| frequency.quick_get(cpu).is_some_and(|khz| khz > 0))
}
