use std::sync::Arc;

use crate::sink::{Marshal, SampleKind};

use super::event::PowerEvent;
use super::idle::{IdleStateCache, IdleUpdate};
use super::metric::{Metric, Metrics};
use super::stats::ProbeStats;
use super::{scale_frequency, FrequencySource, Host, ProbeHandler, Topology};

/// Whether the build target reports wait-for-interrupt idle transitions.
pub const fn platform_reports_idle() -> bool {
    cfg!(target_arch = "arm")
}

/// State shared by the probe handlers, the resync task and the hotplug
/// hooks.
///
/// Nothing on the event paths allocates or takes a lock.
pub struct ProbeContext {
    metrics: Metrics,
    idle: IdleStateCache,
    topology: Arc<dyn Topology>,
    frequency: Arc<dyn FrequencySource>,
    sink: Arc<dyn Marshal>,
    stats: Arc<ProbeStats>,
    report_idle: bool,
}

impl ProbeContext {
    pub fn new(host: &Host, metrics: Metrics, report_idle: bool) -> Self {
        Self {
            idle: IdleStateCache::new(host.topology.cpu_count()),
            metrics,
            topology: Arc::clone(&host.topology),
            frequency: Arc::clone(&host.frequency),
            sink: Arc::clone(&host.sink),
            stats: Arc::new(ProbeStats::new()),
            report_idle,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn idle_cache(&self) -> &IdleStateCache {
        &self.idle
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    pub fn frequency(&self) -> &dyn FrequencySource {
        self.frequency.as_ref()
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    pub fn shared_stats(&self) -> Arc<ProbeStats> {
        Arc::clone(&self.stats)
    }

    pub fn reports_idle(&self) -> bool {
        self.report_idle
    }

    /// Build the handler attached to a host probe.
    pub fn handler(ctx: &Arc<Self>) -> ProbeHandler {
        let ctx = Arc::clone(ctx);
        Arc::new(move |event: &PowerEvent| ctx.dispatch(event))
    }

    /// Route a host event to its probe.
    #[inline]
    pub fn dispatch(&self, event: &PowerEvent) {
        self.stats.record_event(event.kind());
        match *event {
            PowerEvent::CpuFrequency { frequency, cpu } => self.cpu_frequency(frequency, cpu),
            PowerEvent::GpuFrequency { frequency, cpu } => self.gpu_frequency(frequency, cpu),
            PowerEvent::CpuIdle { state, cpu } => self.cpu_idle(state, cpu),
        }
    }

    /// CPU frequency change on logical core `cpu`. `frequency` in kHz.
    #[inline]
    pub fn cpu_frequency(&self, frequency: u32, cpu: u32) {
        if !self.metrics.is_enabled(Metric::CpuFrequency) {
            return;
        }
        let pcpu = self.topology.to_physical(cpu);
        self.emit_frequency(pcpu, Metric::CpuFrequency, frequency);
    }

    /// GPU frequency change raised on logical core `cpu`.
    #[inline]
    pub fn gpu_frequency(&self, frequency: u32, cpu: u32) {
        if !self.metrics.is_enabled(Metric::GpuFrequency) {
            return;
        }
        let pcpu = self.topology.to_physical(cpu);
        self.emit_frequency(pcpu, Metric::GpuFrequency, frequency);
    }

    /// Idle state change on logical core `cpu`. Repeats of the cached state
    /// are dropped.
    #[inline]
    pub fn cpu_idle(&self, state: u32, cpu: u32) {
        let pcpu = self.topology.to_physical(cpu);
        match self.idle.record(pcpu, state) {
            IdleUpdate::Unchanged => self.stats.record_idle_duplicate(),
            IdleUpdate::OutOfRange => self.stats.record_idle_out_of_range(),
            IdleUpdate::Transition if self.report_idle => {
                self.sink.emit_idle(pcpu, state);
                self.stats.record_emit(SampleKind::Idle);
            }
            IdleUpdate::Transition => self.stats.record_idle_unreported(),
        }
    }

    /// Core came online: report its current frequency right away.
    pub fn online(&self, cpu: u32) {
        if !self.metrics.is_enabled(Metric::CpuFrequency) {
            return;
        }
        let pcpu = self.topology.to_physical(cpu);
        let khz = self.frequency.quick_get(cpu).unwrap_or(0);
        self.emit_frequency(pcpu, Metric::CpuFrequency, khz);
    }

    /// Core went offline: report a zero frequency.
    pub fn offline(&self, cpu: u32) {
        if !self.metrics.is_enabled(Metric::CpuFrequency) {
            return;
        }
        let pcpu = self.topology.to_physical(cpu);
        self.emit_offline(pcpu);
    }

    #[inline]
    pub(crate) fn emit_frequency(&self, pcpu: u32, metric: Metric, khz: u32) {
        self.sink
            .emit_single64(pcpu, self.metrics.key(metric), scale_frequency(khz));
        self.stats.record_emit(SampleKind::Single64);
    }

    #[inline]
    pub(crate) fn emit_offline(&self, pcpu: u32) {
        self.sink
            .emit_single(pcpu, self.metrics.key(Metric::CpuFrequency), 0);
        self.stats.record_emit(SampleKind::Single);
    }
}
