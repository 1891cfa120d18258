pub mod hotplug;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::host::sysfs::{SysfsFrequency, SysfsTopology};
use crate::host::tracefs::{self, TraceCounters, TracefsBroadcaster};
use crate::power::stats::ProbeStats;
use crate::power::{Host, Metric, PowerTracer, SequentialKeys, Topology, TracerOptions};
use crate::sink::buffer::TraceBuffer;
use crate::sink::writer::{self, Output, SampleWriter};

use self::hotplug::HotplugMonitor;

/// Interval of the periodic stats log line.
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Agent orchestrates all components: host backends, power tracer, trace
/// buffer writer and background monitors.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    buffer: Arc<TraceBuffer>,
    tracer: Option<PowerTracer>,
    reader: Option<JoinHandle<Result<()>>>,
    writer: Option<SampleWriter<Output>>,
    monitors: Vec<JoinHandle<()>>,
    /// Stops the reader and monitors.
    cancel: CancellationToken,
    /// Stops the writer, which drains the buffer one last time.
    writer_cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics and the trace buffer.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let buffer = Arc::new(TraceBuffer::new(cfg.output.buffer_capacity));

        Ok(Self {
            cfg,
            health,
            buffer,
            tracer: None,
            reader: None,
            writer: None,
            monitors: Vec::new(),
            cancel: CancellationToken::new(),
            writer_cancel: CancellationToken::new(),
        })
    }

    /// The trace buffer samples are emitted into.
    pub fn buffer(&self) -> Arc<TraceBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn tracer(&self) -> Option<&PowerTracer> {
        self.tracer.as_ref()
    }

    /// Start all components and begin tracing.
    pub async fn start(&mut self) -> Result<()> {
        let started = Instant::now();

        // 0. Health metrics server first so probes respond during startup.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Host backends.
        let phase = Instant::now();
        let topology: Arc<dyn Topology> = Arc::new(
            SysfsTopology::load(
                &self.cfg.sysfs_cpu_path,
                self.cfg.topology.physical_map.clone(),
            )
            .context("loading cpu topology")?,
        );
        let frequency = Arc::new(SysfsFrequency::new(&self.cfg.sysfs_cpu_path));

        let root = tracefs::resolve_root(&self.cfg.tracefs_path).context("locating tracefs")?;
        let broadcaster = Arc::new(TracefsBroadcaster::new(root));

        info!(
            tracefs = %broadcaster.root().display(),
            cores = topology.cpu_count(),
            present = topology.present_cpus().len(),
            "host backends ready"
        );
        self.record_phase("host", phase);

        // 2. Sample writer.
        let out = writer::open_output(&self.cfg.output.path)
            .await
            .context("opening sample output")?;
        self.writer = Some(SampleWriter::spawn(
            Arc::clone(&self.buffer),
            out,
            self.cfg.output.flush_interval,
            self.writer_cancel.clone(),
        ));

        // 3. Power tracer.
        let phase = Instant::now();
        let host = Host {
            broadcaster: broadcaster.clone(),
            topology: Arc::clone(&topology),
            frequency,
            sink: self.buffer.clone(),
        };
        let keys = SequentialKeys::new(self.cfg.first_key);
        let mut tracer = PowerTracer::init(
            host,
            &keys,
            TracerOptions {
                resync_interval: self.cfg.resync_interval,
                report_idle: self.cfg.report_idle(),
            },
        );

        self.apply_metric_flags(&tracer);

        tracer.start().context("starting power tracer")?;
        self.health.tracer_running.set(1.0);
        self.record_phase("tracer", phase);

        // 4. Trace pipe reader. Events enabled above are buffered by the
        // kernel until read.
        self.reader = Some(broadcaster.spawn_reader(self.cancel.clone()));

        // 5. Background monitors.
        let monitor = HotplugMonitor::new(Arc::clone(&topology), tracer.hotplug());
        self.health.cores_online.set(monitor.online_count() as f64);
        self.monitors.push(self.spawn_hotplug_monitor(monitor));
        self.monitors
            .push(self.spawn_stats_reporter(tracer.stats(), broadcaster.counters()));

        self.tracer = Some(tracer);

        self.health
            .agent_start_duration
            .with_label_values(&["total"])
            .set(started.elapsed().as_secs_f64());
        info!(elapsed = ?started.elapsed(), "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop the tracer first so no sample is emitted after the final drain.
        if let Some(tracer) = &mut self.tracer {
            if let Err(e) = tracer.stop().await {
                error!(error = %e, "error stopping power tracer");
            }
        }
        self.health.tracer_running.set(0.0);

        // Signal reader and monitors to stop.
        self.cancel.cancel();

        if let Some(reader) = self.reader.take() {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "trace pipe reader failed"),
                Err(e) => warn!(error = %e, "trace pipe reader panicked"),
            }
        }

        for monitor in self.monitors.drain(..) {
            if let Err(e) = monitor.await {
                warn!(error = %e, "monitor task panicked");
            }
        }

        // Final drain of the trace buffer.
        self.writer_cancel.cancel();
        if let Some(writer) = self.writer.take() {
            let (_, written) = writer.wait().await.context("stopping sample writer")?;
            info!(
                written,
                dropped = self.buffer.dropped(),
                "sample writer stopped"
            );
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Enable metrics from config. The CPU frequency metric stays disabled
    /// when no core reports a frequency.
    fn apply_metric_flags(&self, tracer: &PowerTracer) {
        for metric in Metric::all() {
            let mut enabled = self.cfg.metric_enabled(*metric);

            if enabled && *metric == Metric::CpuFrequency && !tracer.cpu_frequency_available() {
                warn!(metric = %metric, "no core reports a frequency, metric unavailable");
                enabled = false;
            }

            tracer.metrics().set_enabled(*metric, enabled);
            info!(
                metric = %metric,
                key = tracer.metrics().key(*metric),
                enabled,
                "power metric configured"
            );
        }
    }

    fn record_phase(&self, phase: &str, started: Instant) {
        self.health
            .agent_start_duration
            .with_label_values(&[phase])
            .set(started.elapsed().as_secs_f64());
    }

    /// Spawn background hotplug monitor.
    fn spawn_hotplug_monitor(&self, mut monitor: HotplugMonitor) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let poll_interval = self.cfg.hotplug_poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if monitor.poll() > 0 {
                            health.cores_online.set(monitor.online_count() as f64);
                        }
                    }
                }
            }
        })
    }

    /// Spawn background stats reporter.
    fn spawn_stats_reporter(
        &self,
        probe_stats: Arc<ProbeStats>,
        trace_counters: Arc<TraceCounters>,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let buffer = Arc::clone(&self.buffer);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_dropped = 0u64;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let probes = probe_stats.snapshot();
                        let trace = trace_counters.snapshot();
                        health.record_probe_stats(&probes);
                        health.record_trace_counters(&trace);

                        let dropped = buffer.dropped();
                        let dropped_delta = dropped.saturating_sub(last_dropped);
                        last_dropped = dropped;
                        health.samples_dropped.inc_by(dropped_delta as f64);

                        if probes.is_empty() && trace.lines == 0 {
                            continue;
                        }

                        let events: u64 = probes.events.iter().map(|(_, n)| n).sum();
                        let emitted: u64 = probes.emitted.iter().map(|(_, n)| n).sum();
                        info!(
                            events,
                            emitted,
                            idle_duplicates = probes.idle_duplicates,
                            resync_ticks = probes.resync_ticks,
                            dropped = dropped_delta,
                            lost = trace.lost_events,
                            "power stats (60s)",
                        );

                        for (probe, count) in &probes.events {
                            debug!(probe = %probe, count, "  by probe (60s)");
                        }
                    }
                }
            }
        })
    }
}
