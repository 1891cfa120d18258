//! Periodic frequency resynchronisation.
//!
//! Frequency probes only fire on change, so a consumer that starts reading
//! mid-trace (or misses samples when the buffer is full) would otherwise hold
//! stale values indefinitely. Every period the task re-emits the frequency of
//! every present core.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::metric::Metric;
use super::probe::ProbeContext;
use super::PolicyGuard;

/// Default period between sweeps.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_millis(500);

/// Emit the current frequency of every present core.
///
/// Online cores with a policy report its current frequency; offline cores and
/// cores without a policy report zero. Returns the number of samples emitted,
/// which is zero while the CPU frequency metric is disabled.
pub fn sweep(ctx: &ProbeContext) -> usize {
    if !ctx.metrics().is_enabled(Metric::CpuFrequency) {
        return 0;
    }

    let topology = ctx.topology();
    let mut emitted = 0;

    for cpu in topology.present_cpus() {
        let pcpu = topology.to_physical(cpu);

        if topology.is_online(cpu) {
            match PolicyGuard::acquire(ctx.frequency(), cpu) {
                Some(policy) => {
                    ctx.emit_frequency(pcpu, Metric::CpuFrequency, policy.cur_khz());
                }
                None => ctx.emit_offline(pcpu),
            }
        } else {
            ctx.emit_offline(pcpu);
        }

        emitted += 1;
    }

    emitted
}

/// Handle to the running resync task.
///
/// Dropping the handle cancels the task without waiting for it.
pub struct ResyncTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ResyncTask {
    /// Spawn the task. The first sweep starts immediately; each following
    /// sweep starts `period` after the previous one finished.
    pub fn spawn(ctx: Arc<ProbeContext>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(ctx, period, cancel.clone()));

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancel the task and wait for any in-flight sweep to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "resync task ended abnormally");
            }
        }
    }
}

impl Drop for ResyncTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(ctx: Arc<ProbeContext>, period: Duration, cancel: CancellationToken) {
    loop {
        let tick_ctx = Arc::clone(&ctx);
        let started = Instant::now();

        match tokio::task::spawn_blocking(move || sweep(&tick_ctx)).await {
            Ok(samples) => {
                let elapsed = started.elapsed();
                ctx.stats()
                    .record_resync(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
                debug!(samples, elapsed_us = elapsed.as_micros() as u64, "resync sweep");
            }
            Err(e) => {
                warn!(error = %e, "resync sweep failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }

    debug!("resync task stopped");
}
