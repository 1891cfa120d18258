//! Event broadcaster backed by the kernel tracefs `power` event group.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parse::{parse_line, ParseError};
use crate::power::event::{PowerEvent, ProbeKind, PROBE_KIND_COUNT};
use crate::power::{EventBroadcaster, ProbeHandler, RegisterError, Subscription};

/// Mount points probed when no tracefs path is configured.
const DEFAULT_TRACEFS_ROOTS: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Locate the tracefs mount. An empty `configured` path means auto-detect.
pub fn resolve_root(configured: &str) -> Result<PathBuf> {
    if !configured.is_empty() {
        let root = PathBuf::from(configured);
        if !root.join("trace_pipe").exists() {
            bail!("{} does not look like a tracefs mount", root.display());
        }
        return Ok(root);
    }

    for candidate in DEFAULT_TRACEFS_ROOTS {
        let root = Path::new(candidate);
        if root.join("trace_pipe").exists() {
            return Ok(root.to_path_buf());
        }
    }

    bail!("tracefs not found (tried {})", DEFAULT_TRACEFS_ROOTS.join(", "))
}

/// Reader-side counters, drained by the agent's stats reporter.
#[derive(Debug, Default)]
pub struct TraceCounters {
    lines: AtomicU64,
    parse_errors: AtomicU64,
    lost_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceCountersSnapshot {
    pub lines: u64,
    pub parse_errors: u64,
    pub lost_events: u64,
}

impl TraceCounters {
    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> TraceCountersSnapshot {
        TraceCountersSnapshot {
            lines: self.lines.swap(0, Ordering::Relaxed),
            parse_errors: self.parse_errors.swap(0, Ordering::Relaxed),
            lost_events: self.lost_events.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct HandlerTable {
    slots: [Vec<(u64, ProbeHandler)>; PROBE_KIND_COUNT],
}

/// Dispatches parsed `trace_pipe` lines to subscribed handlers.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HandlerTable>>,
    counters: Arc<TraceCounters>,
}

impl Dispatcher {
    /// Parse `line` and deliver the event to every handler of its probe.
    pub fn dispatch_line(&self, line: &str) {
        self.counters.lines.fetch_add(1, Ordering::Relaxed);

        match parse_line(line) {
            Ok(Some(event)) => self.dispatch(&event),
            Ok(None) => {}
            Err(ParseError::LostEvents { cpu, count }) => {
                self.counters.lost_events.fetch_add(count, Ordering::Relaxed);
                warn!(cpu, count, "trace buffer overrun");
            }
            Err(e) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "trace line parse error");
            }
        }
    }

    /// Deliver `event` to its handlers. The read lock is held for the whole
    /// delivery so unsubscribe waits for it.
    pub fn dispatch(&self, event: &PowerEvent) {
        let table = self.handlers.read();
        for (_, handler) in &table.slots[event.kind() as usize] {
            handler(event);
        }
    }
}

/// [`EventBroadcaster`] over `<tracefs>/events/power/*`.
///
/// Subscribing to a probe enables its trace event; removing the last
/// handler disables it again. Events are read from `trace_pipe` by the task
/// started with [`TracefsBroadcaster::spawn_reader`].
pub struct TracefsBroadcaster {
    root: PathBuf,
    dispatcher: Dispatcher,
    next_id: AtomicU64,
}

impl TracefsBroadcaster {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dispatcher: Dispatcher {
                handlers: Arc::new(RwLock::new(HandlerTable::default())),
                counters: Arc::new(TraceCounters::default()),
            },
            next_id: AtomicU64::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn counters(&self) -> Arc<TraceCounters> {
        Arc::clone(&self.dispatcher.counters)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    fn enable_path(&self, kind: ProbeKind) -> PathBuf {
        self.root
            .join("events/power")
            .join(kind.as_str())
            .join("enable")
    }

    fn set_enabled(&self, kind: ProbeKind, enabled: bool) -> io::Result<()> {
        let path = self.enable_path(kind);
        // The enable file always exists for a known event; a missing one
        // means the kernel lacks the tracepoint.
        if !path.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, path.display().to_string()));
        }
        std::fs::write(&path, if enabled { "1" } else { "0" })
    }

    /// Spawn the `trace_pipe` reader. It stops when `cancel` fires.
    pub fn spawn_reader(&self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        let path = self.root.join("trace_pipe");
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move { read_loop(path, dispatcher, cancel).await })
    }
}

impl EventBroadcaster for TracefsBroadcaster {
    fn subscribe(
        &self,
        kind: ProbeKind,
        handler: ProbeHandler,
    ) -> Result<Subscription, RegisterError> {
        let mut table = self.dispatcher.handlers.write();
        let slot = &mut table.slots[kind as usize];

        if slot.is_empty() {
            self.set_enabled(kind, true).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => RegisterError::Unavailable { probe: kind },
                _ => RegisterError::Io {
                    probe: kind,
                    source: e,
                },
            })?;
            debug!(probe = %kind, "enabled trace event");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slot.push((id, handler));

        Ok(Subscription::new(kind, id))
    }

    fn unsubscribe(&self, subscription: Subscription) {
        let kind = subscription.kind();
        let mut table = self.dispatcher.handlers.write();
        let slot = &mut table.slots[kind as usize];

        let before = slot.len();
        slot.retain(|(id, _)| *id != subscription.id());
        if slot.len() == before {
            warn!(probe = %kind, id = subscription.id(), "unsubscribe of unknown subscription");
            return;
        }

        if slot.is_empty() {
            if let Err(e) = self.set_enabled(kind, false) {
                warn!(probe = %kind, error = %e, "failed to disable trace event");
            } else {
                debug!(probe = %kind, "disabled trace event");
            }
        }
    }
}

async fn read_loop(path: PathBuf, dispatcher: Dispatcher, cancel: CancellationToken) -> Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    info!(path = %path.display(), "trace pipe reader started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                match line.with_context(|| format!("reading {}", path.display()))? {
                    Some(line) => dispatcher.dispatch_line(&line),
                    None => {
                        warn!("trace pipe closed");
                        break;
                    }
                }
            }
        }
    }

    info!("trace pipe reader stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn tracefs_with(events: &[ProbeKind]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("trace_pipe"), "").expect("trace_pipe");
        for kind in events {
            let event_dir = dir.path().join("events/power").join(kind.as_str());
            std::fs::create_dir_all(&event_dir).expect("event dir");
            std::fs::write(event_dir.join("enable"), "0").expect("enable file");
        }
        dir
    }

    fn enable_state(root: &Path, kind: ProbeKind) -> String {
        std::fs::read_to_string(root.join("events/power").join(kind.as_str()).join("enable"))
            .expect("read enable")
    }

    fn counting_handler() -> (ProbeHandler, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let handler: ProbeHandler = Arc::new(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        (handler, count)
    }

    #[test]
    fn test_subscribe_enables_and_last_unsubscribe_disables() {
        let dir = tracefs_with(&[ProbeKind::CpuIdle]);
        let broadcaster = TracefsBroadcaster::new(dir.path());

        let (h1, _) = counting_handler();
        let (h2, _) = counting_handler();
        let s1 = broadcaster.subscribe(ProbeKind::CpuIdle, h1).expect("subscribe");
        assert_eq!(enable_state(dir.path(), ProbeKind::CpuIdle), "1");

        let s2 = broadcaster.subscribe(ProbeKind::CpuIdle, h2).expect("subscribe");
        assert_ne!(s1.id(), s2.id());

        broadcaster.unsubscribe(s1);
        assert_eq!(enable_state(dir.path(), ProbeKind::CpuIdle), "1");

        broadcaster.unsubscribe(s2);
        assert_eq!(enable_state(dir.path(), ProbeKind::CpuIdle), "0");
    }

    #[test]
    fn test_missing_event_is_unavailable() {
        let dir = tracefs_with(&[ProbeKind::CpuIdle]);
        let broadcaster = TracefsBroadcaster::new(dir.path());
        let (handler, _) = counting_handler();

        let err = broadcaster
            .subscribe(ProbeKind::GpuFrequency, handler)
            .expect_err("gpu_frequency missing");
        assert!(matches!(
            err,
            RegisterError::Unavailable {
                probe: ProbeKind::GpuFrequency
            }
        ));
    }

    #[test]
    fn test_dispatch_routes_by_probe() {
        let dir = tracefs_with(&[ProbeKind::CpuIdle, ProbeKind::CpuFrequency]);
        let broadcaster = TracefsBroadcaster::new(dir.path());
        let (idle, idle_count) = counting_handler();
        let (freq, freq_count) = counting_handler();

        let idle_sub = broadcaster.subscribe(ProbeKind::CpuIdle, idle).expect("idle");
        broadcaster
            .subscribe(ProbeKind::CpuFrequency, freq)
            .expect("freq");

        let dispatcher = broadcaster.dispatcher();
        dispatcher.dispatch_line("<idle>-0 [001] d..2. 1.0: cpu_idle: state=1 cpu_id=1");
        dispatcher.dispatch_line("<idle>-0 [001] d..2. 1.1: cpu_idle: state=4294967295 cpu_id=1");
        dispatcher.dispatch_line("kw-1 [000] .... 1.2: cpu_frequency: state=1000 cpu_id=0");

        assert_eq!(idle_count.load(Ordering::Relaxed), 2);
        assert_eq!(freq_count.load(Ordering::Relaxed), 1);

        broadcaster.unsubscribe(idle_sub);
        dispatcher.dispatch_line("<idle>-0 [001] d..2. 1.3: cpu_idle: state=2 cpu_id=1");
        assert_eq!(idle_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_gpu_line_attributed_to_writing_core() {
        use crate::power::metric::{Metric, Metrics, SequentialKeys};
        use crate::power::probe::ProbeContext;
        use crate::power::{FrequencySource, Host, PolicySnapshot, Topology};
        use crate::sink::buffer::TraceBuffer;
        use crate::sink::{Sample, SampleKind};

        struct Identity;

        impl Topology for Identity {
            fn to_physical(&self, cpu: u32) -> u32 {
                cpu
            }

            fn present_cpus(&self) -> Vec<u32> {
                (0..4).collect()
            }

            fn is_online(&self, _cpu: u32) -> bool {
                true
            }

            fn cpu_count(&self) -> usize {
                4
            }
        }

        struct NoFrequency;

        impl FrequencySource for NoFrequency {
            fn quick_get(&self, _cpu: u32) -> Option<u32> {
                None
            }

            fn acquire_policy(&self, _cpu: u32) -> Option<PolicySnapshot> {
                None
            }

            fn release_policy(&self, _policy: PolicySnapshot) {}
        }

        let dir = tracefs_with(&[ProbeKind::GpuFrequency]);
        let broadcaster = Arc::new(TracefsBroadcaster::new(dir.path()));
        let buffer = Arc::new(TraceBuffer::new(8));
        let host = Host {
            broadcaster: broadcaster.clone(),
            topology: Arc::new(Identity),
            frequency: Arc::new(NoFrequency),
            sink: buffer.clone(),
        };
        let ctx = Arc::new(ProbeContext::new(
            &host,
            Metrics::new(&SequentialKeys::new(10)),
            false,
        ));
        ctx.metrics().set_enabled(Metric::GpuFrequency, true);
        broadcaster
            .subscribe(ProbeKind::GpuFrequency, ProbeContext::handler(&ctx))
            .expect("subscribe");

        // The reader thread runs on some other core; only the column counts.
        broadcaster
            .dispatcher()
            .dispatch_line("kworker/3:1-99 [003] .... 10.0: gpu_frequency: state=600000 gpu_id=0");

        let mut out: Vec<Sample> = Vec::new();
        buffer.drain_into(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].core, 3);
        assert_eq!(out[0].key, Some(11));
        assert_eq!(out[0].kind, SampleKind::Single64);
        assert_eq!(out[0].value, 600_000_000);
    }

    #[test]
    fn test_unsubscribe_waits_for_running_handler() {
        use std::sync::atomic::AtomicBool;
        use std::sync::mpsc;
        use std::time::Duration;

        let dir = tracefs_with(&[ProbeKind::CpuIdle]);
        let broadcaster = TracefsBroadcaster::new(dir.path());

        let (entered_tx, entered_rx) = mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&finished);
        let entered_tx = parking_lot::Mutex::new(entered_tx);
        let handler: ProbeHandler = Arc::new(move |_| {
            let _ = entered_tx.lock().send(());
            std::thread::sleep(Duration::from_millis(100));
            done.store(true, Ordering::SeqCst);
        });
        let sub = broadcaster
            .subscribe(ProbeKind::CpuIdle, handler)
            .expect("subscribe");

        let dispatcher = broadcaster.dispatcher();
        let delivery = std::thread::spawn(move || {
            dispatcher.dispatch(&PowerEvent::CpuIdle { state: 1, cpu: 0 });
        });

        entered_rx.recv().expect("handler entered");
        broadcaster.unsubscribe(sub);
        assert!(finished.load(Ordering::SeqCst));

        delivery.join().expect("delivery thread");
    }

    #[test]
    fn test_dispatch_counters() {
        let dir = tracefs_with(&[]);
        let broadcaster = TracefsBroadcaster::new(dir.path());
        let dispatcher = broadcaster.dispatcher();

        dispatcher.dispatch_line("CPU:2 [LOST 40 EVENTS]");
        dispatcher.dispatch_line("garbage");
        dispatcher.dispatch_line("bash-1 [000] .... 1.0: sched_switch: prev_pid=1");

        let snap = broadcaster.counters().snapshot();
        assert_eq!(snap.lines, 3);
        assert_eq!(snap.lost_events, 40);
        assert_eq!(snap.parse_errors, 1);

        assert_eq!(broadcaster.counters().snapshot(), TraceCountersSnapshot::default());
    }

    #[test]
    fn test_resolve_root() {
        let dir = tracefs_with(&[]);
        let path = dir.path().to_str().expect("utf8 path");
        assert_eq!(resolve_root(path).expect("resolves"), dir.path());

        let empty = tempfile::tempdir().expect("tempdir");
        assert!(resolve_root(empty.path().to_str().expect("utf8 path")).is_err());
    }

    #[tokio::test]
    async fn test_reader_dispatches_file_lines() {
        let dir = tracefs_with(&[ProbeKind::CpuIdle]);
        std::fs::write(
            dir.path().join("trace_pipe"),
            "<idle>-0 [000] d..2. 1.0: cpu_idle: state=1 cpu_id=0\n\
             <idle>-0 [000] d..2. 1.1: cpu_idle: state=2 cpu_id=0\n",
        )
        .expect("write trace_pipe");

        let broadcaster = TracefsBroadcaster::new(dir.path());
        let (handler, count) = counting_handler();
        broadcaster
            .subscribe(ProbeKind::CpuIdle, handler)
            .expect("subscribe");

        // A regular file hits EOF, which ends the loop.
        let reader = broadcaster.spawn_reader(CancellationToken::new());
        reader.await.expect("join").expect("reader ok");

        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
