#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use powertrace::power::event::{PowerEvent, ProbeKind};
use powertrace::power::{
    EventBroadcaster, FrequencySource, Host, PolicySnapshot, PowerTracer, ProbeHandler,
    RegisterError, SequentialKeys, Subscription, Topology, TracerOptions,
};
use powertrace::sink::Marshal;

/// One call into the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    Single { core: u32, key: u32, value: i32 },
    Single64 { core: u32, key: u32, value: i64 },
    Idle { core: u32, state: u32 },
}

/// Sink that records every emission in order.
#[derive(Default)]
pub struct RecordingSink {
    samples: Mutex<Vec<Emitted>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<Emitted> {
        std::mem::take(&mut *self.samples.lock())
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn count(&self, pred: impl Fn(&Emitted) -> bool) -> usize {
        self.samples.lock().iter().filter(|e| pred(e)).count()
    }
}

impl Marshal for RecordingSink {
    fn emit_single(&self, core: u32, key: u32, value: i32) {
        self.samples.lock().push(Emitted::Single { core, key, value });
    }

    fn emit_single64(&self, core: u32, key: u32, value: i64) {
        self.samples
            .lock()
            .push(Emitted::Single64 { core, key, value });
    }

    fn emit_idle(&self, core: u32, state: u32) {
        self.samples.lock().push(Emitted::Idle { core, state });
    }
}

/// In-memory broadcaster with a registration log and failure injection.
#[derive(Default)]
pub struct FakeBroadcaster {
    handlers: RwLock<Vec<(Subscription, ProbeHandler)>>,
    log: Mutex<Vec<String>>,
    fail_on: Mutex<Option<ProbeKind>>,
    next_id: AtomicU32,
}

impl FakeBroadcaster {
    /// Make the next subscribe for `kind` fail.
    pub fn fail_on(&self, kind: ProbeKind) {
        *self.fail_on.lock() = Some(kind);
    }

    /// Entries `+kind` for subscribe and `-kind` for unsubscribe, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Kinds with at least one live handler, in subscription order.
    pub fn active(&self) -> Vec<ProbeKind> {
        self.handlers.read().iter().map(|(s, _)| s.kind()).collect()
    }

    /// Deliver `event` to every handler of its probe.
    pub fn emit(&self, event: PowerEvent) {
        let handlers = self.handlers.read();
        for (sub, handler) in handlers.iter() {
            if sub.kind() == event.kind() {
                handler(&event);
            }
        }
    }
}

impl EventBroadcaster for FakeBroadcaster {
    fn subscribe(
        &self,
        kind: ProbeKind,
        handler: ProbeHandler,
    ) -> Result<Subscription, RegisterError> {
        let mut fail_on = self.fail_on.lock();
        if *fail_on == Some(kind) {
            *fail_on = None;
            return Err(RegisterError::Rejected {
                probe: kind,
                reason: "injected failure".to_string(),
            });
        }

        let id = u64::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sub = Subscription::new(kind, id);
        self.handlers.write().push((sub, handler));
        self.log.lock().push(format!("+{kind}"));
        Ok(sub)
    }

    fn unsubscribe(&self, subscription: Subscription) {
        self.handlers.write().retain(|(s, _)| *s != subscription);
        self.log.lock().push(format!("-{}", subscription.kind()));
    }
}

/// Topology with settable online state and an optional logical->physical map.
pub struct FakeTopology {
    online: Vec<AtomicBool>,
    physical: Vec<u32>,
}

impl FakeTopology {
    /// `cores` cores, all online, identity mapping.
    pub fn new(cores: u32) -> Self {
        Self::with_map((0..cores).collect())
    }

    pub fn with_map(physical: Vec<u32>) -> Self {
        Self {
            online: physical.iter().map(|_| AtomicBool::new(true)).collect(),
            physical,
        }
    }

    pub fn set_online(&self, cpu: u32, online: bool) {
        self.online[cpu as usize].store(online, Ordering::Relaxed);
    }
}

impl Topology for FakeTopology {
    fn to_physical(&self, cpu: u32) -> u32 {
        self.physical[cpu as usize]
    }

    fn present_cpus(&self) -> Vec<u32> {
        (0..self.online.len() as u32).collect()
    }

    fn is_online(&self, cpu: u32) -> bool {
        self.online[cpu as usize].load(Ordering::Relaxed)
    }

    fn cpu_count(&self) -> usize {
        self.online.len()
    }
}

/// Frequency source with per-core readings and acquire/release accounting.
pub struct FakeFrequency {
    quick: Mutex<Vec<Option<u32>>>,
    policy: Mutex<Vec<Option<u32>>>,
    acquired: AtomicU32,
    released: AtomicU32,
}

impl FakeFrequency {
    /// Every core reports `khz` both ways.
    pub fn uniform(cores: usize, khz: u32) -> Self {
        Self {
            quick: Mutex::new(vec![Some(khz); cores]),
            policy: Mutex::new(vec![Some(khz); cores]),
            acquired: AtomicU32::new(0),
            released: AtomicU32::new(0),
        }
    }

    pub fn set_quick(&self, cpu: u32, khz: Option<u32>) {
        self.quick.lock()[cpu as usize] = khz;
    }

    pub fn set_policy(&self, cpu: u32, khz: Option<u32>) {
        self.policy.lock()[cpu as usize] = khz;
    }

    pub fn acquired(&self) -> u32 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u32 {
        self.released.load(Ordering::Relaxed)
    }
}

impl FrequencySource for FakeFrequency {
    fn quick_get(&self, cpu: u32) -> Option<u32> {
        self.quick.lock().get(cpu as usize).copied().flatten()
    }

    fn acquire_policy(&self, cpu: u32) -> Option<PolicySnapshot> {
        let cur_khz = self.policy.lock().get(cpu as usize).copied().flatten()?;
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Some(PolicySnapshot { cur_khz })
    }

    fn release_policy(&self, _policy: PolicySnapshot) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// A tracer wired to fakes, keys starting at 100 (CPU 100, GPU 101).
pub struct Harness {
    pub broadcaster: Arc<FakeBroadcaster>,
    pub topology: Arc<FakeTopology>,
    pub frequency: Arc<FakeFrequency>,
    pub sink: Arc<RecordingSink>,
    pub tracer: PowerTracer,
}

pub const CPU_KEY: u32 = 100;
pub const GPU_KEY: u32 = 101;

impl Harness {
    pub fn new(topology: FakeTopology, options: TracerOptions) -> Self {
        let cores = topology.cpu_count();
        let broadcaster = Arc::new(FakeBroadcaster::default());
        let topology = Arc::new(topology);
        let frequency = Arc::new(FakeFrequency::uniform(cores, 1_000_000));
        let sink = Arc::new(RecordingSink::default());

        let host = Host {
            broadcaster: broadcaster.clone(),
            topology: topology.clone(),
            frequency: frequency.clone(),
            sink: sink.clone(),
        };
        let tracer = PowerTracer::init(host, &SequentialKeys::new(CPU_KEY), options);

        Self {
            broadcaster,
            topology,
            frequency,
            sink,
            tracer,
        }
    }

    /// Four identity-mapped cores, idle reporting on.
    pub fn basic() -> Self {
        Self::new(
            FakeTopology::new(4),
            TracerOptions {
                report_idle: true,
                ..Default::default()
            },
        )
    }
}
