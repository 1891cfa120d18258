use std::sync::Arc;

use tracing::{debug, info};

use crate::power::{HotplugHandle, Topology};

/// Detects core online/offline transitions by polling the topology and
/// forwards them to the power tracer.
pub struct HotplugMonitor {
    topology: Arc<dyn Topology>,
    hotplug: HotplugHandle,
    known: Vec<(u32, bool)>,
}

impl HotplugMonitor {
    /// Capture the current online state of every present core. No hooks
    /// fire for the initial state.
    pub fn new(topology: Arc<dyn Topology>, hotplug: HotplugHandle) -> Self {
        let known = topology
            .present_cpus()
            .into_iter()
            .map(|cpu| (cpu, topology.is_online(cpu)))
            .collect();

        Self {
            topology,
            hotplug,
            known,
        }
    }

    /// Cores online at the last poll.
    pub fn online_count(&self) -> usize {
        self.known.iter().filter(|(_, online)| *online).count()
    }

    /// Re-read online state and fire the hooks for every change. Returns the
    /// number of transitions.
    pub fn poll(&mut self) -> usize {
        let mut transitions = 0;

        for (cpu, online) in &mut self.known {
            let now = self.topology.is_online(*cpu);
            if now == *online {
                continue;
            }

            if now {
                info!(cpu = *cpu, "core online");
                self.hotplug.online(*cpu);
            } else {
                info!(cpu = *cpu, "core offline");
                self.hotplug.offline(*cpu);
            }

            *online = now;
            transitions += 1;
        }

        if transitions > 0 {
            debug!(transitions, online = self.online_count(), "hotplug poll");
        }

        transitions
    }
}
