//! Host metrics gathered independently of the GPU backend.

use std::sync::Mutex;

use gpuwatch_types::SystemReading;
use sysinfo::System;
use tracing::warn;

use crate::source::round2;

/// Collects a [`SystemReading`] on demand.
///
/// One `sysinfo::System` is kept alive between calls so that CPU usage is
/// measured over the interval since the previous poll.
pub struct SystemCollector {
    system: Mutex<System>,
}

impl SystemCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters so the first collect has a baseline.
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    /// Take a fresh reading.  Returns `None` only if the collector's lock was
    /// poisoned by a panicking caller.
    pub fn collect(&self) -> Option<SystemReading> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "system metrics collector poisoned");
                return None;
            }
        };
        system.refresh_cpu();
        system.refresh_memory();

        let memory_total = system.total_memory();
        let memory_used = system.used_memory();
        let memory_usage = if memory_total > 0 {
            round2(memory_used as f64 / memory_total as f64 * 100.0)
        } else {
            0.0
        };
        let load = System::load_average();

        Some(SystemReading {
            cpu_usage: round2(f64::from(system.global_cpu_info().cpu_usage())),
            memory_usage,
            memory_used,
            memory_total,
            load_average: [load.one, load.five, load.fifteen],
            uptime_seconds: System::uptime(),
            hostname: System::host_name().unwrap_or_default(),
        })
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}
