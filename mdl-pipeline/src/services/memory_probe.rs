//! Resident memory probing
//!
//! The analysis runner checks resident memory after every chunk and forces
//! a reclaim pass when it crosses the configured ceiling.

use std::sync::Mutex;
use sysinfo::{Pid, System};

/// Memory usage source for the current process
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in bytes, `None` when unavailable
    fn resident_bytes(&self) -> Option<u64>;

    /// Release whatever the probe can release beyond the caller's buffers
    fn reclaim(&self) {}
}

/// Probe backed by `sysinfo` process information
pub struct SystemMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Current process id unavailable, memory ceiling disabled");
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.memory())
    }

    fn reclaim(&self) {
        // Drop cached process tables held by the probe itself
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        *system = System::new();
        tracing::debug!("Memory probe state released");
    }
}

/// Probe that never reports usage (ceiling never triggers)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMemoryProbe;

impl MemoryProbe for NullMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        None
    }
}
