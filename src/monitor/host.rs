use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Read-only view of the host a coordinator runs on.
///
/// Only [`ResourceMonitor::sample`](super::ResourceMonitor::sample) calls into
/// this; everything else receives ceilings as configuration.
pub trait HostIntrospection: Send + Sync {
    /// Short label for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Bytes currently attributed to this process.
    fn used_memory(&self) -> u64;

    /// Physical memory of the host, when it can be read.
    fn total_memory(&self) -> Option<u64>;

    /// Logical cores available to this process. Always at least 1.
    fn core_count(&self) -> usize;

    /// Ask the host to give memory back. Hosts without such a knob ignore it.
    fn reclaim(&self) {}
}

/// Server-side host: readings come from the operating system.
pub struct SystemHost {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemHost {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                tracing::warn!(error = err, "cannot resolve own pid, process memory reads as 0");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIntrospection for SystemHost {
    fn name(&self) -> &'static str {
        "system"
    }

    fn used_memory(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let Ok(mut system) = self.system.lock() else {
            return 0;
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    fn total_memory(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        match system.total_memory() {
            0 => None,
            total => Some(total),
        }
    }

    /// Re-read on every call: affinity and cgroup quotas can change at runtime.
    fn core_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn reclaim(&self) {
        // The global allocator returns freed pages on its own; nothing to trigger.
        tracing::trace!("reclamation hint ignored by system host");
    }
}

/// Client-side host: the embedding application declares what the device
/// reports about itself and feeds in its own memory estimate.
#[derive(Debug)]
pub struct DeviceHints {
    cores: AtomicUsize,
    memory: Option<u64>,
    used: AtomicU64,
    reclaims: AtomicU64,
}

impl DeviceHints {
    pub fn new(cores: usize, memory_bytes: Option<u64>) -> Self {
        Self {
            cores: AtomicUsize::new(cores.max(1)),
            memory: memory_bytes,
            used: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        }
    }

    /// Update the application's current memory estimate.
    pub fn report_usage(&self, bytes: u64) {
        self.used.store(bytes, Ordering::Relaxed);
    }

    pub fn set_cores(&self, cores: usize) {
        self.cores.store(cores.max(1), Ordering::Relaxed);
    }

    /// How many reclamation hints this host has received.
    pub fn reclaims(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }
}

impl HostIntrospection for DeviceHints {
    fn name(&self) -> &'static str {
        "device"
    }

    fn used_memory(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn total_memory(&self) -> Option<u64> {
        self.memory
    }

    fn core_count(&self) -> usize {
        self.cores.load(Ordering::Relaxed).max(1)
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_hints_report_what_they_are_told() {
        let host = DeviceHints::new(4, Some(2 << 30));
        assert_eq!(host.core_count(), 4);
        assert_eq!(host.total_memory(), Some(2 << 30));
        assert_eq!(host.used_memory(), 0);

        host.report_usage(123);
        assert_eq!(host.used_memory(), 123);

        host.reclaim();
        host.reclaim();
        assert_eq!(host.reclaims(), 2);
    }

    #[test]
    fn device_hints_never_report_zero_cores() {
        let host = DeviceHints::new(0, None);
        assert_eq!(host.core_count(), 1);
        host.set_cores(0);
        assert_eq!(host.core_count(), 1);
    }

    #[test]
    fn system_host_reads_plausible_values() {
        let host = SystemHost::new();
        assert!(host.core_count() >= 1);
        let now = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(host.core_count(), now);
        assert_eq!(host.name(), "system");
        // Reading must not panic even where /proc is restricted.
        let _ = host.used_memory();
        let _ = host.total_memory();
    }
}
