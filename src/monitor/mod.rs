//! Host resource sampling and the concurrency ceilings derived from it.
//!
//! [`ResourceMonitor`] is the only component that reads live host state.
//! It turns a [`HostIntrospection`] reading into a [`ResourceSample`], a
//! memory [`PressureLevel`], and a recommended slot ceiling per [`PoolKind`].

mod host;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use host::{DeviceHints, HostIntrospection, SystemHost};

const MIB: u64 = 1024 * 1024;

/// Fraction of the ceiling at or above which pressure is critical.
const CRITICAL_RATIO: f64 = 0.95;

/// The two independent slot pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Network transfers of file bytes.
    Transfer,
    /// CPU-bound work such as hashing.
    Cpu,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Transfer => write!(f, "transfer"),
            PoolKind::Cpu => write!(f, "cpu"),
        }
    }
}

/// Point-in-time host reading. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub used_memory: u64,
    pub ceiling_memory: u64,
    pub core_count: usize,
}

impl ResourceSample {
    pub fn usage_ratio(&self) -> f64 {
        if self.ceiling_memory == 0 {
            return 0.0;
        }
        self.used_memory as f64 / self.ceiling_memory as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureLevel::Normal => write!(f, "normal"),
            PressureLevel::Warning => write!(f, "warning"),
            PressureLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Slots for network transfers, stepped by core count.
///
/// Transfers are not CPU-bound, but a small host still benefits from capping
/// how many large buffers are live at once.
pub fn transfer_ceiling_for_cores(cores: usize) -> usize {
    match cores {
        0..=2 => 1,
        3..=4 => 2,
        _ => 3,
    }
}

/// Memory ceiling assumed when none is configured, by core count.
pub fn default_memory_ceiling(cores: usize) -> u64 {
    match cores {
        0..=2 => 256 * MIB,
        3..=4 => 768 * MIB,
        _ => 1536 * MIB,
    }
}

/// Never budget more than this share of the host's physical memory.
const TOTAL_MEMORY_SHARE: u64 = 4;
const MIN_DERIVED_CEILING: u64 = 64 * MIB;

/// Ceiling for a host with no configured one: the core-count default, capped
/// at a quarter of physical memory when the host reports it.
pub fn derived_memory_ceiling(cores: usize, total_memory: Option<u64>) -> u64 {
    let by_cores = default_memory_ceiling(cores);
    match total_memory {
        Some(total) => by_cores.min((total / TOTAL_MEMORY_SHARE).max(MIN_DERIVED_CEILING)),
        None => by_cores,
    }
}

pub struct ResourceMonitor {
    host: Arc<dyn HostIntrospection>,
    memory_ceiling: u64,
    pressure_threshold: f64,
    reclaim_requests: AtomicU64,
}

impl ResourceMonitor {
    /// `memory_ceiling` of `None` derives one from the host's core count and
    /// reported memory.
    pub fn new(
        host: Arc<dyn HostIntrospection>,
        memory_ceiling: Option<u64>,
        pressure_threshold: f64,
    ) -> Self {
        let memory_ceiling = memory_ceiling.unwrap_or_else(|| {
            derived_memory_ceiling(host.core_count(), host.total_memory())
        });
        tracing::debug!(
            host = host.name(),
            memory_ceiling_mb = memory_ceiling / MIB,
            pressure_threshold,
            "resource monitor ready"
        );
        Self {
            host,
            memory_ceiling,
            pressure_threshold,
            reclaim_requests: AtomicU64::new(0),
        }
    }

    pub fn host_name(&self) -> &'static str {
        self.host.name()
    }

    pub fn memory_ceiling(&self) -> u64 {
        self.memory_ceiling
    }

    pub fn sample(&self) -> ResourceSample {
        ResourceSample {
            used_memory: self.host.used_memory(),
            ceiling_memory: self.memory_ceiling,
            core_count: self.host.core_count().max(1),
        }
    }

    pub fn recommended_ceiling(&self, kind: PoolKind) -> usize {
        let cores = self.host.core_count().max(1);
        match kind {
            PoolKind::Transfer => transfer_ceiling_for_cores(cores),
            PoolKind::Cpu => cores,
        }
    }

    /// True when used memory is above the pressure threshold of the ceiling.
    /// Under pressure the host is also asked to reclaim memory.
    pub fn pressure_check(&self) -> bool {
        let sample = self.sample();
        let under_pressure = sample.usage_ratio() > self.pressure_threshold;
        if under_pressure {
            self.reclaim_requests.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                used_mb = sample.used_memory / MIB,
                ceiling_mb = sample.ceiling_memory / MIB,
                "memory pressure, requesting reclamation"
            );
            self.host.reclaim();
        }
        under_pressure
    }

    pub fn pressure_level(&self) -> PressureLevel {
        Self::level_for(self.sample().usage_ratio(), self.pressure_threshold)
    }

    fn level_for(ratio: f64, threshold: f64) -> PressureLevel {
        if ratio <= threshold {
            PressureLevel::Normal
        } else if ratio < CRITICAL_RATIO {
            PressureLevel::Warning
        } else {
            PressureLevel::Critical
        }
    }

    /// Number of reclamation hints issued so far.
    pub fn reclaim_requests(&self) -> u64 {
        self.reclaim_requests.load(Ordering::Relaxed)
    }
}
