//! Admission control: two weighted slot pools gated by memory pressure.
//!
//! Every bounded operation acquires from a [`SlotPool`] through the
//! [`AdmissionController`]. Transfer acquisitions are additionally deferred
//! while the [`ResourceMonitor`] reports memory pressure, but never for longer
//! than the configured grace period: after that the slot is granted anyway and
//! the event is logged as [`TransferError::ResourceExhausted`].
//!
//! Transfer callers pass through a fair turnstile before the pressure wait, so
//! a caller deferred by pressure keeps its place ahead of later arrivals.

mod pool;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{AdmissionError, TransferError};
use crate::monitor::{PoolKind, PressureLevel, ResourceMonitor, ResourceSample};

pub use pool::{PoolSnapshot, SlotPermit, SlotPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSettings {
    /// Longest a transfer acquisition is deferred under sustained pressure.
    pub grace_period: Duration,
    /// How often pressure is re-read while deferring.
    pub recheck_interval: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(2000),
            recheck_interval: Duration::from_millis(100),
        }
    }
}

/// Read-only diagnostics. Built on demand, never consulted by the algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub host: String,
    pub sample: ResourceSample,
    pub pressure_level: PressureLevel,
    pub pools: Vec<PoolSnapshot>,
    pub grace_escapes: u64,
    pub reclaim_requests: u64,
}

pub struct AdmissionController {
    monitor: Arc<ResourceMonitor>,
    transfer: SlotPool,
    cpu: SlotPool,
    /// Held from the pressure wait until a transfer slot is granted.
    turnstile: AsyncMutex<()>,
    settings: AdmissionSettings,
    grace_escapes: AtomicU64,
}

impl AdmissionController {
    /// Size both pools from the monitor's recommended ceilings.
    pub fn new(monitor: Arc<ResourceMonitor>, settings: AdmissionSettings) -> Self {
        let transfer = monitor.recommended_ceiling(PoolKind::Transfer);
        let cpu = monitor.recommended_ceiling(PoolKind::Cpu);
        Self::with_capacities(monitor, transfer, cpu, settings)
    }

    pub fn with_capacities(
        monitor: Arc<ResourceMonitor>,
        transfer: usize,
        cpu: usize,
        settings: AdmissionSettings,
    ) -> Self {
        tracing::info!(transfer, cpu, grace_ms = settings.grace_period.as_millis() as u64, "admission pools sized");
        Self {
            monitor,
            transfer: SlotPool::new(PoolKind::Transfer, transfer),
            cpu: SlotPool::new(PoolKind::Cpu, cpu),
            turnstile: AsyncMutex::new(()),
            settings,
            grace_escapes: AtomicU64::new(0),
        }
    }

    pub fn pool(&self, kind: PoolKind) -> &SlotPool {
        match kind {
            PoolKind::Transfer => &self.transfer,
            PoolKind::Cpu => &self.cpu,
        }
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Block until `weight` units of `kind` are free, then take them.
    ///
    /// Fails with [`AdmissionError::Cancelled`] if `cancel` fires first; in
    /// that case no slot is held. Transfer callers are served in arrival
    /// order whether or not pressure deferred them.
    pub async fn acquire(
        &self,
        kind: PoolKind,
        weight: usize,
        cancel: &CancellationToken,
    ) -> Result<SlotPermit, AdmissionError> {
        if kind == PoolKind::Cpu {
            return self.cpu.acquire(weight, cancel).await;
        }

        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdmissionError::Cancelled),
            turn = self.turnstile.lock() => turn,
        };
        self.await_pressure_relief(cancel).await?;
        self.transfer.acquire(weight, cancel).await
    }

    /// Give slots back. Equivalent to dropping the permit.
    pub fn release(&self, permit: SlotPermit) {
        permit.release();
    }

    async fn await_pressure_relief(&self, cancel: &CancellationToken) -> Result<(), AdmissionError> {
        if !self.monitor.pressure_check() {
            return Ok(());
        }

        let started = Instant::now();
        let deadline = started + self.settings.grace_period;
        let mut recheck = tokio::time::interval_at(
            started + self.settings.recheck_interval,
            self.settings.recheck_interval,
        );
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!("memory pressure, deferring transfer admission");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AdmissionError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    self.grace_escapes.fetch_add(1, Ordering::Relaxed);
                    let err = TransferError::ResourceExhausted {
                        waited_ms: started.elapsed().as_millis() as u64,
                    };
                    tracing::warn!(pool = %PoolKind::Transfer, error = %err, "admission grace period expired");
                    return Ok(());
                }
                _ = recheck.tick() => {
                    if !self.monitor.pressure_check() {
                        tracing::debug!(
                            waited_ms = started.elapsed().as_millis() as u64,
                            "memory pressure cleared"
                        );
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Resize both pools to the monitor's current recommendations.
    pub fn resample(&self) {
        self.transfer
            .resize(self.monitor.recommended_ceiling(PoolKind::Transfer));
        self.cpu.resize(self.monitor.recommended_ceiling(PoolKind::Cpu));
    }

    /// Fail every pending and future acquisition.
    pub fn close(&self) {
        self.transfer.close();
        self.cpu.close();
    }

    pub fn grace_escapes(&self) -> u64 {
        self.grace_escapes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            host: self.monitor.host_name().to_string(),
            sample: self.monitor.sample(),
            pressure_level: self.monitor.pressure_level(),
            pools: vec![self.transfer.snapshot(), self.cpu.snapshot()],
            grace_escapes: self.grace_escapes(),
            reclaim_requests: self.monitor.reclaim_requests(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::DeviceHints;
    use tokio::time::sleep;

    const MIB: u64 = 1024 * 1024;

    fn controller(cores: usize, grace_ms: u64) -> (Arc<DeviceHints>, AdmissionController) {
        let host = Arc::new(DeviceHints::new(cores, None));
        let monitor = Arc::new(ResourceMonitor::new(host.clone(), Some(100 * MIB), 0.8));
        let settings = AdmissionSettings {
            grace_period: Duration::from_millis(grace_ms),
            recheck_interval: Duration::from_millis(50),
        };
        (host, AdmissionController::new(monitor, settings))
    }

    #[test]
    fn pools_sized_from_monitor() {
        let (_, ctl) = controller(4, 1000);
        assert_eq!(ctl.pool(PoolKind::Transfer).capacity(), 2);
        assert_eq!(ctl.pool(PoolKind::Cpu).capacity(), 4);

        let (_, ctl) = controller(1, 1000);
        assert_eq!(ctl.pool(PoolKind::Transfer).capacity(), 1);
        assert_eq!(ctl.pool(PoolKind::Cpu).capacity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_pressure_means_no_delay() {
        let (_, ctl) = controller(4, 1000);
        let started = Instant::now();
        let permit = ctl
            .acquire(PoolKind::Transfer, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        ctl.release(permit);
        assert_eq!(ctl.pool(PoolKind::Transfer).in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_pressure_grants_after_grace_period() {
        let (host, ctl) = controller(4, 500);
        host.report_usage(95 * MIB);

        let started = Instant::now();
        let permit = ctl
            .acquire(PoolKind::Transfer, 1, &CancellationToken::new())
            .await
            .unwrap();
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(600));
        assert_eq!(ctl.grace_escapes(), 1);
        assert!(host.reclaims() >= 1);
        drop(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn relief_before_grace_period_admits_early() {
        let (host, ctl) = controller(4, 5000);
        host.report_usage(90 * MIB);

        let relief = {
            let host = host.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(300)).await;
                host.report_usage(10 * MIB);
            })
        };

        let started = Instant::now();
        let _permit = ctl
            .acquire(PoolKind::Transfer, 1, &CancellationToken::new())
            .await
            .unwrap();
        let waited = started.elapsed();
        relief.await.unwrap();

        assert!(waited >= Duration::from_millis(300));
        assert!(waited < Duration::from_millis(400));
        assert_eq!(ctl.grace_escapes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cpu_pool_ignores_pressure() {
        let (host, ctl) = controller(4, 5000);
        host.report_usage(99 * MIB);
        let started = Instant::now();
        let _permit = ctl
            .acquire(PoolKind::Cpu, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_pressure_wait() {
        let (host, ctl) = controller(4, 10_000);
        host.report_usage(99 * MIB);
        let token = CancellationToken::new();
        {
            let token = token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(200)).await;
                token.cancel();
            });
        }
        let err = ctl
            .acquire(PoolKind::Transfer, 1, &token)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Cancelled);
        assert_eq!(ctl.pool(PoolKind::Transfer).in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_waiter_keeps_its_place_after_relief() {
        let (host, ctl) = controller(2, 10_000);
        let ctl = Arc::new(ctl);
        host.report_usage(95 * MIB);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let waiter = |name: &'static str, after: Duration| {
            let ctl = Arc::clone(&ctl);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                sleep(after).await;
                let permit = ctl
                    .acquire(PoolKind::Transfer, 1, &CancellationToken::new())
                    .await
                    .unwrap();
                order.lock().unwrap().push(name);
                sleep(Duration::from_millis(10)).await;
                drop(permit);
            })
        };

        // "first" is deferred; relief lands between its rechecks and
        // "second" shows up before the next one.
        let first = waiter("first", Duration::ZERO);
        let second = waiter("second", Duration::from_millis(40));
        sleep(Duration::from_millis(30)).await;
        host.report_usage(10 * MIB);

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(ctl.grace_escapes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_queued_behind_a_deferred_waiter() {
        let (host, ctl) = controller(2, 10_000);
        host.report_usage(95 * MIB);
        let ctl = Arc::new(ctl);
        let head = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                ctl.acquire(PoolKind::Transfer, 1, &CancellationToken::new())
                    .await
                    .map(drop)
            })
        };
        sleep(Duration::from_millis(10)).await;

        let token = CancellationToken::new();
        {
            let token = token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(100)).await;
                token.cancel();
            });
        }
        let started = Instant::now();
        let err = ctl
            .acquire(PoolKind::Transfer, 1, &token)
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Cancelled);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(150));

        host.report_usage(10 * MIB);
        head.await.unwrap().unwrap();
        assert_eq!(ctl.pool(PoolKind::Transfer).in_flight(), 0);
    }

    #[tokio::test]
    async fn resample_follows_host_changes() {
        let (host, ctl) = controller(2, 1000);
        assert_eq!(ctl.pool(PoolKind::Transfer).capacity(), 1);

        host.set_cores(8);
        ctl.resample();
        assert_eq!(ctl.pool(PoolKind::Transfer).capacity(), 3);
        assert_eq!(ctl.pool(PoolKind::Cpu).capacity(), 8);
    }

    #[tokio::test]
    async fn snapshot_reports_pools() {
        let (host, ctl) = controller(4, 1000);
        host.report_usage(10 * MIB);
        let _permit = ctl
            .acquire(PoolKind::Transfer, 1, &CancellationToken::new())
            .await
            .unwrap();

        let diag = ctl.snapshot();
        assert_eq!(diag.host, "device");
        assert_eq!(diag.sample.used_memory, 10 * MIB);
        assert_eq!(diag.pressure_level, PressureLevel::Normal);
        assert_eq!(diag.pools.len(), 2);
        assert_eq!(diag.pools[0].kind, PoolKind::Transfer);
        assert_eq!(diag.pools[0].in_flight, 1);
        assert_eq!(diag.pools[1].in_flight, 0);

        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["pools"][0]["kind"], "transfer");
    }
}
