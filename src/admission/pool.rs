use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;

use crate::error::AdmissionError;
use crate::monitor::PoolKind;

/// A named pool of weighted slots.
///
/// Waiters are served strictly in arrival order. The capacity can be resized
/// at any time; a shrink never revokes slots already held and instead takes
/// effect as holders release. A shrink below a queued waiter's weight fails
/// that waiter with [`AdmissionError::WeightExceedsCapacity`].
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    kind: PoolKind,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    sizing: Mutex<Sizing>,
    /// Publishes every capacity change to queued waiters.
    resized: watch::Sender<usize>,
}

struct Sizing {
    capacity: usize,
    // Units to swallow on release because a shrink could not forget them
    // while they were held.
    debt: usize,
}

/// Read-only view of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub kind: PoolKind,
    pub capacity: usize,
    pub in_flight: usize,
    pub available: usize,
    pub peak_in_flight: usize,
}

impl SlotPool {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                kind,
                semaphore: Arc::new(Semaphore::new(capacity)),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                sizing: Mutex::new(Sizing { capacity, debt: 0 }),
                resized: watch::channel(capacity).0,
            }),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    pub fn capacity(&self) -> usize {
        self.inner.sizing().capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait for `weight` units, or fail with [`AdmissionError::Cancelled`]
    /// if `cancel` fires first. Nothing is held when this returns an error.
    pub async fn acquire(
        &self,
        weight: usize,
        cancel: &CancellationToken,
    ) -> Result<SlotPermit, AdmissionError> {
        let capacity = self.capacity();
        if weight > capacity {
            return Err(AdmissionError::WeightExceedsCapacity { weight, capacity });
        }
        let units = u32::try_from(weight)
            .map_err(|_| AdmissionError::WeightExceedsCapacity { weight, capacity })?;
        let mut resized = self.inner.resized.subscribe();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdmissionError::Cancelled),
            capacity = shrunk_below(&mut resized, weight) => {
                return Err(AdmissionError::WeightExceedsCapacity { weight, capacity });
            }
            permit = self.inner.semaphore.clone().acquire_many_owned(units) => {
                permit.map_err(|_| AdmissionError::Closed)?
            }
        };

        let now = self.inner.in_flight.fetch_add(weight, Ordering::AcqRel) + weight;
        self.inner.peak.fetch_max(now, Ordering::AcqRel);
        tracing::trace!(pool = %self.inner.kind, weight, in_flight = now, "slot acquired");

        Ok(SlotPermit {
            pool: self.inner.clone(),
            weight,
            permit: Some(permit),
        })
    }

    /// Change the capacity. Growth is visible to waiters immediately; a
    /// shrink below what is currently held completes as holders release.
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut sizing = self.inner.sizing();
        let old = sizing.capacity;
        if capacity > old {
            let grow = capacity - old;
            let repaid = sizing.debt.min(grow);
            sizing.debt -= repaid;
            self.inner.semaphore.add_permits(grow - repaid);
        } else if capacity < old {
            let shrink = old - capacity;
            let forgotten = self.inner.semaphore.forget_permits(shrink);
            sizing.debt += shrink - forgotten;
        }
        sizing.capacity = capacity;
        self.inner.resized.send_replace(capacity);
        if old != capacity {
            tracing::debug!(pool = %self.inner.kind, old, new = capacity, debt = sizing.debt, "pool resized");
        }
    }

    /// Fail all current and future waiters with [`AdmissionError::Closed`].
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let sizing = self.inner.sizing();
        PoolSnapshot {
            kind: self.inner.kind,
            capacity: sizing.capacity,
            in_flight: self.inner.in_flight.load(Ordering::Acquire),
            available: self.inner.semaphore.available_permits(),
            peak_in_flight: self.inner.peak.load(Ordering::Acquire),
        }
    }
}

/// Resolves with the new capacity once it drops below `weight`.
async fn shrunk_below(resized: &mut watch::Receiver<usize>, weight: usize) -> usize {
    let resized = resized
        .wait_for(|&capacity| capacity < weight)
        .await
        .map(|capacity| *capacity);
    match resized {
        Ok(capacity) => capacity,
        // The sender lives as long as the pool.
        Err(_) => std::future::pending().await,
    }
}

impl PoolInner {
    fn sizing(&self) -> MutexGuard<'_, Sizing> {
        self.sizing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, permit: OwnedSemaphorePermit, weight: usize) {
        self.in_flight.fetch_sub(weight, Ordering::AcqRel);
        let mut sizing = self.sizing();
        if sizing.debt == 0 {
            drop(permit);
            return;
        }
        let absorbed = sizing.debt.min(weight);
        sizing.debt -= absorbed;
        permit.forget();
        self.semaphore.add_permits(weight - absorbed);
    }
}

/// Proof of a successful acquisition. The slots go back to the pool exactly
/// once: on [`SlotPermit::release`] or when the permit is dropped on any other
/// exit path.
pub struct SlotPermit {
    pool: Arc<PoolInner>,
    weight: usize,
    permit: Option<OwnedSemaphorePermit>,
}

impl SlotPermit {
    pub fn kind(&self) -> PoolKind {
        self.pool.kind
    }

    pub fn weight(&self) -> usize {
        self.weight
    }

    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.pool.give_back(permit, self.weight);
            tracing::trace!(pool = %self.pool.kind, weight = self.weight, "slot released");
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("kind", &self.pool.kind)
            .field("weight", &self.weight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn acquire_and_release_update_counters() {
        let pool = SlotPool::new(PoolKind::Transfer, 2);
        let token = CancellationToken::new();

        let a = pool.acquire(1, &token).await.unwrap();
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.snapshot().available, 1);

        let b = pool.acquire(1, &token).await.unwrap();
        assert_eq!(pool.snapshot().available, 0);

        a.release();
        drop(b);
        let snap = pool.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.available, 2);
        assert_eq!(snap.peak_in_flight, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_holders_never_exceed_capacity() {
        let pool = SlotPool::new(PoolKind::Transfer, 2);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..12u64 {
            let pool = pool.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                let permit = pool.acquire(1, &token).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5 + i % 3)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                permit.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
        assert_eq!(pool.snapshot().peak_in_flight, 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let pool = SlotPool::new(PoolKind::Transfer, 1);
        let token = CancellationToken::new();
        let held = pool.acquire(1, &token).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                let permit = pool.acquire(1, &token).await.unwrap();
                order.lock().unwrap().push(name);
                sleep(Duration::from_millis(1)).await;
                drop(permit);
            }));
            // Let the task register as a waiter before the next one arrives.
            sleep(Duration::from_millis(1)).await;
        }

        held.release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn larger_weight_is_not_overtaken_by_smaller_one() {
        let pool = SlotPool::new(PoolKind::Cpu, 4);
        let token = CancellationToken::new();
        let first = pool.acquire(3, &token).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let heavy = {
            let pool = pool.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let permit = pool.acquire(3, &CancellationToken::new()).await.unwrap();
                order.lock().unwrap().push("heavy");
                drop(permit);
            })
        };
        sleep(Duration::from_millis(1)).await;
        let light = {
            let pool = pool.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let permit = pool.acquire(1, &CancellationToken::new()).await.unwrap();
                order.lock().unwrap().push("light");
                drop(permit);
            })
        };
        sleep(Duration::from_millis(1)).await;
        // One unit is free, but the heavy waiter arrived first.
        assert!(order.lock().unwrap().is_empty());

        first.release();
        heavy.await.unwrap();
        light.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["heavy", "light"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_holds_nothing() {
        let pool = SlotPool::new(PoolKind::Transfer, 1);
        let held = pool.acquire(1, &CancellationToken::new()).await.unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let pool = pool.clone();
            let token = token.clone();
            tokio::spawn(async move { pool.acquire(1, &token).await })
        };
        sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), AdmissionError::Cancelled);
        assert_eq!(pool.in_flight(), 1);

        held.release();
        let snap = pool.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.available, 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_wins_over_free_slot() {
        let pool = SlotPool::new(PoolKind::Transfer, 1);
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            pool.acquire(1, &token).await.unwrap_err(),
            AdmissionError::Cancelled
        );
        assert_eq!(pool.snapshot().available, 1);
    }

    #[tokio::test]
    async fn weight_above_capacity_is_rejected() {
        let pool = SlotPool::new(PoolKind::Cpu, 2);
        let err = pool.acquire(3, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err,
            AdmissionError::WeightExceedsCapacity {
                weight: 3,
                capacity: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shrink_below_queued_weight_fails_the_waiter() {
        let pool = SlotPool::new(PoolKind::Cpu, 4);
        let held = pool.acquire(3, &CancellationToken::new()).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(3, &CancellationToken::new()).await })
        };
        sleep(Duration::from_millis(10)).await;

        pool.resize(2);
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            AdmissionError::WeightExceedsCapacity {
                weight: 3,
                capacity: 2
            }
        );

        held.release();
        let snap = pool.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.available, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shrink_that_still_fits_keeps_the_waiter() {
        let pool = SlotPool::new(PoolKind::Cpu, 4);
        let held = pool.acquire(4, &CancellationToken::new()).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(2, &CancellationToken::new()).await })
        };
        sleep(Duration::from_millis(10)).await;

        pool.resize(2);
        held.release();
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(permit.weight(), 2);
    }

    #[tokio::test]
    async fn shrink_waits_for_holders() {
        let pool = SlotPool::new(PoolKind::Transfer, 3);
        let token = CancellationToken::new();
        let a = pool.acquire(1, &token).await.unwrap();
        let b = pool.acquire(1, &token).await.unwrap();
        let c = pool.acquire(1, &token).await.unwrap();

        pool.resize(1);
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.in_flight(), 3);

        a.release();
        assert_eq!(pool.snapshot().available, 0);
        b.release();
        assert_eq!(pool.snapshot().available, 0);
        c.release();
        assert_eq!(pool.snapshot().available, 1);
    }

    #[tokio::test]
    async fn shrink_forgets_idle_slots_immediately() {
        let pool = SlotPool::new(PoolKind::Cpu, 4);
        let held = pool.acquire(1, &CancellationToken::new()).await.unwrap();
        pool.resize(2);
        assert_eq!(pool.snapshot().available, 1);
        held.release();
        assert_eq!(pool.snapshot().available, 2);
    }

    #[tokio::test]
    async fn growth_repays_pending_shrink_first() {
        let pool = SlotPool::new(PoolKind::Transfer, 2);
        let token = CancellationToken::new();
        let a = pool.acquire(1, &token).await.unwrap();
        let b = pool.acquire(1, &token).await.unwrap();

        pool.resize(1); // one unit of debt
        pool.resize(3); // repays the debt, adds one
        assert_eq!(pool.snapshot().available, 1);

        a.release();
        b.release();
        assert_eq!(pool.snapshot().available, 3);
    }

    #[tokio::test]
    async fn closed_pool_rejects_waiters() {
        let pool = SlotPool::new(PoolKind::Transfer, 1);
        pool.close();
        assert_eq!(
            pool.acquire(1, &CancellationToken::new()).await.unwrap_err(),
            AdmissionError::Closed
        );
    }
}
