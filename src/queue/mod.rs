//! The transfer queue: owns every work item and drives it to a terminal state.
//!
//! One driver task resolves `Queued` items in batches, oldest first, and hands
//! authorized ones to a fixed pool of workers over a bounded channel. Each
//! worker takes a `Transfer` slot, moves the bytes, releases the slot and
//! reports back. Failed attempts wait out the retry backoff and re-enter the
//! queue, so a fresh authorization is always requested.
//!
//! Items live in a single ledger behind one lock. The driver, the workers and
//! the public operations all go through it, so [`TransferQueue::stats`] never
//! observes a half-applied transition.

mod stats;
mod worker;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::AdmissionController;
use crate::backoff::RetryPolicy;
use crate::error::PacerError;
use crate::monitor::PoolKind;
use crate::notify::{CompletionNotifier, LogNotifier};
use crate::resolver::{AuthorizationIssuer, DuplicateResolver};
use crate::state_machine::{Event, FileCandidate, WorkItem};
use crate::transport::Transport;

pub use stats::QueueStats;
use worker::{Entry, Ledger, Shared};

/// Longest `shutdown` waits for outstanding completion notifications.
const NOTIFY_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueSettings {
    pub retry: RetryPolicy,
    /// Concurrent transfer workers. Defaults to the `Transfer` pool capacity.
    pub workers: Option<usize>,
}

/// What [`TransferQueue::submit`] did with a batch of candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct SubmitReport {
    pub accepted: usize,
    /// Identities already tracked, or repeated within the batch.
    pub ignored: usize,
}

pub struct TransferQueue<I, T, N = LogNotifier> {
    shared: Arc<Shared<I, T, N>>,
    workers: usize,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<I, T, N> TransferQueue<I, T, N>
where
    I: AuthorizationIssuer + 'static,
    T: Transport + 'static,
    N: CompletionNotifier,
{
    pub fn new(
        resolver: DuplicateResolver<I>,
        transport: T,
        notifier: N,
        admission: Arc<AdmissionController>,
        settings: QueueSettings,
    ) -> Self {
        let workers = settings
            .workers
            .unwrap_or_else(|| admission.pool(PoolKind::Transfer).capacity())
            .max(1);
        Self {
            shared: Arc::new(Shared {
                ledger: Mutex::new(Ledger::default()),
                resolver,
                transport,
                notifier: Arc::new(notifier),
                notifications: TaskTracker::new(),
                admission,
                policy: settings.retry,
                wake: Notify::new(),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            workers,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.shared.admission
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn resolver(&self) -> &DuplicateResolver<I> {
        &self.shared.resolver
    }

    /// Spawn the driver and the workers. Must be called inside a tokio
    /// runtime; later calls do nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::channel(self.shared.resolver.batch_size());
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(worker::drive(Arc::clone(&self.shared), tx)));
        for id in 0..self.workers {
            tasks.push(tokio::spawn(worker::work(
                Arc::clone(&self.shared),
                id,
                Arc::clone(&rx),
            )));
        }
        tracing::info!(
            workers = self.workers,
            batch_size = self.shared.resolver.batch_size(),
            "transfer queue started"
        );
    }

    /// Enqueue new items in `Queued`. Identities already tracked, in any
    /// state, are ignored.
    pub fn submit(&self, files: Vec<FileCandidate>) -> Result<SubmitReport, PacerError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PacerError::QueueClosed);
        }
        let mut report = SubmitReport::default();
        {
            let mut ledger = self.shared.ledger();
            let mut known: HashSet<String> =
                ledger.entries.iter().map(|e| e.item.identity.clone()).collect();
            for file in files {
                if !known.insert(file.identity.clone()) {
                    report.ignored += 1;
                    continue;
                }
                ledger.entries.push(Entry {
                    item: WorkItem::new(file),
                    cancel: self.shared.shutdown.child_token(),
                });
                report.accepted += 1;
            }
        }
        if report.accepted > 0 {
            self.shared.wake.notify_one();
        }
        tracing::debug!(accepted = report.accepted, ignored = report.ignored, "files submitted");
        Ok(report)
    }

    /// Move a live item to `Cancelled`, interrupting whatever it is waiting on.
    /// Returns `false` if it had already finished.
    pub fn cancel(&self, identity: &str) -> Result<bool, PacerError> {
        let mut ledger = self.shared.ledger();
        let entry = ledger
            .find_mut(identity)
            .ok_or_else(|| PacerError::ItemNotFound(identity.to_string()))?;
        if entry.item.is_terminal() {
            return Ok(false);
        }
        self.shared.apply_to(entry, Event::Cancel);
        entry.cancel.cancel();
        Ok(true)
    }

    /// Cancel the item if it is still live, then stop tracking it.
    pub fn remove(&self, identity: &str) -> Result<WorkItem, PacerError> {
        let mut ledger = self.shared.ledger();
        let index = ledger
            .entries
            .iter()
            .position(|e| e.item.identity == identity)
            .ok_or_else(|| PacerError::ItemNotFound(identity.to_string()))?;
        let mut entry = ledger.entries.remove(index);
        if !entry.item.is_terminal() {
            self.shared.apply_to(&mut entry, Event::Cancel);
        }
        entry.cancel.cancel();
        self.shared.idle.notify_waiters();
        Ok(entry.item)
    }

    /// Drop every terminal item. Returns how many were removed.
    pub fn clear_terminal(&self) -> usize {
        let mut ledger = self.shared.ledger();
        let before = ledger.entries.len();
        ledger.entries.retain(|e| !e.item.is_terminal());
        before - ledger.entries.len()
    }

    pub fn stats(&self) -> QueueStats {
        let ledger = self.shared.ledger();
        QueueStats::collect(
            ledger.entries.iter().map(|e| &e.item),
            ledger.first_transfer,
        )
    }

    pub fn item(&self, identity: &str) -> Option<WorkItem> {
        self.shared.ledger().find(identity).map(|e| e.item.clone())
    }

    /// Snapshot of every tracked item in submission order.
    pub fn items(&self) -> Vec<WorkItem> {
        self.shared
            .ledger()
            .entries
            .iter()
            .map(|e| e.item.clone())
            .collect()
    }

    /// Resolve once every tracked item is terminal. Never resolves for a
    /// queue with live items that was not started.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stats().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel every live item, stop the driver and workers, and wait for them.
    /// Pending completion notifications get up to five seconds to go out.
    pub async fn shutdown(&self) {
        {
            let mut ledger = self.shared.ledger();
            for entry in ledger.entries.iter_mut().filter(|e| !e.item.is_terminal()) {
                self.shared.apply_to(entry, Event::Cancel);
            }
        }
        self.shared.shutdown.cancel();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "queue task ended abnormally");
            }
        }

        let notifications = &self.shared.notifications;
        notifications.close();
        if tokio::time::timeout(NOTIFY_DRAIN, notifications.wait()).await.is_err() {
            tracing::warn!(
                pending = notifications.len(),
                "completion notifications still pending at shutdown"
            );
        }
        tracing::info!("transfer queue stopped");
    }
}
