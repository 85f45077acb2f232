//! Driver loop, transfer workers and the item ledger they share.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::AdmissionController;
use crate::backoff::RetryPolicy;
use crate::error::TransferError;
use crate::monitor::PoolKind;
use crate::notify::CompletionNotifier;
use crate::resolver::{AuthorizationIssuer, DuplicateResolver, Resolution};
use crate::state_machine::{
    CompletionEvent, Event, FileCandidate, ItemState, Outcome, StateMachine, Transition, WorkItem,
};
use crate::transport::{ProgressFn, TransferRequest, Transport};

pub(super) struct Entry {
    pub item: WorkItem,
    /// Child of the queue's shutdown token.
    pub cancel: CancellationToken,
}

/// Every tracked item in submission order.
#[derive(Default)]
pub(super) struct Ledger {
    pub entries: Vec<Entry>,
    pub first_transfer: Option<Instant>,
}

impl Ledger {
    pub fn find(&self, identity: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.item.identity == identity)
    }

    pub fn find_mut(&mut self, identity: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.item.identity == identity)
    }
}

pub(super) struct Shared<I, T, N> {
    pub ledger: Mutex<Ledger>,
    pub resolver: DuplicateResolver<I>,
    pub transport: T,
    pub notifier: Arc<N>,
    /// In-flight completion notifications, drained on shutdown.
    pub notifications: TaskTracker,
    pub admission: Arc<AdmissionController>,
    pub policy: RetryPolicy,
    /// Wakes the driver when items become `Queued`.
    pub wake: Notify,
    /// Fires whenever an item turns terminal or leaves the ledger.
    pub idle: Notify,
    pub shutdown: CancellationToken,
}

impl<I, T, N> Shared<I, T, N>
where
    I: AuthorizationIssuer + 'static,
    T: Transport + 'static,
    N: CompletionNotifier,
{
    pub fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `event` to the item tracked under `identity`. Events for items
    /// that moved on (cancelled, removed) are dropped.
    pub fn apply(self: &Arc<Self>, identity: &str, event: Event) -> Option<Transition> {
        let mut ledger = self.ledger();
        let entry = ledger.find_mut(identity)?;
        self.apply_to(entry, event)
    }

    pub fn apply_to(self: &Arc<Self>, entry: &mut Entry, event: Event) -> Option<Transition> {
        let transition = match StateMachine::apply(&mut entry.item, event, &self.policy) {
            Ok(transition) => transition,
            Err(err) => {
                tracing::debug!(identity = %entry.item.identity, error = %err, "stale event dropped");
                return None;
            }
        };

        match &transition {
            Transition::Next(state) => {
                tracing::debug!(identity = %entry.item.identity, state = %state, "state changed");
            }
            Transition::Retry {
                attempt,
                delay,
                reason,
            } => {
                tracing::warn!(
                    identity = %entry.item.identity,
                    attempt,
                    max_retries = self.policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "attempt failed, retrying"
                );
                self.schedule_requeue(entry.item.identity.clone(), *delay, entry.cancel.clone());
            }
            Transition::Complete(outcome) => self.finish(&entry.item, outcome),
        }
        Some(transition)
    }

    fn finish(&self, item: &WorkItem, outcome: &Outcome) {
        match outcome {
            Outcome::Failed(err) => {
                tracing::warn!(identity = %item.identity, attempts = item.attempts, error = %err, "item failed")
            }
            _ => tracing::debug!(identity = %item.identity, outcome = %outcome, "item settled"),
        }

        if let Some(event) = CompletionEvent::from_item(item) {
            let notifier = Arc::clone(&self.notifier);
            self.notifications.spawn(async move {
                if let Err(err) = notifier.notify(event).await {
                    tracing::warn!(error = %err, "completion notification failed");
                }
            });
        }
        self.idle.notify_waiters();
    }

    fn schedule_requeue(self: &Arc<Self>, identity: String, delay: Duration, cancel: CancellationToken) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if shared.apply(&identity, Event::Requeue).is_some() {
                        shared.wake.notify_one();
                    }
                }
            }
        });
    }

    /// Move up to one resolver batch of `Queued` items into `Resolving`, oldest first.
    fn take_batch(self: &Arc<Self>) -> Vec<FileCandidate> {
        let limit = self.resolver.batch_size();
        let mut ledger = self.ledger();
        let mut batch = Vec::new();
        for entry in ledger
            .entries
            .iter_mut()
            .filter(|e| e.item.state == ItemState::Queued)
            .take(limit)
        {
            if self.apply_to(entry, Event::BeginResolve).is_some() {
                batch.push(entry.item.candidate());
            }
        }
        batch
    }

    fn record_progress(&self, identity: &str, bytes: u64) {
        if let Some(entry) = self.ledger().find_mut(identity) {
            entry.item.record_progress(bytes);
        }
    }

    /// Run one authorized item through slot acquisition and transfer.
    /// The slot is released on every path out.
    async fn transfer(self: &Arc<Self>, identity: &str) {
        let cancel = {
            let ledger = self.ledger();
            match ledger.find(identity) {
                Some(entry) if entry.item.state == ItemState::Authorized => entry.cancel.clone(),
                _ => return,
            }
        };

        let permit = match self.admission.acquire(PoolKind::Transfer, 1, &cancel).await {
            Ok(permit) => permit,
            Err(err) => {
                self.apply(identity, Event::Failed(err.into()));
                return;
            }
        };

        let job = {
            let mut ledger = self.ledger();
            let Some(entry) = ledger.find_mut(identity) else {
                return;
            };
            if entry.item.state != ItemState::Authorized {
                return;
            }
            match entry.item.authorization.clone() {
                Some(auth) if !auth.is_expired() => {
                    self.apply_to(entry, Event::BeginTransfer);
                    let job = (entry.item.source.clone(), entry.item.size, auth);
                    ledger.first_transfer.get_or_insert_with(Instant::now);
                    Some(job)
                }
                _ => {
                    self.apply_to(entry, Event::Failed(TransferError::AuthorizationExpired));
                    None
                }
            }
        };
        let Some((source, size, authorization)) = job else {
            self.admission.release(permit);
            return;
        };

        let progress: ProgressFn = {
            let shared = Arc::clone(self);
            let identity = identity.to_string();
            Arc::new(move |bytes: u64| shared.record_progress(&identity, bytes))
        };
        let request = TransferRequest {
            identity,
            source: &source,
            size,
            authorization: &authorization,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.transport.send(request, progress) => result,
        };
        self.admission.release(permit);

        let event = match result {
            Ok(()) => Event::TransferSucceeded,
            Err(err) => Event::Failed(err),
        };
        self.apply(identity, event);
    }
}

/// Resolve `Queued` items in batches and hand authorized ones to the workers.
pub(super) async fn drive<I, T, N>(shared: Arc<Shared<I, T, N>>, ready: mpsc::Sender<String>)
where
    I: AuthorizationIssuer + 'static,
    T: Transport + 'static,
    N: CompletionNotifier,
{
    loop {
        let batch = shared.take_batch();
        if batch.is_empty() {
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                _ = shared.wake.notified() => continue,
            }
        }

        let resolution = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            resolution = shared.resolver.resolve_batch(&batch) => resolution,
        };

        let mut authorized = Vec::new();
        for candidate in &batch {
            let event = match resolution.get(&candidate.identity) {
                Some(Resolution::Duplicate) => Event::ResolvedDuplicate,
                Some(Resolution::Authorized(auth)) => Event::ResolvedAuthorized(auth.clone()),
                Some(Resolution::Failed(err)) => Event::Failed(err.clone()),
                None => Event::Failed(TransferError::Transient("resolver skipped file".into())),
            };
            if let Some(Transition::Next(ItemState::Authorized)) =
                shared.apply(&candidate.identity, event)
            {
                authorized.push(candidate.identity.clone());
            }
        }

        for identity in authorized {
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => return,
                sent = ready.send(identity) => if sent.is_err() { return },
            }
        }
    }
    tracing::debug!("driver stopped");
}

/// Pull authorized identities one at a time until shutdown.
pub(super) async fn work<I, T, N>(
    shared: Arc<Shared<I, T, N>>,
    worker: usize,
    ready: Arc<AsyncMutex<mpsc::Receiver<String>>>,
) where
    I: AuthorizationIssuer + 'static,
    T: Transport + 'static,
    N: CompletionNotifier,
{
    loop {
        let next = {
            let mut ready = ready.lock().await;
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => None,
                next = ready.recv() => next,
            }
        };
        let Some(identity) = next else { break };
        tracing::trace!(worker, identity = %identity, "picked up");
        shared.transfer(&identity).await;
    }
    tracing::debug!(worker, "worker stopped");
}
