use std::fmt;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::item::{Outcome, WorkItem};
use crate::backoff::RetryPolicy;
use crate::error::TransferError;
use crate::resolver::Authorization;

/// The lifecycle states of a work item.
///
/// Queued → Resolving → Authorized → Transferring → Succeeded, with
/// Duplicate, Failed and Cancelled as the other exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    Queued,
    Resolving,
    Authorized,
    Duplicate,
    Transferring,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Queued => write!(f, "QUEUED"),
            ItemState::Resolving => write!(f, "RESOLVING"),
            ItemState::Authorized => write!(f, "AUTHORIZED"),
            ItemState::Duplicate => write!(f, "DUPLICATE"),
            ItemState::Transferring => write!(f, "TRANSFERRING"),
            ItemState::Succeeded => write!(f, "SUCCEEDED"),
            ItemState::Failed => write!(f, "FAILED"),
            ItemState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Something that happened to a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The item was handed to the resolver.
    BeginResolve,
    /// The resolver found the content already stored.
    ResolvedDuplicate,
    /// The resolver issued a write authorization.
    ResolvedAuthorized(Authorization),
    /// A transfer slot was acquired and bytes are about to move.
    BeginTransfer,
    TransferSucceeded,
    /// Resolution or transfer failed.
    Failed(TransferError),
    /// Backoff elapsed; go back to the queue.
    Requeue,
    Cancel,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::BeginResolve => write!(f, "begin-resolve"),
            Event::ResolvedDuplicate => write!(f, "resolved-duplicate"),
            Event::ResolvedAuthorized(_) => write!(f, "resolved-authorized"),
            Event::BeginTransfer => write!(f, "begin-transfer"),
            Event::TransferSucceeded => write!(f, "transfer-succeeded"),
            Event::Failed(err) => write!(f, "failed ({err})"),
            Event::Requeue => write!(f, "requeue"),
            Event::Cancel => write!(f, "cancel"),
        }
    }
}

/// The result of applying an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Moved to a non-terminal state.
    Next(ItemState),
    /// The attempt failed and another is allowed after `delay`.
    Retry {
        attempt: u32,
        delay: Duration,
        reason: TransferError,
    },
    /// The item reached a terminal state.
    Complete(Outcome),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event} in state {from}")]
pub struct InvalidTransition {
    pub from: ItemState,
    pub event: String,
}

/// Drives a `WorkItem` through its lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Apply `event` to `item`, mutating it in place.
    ///
    /// Terminal items reject every event, so once an item is `Succeeded`,
    /// `Duplicate`, `Cancelled` or terminally `Failed` it never changes state
    /// again.
    pub fn apply(
        item: &mut WorkItem,
        event: Event,
        policy: &RetryPolicy,
    ) -> Result<Transition, InvalidTransition> {
        if item.is_terminal() {
            return Err(Self::invalid(item, &event));
        }

        let transition = match (item.state, event) {
            (ItemState::Queued, Event::BeginResolve) => {
                Self::enter(item, ItemState::Resolving);
                Transition::Next(ItemState::Resolving)
            }
            (ItemState::Resolving, Event::ResolvedDuplicate) => {
                Self::enter(item, ItemState::Duplicate);
                Transition::Complete(Outcome::Duplicate)
            }
            (ItemState::Resolving, Event::ResolvedAuthorized(auth)) => {
                item.authorization = Some(auth);
                Self::enter(item, ItemState::Authorized);
                Transition::Next(ItemState::Authorized)
            }
            (ItemState::Authorized, Event::BeginTransfer) => {
                item.progress = 0.0;
                item.bytes_transferred = 0;
                Self::enter(item, ItemState::Transferring);
                Transition::Next(ItemState::Transferring)
            }
            (ItemState::Transferring, Event::TransferSucceeded) => {
                item.progress = 1.0;
                item.bytes_transferred = item.bytes_transferred.max(item.size);
                item.authorization = None;
                Self::enter(item, ItemState::Succeeded);
                Transition::Complete(Outcome::Succeeded)
            }
            (
                ItemState::Resolving | ItemState::Authorized | ItemState::Transferring,
                Event::Failed(TransferError::Cancelled),
            )
            | (_, Event::Cancel) => Self::cancel(item),
            (
                ItemState::Resolving | ItemState::Authorized | ItemState::Transferring,
                Event::Failed(err),
            ) => Self::handle_failure(item, err, policy),
            (ItemState::Failed, Event::Requeue) => {
                item.retry_pending = false;
                item.last_error = None;
                item.authorization = None;
                Self::enter(item, ItemState::Queued);
                Transition::Next(ItemState::Queued)
            }
            (_, event) => return Err(Self::invalid(item, &event)),
        };

        Ok(transition)
    }

    fn handle_failure(item: &mut WorkItem, err: TransferError, policy: &RetryPolicy) -> Transition {
        item.attempts += 1;
        item.authorization = None;
        item.last_error = Some(err.clone());
        Self::enter(item, ItemState::Failed);

        if err.is_retryable() && policy.allows_retry(item.attempts) {
            item.retry_pending = true;
            Transition::Retry {
                attempt: item.attempts,
                delay: policy.delay(item.attempts - 1),
                reason: err,
            }
        } else {
            item.retry_pending = false;
            Transition::Complete(Outcome::Failed(err))
        }
    }

    fn cancel(item: &mut WorkItem) -> Transition {
        item.retry_pending = false;
        item.last_error = None;
        item.authorization = None;
        Self::enter(item, ItemState::Cancelled);
        Transition::Complete(Outcome::Cancelled)
    }

    fn enter(item: &mut WorkItem, next: ItemState) {
        item.state_history.push(item.state);
        item.state = next;
        item.updated_at = Utc::now();
    }

    fn invalid(item: &WorkItem, event: &Event) -> InvalidTransition {
        InvalidTransition {
            from: item.state,
            event: event.to_string(),
        }
    }
}
