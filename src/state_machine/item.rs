use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::ItemState;
use crate::error::TransferError;
use crate::resolver::Authorization;

/// A file offered for transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCandidate {
    /// Stable content/name key. Two candidates with the same identity are the same file.
    pub identity: String,
    pub size: u64,
    /// Where the bytes are read from at transfer time.
    pub source: PathBuf,
}

impl FileCandidate {
    pub fn new(identity: impl Into<String>, size: u64, source: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.into(),
            size,
            source: source.into(),
        }
    }
}

/// How a work item ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Succeeded,
    Duplicate,
    Failed(TransferError),
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "uploaded"),
            Outcome::Duplicate => write!(f, "already stored"),
            Outcome::Failed(err) => write!(f, "failed: {err}"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One file's transfer lifecycle. Owned by the transfer queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub identity: String,
    pub size: u64,
    pub source: PathBuf,
    pub state: ItemState,
    pub state_history: Vec<ItemState>,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Fraction in [0.0, 1.0]. Never decreases while transferring.
    pub progress: f64,
    pub bytes_transferred: u64,
    /// Set only while the item is `Failed`.
    pub last_error: Option<TransferError>,
    /// A `Failed` item waiting out its backoff before re-entering the queue.
    pub retry_pending: bool,
    #[serde(skip)]
    pub authorization: Option<Authorization>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(candidate: FileCandidate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            identity: candidate.identity,
            size: candidate.size,
            source: candidate.source,
            state: ItemState::Queued,
            state_history: Vec::new(),
            attempts: 0,
            progress: 0.0,
            bytes_transferred: 0,
            last_error: None,
            retry_pending: false,
            authorization: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self.state {
            ItemState::Duplicate | ItemState::Succeeded | ItemState::Cancelled => true,
            ItemState::Failed => !self.retry_pending,
            _ => false,
        }
    }

    pub fn candidate(&self) -> FileCandidate {
        FileCandidate {
            identity: self.identity.clone(),
            size: self.size,
            source: self.source.clone(),
        }
    }

    /// Record bytes reported by the transport. Ignored outside `Transferring`
    /// and never moves progress backwards.
    pub fn record_progress(&mut self, bytes: u64) {
        if self.state != ItemState::Transferring || bytes <= self.bytes_transferred {
            return;
        }
        self.bytes_transferred = bytes;
        let fraction = if self.size == 0 {
            1.0
        } else {
            (bytes as f64 / self.size as f64).min(1.0)
        };
        self.progress = self.progress.max(fraction);
        self.updated_at = Utc::now();
    }

    /// The outcome, once terminal.
    pub fn outcome(&self) -> Option<Outcome> {
        if !self.is_terminal() {
            return None;
        }
        Some(match self.state {
            ItemState::Succeeded => Outcome::Succeeded,
            ItemState::Duplicate => Outcome::Duplicate,
            ItemState::Cancelled => Outcome::Cancelled,
            _ => Outcome::Failed(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| TransferError::Transient("unknown".into())),
            ),
        })
    }
}

/// Completion record handed to the notifier when an item turns terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub item_id: String,
    pub identity: String,
    pub size: u64,
    pub outcome: Outcome,
    pub attempts: u32,
    pub state_transitions: Vec<ItemState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl CompletionEvent {
    /// Build the record for a terminal item; `None` if it is still live.
    pub fn from_item(item: &WorkItem) -> Option<Self> {
        let outcome = item.outcome()?;
        let now = Utc::now();
        let mut transitions = item.state_history.clone();
        transitions.push(item.state);
        Some(Self {
            item_id: item.id.clone(),
            identity: item.identity.clone(),
            size: item.size,
            outcome,
            attempts: item.attempts,
            state_transitions: transitions,
            started_at: item.created_at,
            completed_at: now,
            duration_ms: (now - item.created_at).num_milliseconds(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(size: u64) -> WorkItem {
        WorkItem::new(FileCandidate::new("sermon.wav", size, "/tmp/sermon.wav"))
    }

    #[test]
    fn item_creation_defaults() {
        let item = item(10);
        assert_eq!(item.state, ItemState::Queued);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.progress, 0.0);
        assert!(item.last_error.is_none());
        assert!(!item.is_terminal());
        assert!(item.outcome().is_none());
        assert_eq!(item.candidate().identity, "sermon.wav");
    }

    #[test]
    fn progress_only_moves_forward_while_transferring() {
        let mut item = item(200);
        item.record_progress(50);
        assert_eq!(item.progress, 0.0);

        item.state = ItemState::Transferring;
        item.record_progress(50);
        assert_eq!(item.progress, 0.25);
        item.record_progress(20);
        assert_eq!(item.progress, 0.25);
        assert_eq!(item.bytes_transferred, 50);
        item.record_progress(400);
        assert_eq!(item.progress, 1.0);
    }

    #[test]
    fn empty_file_progress_is_complete() {
        let mut item = item(0);
        item.state = ItemState::Transferring;
        item.record_progress(1);
        assert_eq!(item.progress, 1.0);
    }

    #[test]
    fn failed_is_terminal_only_without_pending_retry() {
        let mut item = item(1);
        item.state = ItemState::Failed;
        item.last_error = Some(TransferError::Transient("reset".into()));
        item.retry_pending = true;
        assert!(!item.is_terminal());

        item.retry_pending = false;
        assert!(item.is_terminal());
        assert_eq!(
            item.outcome(),
            Some(Outcome::Failed(TransferError::Transient("reset".into())))
        );
    }

    #[test]
    fn completion_event_from_item() {
        let mut item = item(5);
        assert!(CompletionEvent::from_item(&item).is_none());

        item.state_history = vec![ItemState::Queued, ItemState::Resolving];
        item.state = ItemState::Duplicate;
        let event = CompletionEvent::from_item(&item).unwrap();
        assert_eq!(event.identity, "sermon.wav");
        assert_eq!(event.outcome, Outcome::Duplicate);
        assert_eq!(
            event.state_transitions,
            vec![ItemState::Queued, ItemState::Resolving, ItemState::Duplicate]
        );
        assert!(event.duration_ms >= 0);
    }

    #[test]
    fn outcome_display() {
        assert_eq!(Outcome::Succeeded.to_string(), "uploaded");
        assert_eq!(
            Outcome::Failed(TransferError::AuthorizationExpired).to_string(),
            "failed: write authorization expired"
        );
    }
}
