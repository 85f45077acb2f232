//! Duplicate detection and write authorization, one round trip per batch.
//!
//! [`DuplicateResolver`] validates identities locally, splits the rest into
//! issuer-sized chunks, and returns a [`BatchResolution`] with an entry for
//! every candidate. A failure for one candidate never fails its neighbours.

mod http;
pub mod types;

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::state_machine::FileCandidate;

pub use http::HttpIssuer;

/// Hard limit of the issuer endpoint.
pub const MAX_BATCH_SIZE: usize = 50;

const MAX_IDENTITY_BYTES: usize = 255;

/// A time-limited credential to write one identity to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    /// Routed straight to storage instead of through the CDN.
    pub large_file: bool,
}

impl Authorization {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// What the resolver decided for a single candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Duplicate,
    Authorized(Authorization),
    Failed(TransferError),
}

impl Resolution {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Resolution::Duplicate)
    }

    pub fn authorization(&self) -> Option<&Authorization> {
        match self {
            Resolution::Authorized(auth) => Some(auth),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TransferError> {
        match self {
            Resolution::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Backing service that knows what is already stored and can presign writes.
pub trait AuthorizationIssuer: Send + Sync {
    /// Resolve every candidate in a single round trip. Entries missing from
    /// the returned map are treated as transient failures by the caller.
    fn issue_batch(
        &self,
        candidates: &[FileCandidate],
    ) -> impl Future<Output = Result<HashMap<String, Resolution>, TransferError>> + Send;
}

/// Identity → resolution for one resolver call. Consumed by the queue right away.
#[derive(Debug, Default)]
pub struct BatchResolution {
    entries: HashMap<String, Resolution>,
}

impl BatchResolution {
    pub fn get(&self, identity: &str) -> Option<&Resolution> {
        self.entries.get(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.entries.values().filter(|r| r.is_duplicate()).count()
    }

    pub fn authorized(&self) -> usize {
        self.entries
            .values()
            .filter(|r| r.authorization().is_some())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entries.values().filter(|r| r.error().is_some()).count()
    }
}

impl IntoIterator for BatchResolution {
    type Item = (String, Resolution);
    type IntoIter = std::collections::hash_map::IntoIter<String, Resolution>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Reject identities the store could never accept, before any round trip.
pub fn validate_identity(identity: &str) -> Result<(), TransferError> {
    let reason = if identity.trim().is_empty() {
        "identity is empty"
    } else if identity.len() > MAX_IDENTITY_BYTES {
        "identity longer than 255 bytes"
    } else if identity == "." || identity == ".." {
        "identity is a relative path component"
    } else if identity.contains(['/', '\\']) {
        "identity contains a path separator"
    } else if identity.chars().any(char::is_control) {
        "identity contains control characters"
    } else {
        return Ok(());
    };
    Err(TransferError::PermanentValidation(format!("{reason}: {identity:?}")))
}

pub struct DuplicateResolver<I> {
    issuer: I,
    batch_size: usize,
}

impl<I: AuthorizationIssuer> DuplicateResolver<I> {
    /// `batch_size` is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn new(issuer: I, batch_size: usize) -> Self {
        Self {
            issuer,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn issuer(&self) -> &I {
        &self.issuer
    }

    pub async fn resolve_batch(&self, candidates: &[FileCandidate]) -> BatchResolution {
        let mut entries = HashMap::with_capacity(candidates.len());
        let mut valid = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match validate_identity(&candidate.identity) {
                Ok(()) => valid.push(candidate.clone()),
                Err(err) => {
                    entries.insert(candidate.identity.clone(), Resolution::Failed(err));
                }
            }
        }

        for chunk in valid.chunks(self.batch_size) {
            match self.issuer.issue_batch(chunk).await {
                Ok(mut results) => {
                    for candidate in chunk {
                        let resolution = results.remove(&candidate.identity).unwrap_or_else(|| {
                            Resolution::Failed(TransferError::Transient(
                                "issuer returned no result for file".to_string(),
                            ))
                        });
                        entries.insert(candidate.identity.clone(), resolution);
                    }
                }
                Err(err) => {
                    tracing::warn!(files = chunk.len(), error = %err, "batch resolution failed");
                    for candidate in chunk {
                        entries.insert(candidate.identity.clone(), Resolution::Failed(err.clone()));
                    }
                }
            }
        }

        let resolution = BatchResolution { entries };
        tracing::debug!(
            candidates = candidates.len(),
            duplicates = resolution.duplicates(),
            authorized = resolution.authorized(),
            failed = resolution.failed(),
            "batch resolved"
        );
        resolution
    }
}
