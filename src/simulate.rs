//! In-memory issuer and transport for `pacer demo` and tests.
//!
//! Both honour tokio's clock, so paused-time tests run instantly while still
//! observing realistic ordering.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;

use crate::error::TransferError;
use crate::resolver::{Authorization, AuthorizationIssuer, Resolution};
use crate::state_machine::FileCandidate;
use crate::transport::{ProgressFn, TransferRequest, Transport};

/// Files above this size are flagged for direct-to-storage routing.
pub const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

const PROGRESS_STEPS: u64 = 4;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Knows a fixed set of stored identities and presigns everything else.
pub struct SimulatedIssuer {
    stored: Mutex<HashSet<String>>,
    latency: Duration,
    ttl: chrono::Duration,
    calls: AtomicUsize,
}

impl Default for SimulatedIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedIssuer {
    pub fn new() -> Self {
        Self {
            stored: Mutex::new(HashSet::new()),
            latency: Duration::from_millis(50),
            ttl: chrono::Duration::hours(1),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_stored<S: Into<String>>(self, identities: impl IntoIterator<Item = S>) -> Self {
        guard(&self.stored).extend(identities.into_iter().map(Into::into));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Lifetime of issued authorizations. Negative values issue stale ones.
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Round trips served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AuthorizationIssuer for SimulatedIssuer {
    async fn issue_batch(
        &self,
        candidates: &[FileCandidate],
    ) -> Result<HashMap<String, Resolution>, TransferError> {
        tokio::time::sleep(self.latency).await;
        self.calls.fetch_add(1, Ordering::SeqCst);

        let stored = guard(&self.stored);
        let expires_at = Utc::now() + self.ttl;
        Ok(candidates
            .iter()
            .map(|c| {
                let resolution = if stored.contains(&c.identity) {
                    Resolution::Duplicate
                } else {
                    Resolution::Authorized(Authorization {
                        url: format!("sim://store/{}", c.identity),
                        expires_at,
                        large_file: c.size > LARGE_FILE_THRESHOLD,
                    })
                };
                (c.identity.clone(), resolution)
            })
            .collect())
    }
}

/// Moves bytes at a fixed rate, with scripted failures per identity.
pub struct SimulatedTransport {
    bytes_per_sec: u64,
    flaky: Mutex<HashMap<String, u32>>,
    rejected: HashSet<String>,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(8 * 1024 * 1024)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedTransport {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            flaky: Mutex::new(HashMap::new()),
            rejected: HashSet::new(),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Fail the first `times` attempts for `identity` midway with a transient error.
    pub fn with_failures(self, identity: impl Into<String>, times: u32) -> Self {
        guard(&self.flaky).insert(identity.into(), times);
        self
    }

    /// Answer every attempt for `identity` with a permanent rejection.
    pub fn with_rejected(mut self, identity: impl Into<String>) -> Self {
        self.rejected.insert(identity.into());
        self
    }

    pub fn calls(&self, identity: &str) -> u32 {
        guard(&self.calls).get(identity).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        guard(&self.calls).values().sum()
    }

    /// Highest number of transfers ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn step_delay(&self, size: u64) -> Duration {
        let micros = size.saturating_mul(1_000_000) / self.bytes_per_sec / PROGRESS_STEPS;
        Duration::from_micros(micros)
    }
}

impl Transport for SimulatedTransport {
    async fn send(&self, request: TransferRequest<'_>, progress: ProgressFn) -> Result<(), TransferError> {
        *guard(&self.calls).entry(request.identity.to_string()).or_insert(0) += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if self.rejected.contains(request.identity) {
            return Err(TransferError::PermanentValidation(format!(
                "store refused {}",
                request.identity
            )));
        }

        let fail_midway = {
            let mut flaky = guard(&self.flaky);
            match flaky.get_mut(request.identity) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };

        let delay = self.step_delay(request.size);
        for step in 1..=PROGRESS_STEPS {
            tokio::time::sleep(delay).await;
            progress(request.size * step / PROGRESS_STEPS);
            if fail_midway && step == PROGRESS_STEPS / 2 {
                return Err(TransferError::Transient("simulated connection reset".into()));
            }
        }
        Ok(())
    }
}
