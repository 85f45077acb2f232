//! Pacer moves batches of files to a remote store without overrunning a
//! small host.
//!
//! Files go through a [`TransferQueue`]: candidates are checked against the
//! store in batches by the [`DuplicateResolver`], already-stored content is
//! skipped, and the rest are transferred under slots handed out by the
//! [`AdmissionController`]. Slot ceilings come from the [`ResourceMonitor`],
//! and failed attempts are retried on the shared [`RetryPolicy`] curve.

pub mod admission;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod queue;
pub mod resolver;
pub mod simulate;
pub mod state_machine;
pub mod transport;
pub mod ui;

pub use admission::{AdmissionController, AdmissionSettings, Diagnostics};
pub use backoff::RetryPolicy;
pub use config::PacerConfig;
pub use error::{AdmissionError, PacerError, TransferError};
pub use monitor::{DeviceHints, HostIntrospection, PoolKind, ResourceMonitor, SystemHost};
pub use notify::{AnyNotifier, CompletionNotifier, LogNotifier, WebhookNotifier};
pub use queue::{QueueSettings, QueueStats, SubmitReport, TransferQueue};
pub use resolver::{AuthorizationIssuer, DuplicateResolver, HttpIssuer};
pub use state_machine::{FileCandidate, ItemState, Outcome, WorkItem};
pub use transport::{HttpTransport, Transport};
