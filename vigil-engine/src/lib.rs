#![cfg_attr(not(test), forbid(unsafe_code))]

//! Location reconciliation engine for Vigil.
//!
//! Merges a periodically polled authoritative snapshot with an intermittent
//! realtime push stream into one deduplicated, pruned view per scope.

pub mod channel;
pub mod clock;
pub mod http;
pub mod reconciler;
pub mod snapshot;
pub mod stack;
pub mod store;
pub mod telemetry;
pub mod token;

pub use channel::{BackoffPolicy, Identity, RealtimeChannel};
pub use reconciler::{ReconcileError, Reconciler};
pub use snapshot::SnapshotFetcher;
pub use stack::{HttpStack, StackError};
pub use store::{LocationStore, MergeOutcome};
pub use token::{AccessToken, TokenLifecycleGuard};
