//! # FieldSync Engine
//!
//! Offline-first sync engine for field devices.
//!
//! This crate provides:
//! - Durable per-device operation queues ([`SyncQueue`]) backed by an
//!   append-only journal
//! - The per-device worker state machine ([`SyncWorker`]) with bounded
//!   exponential backoff
//! - Conflict handling via the device-priority policy in
//!   `fieldsync_protocol`
//! - The process-facing [`SyncCoordinator`]
//! - The [`RemoteApplier`] seam to the (external) server side
//!
//! ## Architecture
//!
//! Devices record operations locally while disconnected; `submit`
//! journals each record before acknowledging it, so pending work
//! survives restarts. One worker per device replays records in
//! enqueue order against the remote applier; within a device at most
//! one operation is ever in flight, which preserves causal order.
//! Devices never share a lock, so one device's failures or backoff
//! never stall another.
//!
//! ## Key invariants
//!
//! - A record is durable before `submit` returns
//! - Per-device enqueue order is per-device apply order
//! - `retry_count` never exceeds the cap before dead-lettering
//! - Terminal statuses (Succeeded, ManualReview, Failed) never change
//! - A field technician's edit is never silently discarded

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod config;
mod coordinator;
mod error;
mod journal;
mod queue;
mod worker;

pub use applier::{ApplyOutcome, MockApplier, RemoteApplier};
pub use config::{EngineConfig, RetryPolicy};
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use journal::{
    FileJournal, Journal, JournalContents, JournalFrame, MemoryJournal, JOURNAL_FILE_NAME,
};
pub use queue::{AttemptOutcome, Disposition, Escalation, PendingEntry, SyncQueue};
pub use worker::{DrainReport, StepOutcome, SyncWorker, WorkerState};
