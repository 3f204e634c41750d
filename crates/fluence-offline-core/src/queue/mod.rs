//! Durable queue of mutating actions recorded while offline.
//!
//! This module provides:
//! - `OfflineAction`: a quiz result or progress update awaiting delivery
//! - `ActionSink`: where queued actions are replayed to (`HttpActionSink`
//!   POSTs them to the site's API)
//! - `OfflineQueue`: the ordered, persisted queue and its drain logic
//!
//! The whole queue is re-serialized into key-value storage on every change.
//! A drain replays every action concurrently and keeps only the failures,
//! in their original order.

pub mod action;
pub mod error;
pub mod manager;
pub mod sink;

pub use action::{ActionKind, ActionPayload, OfflineAction};
pub use error::{QueueError, SyncError};
pub use manager::{Connectivity, DrainReport, OfflineQueue, SubmitOutcome};
pub use sink::{ActionSink, HttpActionSink};
