use thiserror::Error;

use crate::http::FetchError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Unknown action type: {0:?}")]
    UnknownActionType(String),

    #[error("Queue storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Offline queue JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a single action couldn't be delivered. Every variant means
/// "keep it and retry on the next drain".
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Delivery failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Server rejected action with status {status}")]
    Rejected { status: u16 },

    #[error("Failed to encode action: {0}")]
    Encode(#[from] serde_json::Error),
}
