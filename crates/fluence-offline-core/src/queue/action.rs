use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    QuizResult,
    ProgressUpdate,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::QuizResult => "quiz_result",
            ActionKind::ProgressUpdate => "progress_update",
        }
    }
}

impl FromStr for ActionKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quiz_result" => Ok(ActionKind::QuizResult),
            "progress_update" => Ok(ActionKind::ProgressUpdate),
            other => Err(QueueError::UnknownActionType(other.to_string())),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued action as persisted: `{"type", "data", "timestamp"}` with the
/// timestamp in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct OfflineAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[cfg_attr(feature = "ts", ts(type = "unknown"))]
    pub data: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub timestamp: DateTime<Utc>,
}

impl OfflineAction {
    /// The timestamp is cut to milliseconds, the precision it is stored with.
    pub fn new(kind: ActionKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }

    /// Body POSTed when the action is replayed.
    pub fn payload(&self) -> ActionPayload<'_> {
        ActionPayload {
            kind: self.kind,
            data: &self.data,
        }
    }
}

/// Wire body: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct ActionPayload<'a> {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub data: &'a Value,
}
