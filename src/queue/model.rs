//! Command records and their lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Executed successfully.
    Completed,
    /// Execution failed and will not be retried.
    Failed,
}

impl CommandStatus {
    pub const ALL: [CommandStatus; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    /// Whether `update_status` may move a command from `self` to `target`.
    pub fn can_transition_to(&self, target: CommandStatus) -> bool {
        use CommandStatus::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed)
        )
    }

    /// States `target` may be entered from.
    pub fn predecessors(target: CommandStatus) -> Vec<CommandStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

/// A command accepted from email, as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Monotonic id; defines FIFO order.
    pub id: i64,
    /// Normalized sender address.
    pub sender: String,
    /// Command text with quoted replies removed.
    pub command: String,
    /// Source `Message-ID` header, if present.
    pub message_id: Option<String>,
    /// Decoded subject line.
    pub subject: Option<String>,
    pub status: CommandStatus,
    /// Set when the command completes.
    pub result: Option<String>,
    /// Set when the command fails.
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub(crate) fn set(&mut self, status: CommandStatus, count: u64) {
        match status {
            CommandStatus::Pending => self.pending = count,
            CommandStatus::Processing => self.processing = count,
            CommandStatus::Completed => self.completed = count,
            CommandStatus::Failed => self.failed = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
