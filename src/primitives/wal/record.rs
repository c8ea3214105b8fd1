use serde::{Deserialize, Serialize};

use crate::model::Task;
use crate::types::TxId;

/// What a log record does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordBody {
    /// Insert of a new task; carries the full record.
    Create {
        /// Task as stored.
        task: Task,
    },
    /// Replacement of an existing task; carries the full new record.
    Update {
        /// Task as stored after the update.
        task: Task,
    },
    /// Removal of one task.
    Delete {
        /// Removed path.
        path: String,
    },
    /// Every earlier record of the transaction is durable and may be applied.
    Commit,
    /// Earlier records of the transaction must be ignored.
    Abort,
}

/// A single WAL payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Owning transaction.
    pub tx_id: TxId,
    /// Operation.
    pub body: RecordBody,
}

impl WalRecord {
    /// Path the record touches, if any.
    pub fn path(&self) -> Option<&str> {
        match &self.body {
            RecordBody::Create { task } | RecordBody::Update { task } => Some(&task.path),
            RecordBody::Delete { path } => Some(path),
            RecordBody::Commit | RecordBody::Abort => None,
        }
    }

    /// True for commit and abort markers.
    pub fn is_marker(&self) -> bool {
        matches!(self.body, RecordBody::Commit | RecordBody::Abort)
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self.body {
            RecordBody::Create { .. } => "create",
            RecordBody::Update { .. } => "update",
            RecordBody::Delete { .. } => "delete",
            RecordBody::Commit => "commit",
            RecordBody::Abort => "abort",
        }
    }
}
