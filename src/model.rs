//! Canonical task record and the mutation payloads that act on it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form task metadata.
pub type Metadata = BTreeMap<String, Value>;

/// Lifecycle status of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started.
    Pending,
    /// Being worked on.
    InProgress,
    /// Done.
    Completed,
    /// Waiting on something external.
    Blocked,
    /// Abandoned.
    Cancelled,
}

impl TaskStatus {
    /// All statuses in declaration order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Blocked,
        TaskStatus::Cancelled,
    ];

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a task in this status may move to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, InProgress | Blocked | Completed | Cancelled),
            InProgress => matches!(next, Pending | Blocked | Completed | Cancelled),
            Blocked => matches!(next, Pending | InProgress | Cancelled),
            Completed => matches!(next, InProgress),
            Cancelled => matches!(next, Pending),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" | "in-progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "blocked" => Ok(TaskStatus::Blocked),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Kind of work item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A unit of work.
    #[default]
    Task,
    /// A checkpoint in a plan.
    Milestone,
    /// A container for other tasks.
    Group,
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(TaskType::Task),
            "milestone" => Ok(TaskType::Milestone),
            "group" => Ok(TaskType::Group),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

/// A persisted task record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique hierarchical path.
    pub path: String,
    /// Work item kind.
    #[serde(default)]
    pub task_type: TaskType,
    /// Current status.
    pub status: TaskStatus,
    /// Parent task, `None` for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    /// Paths this task depends on, first-seen order, no duplicates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Caller supplied metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
    /// Creation time, unix milliseconds.
    pub created_at: i64,
    /// Last update time, unix milliseconds.
    pub updated_at: i64,
    /// Bumped on every update, starts at 1.
    pub version: u64,
}

/// Input for creating a task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// Path of the new task.
    pub path: String,
    /// Work item kind.
    #[serde(default)]
    pub task_type: TaskType,
    /// Initial status, pending when omitted.
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// Parent path.
    #[serde(default)]
    pub parent_path: Option<String>,
    /// Dependency paths.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewTask {
    /// Creates an input for `path` with default fields.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Sets the parent path.
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_path = Some(parent.into());
        self
    }

    /// Sets the initial status.
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the task type.
    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    /// Adds a dependency.
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Adds one metadata entry.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn into_task(self, now: i64) -> Task {
        Task {
            path: self.path,
            task_type: self.task_type,
            status: self.status.unwrap_or(TaskStatus::Pending),
            parent_path: self.parent_path,
            dependencies: dedup_preserving_order(self.dependencies),
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

/// Partial update applied to an existing task.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New status.
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// New task type.
    #[serde(default)]
    pub task_type: Option<TaskType>,
    /// Replacement dependency list.
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    /// Metadata entries merged over the existing map; `null` removes a key.
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl TaskPatch {
    /// Patch that only changes status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that replaces the dependency list.
    pub fn dependencies<I, S>(deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dependencies: Some(deps.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// True when the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.task_type.is_none()
            && self.dependencies.is_none()
            && self.metadata.is_none()
    }

    pub(crate) fn apply_to(&self, current: &Task, now: i64) -> Task {
        let mut next = current.clone();
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(task_type) = self.task_type {
            next.task_type = task_type;
        }
        if let Some(deps) = &self.dependencies {
            next.dependencies = dedup_preserving_order(deps.clone());
        }
        if let Some(meta) = &self.metadata {
            for (key, value) in meta {
                if value.is_null() {
                    next.metadata.remove(key);
                } else {
                    next.metadata.insert(key.clone(), value.clone());
                }
            }
        }
        next.updated_at = now.max(current.updated_at);
        next.version = current.version + 1;
        next
    }
}

/// A single mutation inside a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskOp {
    /// Create a task.
    Create(NewTask),
    /// Update a task.
    Update {
        /// Target path.
        path: String,
        /// Changes to apply.
        patch: TaskPatch,
    },
    /// Delete a task and its descendants.
    Delete {
        /// Target path.
        path: String,
    },
}

impl TaskOp {
    /// Path targeted by the operation.
    pub fn path(&self) -> &str {
        match self {
            TaskOp::Create(input) => &input.path,
            TaskOp::Update { path, .. } | TaskOp::Delete { path } => path,
        }
    }

    /// Short operation name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            TaskOp::Create(_) => "create",
            TaskOp::Update { .. } => "update",
            TaskOp::Delete { .. } => "delete",
        }
    }
}

/// Current wall clock in unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
