use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Draft,
    Pending,
    /// Ready for pickup by any engine instance.
    Available,
    /// Claimed by exactly one engine instance.
    InProgress,
    Completed,
    Failed,
    Archived,
}

impl TaskState {
    /// Returns `true` when the engine may move a task from `self` to `target`.
    ///
    /// Draft, pending and archived edges belong to upstream/downstream
    /// collaborators and are never legal through the engine.
    pub fn can_transition_to(&self, target: &TaskState) -> bool {
        matches!(
            (self, target),
            (TaskState::Available, TaskState::InProgress)
                | (TaskState::InProgress, TaskState::Completed)
                | (TaskState::InProgress, TaskState::Failed)
                | (TaskState::InProgress, TaskState::Available)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Archived
        )
    }

    /// Canonical storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Draft => "draft",
            TaskState::Pending => "pending",
            TaskState::Available => "available",
            TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<TaskState> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(TaskState::Draft),
            "pending" => Some(TaskState::Pending),
            "available" => Some(TaskState::Available),
            "in_progress" => Some(TaskState::InProgress),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "archived" => Some(TaskState::Archived),
            _ => None,
        }
    }

    pub const ALL: [TaskState; 7] = [
        TaskState::Draft,
        TaskState::Pending,
        TaskState::Available,
        TaskState::InProgress,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Archived,
    ];
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkCategory {
    Documentation,
    Coding,
    Operations,
    Planning,
}

impl WorkCategory {
    /// Code-bearing work runs in an isolated worktree and must pass the
    /// test/lint/build gates before it is merged.
    pub fn is_code_bearing(&self) -> bool {
        matches!(self, WorkCategory::Coding)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkCategory::Documentation => "documentation",
            WorkCategory::Coding => "coding",
            WorkCategory::Operations => "operations",
            WorkCategory::Planning => "planning",
        }
    }

    pub fn parse(raw: &str) -> Option<WorkCategory> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "documentation" | "docs" => Some(WorkCategory::Documentation),
            "coding" | "code" => Some(WorkCategory::Coding),
            "operations" | "ops" => Some(WorkCategory::Operations),
            "planning" => Some(WorkCategory::Planning),
            _ => None,
        }
    }
}

impl fmt::Display for WorkCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskProperties
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProperties {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Prompt template override handed to the prompt provider.
    #[serde(default)]
    pub template: Option<String>,
    /// Declared output location for documentation tasks, relative to the
    /// working tree.
    #[serde(default)]
    pub output_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Metadata keys written on every engine-driven transition.
pub mod meta {
    pub const CLAIMED_AT: &str = "claimed_at";
    pub const CLAIMED_BY: &str = "claimed_by";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const TOKENS_INPUT: &str = "tokens_input";
    pub const TOKENS_OUTPUT: &str = "tokens_output";
    pub const INVOCATIONS: &str = "invocations";
    pub const LINES_ADDED: &str = "lines_added";
    pub const LINES_REMOVED: &str = "lines_removed";
    pub const DOC_WORDS: &str = "doc_words";
    pub const FAILED_AT: &str = "failed_at";
    pub const FAILURE_REASON: &str = "failure_reason";
    pub const FAILED_GATE: &str = "failed_gate";
    pub const RELEASED_AT: &str = "released_at";
    pub const RELEASE_REASON: &str = "release_reason";
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub category: WorkCategory,
    #[serde(default)]
    pub properties: TaskProperties,
    pub state: TaskState,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a task that is immediately available for pickup.
    pub fn new(name: impl Into<String>, category: WorkCategory) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            category,
            properties: TaskProperties::default(),
            state: TaskState::Available,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.properties.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.properties.description = Some(description.into());
        self
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.properties.output_path = Some(path.into());
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    pub fn priority(&self) -> i32 {
        self.properties.priority
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }
}

/// Pickup ordering: priority descending, then oldest first, then id so the
/// order is total even for tasks created in the same instant.
pub fn pickup_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

// ---------------------------------------------------------------------------
// Store query / update shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub category: Option<WorkCategory>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn available() -> Self {
        Self {
            state: Some(TaskState::Available),
            ..Self::default()
        }
    }

    pub fn in_category(mut self, category: WorkCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.state.is_none_or(|s| s == task.state)
            && self.category.is_none_or(|c| c == task.category)
    }
}

/// Fields written by a conditional set. Metadata entries are merged into
/// the existing map, never replacing it wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub state: Option<TaskState>,
    pub metadata: Metadata,
}

impl TaskUpdate {
    pub fn to_state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Apply this update to an in-memory record.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(state) = self.state {
            task.state = state;
        }
        for (k, v) in &self.metadata {
            task.metadata.insert(k.clone(), v.clone());
        }
        task.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_core_edges_are_legal() {
        let legal = [
            (TaskState::Available, TaskState::InProgress),
            (TaskState::InProgress, TaskState::Completed),
            (TaskState::InProgress, TaskState::Failed),
            (TaskState::InProgress, TaskState::Available),
        ];
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(&to),
                    expected,
                    "{from} -> {to} should be legal={expected}"
                );
            }
        }
    }

    #[test]
    fn state_parse_round_trips_storage_names() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("bogus"), None);
    }

    #[test]
    fn only_coding_is_code_bearing() {
        assert!(WorkCategory::Coding.is_code_bearing());
        assert!(!WorkCategory::Documentation.is_code_bearing());
        assert!(!WorkCategory::Operations.is_code_bearing());
        assert!(!WorkCategory::Planning.is_code_bearing());
    }

    #[test]
    fn pickup_order_prefers_priority_then_age() {
        let old_low = Task::new("old low", WorkCategory::Coding).with_priority(1);
        let mut new_high = Task::new("new high", WorkCategory::Coding).with_priority(5);
        new_high.created_at = old_low.created_at + chrono::TimeDelta::seconds(10);
        let mut new_low = Task::new("new low", WorkCategory::Coding).with_priority(1);
        new_low.created_at = old_low.created_at + chrono::TimeDelta::seconds(20);

        let mut tasks = vec![new_low.clone(), old_low.clone(), new_high.clone()];
        tasks.sort_by(pickup_order);
        let names: Vec<_> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["new high", "old low", "new low"]);
    }

    #[test]
    fn update_merges_metadata() {
        let mut task = Task::new("t", WorkCategory::Coding);
        task.metadata.insert("keep".into(), serde_json::json!(1));
        TaskUpdate::to_state(TaskState::InProgress)
            .with_meta(meta::CLAIMED_BY, "engine-a")
            .apply_to(&mut task);
        assert_eq!(task.state, TaskState::InProgress);
        assert_eq!(task.meta_str(meta::CLAIMED_BY), Some("engine-a"));
        assert_eq!(task.meta_u64("keep"), Some(1));
    }

    #[test]
    fn filter_matches_state_and_category() {
        let task = Task::new("doc", WorkCategory::Documentation);
        assert!(TaskFilter::available().matches(&task));
        assert!(!TaskFilter::available()
            .in_category(WorkCategory::Coding)
            .matches(&task));
        assert!(TaskFilter::default().matches(&task));
    }
}
