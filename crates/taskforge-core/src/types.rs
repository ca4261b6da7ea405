use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Project ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Planning,
    Active,
    Paused,
    Complete,
    Archived,
}

impl ProjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "planning" => Self::Planning,
            "active" => Self::Active,
            "paused" => Self::Paused,
            "complete" => Self::Complete,
            "archived" => Self::Archived,
            _ => return None,
        })
    }

    /// Allowed next states for `planning → active → {paused, complete}`;
    /// `paused ↔ active`; `paused → archived`; `complete → archived`;
    /// `archived → active`.
    pub fn allowed_next(&self) -> &'static [ProjectState] {
        use ProjectState::*;
        match self {
            Planning => &[Active],
            Active => &[Paused, Complete],
            Paused => &[Active, Archived],
            Complete => &[Archived],
            Archived => &[Active],
        }
    }
}

/// A project as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub workspace_path: Option<String>,
    pub remote_url: Option<String>,
    pub telegram_topic_id: Option<i64>,
    pub has_build_step: bool,
    pub has_deploy_step: bool,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Project links / commands / memory ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectLink {
    pub id: i64,
    pub project_id: String,
    pub label: String,
    pub url: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

/// `run_mode` for a stored command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Exec,
    Task,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "exec" => Self::Exec,
            "task" => Self::Task,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectCommand {
    pub id: i64,
    pub project_id: String,
    pub label: String,
    pub command: String,
    pub category: String,
    pub run_mode: String,
    pub task_runner_id: Option<String>,
    pub locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNote {
    pub id: i64,
    pub project_id: String,
    pub category: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ── Tasks ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    Bugfix,
    Iteration,
    Hotfix,
    Chore,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Iteration => "iteration",
            Self::Hotfix => "hotfix",
            Self::Chore => "chore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "feature" => Self::Feature,
            "bugfix" => Self::Bugfix,
            "iteration" => Self::Iteration,
            "hotfix" => Self::Hotfix,
            "chore" => Self::Chore,
            _ => return None,
        })
    }

    /// `(requires_branching, requires_human_review)` defaults at creation time.
    pub fn defaults(&self) -> (bool, bool) {
        match self {
            Self::Feature => (true, true),
            Self::Bugfix => (true, false),
            Self::Iteration => (false, true),
            Self::Hotfix => (false, false),
            Self::Chore => (true, false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Requirements,
    Implementing,
    ReviewRequested,
    ChangesRequested,
    Approved,
    Merging,
    MergeConflict,
    Building,
    Deploying,
    Done,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::Implementing => "implementing",
            Self::ReviewRequested => "review_requested",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
            Self::Merging => "merging",
            Self::MergeConflict => "merge_conflict",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "requirements" => Self::Requirements,
            "implementing" => Self::Implementing,
            "review_requested" => Self::ReviewRequested,
            "changes_requested" => Self::ChangesRequested,
            "approved" => Self::Approved,
            "merging" => Self::Merging,
            "merge_conflict" => Self::MergeConflict,
            "building" => Self::Building,
            "deploying" => Self::Deploying,
            "done" => Self::Done,
            "blocked" => Self::Blocked,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// A task as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: String,
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub status: String,
    pub status_before_blocked: Option<String>,
    pub requires_branching: bool,
    pub requires_human_review: bool,
    pub priority: i32,
    pub phase: Option<String>,
    pub assigned_model: Option<String>,
    pub git_branch: Option<String>,
    pub worktree_path: Option<String>,
    pub dev_server_url: Option<String>,
    pub review_notes: Option<String>,
    pub review_feedback: Option<String>,
    pub block_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: i64,
    pub depends_on_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusHistoryEntry {
    pub id: i64,
    pub task_id: i64,
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Partial,
    Failed,
    Abandoned,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => Self::Success,
            "partial" => Self::Partial,
            "failed" => Self::Failed,
            "abandoned" => Self::Abandoned,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub id: i64,
    pub task_id: i64,
    pub session_key: Option<String>,
    pub model: Option<String>,
    pub summary: Option<String>,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

// ── Response bundles ─────────────────────────────────────────────────────

/// Response shape for `project_get`.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectContext {
    pub project: Project,
    pub links: Vec<ProjectLink>,
    pub commands: Vec<ProjectCommand>,
    pub tasks: Vec<Task>,
    pub task_dependencies: Vec<TaskDependency>,
    pub recent_memory: Vec<MemoryNote>,
    pub running_processes: Vec<serde_json::Value>,
}

/// Response shape for `task_get`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    pub task: Task,
    pub dependencies: Vec<TaskDependency>,
    pub attempts: Vec<TaskAttempt>,
    pub status_history: Vec<TaskStatusHistoryEntry>,
}

/// Result of a stored-command invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CmdRunResult {
    Exec { stdout: String, stderr: String },
    Task {
        task_id: String,
        tags: Vec<String>,
        project_id: String,
    },
}

// ── Process Supervisor ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Killed,
    Timeout,
    Lost,
}

impl ProcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Timeout => "timeout",
            Self::Lost => "lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Failed | Self::Killed | Self::Timeout | Self::Lost
        )
    }
}

/// A supervised child process record, durable across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: ProcStatus,
    pub pid: Option<u32>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub log_path: String,
    pub pid_path: Option<String>,
    #[serde(default)]
    pub stdin_attached: bool,
}

/// Durable on-disk document: `{version, updated_at, tasks}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorState {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub tasks: std::collections::BTreeMap<String, TaskRecord>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            tasks: std::collections::BTreeMap::new(),
        }
    }
}
