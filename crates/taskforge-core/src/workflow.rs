//! Workflow Engine: projects, links, stored commands, tasks, dependencies,
//! status history, attempts, and memory. Enforces the project and task
//! state machines and drives git side effects for branching tasks.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::git::Git;
use crate::storage::Storage;
use crate::supervisor::{StartRequest, Supervisor};
use crate::types::{
    CmdRunResult, MemoryNote, Project, ProjectCommand, ProjectContext, ProjectLink, ProjectState,
    RunMode, Task, TaskAttempt, TaskContext, TaskDependency, TaskStatus, TaskStatusHistoryEntry,
    TaskType,
};

/// Documents the task status machine as a declarative allowed-from table.
/// Each `apply_transition` call site below still lists its own allowed-from
/// statuses inline, because several of them narrow that set at runtime based
/// on `requires_human_review`; this table is the one place a reader (or a
/// future caller wanting to validate a transition without attempting it) can
/// see the whole machine at a glance. See `transition_table()`.
const TASK_TRANSITIONS: &[(TaskStatus, &[TaskStatus])] = &[
    (TaskStatus::Requirements, &[TaskStatus::Implementing]),
    (
        TaskStatus::Implementing,
        &[TaskStatus::ReviewRequested, TaskStatus::Approved],
    ),
    (
        TaskStatus::ReviewRequested,
        &[TaskStatus::Approved, TaskStatus::ChangesRequested],
    ),
    (
        TaskStatus::ChangesRequested,
        &[TaskStatus::Implementing, TaskStatus::ReviewRequested],
    ),
    (TaskStatus::Approved, &[TaskStatus::Merging]),
    (
        TaskStatus::Merging,
        &[
            TaskStatus::MergeConflict,
            TaskStatus::Building,
            TaskStatus::Deploying,
            TaskStatus::Done,
        ],
    ),
    (TaskStatus::MergeConflict, &[TaskStatus::Merging]),
    (
        TaskStatus::Building,
        &[TaskStatus::Deploying, TaskStatus::Done],
    ),
    (TaskStatus::Deploying, &[TaskStatus::Done]),
];

/// Statuses eligible to be picked up by `task_next`.
const READY_STATUSES: &[&str] = &[
    "requirements",
    "implementing",
    "changes_requested",
    "review_requested",
    "approved",
    "merge_conflict",
];

fn non_terminal_statuses() -> Vec<&'static str> {
    vec![
        "requirements",
        "implementing",
        "review_requested",
        "changes_requested",
        "approved",
        "merging",
        "merge_conflict",
        "building",
        "deploying",
    ]
}

// ── Typed action arguments ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ProjectCreateArgs {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub workspace_path: Option<String>,
    pub remote_url: Option<String>,
    pub telegram_topic_id: Option<i64>,
    pub has_build_step: Option<bool>,
    pub has_deploy_step: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectUpdateArgs {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub workspace_path: Option<String>,
    pub remote_url: Option<String>,
    pub telegram_topic_id: Option<i64>,
    pub has_build_step: Option<bool>,
    pub has_deploy_step: Option<bool>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkAddArgs {
    pub project_id: String,
    pub label: String,
    pub url: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CmdAddArgs {
    pub project_id: String,
    pub label: String,
    pub command: String,
    pub category: Option<String>,
    pub run_mode: Option<String>,
    pub task_runner_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CmdUpdateArgs {
    pub id: i64,
    pub command: Option<String>,
    pub category: Option<String>,
    pub run_mode: Option<String>,
    pub task_runner_id: Option<String>,
    pub force: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CmdRunArgs {
    pub id: Option<i64>,
    pub project_id: Option<String>,
    pub label: Option<String>,
    pub task_id: Option<i64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskAddArgs {
    pub project_id: String,
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub priority: Option<i32>,
    pub requires_branching: Option<bool>,
    pub requires_human_review: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskUpdateArgs {
    pub id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub phase: Option<String>,
    pub assigned_model: Option<String>,
    pub dev_server_url: Option<String>,
    pub review_notes: Option<String>,
    pub review_feedback: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskTransitionArgs {
    pub id: i64,
    pub actor: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskBlockArgs {
    pub id: i64,
    pub actor: Option<String>,
    pub reason: Option<String>,
    pub block_reason: Option<String>,
}

pub struct WorkflowEngine {
    storage: Arc<Storage>,
    supervisor: Arc<Supervisor>,
}

impl WorkflowEngine {
    pub fn new(storage: Arc<Storage>, supervisor: Arc<Supervisor>) -> Self {
        Self { storage, supervisor }
    }

    // ── Loaders ───────────────────────────────────────────────────────────

    async fn ensure_project(&self, id: &str) -> EngineResult<Project> {
        let rows = self
            .storage
            .query("SELECT * FROM projects WHERE id = $1", &[&id])
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| EngineError::ProjectNotFound(id.to_string()))?;
        Ok(Storage::row_to_project(row)?)
    }

    async fn ensure_task(&self, id: i64) -> EngineResult<Task> {
        let rows = self
            .storage
            .query("SELECT * FROM project_tasks WHERE id = $1", &[&id])
            .await?;
        let row = rows.first().ok_or(EngineError::TaskNotFound(id))?;
        Ok(Storage::row_to_task(row)?)
    }

    async fn ensure_command(&self, id: i64) -> EngineResult<ProjectCommand> {
        let rows = self
            .storage
            .query("SELECT * FROM project_commands WHERE id = $1", &[&id])
            .await?;
        let row = rows.first().ok_or(EngineError::CommandNotFound(id))?;
        Ok(Storage::row_to_command(row)?)
    }

    // ── Projects ──────────────────────────────────────────────────────────

    pub async fn project_create(&self, args: ProjectCreateArgs) -> EngineResult<Project> {
        if args.id.trim().is_empty() {
            return Err(EngineError::MissingField("id".into()));
        }
        if args.id.len() > 64 {
            return Err(EngineError::Precondition(
                "project id must be <= 64 chars".into(),
            ));
        }
        if args.name.trim().is_empty() {
            return Err(EngineError::MissingField("name".into()));
        }

        self.storage
            .execute(
                "INSERT INTO projects (id, name, description, workspace_path, remote_url, \
                 telegram_topic_id, has_build_step, has_deploy_step) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &args.id,
                    &args.name,
                    &args.description,
                    &args.workspace_path,
                    &args.remote_url,
                    &args.telegram_topic_id,
                    &args.has_build_step.unwrap_or(true),
                    &args.has_deploy_step.unwrap_or(true),
                ],
            )
            .await?;

        info!(project_id = %args.id, "workflow: project created");
        self.ensure_project(&args.id).await
    }

    pub async fn project_get(&self, id: &str) -> EngineResult<ProjectContext> {
        let project = self.ensure_project(id).await?;
        let links = self.link_list(id).await?;
        let commands = self.cmd_list(id).await?;
        let tasks = self.task_list(id).await?;

        let mut task_dependencies = Vec::new();
        for task in &tasks {
            task_dependencies.extend(self.task_dep_list(task.id).await?);
        }

        let recent_memory = self.memory_list(id, 50).await?;

        Ok(ProjectContext {
            project,
            links,
            commands,
            tasks,
            task_dependencies,
            recent_memory,
            running_processes: Vec::new(),
        })
    }

    pub async fn project_list(&self) -> EngineResult<Vec<Project>> {
        let rows = self
            .storage
            .query("SELECT * FROM projects ORDER BY created_at ASC", &[])
            .await?;
        rows.iter()
            .map(|r| Storage::row_to_project(r).map_err(EngineError::from))
            .collect()
    }

    pub async fn project_update(&self, args: ProjectUpdateArgs) -> EngineResult<Project> {
        let current = self.ensure_project(&args.id).await?;

        if let Some(ref new_state) = args.state {
            let from = ProjectState::parse(&current.state)
                .ok_or_else(|| EngineError::Precondition("corrupt project state".into()))?;
            let to = ProjectState::parse(new_state)
                .ok_or_else(|| EngineError::MissingField("state".into()))?;
            if !from.allowed_next().contains(&to) {
                return Err(EngineError::IllegalProjectTransition {
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }
        }

        self.storage
            .execute(
                "UPDATE projects SET \
                 name = COALESCE($2, name), \
                 description = COALESCE($3, description), \
                 workspace_path = COALESCE($4, workspace_path), \
                 remote_url = COALESCE($5, remote_url), \
                 telegram_topic_id = COALESCE($6, telegram_topic_id), \
                 has_build_step = COALESCE($7, has_build_step), \
                 has_deploy_step = COALESCE($8, has_deploy_step), \
                 state = COALESCE($9, state), \
                 updated_at = now() \
                 WHERE id = $1",
                &[
                    &args.id,
                    &args.name,
                    &args.description,
                    &args.workspace_path,
                    &args.remote_url,
                    &args.telegram_topic_id,
                    &args.has_build_step,
                    &args.has_deploy_step,
                    &args.state,
                ],
            )
            .await?;

        self.ensure_project(&args.id).await
    }

    pub async fn project_delete(&self, id: &str) -> EngineResult<()> {
        self.ensure_project(id).await?;
        self.storage
            .execute("DELETE FROM projects WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    // ── Links ─────────────────────────────────────────────────────────────

    pub async fn link_add(&self, args: LinkAddArgs) -> EngineResult<ProjectLink> {
        self.ensure_project(&args.project_id).await?;
        if args.label.trim().is_empty() {
            return Err(EngineError::MissingField("label".into()));
        }
        if args.url.trim().is_empty() {
            return Err(EngineError::MissingField("url".into()));
        }
        let category = args.category.unwrap_or_else(|| "other".to_string());

        let id = self
            .storage
            .execute_returning_id(
                "INSERT INTO project_links (project_id, label, url, category) \
                 VALUES ($1, $2, $3, $4) RETURNING id",
                &[&args.project_id, &args.label, &args.url, &category],
            )
            .await?;

        let rows = self
            .storage
            .query("SELECT * FROM project_links WHERE id = $1", &[&id])
            .await?;
        Ok(Storage::row_to_link(&rows[0])?)
    }

    pub async fn link_remove(&self, id: i64) -> EngineResult<()> {
        self.storage
            .execute("DELETE FROM project_links WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    pub async fn link_list(&self, project_id: &str) -> EngineResult<Vec<ProjectLink>> {
        let rows = self
            .storage
            .query(
                "SELECT * FROM project_links WHERE project_id = $1 ORDER BY id ASC",
                &[&project_id],
            )
            .await?;
        rows.iter()
            .map(|r| Storage::row_to_link(r).map_err(EngineError::from))
            .collect()
    }

    // ── Stored commands ───────────────────────────────────────────────────

    pub async fn cmd_add(&self, args: CmdAddArgs) -> EngineResult<ProjectCommand> {
        self.ensure_project(&args.project_id).await?;
        if args.label.trim().is_empty() {
            return Err(EngineError::MissingField("label".into()));
        }
        if args.command.trim().is_empty() {
            return Err(EngineError::MissingField("command".into()));
        }
        let category = args.category.unwrap_or_else(|| "other".to_string());
        let run_mode = args.run_mode.unwrap_or_else(|| "exec".to_string());
        RunMode::parse(&run_mode).ok_or_else(|| EngineError::MissingField("run_mode".into()))?;

        let id = self
            .storage
            .execute_returning_id(
                "INSERT INTO project_commands \
                 (project_id, label, command, category, run_mode, task_runner_id) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                &[
                    &args.project_id,
                    &args.label,
                    &args.command,
                    &category,
                    &run_mode,
                    &args.task_runner_id,
                ],
            )
            .await?;

        self.ensure_command(id).await
    }

    pub async fn cmd_list(&self, project_id: &str) -> EngineResult<Vec<ProjectCommand>> {
        let rows = self
            .storage
            .query(
                "SELECT * FROM project_commands WHERE project_id = $1 ORDER BY id ASC",
                &[&project_id],
            )
            .await?;
        rows.iter()
            .map(|r| Storage::row_to_command(r).map_err(EngineError::from))
            .collect()
    }

    fn check_lock(cmd: &ProjectCommand, force: bool, reason: &Option<String>) -> EngineResult<()> {
        if !cmd.locked {
            return Ok(());
        }
        if !force {
            return Err(EngineError::Locked(cmd.id));
        }
        if reason.as_deref().unwrap_or("").trim().is_empty() {
            return Err(EngineError::LockReasonRequired);
        }
        Ok(())
    }

    pub async fn cmd_update(&self, args: CmdUpdateArgs) -> EngineResult<ProjectCommand> {
        let current = self.ensure_command(args.id).await?;
        Self::check_lock(&current, args.force, &args.reason)?;

        if let Some(ref run_mode) = args.run_mode {
            RunMode::parse(run_mode).ok_or_else(|| EngineError::MissingField("run_mode".into()))?;
        }

        self.storage
            .execute(
                "UPDATE project_commands SET \
                 command = COALESCE($2, command), \
                 category = COALESCE($3, category), \
                 run_mode = COALESCE($4, run_mode), \
                 task_runner_id = COALESCE($5, task_runner_id), \
                 updated_at = now() \
                 WHERE id = $1",
                &[
                    &args.id,
                    &args.command,
                    &args.category,
                    &args.run_mode,
                    &args.task_runner_id,
                ],
            )
            .await?;

        self.ensure_command(args.id).await
    }

    pub async fn cmd_remove(
        &self,
        id: i64,
        force: bool,
        reason: Option<String>,
    ) -> EngineResult<()> {
        let current = self.ensure_command(id).await?;
        Self::check_lock(&current, force, &reason)?;
        self.storage
            .execute("DELETE FROM project_commands WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    pub async fn cmd_lock(&self, id: i64, locked_by: String) -> EngineResult<ProjectCommand> {
        self.ensure_command(id).await?;
        self.storage
            .execute(
                "UPDATE project_commands SET locked = TRUE, locked_by = $2, locked_at = now(), \
                 updated_at = now() WHERE id = $1",
                &[&id, &locked_by],
            )
            .await?;
        self.ensure_command(id).await
    }

    pub async fn cmd_unlock(&self, id: i64) -> EngineResult<ProjectCommand> {
        self.ensure_command(id).await?;
        self.storage
            .execute(
                "UPDATE project_commands SET locked = FALSE, locked_by = NULL, \
                 locked_at = NULL, updated_at = now() WHERE id = $1",
                &[&id],
            )
            .await?;
        self.ensure_command(id).await
    }

    pub async fn cmd_run(&self, args: CmdRunArgs) -> EngineResult<CmdRunResult> {
        let cmd = if let Some(id) = args.id {
            self.ensure_command(id).await?
        } else {
            let project_id = args
                .project_id
                .clone()
                .ok_or_else(|| EngineError::MissingFields {
                    a: "id".into(),
                    b: "project_id and label".into(),
                })?;
            let label = args.label.clone().ok_or_else(|| EngineError::MissingField("label".into()))?;
            let rows = self
                .storage
                .query(
                    "SELECT * FROM project_commands WHERE project_id = $1 AND label = $2",
                    &[&project_id, &label],
                )
                .await?;
            let row = rows.first().ok_or_else(|| {
                EngineError::Precondition(format!("Command not found: {project_id}/{label}"))
            })?;
            Storage::row_to_command(row)?
        };

        let substitute = |template: &str| -> String {
            template
                .replace("{project_id}", &cmd.project_id)
                .replace("{task_id}", &args.task_id.map(|t| t.to_string()).unwrap_or_default())
                .replace("{label}", &cmd.label)
        };

        let command = substitute(&cmd.command);

        match RunMode::parse(&cmd.run_mode) {
            Some(RunMode::Exec) => {
                let output = run_exec(&command, args.timeout_ms).await?;
                Ok(CmdRunResult::Exec {
                    stdout: output.0,
                    stderr: output.1,
                })
            }
            Some(RunMode::Task) => {
                let task_runner_id = cmd
                    .task_runner_id
                    .as_deref()
                    .map(substitute)
                    .unwrap_or_else(|| format!("project-{}-{}", cmd.project_id, cmd.id));
                let tags = vec![
                    "project".to_string(),
                    cmd.project_id.clone(),
                    cmd.label.clone(),
                ];

                self.supervisor
                    .start(StartRequest {
                        id: Some(task_runner_id.clone()),
                        command,
                        tags: tags.clone(),
                        project_id: Some(cmd.project_id.clone()),
                        replace: true,
                        ..Default::default()
                    })
                    .await?;

                Ok(CmdRunResult::Task {
                    task_id: task_runner_id,
                    tags,
                    project_id: cmd.project_id.clone(),
                })
            }
            None => Err(EngineError::Precondition(format!(
                "command {} has invalid run_mode",
                cmd.id
            ))),
        }
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub async fn task_add(&self, args: TaskAddArgs) -> EngineResult<Task> {
        self.ensure_project(&args.project_id).await?;
        if args.title.trim().is_empty() {
            return Err(EngineError::MissingField("title".into()));
        }
        let task_type = TaskType::parse(&args.task_type)
            .ok_or_else(|| EngineError::MissingField("task_type".into()))?;
        let (default_branching, default_review) = task_type.defaults();

        let id = self
            .storage
            .execute_returning_id(
                "INSERT INTO project_tasks \
                 (project_id, title, description, task_type, status, requires_branching, \
                  requires_human_review, priority) \
                 VALUES ($1, $2, $3, $4, 'requirements', $5, $6, $7) RETURNING id",
                &[
                    &args.project_id,
                    &args.title,
                    &args.description,
                    &task_type.as_str(),
                    &args.requires_branching.unwrap_or(default_branching),
                    &args.requires_human_review.unwrap_or(default_review),
                    &args.priority.unwrap_or(0),
                ],
            )
            .await?;

        self.append_history(id, None, "requirements", "system", None)
            .await?;

        self.ensure_task(id).await
    }

    pub async fn task_get(&self, id: i64) -> EngineResult<TaskContext> {
        let task = self.ensure_task(id).await?;
        let dependencies = self.task_dep_list(id).await?;
        let attempts = self.task_attempts(id).await?;
        let status_history = self.task_status_history(id).await?;
        Ok(TaskContext {
            task,
            dependencies,
            attempts,
            status_history,
        })
    }

    pub async fn task_list(&self, project_id: &str) -> EngineResult<Vec<Task>> {
        let rows = self
            .storage
            .query(
                "SELECT * FROM project_tasks WHERE project_id = $1 ORDER BY id ASC",
                &[&project_id],
            )
            .await?;
        rows.iter()
            .map(|r| Storage::row_to_task(r).map_err(EngineError::from))
            .collect()
    }

    async fn task_attempts(&self, task_id: i64) -> EngineResult<Vec<TaskAttempt>> {
        let rows = self
            .storage
            .query(
                "SELECT * FROM task_attempts WHERE task_id = $1 ORDER BY id ASC",
                &[&task_id],
            )
            .await?;
        rows.iter()
            .map(|r| Storage::row_to_attempt(r).map_err(EngineError::from))
            .collect()
    }

    async fn task_status_history(&self, task_id: i64) -> EngineResult<Vec<TaskStatusHistoryEntry>> {
        let rows = self
            .storage
            .query(
                "SELECT * FROM task_status_history WHERE task_id = $1 ORDER BY id ASC",
                &[&task_id],
            )
            .await?;
        rows.iter()
            .map(|r| Storage::row_to_history(r).map_err(EngineError::from))
            .collect()
    }

    pub async fn task_update(&self, args: TaskUpdateArgs) -> EngineResult<Task> {
        self.ensure_task(args.id).await?;
        self.storage
            .execute(
                "UPDATE project_tasks SET \
                 title = COALESCE($2, title), \
                 description = COALESCE($3, description), \
                 priority = COALESCE($4, priority), \
                 phase = COALESCE($5, phase), \
                 assigned_model = COALESCE($6, assigned_model), \
                 dev_server_url = COALESCE($7, dev_server_url), \
                 review_notes = COALESCE($8, review_notes), \
                 review_feedback = COALESCE($9, review_feedback), \
                 updated_at = now() \
                 WHERE id = $1",
                &[
                    &args.id,
                    &args.title,
                    &args.description,
                    &args.priority,
                    &args.phase,
                    &args.assigned_model,
                    &args.dev_server_url,
                    &args.review_notes,
                    &args.review_feedback,
                ],
            )
            .await?;
        self.ensure_task(args.id).await
    }

    async fn append_history(
        &self,
        task_id: i64,
        from: Option<&str>,
        to: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        self.storage
            .execute(
                "INSERT INTO task_status_history (task_id, from_status, to_status, actor, reason) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[&task_id, &from, &to, &actor, &reason],
            )
            .await?;
        Ok(())
    }

    /// Conditional `UPDATE … WHERE status = ANY(allowed)`, race-safe at
    /// the store level. Returns the reloaded task on success.
    async fn apply_transition(
        &self,
        id: i64,
        allowed_from: &[&str],
        to: TaskStatus,
        actor: &str,
        reason: Option<&str>,
        extra_set: &str,
        extra_params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> EngineResult<Task> {
        let current = self.ensure_task(id).await?;

        let sql = format!(
            "UPDATE project_tasks SET status = $1, updated_at = now(){extra_set} \
             WHERE id = $2 AND status = ANY($3)"
        );
        let allowed: Vec<String> = allowed_from.iter().map(|s| s.to_string()).collect();
        let to_str = to.as_str();

        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            vec![&to_str, &id, &allowed];
        params.extend_from_slice(extra_params);

        let outcome = self.storage.execute(&sql, &params).await?;
        if outcome.affected_rows != 1 {
            return Err(EngineError::IllegalTransition {
                id,
                from: current.status.clone(),
                to: to_str.to_string(),
            });
        }

        self.append_history(id, Some(&current.status), to_str, actor, reason)
            .await?;
        self.ensure_task(id).await
    }

    pub async fn task_start(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let task = self.ensure_task(args.id).await?;
        let actor = args.actor.as_deref().unwrap_or("system");

        if task.requires_branching {
            let project = self.ensure_project(&task.project_id).await?;
            let workspace_path = project.workspace_path.clone().ok_or_else(|| {
                EngineError::Precondition(
                    "Project workspace_path required for branching tasks".into(),
                )
            })?;

            let repo_path = format!("{workspace_path}/main");
            let worktree_path = format!("{workspace_path}/worktrees/task-{}", task.id);
            let branch = format!("task/{}", task.id);

            let git = Git::new(repo_path);
            git.create_worktree(&worktree_path, &branch)
                .context("git worktree creation failed")?;

            let updated = self
                .apply_transition(
                    args.id,
                    &["requirements", "changes_requested"],
                    TaskStatus::Implementing,
                    actor,
                    args.reason.as_deref(),
                    ", git_branch = $4, worktree_path = $5",
                    &[&branch, &worktree_path],
                )
                .await?;
            return Ok(updated);
        }

        self.apply_transition(
            args.id,
            &["requirements", "changes_requested"],
            TaskStatus::Implementing,
            actor,
            args.reason.as_deref(),
            "",
            &[],
        )
        .await
    }

    pub async fn task_request_review(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let task = self.ensure_task(args.id).await?;
        let actor = args.actor.as_deref().unwrap_or("system");

        if !task.requires_human_review {
            return self
                .apply_transition(
                    args.id,
                    &["implementing", "changes_requested"],
                    TaskStatus::Approved,
                    actor,
                    Some("auto-approved"),
                    "",
                    &[],
                )
                .await;
        }

        self.apply_transition(
            args.id,
            &["implementing", "changes_requested"],
            TaskStatus::ReviewRequested,
            actor,
            args.reason.as_deref(),
            "",
            &[],
        )
        .await
    }

    pub async fn task_approve(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let task = self.ensure_task(args.id).await?;
        let actor = args.actor.as_deref().unwrap_or("system");

        let mut allowed = vec!["review_requested"];
        if !task.requires_human_review {
            allowed.push("implementing");
            allowed.push("changes_requested");
        }

        self.apply_transition(
            args.id,
            &allowed,
            TaskStatus::Approved,
            actor,
            args.reason.as_deref(),
            "",
            &[],
        )
        .await
    }

    pub async fn task_request_changes(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let actor = args.actor.as_deref().unwrap_or("system");
        self.apply_transition(
            args.id,
            &["review_requested"],
            TaskStatus::ChangesRequested,
            actor,
            args.reason.as_deref(),
            "",
            &[],
        )
        .await
    }

    /// `building` if a build step is configured, else `deploying` if a
    /// deploy step is configured, else `done`.
    fn pick_post_merge_status(project: &Project) -> TaskStatus {
        if project.has_build_step {
            TaskStatus::Building
        } else if project.has_deploy_step {
            TaskStatus::Deploying
        } else {
            TaskStatus::Done
        }
    }

    pub async fn task_merge(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let task = self.ensure_task(args.id).await?;
        let project = self.ensure_project(&task.project_id).await?;
        let actor = args.actor.as_deref().unwrap_or("system");

        if !task.requires_branching {
            let next = Self::pick_post_merge_status(&project);
            if next == TaskStatus::Done {
                return self.task_complete(args).await;
            }
            return self
                .apply_transition(
                    args.id,
                    &["approved", "implementing"],
                    next,
                    actor,
                    args.reason.as_deref(),
                    "",
                    &[],
                )
                .await;
        }

        let workspace_path = project
            .workspace_path
            .clone()
            .ok_or_else(|| EngineError::Precondition("workspace_path and git_branch required for merge".into()))?;
        let branch = task
            .git_branch
            .clone()
            .ok_or_else(|| EngineError::Precondition("workspace_path and git_branch required for merge".into()))?;

        self.apply_transition(
            args.id,
            &["approved", "merge_conflict"],
            TaskStatus::Merging,
            actor,
            args.reason.as_deref(),
            "",
            &[],
        )
        .await?;

        let repo_path = format!("{workspace_path}/main");
        let git = Git::new(repo_path);
        let outcome = git.merge_branch(&branch).context("git merge failed")?;

        if outcome.conflict {
            return self
                .apply_transition(
                    args.id,
                    &["merging"],
                    TaskStatus::MergeConflict,
                    actor,
                    Some("merge conflict"),
                    "",
                    &[],
                )
                .await;
        }
        if !outcome.success {
            return Err(EngineError::MergeFailed(outcome.output));
        }

        let next = Self::pick_post_merge_status(&project);
        if next == TaskStatus::Done {
            return self
                .apply_transition(
                    args.id,
                    &["merging"],
                    TaskStatus::Done,
                    actor,
                    args.reason.as_deref(),
                    ", completed_at = now()",
                    &[],
                )
                .await;
        }

        self.apply_transition(
            args.id,
            &["merging"],
            next,
            actor,
            args.reason.as_deref(),
            "",
            &[],
        )
        .await
    }

    pub async fn task_resolve_conflict(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let actor = args.actor.as_deref().unwrap_or("system");
        self.apply_transition(
            args.id,
            &["merge_conflict"],
            TaskStatus::Merging,
            actor,
            args.reason.as_deref(),
            "",
            &[],
        )
        .await
    }

    pub async fn task_build(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let task = self.ensure_task(args.id).await?;
        let project = self.ensure_project(&task.project_id).await?;
        if !project.has_build_step {
            return Err(EngineError::Precondition(
                "project does not have a build step configured".into(),
            ));
        }
        let actor = args.actor.as_deref().unwrap_or("system");
        let next = if project.has_deploy_step {
            TaskStatus::Deploying
        } else {
            TaskStatus::Done
        };
        let extra_set = if next == TaskStatus::Done {
            ", completed_at = now()"
        } else {
            ""
        };
        self.apply_transition(
            args.id,
            &["building", "merging", "approved"],
            next,
            actor,
            args.reason.as_deref(),
            extra_set,
            &[],
        )
        .await
    }

    pub async fn task_deploy(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let actor = args.actor.as_deref().unwrap_or("system");
        self.apply_transition(
            args.id,
            &["deploying", "building", "merging", "approved"],
            TaskStatus::Done,
            actor,
            args.reason.as_deref(),
            ", completed_at = now()",
            &[],
        )
        .await
    }

    pub async fn task_complete(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let actor = args.actor.as_deref().unwrap_or("system");
        let allowed = non_terminal_statuses();
        let allowed: Vec<&str> = allowed.into_iter().chain(std::iter::once("blocked")).collect();
        self.apply_transition(
            args.id,
            &allowed,
            TaskStatus::Done,
            actor,
            args.reason.as_deref(),
            ", completed_at = now(), status_before_blocked = NULL",
            &[],
        )
        .await
    }

    pub async fn task_cancel(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let task = self.ensure_task(args.id).await?;
        let actor = args.actor.as_deref().unwrap_or("system");

        let mut allowed = non_terminal_statuses();
        allowed.push("blocked");
        allowed.push("done");

        let updated = self
            .apply_transition(
                args.id,
                &allowed,
                TaskStatus::Cancelled,
                actor,
                args.reason.as_deref(),
                ", status_before_blocked = NULL",
                &[],
            )
            .await?;

        if let (Some(worktree_path), Some(branch)) = (&task.worktree_path, &task.git_branch) {
            if let Ok(project) = self.ensure_project(&task.project_id).await {
                if let Some(workspace_path) = project.workspace_path {
                    let git = Git::new(format!("{workspace_path}/main"));
                    if let Err(e) = git.remove_worktree(worktree_path, branch) {
                        warn!(task_id = task.id, "task_cancel: worktree removal failed (ignored): {e}");
                    }
                }
            }
        }

        Ok(updated)
    }

    pub async fn task_block(&self, args: TaskBlockArgs) -> EngineResult<Task> {
        let task = self.ensure_task(args.id).await?;
        let actor = args.actor.as_deref().unwrap_or("system");
        if task.status == "blocked" || task.status == "done" || task.status == "cancelled" {
            return Err(EngineError::IllegalTransition {
                id: args.id,
                from: task.status,
                to: "blocked".to_string(),
            });
        }

        let allowed: Vec<&str> = non_terminal_statuses();
        let prior = task.status.clone();

        self.apply_transition(
            args.id,
            &allowed,
            TaskStatus::Blocked,
            actor,
            args.reason.as_deref(),
            ", status_before_blocked = $4, block_reason = $5",
            &[&prior, &args.block_reason],
        )
        .await
    }

    pub async fn task_unblock(&self, args: TaskTransitionArgs) -> EngineResult<Task> {
        let task = self.ensure_task(args.id).await?;
        let actor = args.actor.as_deref().unwrap_or("system");
        let prior = task
            .status_before_blocked
            .clone()
            .unwrap_or_else(|| "requirements".to_string());
        let prior_status = TaskStatus::parse(&prior)
            .ok_or_else(|| EngineError::Precondition("corrupt status_before_blocked".into()))?;

        self.apply_transition(
            args.id,
            &["blocked"],
            prior_status,
            actor,
            args.reason.as_deref(),
            ", status_before_blocked = NULL, block_reason = NULL",
            &[],
        )
        .await
    }

    /// Highest-priority task in the ready set whose every `depends_on`
    /// task is `done`. Tie-break: oldest `created_at`, then smallest id.
    pub async fn task_next(&self, project_id: &str) -> EngineResult<Option<Task>> {
        let rows = self
            .storage
            .query(
                "SELECT t.* FROM project_tasks t \
                 WHERE t.project_id = $1 AND t.status = ANY($2) \
                 AND NOT EXISTS ( \
                   SELECT 1 FROM project_task_dependencies d \
                   JOIN project_tasks dep ON dep.id = d.depends_on_id \
                   WHERE d.task_id = t.id AND dep.status <> 'done' \
                 ) \
                 ORDER BY t.priority DESC, t.created_at ASC, t.id ASC \
                 LIMIT 1",
                &[&project_id, &READY_STATUSES],
            )
            .await?;
        match rows.first() {
            Some(row) => Ok(Some(Storage::row_to_task(row)?)),
            None => Ok(None),
        }
    }

    // ── Task dependencies ────────────────────────────────────────────────

    pub async fn task_dep_add(&self, task_id: i64, depends_on_id: i64) -> EngineResult<()> {
        if task_id == depends_on_id {
            return Err(EngineError::Precondition(
                "a task cannot depend on itself".into(),
            ));
        }
        self.ensure_task(task_id).await?;
        self.ensure_task(depends_on_id).await?;
        self.storage
            .execute(
                "INSERT INTO project_task_dependencies (task_id, depends_on_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&task_id, &depends_on_id],
            )
            .await?;
        Ok(())
    }

    pub async fn task_dep_remove(&self, task_id: i64, depends_on_id: i64) -> EngineResult<()> {
        self.storage
            .execute(
                "DELETE FROM project_task_dependencies WHERE task_id = $1 AND depends_on_id = $2",
                &[&task_id, &depends_on_id],
            )
            .await?;
        Ok(())
    }

    pub async fn task_dep_list(&self, task_id: i64) -> EngineResult<Vec<TaskDependency>> {
        let rows = self
            .storage
            .query(
                "SELECT * FROM project_task_dependencies WHERE task_id = $1",
                &[&task_id],
            )
            .await?;
        rows.iter()
            .map(|r| Storage::row_to_dependency(r).map_err(EngineError::from))
            .collect()
    }

    // ── Memory ────────────────────────────────────────────────────────────

    pub async fn memory_add(
        &self,
        project_id: &str,
        category: &str,
        content: &str,
    ) -> EngineResult<MemoryNote> {
        self.ensure_project(project_id).await?;
        if content.trim().is_empty() {
            return Err(EngineError::MissingField("content".into()));
        }
        let id = self
            .storage
            .execute_returning_id(
                "INSERT INTO project_memory (project_id, category, content) \
                 VALUES ($1, $2, $3) RETURNING id",
                &[&project_id, &category, &content],
            )
            .await?;
        let rows = self
            .storage
            .query("SELECT * FROM project_memory WHERE id = $1", &[&id])
            .await?;
        Ok(Storage::row_to_memory(&rows[0])?)
    }

    pub async fn memory_list(&self, project_id: &str, limit: i64) -> EngineResult<Vec<MemoryNote>> {
        let rows = self
            .storage
            .query(
                "SELECT * FROM project_memory WHERE project_id = $1 \
                 ORDER BY created_at DESC LIMIT $2",
                &[&project_id, &limit],
            )
            .await?;
        rows.iter()
            .map(|r| Storage::row_to_memory(r).map_err(EngineError::from))
            .collect()
    }

    pub async fn memory_remove(&self, id: i64) -> EngineResult<()> {
        self.storage
            .execute("DELETE FROM project_memory WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }
}

/// Run a stored command synchronously through `bash -lc`, capping stdout
/// at 20 MiB, honoring an optional timeout.
async fn run_exec(command: &str, timeout_ms: Option<u64>) -> EngineResult<(String, String)> {
    use tokio::process::Command;

    const MAX_STDOUT_BYTES: usize = 20 * 1024 * 1024;

    let mut cmd = Command::new("bash");
    cmd.arg("-lc").arg(command);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn exec command: {command}"))?;

    let output_fut = child.wait_with_output();
    let output = match timeout_ms {
        Some(ms) => tokio::time::timeout(std::time::Duration::from_millis(ms), output_fut)
            .await
            .map_err(|_| EngineError::Precondition("command timed out".into()))?
            .context("exec command failed")?,
        None => output_fut.await.context("exec command failed")?,
    };

    let mut stdout = output.stdout;
    stdout.truncate(MAX_STDOUT_BYTES);

    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

#[allow(dead_code)]
fn transition_table() -> &'static [(TaskStatus, &'static [TaskStatus])] {
    TASK_TRANSITIONS
}
