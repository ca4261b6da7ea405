//! Storage Adapter: parameterized SQL over a pooled Postgres-compatible
//! connection. Exposes `query`/`execute` primitives plus the handful of
//! typed entity readers the workflow engine composes directly, with one
//! `row_to_*` mapper per entity (generalized from synchronous `rusqlite`
//! to async `tokio-postgres`).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio::sync::OnceCell;
use tokio_postgres::{NoTls, Row};

use crate::config::StorageConfig;
use crate::types::{
    MemoryNote, Project, ProjectCommand, ProjectLink, Task, TaskAttempt, TaskDependency,
    TaskStatusHistoryEntry,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Storage {
    pool: Pool,
    migrated: OnceCell<()>,
}

/// Outcome of a mutating statement: row count plus, for inserts that use
/// `RETURNING id`, the new row's id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOutcome {
    pub affected_rows: u64,
    pub insert_id: Option<i64>,
}

impl Storage {
    pub fn connect(cfg: &StorageConfig) -> Result<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&cfg.host)
            .port(cfg.port)
            .user(&cfg.user)
            .password(&cfg.password)
            .dbname(&cfg.dbname);
        if cfg.keepalives {
            pg_config.keepalives(true).keepalives_idle(
                std::time::Duration::from_secs(cfg.keepalives_idle_secs),
            );
        }

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(cfg.pool_max_size)
            .build()
            .context("failed to build storage connection pool")?;

        Ok(Self {
            pool,
            migrated: OnceCell::new(),
        })
    }

    /// Idempotent schema setup, called lazily on first public operation.
    /// Guarded by a `OnceCell` so concurrent first-callers migrate once.
    pub async fn run_migrations(&self) -> Result<()> {
        self.migrated
            .get_or_try_init(|| async {
                let client = self.pool.get().await.context("get connection for migrate")?;
                client
                    .batch_execute(SCHEMA_SQL)
                    .await
                    .context("failed to apply schema migrations")?;
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<deadpool_postgres::Client> {
        self.run_migrations().await?;
        self.pool.get().await.context("get connection from pool")
    }

    // ── Generic primitives ───────────────────────────────────────────────

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        let client = self.ensure_ready().await?;
        client
            .query(sql, params)
            .await
            .with_context(|| format!("query failed: {sql}"))
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<ExecOutcome> {
        let client = self.ensure_ready().await?;
        let affected = client
            .execute(sql, params)
            .await
            .with_context(|| format!("execute failed: {sql}"))?;
        Ok(ExecOutcome {
            affected_rows: affected,
            insert_id: None,
        })
    }

    /// Like `execute` but for `INSERT … RETURNING id` statements.
    pub async fn execute_returning_id(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<i64> {
        let client = self.ensure_ready().await?;
        let row = client
            .query_one(sql, params)
            .await
            .with_context(|| format!("insert failed: {sql}"))?;
        Ok(row.try_get::<_, i64>(0)?)
    }

    // ── Row mappers ───────────────────────────────────────────────────────

    pub fn row_to_project(row: &Row) -> Result<Project> {
        Ok(Project {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            workspace_path: row.try_get("workspace_path")?,
            remote_url: row.try_get("remote_url")?,
            telegram_topic_id: row.try_get("telegram_topic_id")?,
            has_build_step: row.try_get("has_build_step")?,
            has_deploy_step: row.try_get("has_deploy_step")?,
            state: row.try_get("state")?,
            created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
            updated_at: row.try_get::<_, DateTime<Utc>>("updated_at")?,
        })
    }

    pub fn row_to_task(row: &Row) -> Result<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            task_type: row.try_get("task_type")?,
            status: row.try_get("status")?,
            status_before_blocked: row.try_get("status_before_blocked")?,
            requires_branching: row.try_get("requires_branching")?,
            requires_human_review: row.try_get("requires_human_review")?,
            priority: row.try_get("priority")?,
            phase: row.try_get("phase")?,
            assigned_model: row.try_get("assigned_model")?,
            git_branch: row.try_get("git_branch")?,
            worktree_path: row.try_get("worktree_path")?,
            dev_server_url: row.try_get("dev_server_url")?,
            review_notes: row.try_get("review_notes")?,
            review_feedback: row.try_get("review_feedback")?,
            block_reason: row.try_get("block_reason")?,
            created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
            updated_at: row.try_get::<_, DateTime<Utc>>("updated_at")?,
            completed_at: row.try_get::<_, Option<DateTime<Utc>>>("completed_at")?,
        })
    }

    pub fn row_to_link(row: &Row) -> Result<ProjectLink> {
        Ok(ProjectLink {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            label: row.try_get("label")?,
            url: row.try_get("url")?,
            category: row.try_get("category")?,
            created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        })
    }

    pub fn row_to_command(row: &Row) -> Result<ProjectCommand> {
        Ok(ProjectCommand {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            label: row.try_get("label")?,
            command: row.try_get("command")?,
            category: row.try_get("category")?,
            run_mode: row.try_get("run_mode")?,
            task_runner_id: row.try_get("task_runner_id")?,
            locked: row.try_get("locked")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get::<_, Option<DateTime<Utc>>>("locked_at")?,
            created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
            updated_at: row.try_get::<_, DateTime<Utc>>("updated_at")?,
        })
    }

    pub fn row_to_dependency(row: &Row) -> Result<TaskDependency> {
        Ok(TaskDependency {
            task_id: row.try_get("task_id")?,
            depends_on_id: row.try_get("depends_on_id")?,
        })
    }

    pub fn row_to_history(row: &Row) -> Result<TaskStatusHistoryEntry> {
        Ok(TaskStatusHistoryEntry {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            from_status: row.try_get("from_status")?,
            to_status: row.try_get("to_status")?,
            actor: row.try_get("actor")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        })
    }

    pub fn row_to_attempt(row: &Row) -> Result<TaskAttempt> {
        Ok(TaskAttempt {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            session_key: row.try_get("session_key")?,
            model: row.try_get("model")?,
            summary: row.try_get("summary")?,
            outcome: row.try_get("outcome")?,
            created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        })
    }

    pub fn row_to_memory(row: &Row) -> Result<MemoryNote> {
        Ok(MemoryNote {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            category: row.try_get("category")?,
            content: row.try_get("content")?,
            created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        })
    }
}
