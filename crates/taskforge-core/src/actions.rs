//! Action Dispatcher: flat router over the 38 named actions. Validates the
//! action name, coerces a free-form parameter map into the Workflow
//! Engine's typed request structs, and serializes the response.

use serde_json::Value;
use tracing::info;

use crate::errors::{EngineError, EngineResult};
use crate::workflow::{
    CmdAddArgs, CmdRunArgs, CmdUpdateArgs, LinkAddArgs, ProjectCreateArgs, ProjectUpdateArgs,
    TaskAddArgs, TaskBlockArgs, TaskTransitionArgs, TaskUpdateArgs, WorkflowEngine,
};

/// Thin view over the incoming `params` object with typed, erroring getters.
struct Params<'a>(&'a serde_json::Map<String, Value>);

impl<'a> Params<'a> {
    fn str_req(&self, field: &str) -> EngineResult<String> {
        self.str_opt(field)
            .ok_or_else(|| EngineError::MissingField(field.to_string()))
    }

    fn str_opt(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn i64_req(&self, field: &str) -> EngineResult<i64> {
        self.i64_opt(field)
            .ok_or_else(|| EngineError::MissingField(field.to_string()))
    }

    fn i64_opt(&self, field: &str) -> Option<i64> {
        match self.0.get(field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn i32_opt(&self, field: &str) -> Option<i32> {
        self.i64_opt(field).map(|n| n as i32)
    }

    fn bool_opt(&self, field: &str) -> Option<bool> {
        match self.0.get(field)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn bool_default(&self, field: &str, default: bool) -> bool {
        self.bool_opt(field).unwrap_or(default)
    }
}

/// Dispatch a `{action, params}` envelope onto the Workflow Engine.
/// Unknown actions fail with `EngineError::UnknownAction`.
pub async fn dispatch(
    engine: &WorkflowEngine,
    action: &str,
    params: Value,
) -> EngineResult<Value> {
    let empty = serde_json::Map::new();
    let obj = params.as_object().unwrap_or(&empty);
    let p = Params(obj);

    info!(action, "dispatch: invoking action");

    let result = match action {
        // Projects
        "project_create" => {
            let args = ProjectCreateArgs {
                id: p.str_req("id")?,
                name: p.str_req("name")?,
                description: p.str_opt("description"),
                workspace_path: p.str_opt("workspace_path"),
                remote_url: p.str_opt("remote_url"),
                telegram_topic_id: p.i64_opt("telegram_topic_id"),
                has_build_step: p.bool_opt("has_build_step"),
                has_deploy_step: p.bool_opt("has_deploy_step"),
            };
            serde_json::to_value(engine.project_create(args).await?)
        }
        "project_get" => serde_json::to_value(engine.project_get(&p.str_req("id")?).await?),
        "project_list" => serde_json::to_value(engine.project_list().await?),
        "project_update" => {
            let args = ProjectUpdateArgs {
                id: p.str_req("id")?,
                name: p.str_opt("name"),
                description: p.str_opt("description"),
                workspace_path: p.str_opt("workspace_path"),
                remote_url: p.str_opt("remote_url"),
                telegram_topic_id: p.i64_opt("telegram_topic_id"),
                has_build_step: p.bool_opt("has_build_step"),
                has_deploy_step: p.bool_opt("has_deploy_step"),
                state: p.str_opt("state"),
            };
            serde_json::to_value(engine.project_update(args).await?)
        }
        "project_delete" => {
            engine.project_delete(&p.str_req("id")?).await?;
            serde_json::to_value(serde_json::json!({ "ok": true }))
        }

        // Links
        "link_add" => {
            let args = LinkAddArgs {
                project_id: p.str_req("project_id")?,
                label: p.str_req("label")?,
                url: p.str_req("url")?,
                category: p.str_opt("category"),
            };
            serde_json::to_value(engine.link_add(args).await?)
        }
        "link_remove" => {
            engine.link_remove(p.i64_req("id")?).await?;
            serde_json::to_value(serde_json::json!({ "ok": true }))
        }
        "link_list" => serde_json::to_value(engine.link_list(&p.str_req("project_id")?).await?),

        // Commands
        "cmd_add" => {
            let args = CmdAddArgs {
                project_id: p.str_req("project_id")?,
                label: p.str_req("label")?,
                command: p.str_req("command")?,
                category: p.str_opt("category"),
                run_mode: p.str_opt("run_mode"),
                task_runner_id: p.str_opt("task_runner_id"),
            };
            serde_json::to_value(engine.cmd_add(args).await?)
        }
        "cmd_list" => serde_json::to_value(engine.cmd_list(&p.str_req("project_id")?).await?),
        "cmd_remove" => {
            engine
                .cmd_remove(
                    p.i64_req("id")?,
                    p.bool_default("force", false),
                    p.str_opt("reason"),
                )
                .await?;
            serde_json::to_value(serde_json::json!({ "ok": true }))
        }
        "cmd_update" => {
            let args = CmdUpdateArgs {
                id: p.i64_req("id")?,
                command: p.str_opt("command"),
                category: p.str_opt("category"),
                run_mode: p.str_opt("run_mode"),
                task_runner_id: p.str_opt("task_runner_id"),
                force: p.bool_default("force", false),
                reason: p.str_opt("reason"),
            };
            serde_json::to_value(engine.cmd_update(args).await?)
        }
        "cmd_lock" => {
            serde_json::to_value(
                engine
                    .cmd_lock(p.i64_req("id")?, p.str_req("locked_by")?)
                    .await?,
            )
        }
        "cmd_unlock" => serde_json::to_value(engine.cmd_unlock(p.i64_req("id")?).await?),
        "cmd_run" => {
            let args = CmdRunArgs {
                id: p.i64_opt("id"),
                project_id: p.str_opt("project_id"),
                label: p.str_opt("label"),
                task_id: p.i64_opt("task_id"),
                timeout_ms: p.i64_opt("timeout_ms").map(|n| n as u64),
            };
            serde_json::to_value(engine.cmd_run(args).await?)
        }

        // Tasks
        "task_add" => {
            let args = TaskAddArgs {
                project_id: p.str_req("project_id")?,
                title: p.str_req("title")?,
                description: p.str_opt("description"),
                task_type: p.str_opt("task_type").unwrap_or_else(|| "feature".into()),
                priority: p.i32_opt("priority"),
                requires_branching: p.bool_opt("requires_branching"),
                requires_human_review: p.bool_opt("requires_human_review"),
            };
            serde_json::to_value(engine.task_add(args).await?)
        }
        "task_get" => serde_json::to_value(engine.task_get(p.i64_req("id")?).await?),
        "task_list" => serde_json::to_value(engine.task_list(&p.str_req("project_id")?).await?),
        "task_update" => {
            let args = TaskUpdateArgs {
                id: p.i64_req("id")?,
                title: p.str_opt("title"),
                description: p.str_opt("description"),
                priority: p.i32_opt("priority"),
                phase: p.str_opt("phase"),
                assigned_model: p.str_opt("assigned_model"),
                dev_server_url: p.str_opt("dev_server_url"),
                review_notes: p.str_opt("review_notes"),
                review_feedback: p.str_opt("review_feedback"),
            };
            serde_json::to_value(engine.task_update(args).await?)
        }
        "task_next" => serde_json::to_value(engine.task_next(&p.str_req("project_id")?).await?),
        "task_start" => serde_json::to_value(engine.task_start(transition_args(&p)?).await?),
        "task_request_review" => {
            serde_json::to_value(engine.task_request_review(transition_args(&p)?).await?)
        }
        "task_approve" => serde_json::to_value(engine.task_approve(transition_args(&p)?).await?),
        "task_request_changes" => {
            serde_json::to_value(engine.task_request_changes(transition_args(&p)?).await?)
        }
        "task_merge" => serde_json::to_value(engine.task_merge(transition_args(&p)?).await?),
        "task_resolve_conflict" => {
            serde_json::to_value(engine.task_resolve_conflict(transition_args(&p)?).await?)
        }
        "task_build" => serde_json::to_value(engine.task_build(transition_args(&p)?).await?),
        "task_deploy" => serde_json::to_value(engine.task_deploy(transition_args(&p)?).await?),
        "task_complete" => serde_json::to_value(engine.task_complete(transition_args(&p)?).await?),
        "task_cancel" => serde_json::to_value(engine.task_cancel(transition_args(&p)?).await?),
        "task_block" => {
            let args = TaskBlockArgs {
                id: p.i64_req("id")?,
                actor: p.str_opt("actor"),
                reason: p.str_opt("reason"),
                block_reason: p.str_opt("block_reason"),
            };
            serde_json::to_value(engine.task_block(args).await?)
        }
        "task_unblock" => serde_json::to_value(engine.task_unblock(transition_args(&p)?).await?),

        // Task dependencies
        "task_dep_add" => {
            engine
                .task_dep_add(p.i64_req("task_id")?, p.i64_req("depends_on_id")?)
                .await?;
            serde_json::to_value(serde_json::json!({ "ok": true }))
        }
        "task_dep_remove" => {
            engine
                .task_dep_remove(p.i64_req("task_id")?, p.i64_req("depends_on_id")?)
                .await?;
            serde_json::to_value(serde_json::json!({ "ok": true }))
        }
        "task_dep_list" => serde_json::to_value(engine.task_dep_list(p.i64_req("task_id")?).await?),

        // Memory
        "memory_add" => serde_json::to_value(
            engine
                .memory_add(
                    &p.str_req("project_id")?,
                    &p.str_req("category")?,
                    &p.str_req("content")?,
                )
                .await?,
        ),
        "memory_list" => serde_json::to_value(
            engine
                .memory_list(&p.str_req("project_id")?, p.i64_opt("limit").unwrap_or(50))
                .await?,
        ),
        "memory_remove" => {
            engine.memory_remove(p.i64_req("id")?).await?;
            serde_json::to_value(serde_json::json!({ "ok": true }))
        }

        other => return Err(EngineError::UnknownAction(other.to_string())),
    };

    result.map_err(|e| EngineError::External(e.into()))
}

fn transition_args(p: &Params<'_>) -> EngineResult<TaskTransitionArgs> {
    Ok(TaskTransitionArgs {
        id: p.i64_req("id")?,
        actor: p.str_opt("actor"),
        reason: p.str_opt("reason"),
    })
}
