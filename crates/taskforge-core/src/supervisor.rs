//! Process Supervisor: spawns, tracks, stops, and restarts long-lived
//! child processes behind durable, machine-identified handles. State
//! survives a restart of the supervisor itself (`init()` reconciles
//! orphaned records against the live process table).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::fs as tfs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::types::{ProcStatus, SupervisorState, TaskRecord};

/// Everything the caller provides to start a new supervised task.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub id: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub tags: Vec<String>,
    pub project_id: Option<String>,
    pub replace: bool,
    pub force: bool,
    pub force_by_tags: bool,
    pub attach_stdin: bool,
    pub stop_timeout_ms: Option<u64>,
}

/// Tail/offset options for `logs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogsQuery {
    pub tail_bytes: Option<u64>,
    pub since_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
}

struct LiveHandle {
    stdin: AsyncMutex<Option<tokio::process::ChildStdin>>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    state: Arc<AsyncMutex<SupervisorState>>,
    live: Arc<AsyncMutex<HashMap<String, Arc<LiveHandle>>>>,
}

fn pid_alive(pid: i32) -> bool {
    // Signal 0 performs no-op existence/permission checks. ESRCH means the
    // pid is gone; anything else (including EPERM) means it's still there.
    unsafe { libc::kill(pid, 0) == 0 || *libc::__errno_location() != libc::ESRCH }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: Arc::new(AsyncMutex::new(SupervisorState::default())),
            live: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    fn state_path(&self) -> PathBuf {
        Path::new(&self.config.base_dir).join("state.json")
    }

    fn log_path(&self, id: &str) -> PathBuf {
        Path::new(&self.config.base_dir).join("logs").join(format!("{id}.log"))
    }

    fn pid_path(&self, id: &str) -> PathBuf {
        Path::new(&self.config.base_dir).join("pids").join(format!("{id}.pid"))
    }

    async fn persist_locked(&self, state: &mut SupervisorState) -> Result<()> {
        state.updated_at = Utc::now();
        let base = Path::new(&self.config.base_dir);
        tfs::create_dir_all(base).await.context("create supervisor base dir")?;
        let serialized = serde_json::to_vec_pretty(state).context("serialize supervisor state")?;
        let tmp_path = base.join("state.json.tmp");
        tfs::write(&tmp_path, &serialized).await.context("write supervisor state tmp file")?;
        tfs::rename(&tmp_path, self.state_path())
            .await
            .context("atomically rename supervisor state file")?;
        Ok(())
    }

    /// Idempotent. Reads the state file, reconciles every non-terminal
    /// task against the live process table (dead pids become `lost`),
    /// resets `stdin_attached`, and writes back if anything changed.
    pub async fn init(&self) -> Result<()> {
        let path = self.state_path();
        let loaded = match tfs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<SupervisorState>(&bytes)
                .context("parse supervisor state file")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SupervisorState::default(),
            Err(e) => return Err(e).context("read supervisor state file"),
        };

        let mut state = self.state.lock().await;
        *state = loaded;

        let mut mutated = false;
        for record in state.tasks.values_mut() {
            if record.stdin_attached {
                record.stdin_attached = false;
                mutated = true;
            }
            if record.status.is_terminal() {
                continue;
            }
            let alive = record.pid.map(|pid| pid_alive(pid as i32)).unwrap_or(false);
            if !alive {
                warn!(task_id = %record.id, "supervisor: reconciling dead pid to lost");
                record.status = ProcStatus::Lost;
                record.ended_at = Some(Utc::now());
                record.updated_at = Utc::now();
                mutated = true;
            }
        }

        if mutated {
            self.persist_locked(&mut state).await?;
        }
        Ok(())
    }

    fn ensure_cwd_allowed(&self, cwd: &str) -> Result<()> {
        let allowed = self
            .config
            .allowed_cwds
            .iter()
            .any(|prefix| cwd.starts_with(prefix.as_str()));
        if !allowed {
            bail!("cwd {cwd} is not within an allowed prefix");
        }
        Ok(())
    }

    fn filtered_env(&self, extra: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| !self.config.blocked_env_vars.iter().any(|b| b == k))
            .collect();
        env.extend(extra.clone());
        env
    }

    pub async fn start(&self, req: StartRequest) -> Result<TaskRecord> {
        let id = req.id.clone().unwrap_or_else(generate_id);

        if req.force_by_tags && !req.tags.is_empty() {
            let victims: Vec<String> = {
                let state = self.state.lock().await;
                state
                    .tasks
                    .values()
                    .filter(|r| !r.status.is_terminal())
                    .filter(|r| r.tags.iter().any(|t| req.tags.contains(t)))
                    .map(|r| r.id.clone())
                    .collect()
            };
            for victim in victims {
                let _ = self.stop(&victim, self.config.default_stop_timeout_ms).await;
            }
        }

        {
            let existing = {
                let state = self.state.lock().await;
                state.tasks.get(&id).cloned()
            };
            if let Some(existing) = existing {
                if !existing.status.is_terminal() {
                    if !req.force {
                        bail!("Task already exists");
                    }
                    self.stop(&id, req.stop_timeout_ms.unwrap_or(self.config.default_stop_timeout_ms))
                        .await?;
                } else if !req.replace {
                    bail!("Task already exists");
                }
            }
        }

        let cwd = req
            .cwd
            .clone()
            .unwrap_or_else(|| self.config.base_dir.clone());
        self.ensure_cwd_allowed(&cwd)?;

        let log_path = self.log_path(&id);
        let pid_path = self.pid_path(&id);
        if let Some(parent) = log_path.parent() {
            tfs::create_dir_all(parent).await.context("create logs dir")?;
        }
        if let Some(parent) = pid_path.parent() {
            tfs::create_dir_all(parent).await.context("create pids dir")?;
        }

        let mut command = Command::new("bash");
        command.arg("-lc").arg(&req.command);
        command.current_dir(&cwd);
        command.env_clear();
        command.envs(self.filtered_env(&req.env));
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.stdin(if req.attach_stdin {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        });

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn task {id}: {}", req.command))?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tfs::write(&pid_path, pid.unwrap_or_default().to_string())
            .await
            .context("write pid file")?;

        let now = Utc::now();
        let record = TaskRecord {
            id: id.clone(),
            status: ProcStatus::Running,
            pid,
            command: req.command.clone(),
            args: req.args.clone(),
            cwd: Some(cwd.clone()),
            env: req.env.clone().into_iter().collect(),
            tags: req.tags.clone(),
            project_id: req.project_id.clone(),
            created_at: now,
            started_at: Some(now),
            ended_at: None,
            updated_at: now,
            exit_code: None,
            exit_signal: None,
            log_path: log_path.to_string_lossy().into_owned(),
            pid_path: Some(pid_path.to_string_lossy().into_owned()),
            stdin_attached: req.attach_stdin,
        };

        {
            let mut state = self.state.lock().await;
            state.tasks.insert(id.clone(), record.clone());
            self.persist_locked(&mut state).await?;
        }

        self.live.lock().await.insert(
            id.clone(),
            Arc::new(LiveHandle {
                stdin: AsyncMutex::new(stdin),
            }),
        );

        self.spawn_log_pump(id.clone(), stdout, stderr, log_path.clone());
        self.spawn_waiter(id.clone(), child);

        info!(task_id = %id, pid, command = %req.command, "supervisor: started task");
        Ok(record)
    }

    fn spawn_log_pump(
        &self,
        id: String,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
        log_path: PathBuf,
    ) {
        let max_bytes = self.config.max_log_size_bytes;
        tokio::spawn(async move {
            let mut file = match tfs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!(task_id = %id, "supervisor: could not open log file: {e}");
                    return;
                }
            };

            let mut buf = [0u8; 4096];
            let mut stdout = stdout;
            let mut stderr = stderr;
            loop {
                let mut progressed = false;
                if let Some(out) = stdout.as_mut() {
                    match out.read(&mut buf).await {
                        Ok(0) => stdout = None,
                        Ok(n) => {
                            progressed = true;
                            let _ = file.write_all(&buf[..n]).await;
                        }
                        Err(_) => stdout = None,
                    }
                }
                if let Some(err) = stderr.as_mut() {
                    match err.read(&mut buf).await {
                        Ok(0) => stderr = None,
                        Ok(n) => {
                            progressed = true;
                            let _ = file.write_all(&buf[..n]).await;
                        }
                        Err(_) => stderr = None,
                    }
                }
                if stdout.is_none() && stderr.is_none() {
                    break;
                }
                if !progressed {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
            let _ = file.flush().await;
            let _ = truncate_log_if_oversized(&log_path, max_bytes).await;
        });
    }

    fn spawn_waiter(&self, id: String, mut child: Child) {
        let state = Arc::clone(&self.state);
        let live = Arc::clone(&self.live);
        let base_dir = self.config.base_dir.clone();
        tokio::spawn(async move {
            let wait_result = child.wait().await;
            live.lock().await.remove(&id);

            let (status, exit_code, exit_signal) = match wait_result {
                Ok(exit_status) => {
                    #[cfg(unix)]
                    let signal = std::os::unix::process::ExitStatusExt::signal(&exit_status);
                    #[cfg(not(unix))]
                    let signal: Option<i32> = None;

                    let status = match signal {
                        Some(libc::SIGKILL) => ProcStatus::Killed,
                        Some(libc::SIGTERM) => ProcStatus::Stopped,
                        Some(_) => ProcStatus::Failed,
                        None if exit_status.success() => ProcStatus::Stopped,
                        None => ProcStatus::Failed,
                    };
                    (status, exit_status.code(), signal)
                }
                Err(e) => {
                    warn!(task_id = %id, "supervisor: wait() failed: {e}");
                    (ProcStatus::Lost, None, None)
                }
            };

            let mut state = state.lock().await;
            if let Some(record) = state.tasks.get_mut(&id) {
                record.status = status;
                record.exit_code = exit_code;
                record.exit_signal = exit_signal;
                record.ended_at = Some(Utc::now());
                record.updated_at = Utc::now();
            }
            let base = Path::new(&base_dir);
            let serialized = serde_json::to_vec_pretty(&*state).unwrap_or_default();
            let tmp_path = base.join("state.json.tmp");
            if tfs::write(&tmp_path, &serialized).await.is_ok() {
                let _ = tfs::rename(&tmp_path, base.join("state.json")).await;
            }
        });
    }

    pub async fn stop(&self, id: &str, timeout_ms: u64) -> Result<TaskRecord> {
        let pid = {
            let state = self.state.lock().await;
            let record = state
                .tasks
                .get(id)
                .ok_or_else(|| anyhow!("Task not found: {id}"))?;
            if record.status.is_terminal() {
                return Ok(record.clone());
            }
            record.pid.ok_or_else(|| anyhow!("task {id} has no pid"))?
        };

        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(record) = self.status(id).await? {
                if record.status.is_terminal() {
                    return Ok(record);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut state = self.state.lock().await;
        if let Some(record) = state.tasks.get_mut(id) {
            if !record.status.is_terminal() {
                record.status = ProcStatus::Killed;
                record.ended_at = Some(Utc::now());
                record.updated_at = Utc::now();
            }
            let record = record.clone();
            self.persist_locked(&mut state).await?;
            return Ok(record);
        }
        Err(anyhow!("Task not found: {id}"))
    }

    pub async fn restart(&self, id: &str) -> Result<TaskRecord> {
        let existing = {
            let state = self.state.lock().await;
            state
                .tasks
                .get(id)
                .cloned()
                .ok_or_else(|| anyhow!("Task not found: {id}"))?
        };
        self.start(StartRequest {
            id: Some(existing.id),
            command: existing.command,
            args: existing.args,
            cwd: existing.cwd,
            env: existing.env.into_iter().collect(),
            tags: existing.tags,
            project_id: existing.project_id,
            replace: true,
            force: true,
            force_by_tags: false,
            attach_stdin: existing.stdin_attached,
            stop_timeout_ms: None,
        })
        .await
    }

    pub async fn status(&self, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.state.lock().await.tasks.get(id).cloned())
    }

    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.state.lock().await.tasks.values().cloned().collect())
    }

    pub async fn wait(&self, id: &str, timeout_ms: u64) -> Result<TaskRecord> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let record = self
                .status(id)
                .await?
                .ok_or_else(|| anyhow!("Task not found: {id}"))?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(record);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn logs(&self, id: &str, query: LogsQuery) -> Result<String> {
        let log_path = {
            let state = self.state.lock().await;
            let record = state
                .tasks
                .get(id)
                .ok_or_else(|| anyhow!("Task not found: {id}"))?;
            record.log_path.clone()
        };

        let mut bytes = match tfs::read(&log_path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context("read log file"),
        };

        if let Some(since) = query.since_bytes {
            let since = since as usize;
            if since < bytes.len() {
                bytes = bytes[since..].to_vec();
            } else {
                bytes.clear();
            }
        } else if let Some(tail) = query.tail_bytes {
            let tail = tail as usize;
            if bytes.len() > tail {
                let start = bytes.len() - tail;
                bytes = bytes[start..].to_vec();
            }
        }

        if let Some(max) = query.max_bytes {
            bytes.truncate(max as usize);
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn write(&self, id: &str, data: &[u8]) -> Result<()> {
        let attached = {
            let state = self.state.lock().await;
            let record = state
                .tasks
                .get(id)
                .ok_or_else(|| anyhow!("Task not found: {id}"))?;
            record.stdin_attached
        };
        if !attached {
            bail!("task {id} has no attached stdin");
        }

        let live = self.live.lock().await;
        let handle = live
            .get(id)
            .ok_or_else(|| anyhow!("task {id} is not running"))?;
        let mut stdin = handle.stdin.lock().await;
        if let Some(stdin) = stdin.as_mut() {
            stdin.write_all(data).await.context("write to task stdin")?;
            Ok(())
        } else {
            bail!("task {id} has no attached stdin")
        }
    }

    /// Remove terminal records whose `ended_at` is older than the cutoff.
    /// `older_than_ms == 0` prunes every terminal record.
    pub async fn prune(&self, older_than_ms: u64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than_ms as i64);
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, record| {
            if !record.status.is_terminal() {
                return true;
            }
            if older_than_ms == 0 {
                return false;
            }
            match record.ended_at {
                Some(ended_at) => ended_at >= cutoff,
                None => true,
            }
        });
        let removed = before - state.tasks.len();
        if removed > 0 {
            self.persist_locked(&mut state).await?;
        }
        Ok(removed)
    }
}

async fn truncate_log_if_oversized(path: &Path, max_bytes: u64) -> Result<()> {
    let metadata = tfs::metadata(path).await?;
    if metadata.len() <= max_bytes {
        return Ok(());
    }
    let contents = tfs::read(path).await?;
    let keep_from = contents.len().saturating_sub(max_bytes as usize);
    tfs::write(path, &contents[keep_from..]).await?;
    Ok(())
}

fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base: &Path) -> SupervisorConfig {
        SupervisorConfig {
            base_dir: base.to_string_lossy().into_owned(),
            max_log_size_bytes: 1024 * 1024,
            default_stop_timeout_ms: 1000,
            allowed_cwds: vec!["/".to_string()],
            blocked_env_vars: vec![],
        }
    }

    #[tokio::test]
    async fn init_reconciles_dead_pid_to_lost() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = test_config(tmp.path());
        let now = Utc::now();
        let mut state = SupervisorState::default();
        state.tasks.insert(
            "x".to_string(),
            TaskRecord {
                id: "x".to_string(),
                status: ProcStatus::Running,
                pid: Some(999_999),
                command: "sleep 100".to_string(),
                args: vec![],
                cwd: None,
                env: Default::default(),
                tags: vec![],
                project_id: None,
                created_at: now,
                started_at: Some(now),
                ended_at: None,
                updated_at: now,
                exit_code: None,
                exit_signal: None,
                log_path: tmp.path().join("logs/x.log").to_string_lossy().into_owned(),
                pid_path: None,
                stdin_attached: true,
            },
        );
        let serialized = serde_json::to_vec_pretty(&state).expect("serialize");
        tfs::write(tmp.path().join("state.json"), serialized)
            .await
            .expect("write state");

        let supervisor = Supervisor::new(config);
        supervisor.init().await.expect("init");

        let record = supervisor
            .status("x")
            .await
            .expect("status")
            .expect("record exists");
        assert_eq!(record.status, ProcStatus::Lost);
        assert!(!record.stdin_attached);
    }

    #[tokio::test]
    async fn start_then_stop_completes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = test_config(tmp.path());
        let supervisor = Supervisor::new(config);
        supervisor.init().await.expect("init");

        let record = supervisor
            .start(StartRequest {
                id: Some("t1".to_string()),
                command: "sleep 5".to_string(),
                cwd: Some(tmp.path().to_string_lossy().into_owned()),
                ..Default::default()
            })
            .await
            .expect("start");
        assert_eq!(record.status, ProcStatus::Running);

        let stopped = supervisor.stop("t1", 500).await.expect("stop");
        assert!(stopped.status.is_terminal());
    }

    #[tokio::test]
    async fn prune_removes_terminal_records() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = test_config(tmp.path());
        let supervisor = Supervisor::new(config);
        supervisor.init().await.expect("init");

        supervisor
            .start(StartRequest {
                id: Some("done-task".to_string()),
                command: "true".to_string(),
                cwd: Some(tmp.path().to_string_lossy().into_owned()),
                ..Default::default()
            })
            .await
            .expect("start");
        supervisor.wait("done-task", 2000).await.expect("wait");

        let removed = supervisor.prune(0).await.expect("prune");
        assert_eq!(removed, 1);
        assert!(supervisor.status("done-task").await.expect("status").is_none());
    }
}
