use std::collections::HashMap;

/// Storage connection settings, assembled once and handed to the pool
/// builder. Not flags: environment/`.env`-driven, matching the rest of
/// the crate's configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub pool_max_size: usize,
    pub keepalives: bool,
    pub keepalives_idle_secs: u64,
}

/// Process Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Base directory for `state.json`, `logs/`, `pids/`.
    pub base_dir: String,
    pub max_log_size_bytes: u64,
    pub default_stop_timeout_ms: u64,
    /// cwd prefixes a spawned task's working directory must fall under.
    pub allowed_cwds: Vec<String>,
    /// Environment variable names stripped from the child's inherited env.
    pub blocked_env_vars: Vec<String>,
}

/// Full application configuration loaded from environment / `.env` file.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub supervisor: SupervisorConfig,

    // Server
    pub web_bind: String,
    pub web_port: u16,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_list(key: &str, dotenv: &HashMap<String, String>, default: &[&str]) -> Vec<String> {
    match get(key, dotenv) {
        Some(raw) if !raw.is_empty() => raw.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn resolve_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

impl Config {
    /// Load configuration from process environment, falling back to a
    /// `.env` file in the current directory, then to documented defaults.
    pub fn from_env() -> Self {
        let dotenv = parse_dotenv();

        let storage = StorageConfig {
            host: get_str("TASKFORGE_DB_HOST", &dotenv, "localhost"),
            port: get_u16("TASKFORGE_DB_PORT", &dotenv, 5432),
            user: get_str("TASKFORGE_DB_USER", &dotenv, "taskforge"),
            password: get_str("TASKFORGE_DB_PASSWORD", &dotenv, ""),
            dbname: get_str("TASKFORGE_DB_NAME", &dotenv, "taskforge"),
            pool_max_size: get_usize("TASKFORGE_DB_POOL_MAX", &dotenv, 10),
            keepalives: get_bool("TASKFORGE_DB_KEEPALIVES", &dotenv, true),
            keepalives_idle_secs: get_u64("TASKFORGE_DB_KEEPALIVES_IDLE_S", &dotenv, 30),
        };

        let base_dir = resolve_tilde(&get_str(
            "TASKFORGE_SUPERVISOR_DIR",
            &dotenv,
            "~/.taskforge/supervisor",
        ));

        let supervisor = SupervisorConfig {
            base_dir,
            max_log_size_bytes: get_u64("TASKFORGE_MAX_LOG_BYTES", &dotenv, 10 * 1024 * 1024),
            default_stop_timeout_ms: get_u64("TASKFORGE_STOP_TIMEOUT_MS", &dotenv, 5000),
            allowed_cwds: get_list("TASKFORGE_ALLOWED_CWDS", &dotenv, &["/"]),
            blocked_env_vars: get_list(
                "TASKFORGE_BLOCKED_ENV_VARS",
                &dotenv,
                &["AWS_SECRET_ACCESS_KEY", "TASKFORGE_DB_PASSWORD"],
            ),
        };

        Self {
            storage,
            supervisor,
            web_bind: get_str("TASKFORGE_WEB_BIND", &dotenv, "0.0.0.0"),
            web_port: get_u16("TASKFORGE_WEB_PORT", &dotenv, 8787),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_tilde_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(resolve_tilde("~/.taskforge"), "/home/tester/.taskforge");
        assert_eq!(resolve_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn get_list_splits_and_trims() {
        let mut dotenv = HashMap::new();
        dotenv.insert("X".to_string(), "a, b ,c".to_string());
        assert_eq!(
            get_list("X", &dotenv, &[]),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
