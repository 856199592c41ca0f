//! Configuration for nbflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (NBFLOW_HOME, NBFLOW_EXECUTOR)
//! 2. Config file (.nbflow/config.yaml)
//! 3. Defaults (~/.nbflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .nbflow/config.yaml
//! - `paths.home` is relative to the .nbflow/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::RetryBackoff;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_EXECUTOR: &str = "nbflow-exec";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub retry: Option<RetryBackoff>,
    #[serde(default)]
    pub event_log: Option<EventLogConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .nbflow/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to nbflow home (run logs)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub executor: ExecutorSettings,
    pub retry: RetryBackoff,
    /// Write runs/<id>/events.jsonl
    pub event_log_enabled: bool,
}

/// Program that executes one notebook per job attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_EXECUTOR.to_string(),
            args: Vec::new(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".nbflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed config file with the environment
fn resolve(config: Option<(&Path, ConfigFile)>, default_home: PathBuf) -> ResolvedConfig {
    let env_home = std::env::var("NBFLOW_HOME").ok().map(PathBuf::from);
    let env_executor = std::env::var("NBFLOW_EXECUTOR").ok();

    let Some((config_path, config)) = config else {
        let mut executor = ExecutorSettings::default();
        if let Some(program) = env_executor {
            executor.program = program;
        }
        return ResolvedConfig {
            home: env_home.unwrap_or(default_home),
            config_file: None,
            executor,
            retry: RetryBackoff::default(),
            event_log_enabled: true,
        };
    };

    let nbflow_dir = config_path.parent().unwrap_or(Path::new("."));
    let home = match (env_home, config.paths.home.as_deref()) {
        (Some(home), _) => home,
        (None, Some(home_path)) => resolve_path(nbflow_dir, home_path),
        (None, None) => default_home,
    };

    let mut executor = ExecutorSettings::default();
    if let Some(section) = config.executor {
        if let Some(program) = section.program {
            executor.program = program;
        }
        executor.args = section.args;
    }
    if let Some(program) = env_executor {
        executor.program = program;
    }

    ResolvedConfig {
        home,
        config_file: Some(config_path.to_path_buf()),
        executor,
        retry: config.retry.unwrap_or_default(),
        event_log_enabled: config.event_log.map(|e| e.enabled).unwrap_or(true),
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".nbflow");

    match find_config_file() {
        Some(config_path) => {
            let config = load_config_file(&config_path)?;
            Ok(resolve(Some((config_path.as_path(), config)), default_home))
        }
        None => Ok(resolve(None, default_home)),
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the nbflow home directory
pub fn nbflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($NBFLOW_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const FULL_CONFIG: &str = r#"
version: "1"
paths:
  home: ./state
executor:
  program: /opt/bin/run-notebook
  args: ["--quiet"]
retry:
  initial_delay_ms: 250
  max_delay_ms: 5000
event_log:
  enabled: false
"#;

    fn write_config(temp: &TempDir, content: &str) -> PathBuf {
        let nbflow_dir = temp.path().join(".nbflow");
        std::fs::create_dir_all(&nbflow_dir).unwrap();

        let config_path = nbflow_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", content).unwrap();
        config_path
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, FULL_CONFIG);

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1");
        assert_eq!(config.paths.home.as_deref(), Some("./state"));

        let executor = config.executor.unwrap();
        assert_eq!(executor.program.as_deref(), Some("/opt/bin/run-notebook"));
        assert_eq!(executor.args, vec!["--quiet"]);

        let retry = config.retry.unwrap();
        assert_eq!(retry.initial_delay_ms, 250);
        assert_eq!(retry.max_delay_ms, 5000);
        // Unset fields keep their defaults
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert!(!config.event_log.unwrap().enabled);
    }

    #[test]
    fn test_minimal_config_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "version: \"1\"");

        let config = load_config_file(&config_path).unwrap();
        assert!(config.paths.home.is_none());
        assert!(config.executor.is_none());
        assert!(config.retry.is_none());
    }

    #[test]
    fn test_resolve_from_file() {
        // Env overrides would make this test depend on the caller's shell
        if std::env::var("NBFLOW_HOME").is_ok() || std::env::var("NBFLOW_EXECUTOR").is_ok() {
            return;
        }

        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, FULL_CONFIG);
        let config = load_config_file(&config_path).unwrap();

        let resolved = resolve(Some((config_path.as_path(), config)), PathBuf::from("/unused"));
        assert_eq!(resolved.home, temp.path().join(".nbflow").join("state"));
        assert_eq!(resolved.config_file.as_deref(), Some(config_path.as_path()));
        assert_eq!(resolved.executor.program, "/opt/bin/run-notebook");
        assert_eq!(resolved.retry.initial_delay_ms, 250);
        assert!(!resolved.event_log_enabled);
    }

    #[test]
    fn test_resolve_defaults() {
        if std::env::var("NBFLOW_HOME").is_ok() || std::env::var("NBFLOW_EXECUTOR").is_ok() {
            return;
        }

        let resolved = resolve(None, PathBuf::from("/home/test/.nbflow"));
        assert_eq!(resolved.home, PathBuf::from("/home/test/.nbflow"));
        assert!(resolved.config_file.is_none());
        assert_eq!(resolved.executor, ExecutorSettings::default());
        assert_eq!(resolved.retry.initial_delay_ms, 1000);
        assert!(resolved.event_log_enabled);
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
