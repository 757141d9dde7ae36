//! Host Configuration
//!
//! Layered settings: an optional JSON file named by `LOOM_CONFIG`, then the
//! `LOOM_LOG` and `LOOM_MEMORY_LIMIT` environment variables, then the
//! command line (`loom <entry> [args...]`).

use std::path::{Path, PathBuf};

use loom_js::EngineConfig;
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_VAR: &str = "LOOM_CONFIG";
pub const LOG_VAR: &str = "LOOM_LOG";
pub const MEMORY_LIMIT_VAR: &str = "LOOM_MEMORY_LIMIT";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no entry script given (usage: loom <entry.js> [args...])")]
    MissingEntry,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

/// Settings for one run of the host
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Entry module path, relative to the working directory
    #[serde(skip)]
    pub entry: PathBuf,
    /// Arguments after the entry, exposed as `sys.args[1..]`
    #[serde(skip)]
    pub args: Vec<String>,
    /// `tracing` filter directive
    pub log_filter: String,
    /// Engine heap limit in bytes
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
    pub gc_threshold: Option<usize>,
    /// Keep the event loop running after an uncaught error
    pub keep_alive_on_error: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            entry: PathBuf::new(),
            args: Vec::new(),
            log_filter: "warn".to_string(),
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            keep_alive_on_error: false,
        }
    }
}

impl HostConfig {
    /// Configuration running `entry` with defaults for everything else
    pub fn new(entry: impl Into<PathBuf>) -> Self {
        Self {
            entry: entry.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_keep_alive_on_error(mut self, keep_alive: bool) -> Self {
        self.keep_alive_on_error = keep_alive;
        self
    }

    /// Build the configuration from the process environment and `args`
    /// (command line without the program name)
    pub fn load(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::load_with(args, |name| std::env::var(name).ok())
    }

    /// [`load`](Self::load) with an explicit environment lookup
    pub fn load_with(
        args: impl IntoIterator<Item = String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match env(CONFIG_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(env)?;

        let mut args = args.into_iter();
        config.entry = args.next().map(PathBuf::from).ok_or(ConfigError::MissingEntry)?;
        config.args = args.collect();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(filter) = env(LOG_VAR) {
            self.log_filter = filter;
        }
        if let Some(limit) = env(MEMORY_LIMIT_VAR) {
            let bytes = limit.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: MEMORY_LIMIT_VAR,
                value: limit.clone(),
            })?;
            self.memory_limit = Some(bytes);
        }
        Ok(())
    }

    /// `sys.args`: the entry path followed by the script arguments
    pub fn script_args(&self) -> Vec<String> {
        std::iter::once(self.entry.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default();
        if let Some(bytes) = self.memory_limit {
            engine = engine.with_memory_limit(bytes);
        }
        if let Some(bytes) = self.max_stack_size {
            engine = engine.with_max_stack_size(bytes);
        }
        if let Some(bytes) = self.gc_threshold {
            engine = engine.with_gc_threshold(bytes);
        }
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_entry_and_args_from_command_line() {
        let config = HostConfig::load_with(args(&["main.js", "--flag", "x"]), env(&[])).unwrap();
        assert_eq!(config.entry, PathBuf::from("main.js"));
        assert_eq!(config.args, args(&["--flag", "x"]));
        assert_eq!(config.script_args(), args(&["main.js", "--flag", "x"]));
        assert_eq!(config.log_filter, "warn");
    }

    #[test]
    fn test_missing_entry() {
        let error = HostConfig::load_with(Vec::new(), env(&[])).unwrap_err();
        assert!(matches!(error, ConfigError::MissingEntry));
    }

    #[test]
    fn test_environment_overrides() {
        let config = HostConfig::load_with(
            args(&["main.js"]),
            env(&[(LOG_VAR, "loom_js=debug"), (MEMORY_LIMIT_VAR, " 1048576 ")]),
        )
        .unwrap();
        assert_eq!(config.log_filter, "loom_js=debug");
        assert_eq!(config.memory_limit, Some(1048576));
        assert_eq!(config.engine_config().memory_limit, Some(1048576));
    }

    #[test]
    fn test_invalid_memory_limit() {
        let error = HostConfig::load_with(args(&["main.js"]), env(&[(MEMORY_LIMIT_VAR, "lots")])).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidValue { name: MEMORY_LIMIT_VAR, .. }));
    }

    #[test]
    fn test_config_file_then_environment() {
        let path = std::env::temp_dir().join(format!("loom-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "log_filter": "info", "max_stack_size": 2048, "keep_alive_on_error": true }"#)
            .unwrap();

        let path_str = path.to_string_lossy().into_owned();
        let config =
            HostConfig::load_with(args(&["main.js"]), env(&[(CONFIG_VAR, path_str.as_str()), (LOG_VAR, "trace")])).unwrap();
        assert_eq!(config.log_filter, "trace");
        assert_eq!(config.max_stack_size, Some(2048));
        assert!(config.keep_alive_on_error);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unknown_config_keys_rejected() {
        let path = std::env::temp_dir().join(format!("loom-config-bad-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "entry": "main.js" }"#).unwrap();
        let error = HostConfig::from_file(&path).unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
        std::fs::remove_file(&path).ok();
    }
}
