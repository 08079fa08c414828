use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Set to any non-empty value to force debug tracing
pub const DEBUG_ENV: &str = "CODESTREAM_DEBUG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub git: GitConfig,
    pub repositories: Vec<RepositoryMapping>,
    pub trace_level: TraceLevel,
}

/// Collaboration server connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "https://api.codestream.com".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Path or name of the git executable
    pub path: PathBuf,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("git"),
        }
    }
}

/// A server repository id and its local checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMapping {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Silent,
    #[default]
    Errors,
    Verbose,
    Debug,
}

impl TraceLevel {
    /// `EnvFilter` directive for this level
    pub fn filter_directive(&self) -> &'static str {
        match self {
            TraceLevel::Silent => "off",
            TraceLevel::Errors => "warn",
            TraceLevel::Verbose => "info",
            TraceLevel::Debug => "debug",
        }
    }

    /// `Debug` when the override variable is set, otherwise `self`
    pub fn with_override(self, debug_env: Option<&str>) -> Self {
        match debug_env {
            Some(value) if !value.is_empty() => TraceLevel::Debug,
            _ => self,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::read_file(path)?;
        Ok(Self::log_loaded(path, config))
    }

    /// Parse `path` without logging; `None` when the file does not exist
    pub fn read_file(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(Some(config))
    }

    /// Report the outcome of `read_file`, falling back to defaults
    pub fn log_loaded(path: &Path, config: Option<Self>) -> Self {
        match config {
            Some(config) => {
                info!(
                    path = %path.display(),
                    repositories = config.repositories.len(),
                    "Loaded configuration"
                );
                config
            }
            None => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from the default location (.codestream/agent.yml)
    pub fn load_default() -> Result<Self> {
        Self::load(".codestream/agent.yml")
    }

    /// Configured trace level, forced to debug by `CODESTREAM_DEBUG`
    pub fn effective_trace_level(&self) -> TraceLevel {
        let debug_env = std::env::var(DEBUG_ENV).ok();
        self.trace_level.with_override(debug_env.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.git.path, PathBuf::from("git"));
        assert_eq!(config.trace_level, TraceLevel::Errors);
        assert!(config.repositories.is_empty());
        assert!(config.server.token.is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  url: https://codestream.example.com
  token: secret

git:
  path: /usr/local/bin/git

repositories:
  - id: repo1
    path: /work/app
  - id: repo2
    path: /work/lib

trace_level: verbose
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.url, "https://codestream.example.com");
        assert_eq!(config.server.token.as_deref(), Some("secret"));
        assert_eq!(config.git.path, PathBuf::from("/usr/local/bin/git"));
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.repositories[1].id, "repo2");
        assert_eq!(config.trace_level, TraceLevel::Verbose);
    }

    #[test]
    fn test_push_keys_are_not_config() {
        let yaml = "pubsub:\n  subscribe_key: sub\n  auth_key: auth\ntrace_level: debug\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.trace_level, TraceLevel::Debug);

        let rendered = serde_yaml::to_string(&config).unwrap();
        assert!(!rendered.contains("pubsub"));
    }

    #[test]
    fn test_trace_level_directives() {
        assert_eq!(TraceLevel::Silent.filter_directive(), "off");
        assert_eq!(TraceLevel::Errors.filter_directive(), "warn");
        assert_eq!(TraceLevel::Verbose.filter_directive(), "info");
        assert_eq!(TraceLevel::Debug.filter_directive(), "debug");
    }

    #[test]
    fn test_debug_override() {
        assert_eq!(TraceLevel::Silent.with_override(Some("1")), TraceLevel::Debug);
        assert_eq!(TraceLevel::Silent.with_override(Some("")), TraceLevel::Silent);
        assert_eq!(TraceLevel::Verbose.with_override(None), TraceLevel::Verbose);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("agent.yml")).unwrap();
        assert_eq!(config.trace_level, TraceLevel::Errors);
    }

    #[test]
    fn test_read_file_distinguishes_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("agent.yml");
        assert!(Config::read_file(&missing).unwrap().is_none());

        fs::write(&missing, "trace_level: debug\n").unwrap();
        let config = Config::read_file(&missing).unwrap().unwrap();
        assert_eq!(config.trace_level, TraceLevel::Debug);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "trace_level: silent\nrepositories:\n  - id: r1\n    path: /tmp/r1").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.trace_level, TraceLevel::Silent);
        assert_eq!(
            config.repositories,
            vec![RepositoryMapping {
                id: "r1".to_string(),
                path: PathBuf::from("/tmp/r1"),
            }]
        );
    }

    #[test]
    fn test_load_invalid_yaml_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "trace_level: [not, a, level]").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
