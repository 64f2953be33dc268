//! Runtime configuration types.
//!
//! Loaded from a `console.toml`; every field has a default so an empty (or
//! missing) file gives the stock runtime.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Write a compiled `.dso` next to each executed script.
    pub write_dso: bool,
    /// Extension appended to a script path to find its compiled cache.
    pub dso_extension: String,
    /// Script call depth at which execution is aborted.
    pub max_call_depth: usize,
    /// Log every executed instruction at `trace` level.
    pub trace_exec: bool,
    pub debugger: DebuggerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            write_dso: true,
            dso_extension: ".dso".to_string(),
            max_call_depth: 1024,
            trace_exec: false,
            debugger: DebuggerConfig::default(),
        }
    }
}

/// `[debugger]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub port: u16,
    pub password: String,
    /// Block the first script execution until a client has authenticated.
    pub wait_for_client: bool,
    /// Sleep between polls of the link while paused at a breakpoint.
    pub poll_interval_ms: u64,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            port: 28040,
            password: String::new(),
            wait_for_client: false,
            poll_interval_ms: 10,
        }
    }
}

impl DebuggerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl RuntimeConfig {
    /// Native stack for the console thread. Script calls run in one loop,
    /// but `eval`, `exec` and `onAdd` callbacks re-enter it per level.
    pub fn console_stack_size(&self) -> usize {
        const PER_LEVEL: usize = 16 * 1024;
        self.max_call_depth.saturating_mul(PER_LEVEL).max(8 << 20)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_partial_debugger_table() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            write_dso = false
            max_call_depth = 64

            [debugger]
            port = 4000
            password = "secret"
            "#,
        )
        .unwrap();
        assert!(!config.write_dso);
        assert_eq!(config.max_call_depth, 64);
        assert_eq!(config.dso_extension, ".dso");
        assert_eq!(config.debugger.port, 4000);
        assert_eq!(config.debugger.password, "secret");
        assert_eq!(config.debugger.poll_interval_ms, 10);
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.toml");
        std::fs::write(&path, "max_call_depth = \"deep\"").unwrap();
        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("console.toml"));
    }

    #[test]
    fn test_console_stack_grows_with_call_depth() {
        let config = RuntimeConfig::default();
        assert_eq!(config.console_stack_size(), 16 << 20);
        let shallow = RuntimeConfig {
            max_call_depth: 8,
            ..RuntimeConfig::default()
        };
        assert_eq!(shallow.console_stack_size(), 8 << 20);
    }
}
