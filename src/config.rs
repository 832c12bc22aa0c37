//! Configuration for the ptyspawn front end

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pty::{SpawnRequest, WaitTimeout, WindowSize};

/// Program used when neither the config nor `$SHELL` names one
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Error type for loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Spawn settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program to run; `$SHELL` when unset
    pub program: Option<String>,
    /// Arguments after `argv[0]`
    pub args: Vec<String>,
    /// Working directory of the child
    pub cwd: Option<PathBuf>,
    /// Variables set on top of the base environment
    pub env: BTreeMap<String, String>,
    /// Start from this process's environment instead of an empty one
    pub inherit_env: bool,
    /// Initial columns; the calling terminal's size when unset
    pub cols: Option<u16>,
    /// Initial rows; the calling terminal's size when unset
    pub rows: Option<u16>,
    /// Give up waiting after this many milliseconds
    pub wait_timeout_ms: Option<u64>,
    /// Look a bare program name up in `PATH`
    pub search_path: bool,
    /// Report child setup failures instead of exiting 127
    pub report_setup_failures: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            inherit_env: true,
            cols: None,
            rows: None,
            wait_timeout_ms: None,
            search_path: true,
            report_setup_failures: false,
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// The configured program, else `$SHELL`, else [`FALLBACK_SHELL`]
    pub fn program(&self) -> String {
        self.program
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| FALLBACK_SHELL.to_string())
    }

    /// Geometry from the config, if both dimensions are set
    pub fn window_size(&self) -> Option<WindowSize> {
        match (self.cols, self.rows) {
            (Some(cols), Some(rows)) => Some(WindowSize::new(cols, rows)),
            _ => None,
        }
    }

    pub fn wait_timeout(&self) -> WaitTimeout {
        self.wait_timeout_ms
            .map(Duration::from_millis)
            .into()
    }

    /// Build a spawn request for the slave device `slave_name`
    pub fn to_request(&self, slave_name: &str) -> SpawnRequest {
        let mut request = SpawnRequest::new(self.program(), slave_name)
            .args(&self.args)
            .search_path(self.search_path)
            .report_setup_failures(self.report_setup_failures);

        if !self.inherit_env {
            request = request.env_clear();
        }
        for (key, value) in &self.env {
            request = request.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            request = request.current_dir(cwd);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.inherit_env);
        assert!(config.search_path);
        assert_eq!(config.window_size(), None);
        assert_eq!(config.wait_timeout(), WaitTimeout::Infinite);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{ "program": "/bin/bash", "cols": 100, "rows": 30 }"#)
            .unwrap();
        assert_eq!(config.program(), "/bin/bash");
        assert_eq!(config.window_size(), Some(WindowSize::new(100, 30)));
        assert!(config.inherit_env);
        assert!(config.args.is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = Config::default();
        config.program = Some("/bin/zsh".into());
        config.env.insert("TERM".into(), "xterm-256color".into());
        config.wait_timeout_ms = Some(1500);
        let text = config.to_json().unwrap();
        assert_eq!(Config::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "args": ["-l"], "wait_timeout_ms": 250 }}"#).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.args, vec!["-l".to_string()]);
        assert_eq!(
            config.wait_timeout(),
            WaitTimeout::Bounded(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_load_errors() {
        let err = Config::load(Path::new("/nonexistent/ptyspawn.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_to_request() {
        let mut config = Config::default();
        config.program = Some("/bin/sh".into());
        config.args = vec!["-c".into(), "exit 0".into()];
        config.inherit_env = false;
        config.env.insert("LANG".into(), "C".into());
        config.cwd = Some(PathBuf::from("/tmp"));

        let request = config.to_request("/dev/pts/9");
        assert_eq!(request.get_program(), "/bin/sh");
        assert_eq!(request.get_argv().len(), 3);
        assert_eq!(request.get_slave_name(), "/dev/pts/9");
        assert_eq!(
            request.get_env().unwrap(),
            &[(OsString::from("LANG"), OsString::from("C"))]
        );
        assert_eq!(request.get_current_dir(), Some(Path::new("/tmp")));
    }
}
