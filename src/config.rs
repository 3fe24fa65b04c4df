//! Engine Configuration
//!
//! Every field has a default, so a configuration file only names what it
//! changes:
//!
//! ```toml
//! hotness_threshold = 500
//! jit_control = "always"
//! backend = "threaded"
//! default_opt_level = 1
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::bytecode::jit::profile::{BACKEDGE_WEIGHT, HOT_THRESHOLD};
use crate::backend::bytecode::jit::types::{BackendKind, JitControl};

/// Engine-wide tiering and execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hotness at which a unit is promoted
    pub hotness_threshold: u64,
    /// Hotness added per backward jump
    pub backedge_weight: u64,
    /// Automatic promotion policy
    pub jit_control: JitControl,
    /// Level used for automatic promotion (0, 1 or 2)
    pub default_opt_level: i32,
    pub backend: BackendKind,
    /// Fatal bails a unit tolerates before it is permanently interpreted
    pub max_fatal_bails: u32,
    /// Observations a branch needs before level 2 speculates on it
    pub branch_min_samples: u64,
    /// Raise `RuntimeError` at guard bails instead of resuming silently
    pub bail_error: bool,
    /// Maximum depth of nested calls
    pub recursion_limit: usize,
    /// Record timing events from the start
    pub record_events: bool,
    /// Events kept by the event timer
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            hotness_threshold: HOT_THRESHOLD,
            backedge_weight: BACKEDGE_WEIGHT,
            jit_control: JitControl::WhenHot,
            default_opt_level: 2,
            backend: BackendKind::Auto,
            max_fatal_bails: 1,
            branch_min_samples: 200,
            bail_error: false,
            recursion_limit: 1000,
            record_events: false,
            event_capacity: 1 << 16,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(ConfigError::Serialize)
    }

    pub fn with_threshold(mut self, hotness_threshold: u64) -> Self {
        self.hotness_threshold = hotness_threshold;
        self
    }

    pub fn with_jit_control(mut self, jit_control: JitControl) -> Self {
        self.jit_control = jit_control;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_opt_level(mut self, level: i32) -> Self {
        self.default_opt_level = level;
        self
    }

    pub fn with_events(mut self, on: bool) -> Self {
        self.record_events = on;
        self
    }
}

/// Failure to read or parse a configuration
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse(e) => write!(f, "Invalid configuration: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Serialize(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.hotness_threshold, 10_000);
        assert_eq!(config.backedge_weight, 10);
        assert_eq!(config.jit_control, JitControl::WhenHot);
        assert_eq!(config.max_fatal_bails, 1);
        assert!(!config.bail_error);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            hotness_threshold = 50
            jit_control = "always"
            backend = "threaded"
            "#,
        )
        .unwrap();
        assert_eq!(config.hotness_threshold, 50);
        assert_eq!(config.jit_control, JitControl::Always);
        assert_eq!(config.backend, BackendKind::Threaded);
        assert_eq!(config.default_opt_level, 2);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::default().with_threshold(7).with_backend(BackendKind::Cranelift);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_toml() {
        let err = EngineConfig::from_toml_str("jit_control = \"sometimes\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("Invalid configuration"));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load("/nonexistent/tiervm.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
