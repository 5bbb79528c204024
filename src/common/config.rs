//! Configuration system for the bytecode analysis backend

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::common::errors::ConfigError;

/// Main analyzer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Lifter configuration
    pub lifter: LifterConfig,

    /// Interprocedural engine configuration
    pub engine: EngineConfig,
}

impl AnalyzerConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let config: AnalyzerConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Policy for opcodes outside the supported set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnknownPolicy {
    /// Record a warning and continue lifting
    Warn,
    /// Abort the method
    Error,
}

/// Lifter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifterConfig {
    /// What to do with unknown opcodes
    pub unknown_opcodes: UnknownPolicy,

    /// Prefer source-level local names from the symbol resolver over
    /// metadata names
    pub use_source_local_names: bool,
}

impl Default for LifterConfig {
    fn default() -> Self {
        Self {
            unknown_opcodes: UnknownPolicy::Warn,
            use_source_local_names: true,
        }
    }
}

/// Interprocedural engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Resolve virtual callees against receiver points-to targets.
    /// Turning this off records static call edges only.
    pub devirtualize: bool,

    /// Propagate points-to state through constructor bodies at
    /// object-allocation sites
    pub analyze_constructors: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devirtualize: true,
            analyze_constructors: true,
        }
    }
}
