use std::path::{Path, PathBuf};

use miette::Diagnostic;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::IdAllocator;

/// File name of the project configuration inside a project directory.
pub const CONFIG_FILE_NAME: &str = "project.toml";

/// Project configuration, read from `project.toml`.
///
/// Every section is optional; missing keys take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    pub identity: IdentitySection,
    pub graph: GraphSection,
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct ProjectSection {
    pub name: String,
    pub description: Option<String>,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: "untitled".to_string(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    /// Random v4 uuids.
    #[default]
    Random,
    /// Monotonic uuids; reproducible fixtures only.
    Sequential,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct IdentitySection {
    pub allocator: AllocatorKind,
}

impl IdentitySection {
    pub fn allocator(&self) -> IdAllocator {
        match self.allocator {
            AllocatorKind::Random => IdAllocator::Random,
            AllocatorKind::Sequential => IdAllocator::sequential(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct GraphSection {
    /// Fail loads that leave dangling references instead of nulling them.
    pub strict_references: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct StorageSection {
    /// Keep the previous blob as `<file>.bak` on every write.
    pub keep_backups: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self { keep_backups: true }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    #[diagnostic(
        code(config::not_found),
        help("Create a 'project.toml' file in the project directory")
    )]
    NotFound(PathBuf),

    #[error("failed to parse config: {0}")]
    #[diagnostic(code(config::parse_error))]
    ParseError(#[from] toml::de::Error),

    #[error("failed to write config: {0}")]
    #[diagnostic(code(config::serialize_error))]
    SerializeError(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    #[diagnostic(code(config::io_error))]
    IoError(#[from] std::io::Error),
}

impl ProjectConfig {
    pub fn new(name: &str) -> Self {
        Self {
            project: ProjectSection {
                name: name.to_string(),
                description: None,
            },
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Loads `project.toml` from `dir`, or the defaults when there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        match Self::load(&dir.join(CONFIG_FILE_NAME)) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ProjectConfig)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
