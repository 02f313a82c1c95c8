//! # Configuration
//!
//! Optional `ruleforge.toml`, looked up in the working directory unless
//! `--config` names a file. Every section and key may be omitted.
//!
//! ```toml
//! [registry]
//! context = "default"
//!
//! [reload]
//! reserved_segments = ["generated", "model"]
//!
//! [engine]
//! max_firings = 10000
//!
//! [logging]
//! format = "text"    # or "json"
//! ```

use ruleforge_core::KnowledgeError;
use ruleforge_core::primitives::{
    DEFAULT_LOADING_CONTEXT, DEFAULT_MAX_FIRINGS, RESERVED_PACKAGE_SEGMENTS,
};
use ruleforge_core::{LoadingContext, ReloadPolicy};
use serde::Deserialize;
use std::path::Path;

/// File looked up when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "ruleforge.toml";

/// Maximum configuration file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub registry: RegistryConfig,
    pub reload: ReloadConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Loading context of every registry the CLI creates.
    pub context: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            context: DEFAULT_LOADING_CONTEXT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReloadConfig {
    pub reserved_segments: Vec<String>,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            reserved_segments: RESERVED_PACKAGE_SEGMENTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub max_firings: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_firings: DEFAULT_MAX_FIRINGS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    /// Load `explicit`, or `ruleforge.toml` if present, or defaults.
    ///
    /// A missing explicit file is an error; a missing default file is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self, KnowledgeError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.is_file() {
                    Self::from_file(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Read and parse one configuration file.
    pub fn from_file(path: &Path) -> Result<Self, KnowledgeError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            KnowledgeError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(KnowledgeError::IoError(format!(
                "Config file size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            KnowledgeError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self, KnowledgeError> {
        toml::from_str(text)
            .map_err(|e| KnowledgeError::DeserializationError(format!("Config: {}", e)))
    }

    /// Apply command line overrides.
    #[must_use]
    pub fn with_context(mut self, context: Option<String>) -> Self {
        if let Some(context) = context {
            self.registry.context = context;
        }
        self
    }

    pub fn loading_context(&self) -> LoadingContext {
        LoadingContext::new(self.registry.context.clone())
    }

    pub fn reload_policy(&self) -> ReloadPolicy {
        ReloadPolicy::new(self.reload.reserved_segments.clone())
    }
}
