use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::features::{DefaultSchema, FeatureSchema};
use crate::service::DemoHeuristic;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Persisted model artifact. `.json` files are read as JSON, anything else as bincode.
    pub model_path: String,
    /// Address the HTTP server binds to.
    pub bind: String,
    /// Schema used when the artifact does not carry `feature_names`.
    pub default_schema: DefaultSchema,
    /// Explicit schema, overrides `default_schema` when set.
    pub feature_names: Option<Vec<String>>,
    /// When set, prediction routes require a matching `x-api-key` header.
    pub api_key: Option<String>,
    pub max_body_bytes: u64,
    pub demo: DemoHeuristic,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_path: "models/rainfall_model.bin".to_string(),
            bind: "127.0.0.1:5000".to_string(),
            default_schema: DefaultSchema::default(),
            feature_names: None,
            api_key: None,
            max_body_bytes: 16 * 1024,
            demo: DemoHeuristic::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| anyhow!("invalid config '{}': {}", path, e))
    }

    /// Like `from_file`, but a missing file yields the defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            log::warn!("Config file '{}' not found, using defaults.", path);
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    pub fn default_feature_schema(&self) -> FeatureSchema {
        match &self.feature_names {
            Some(names) => FeatureSchema::new(names.iter().cloned()),
            None => self.default_schema.schema(),
        }
    }
}
