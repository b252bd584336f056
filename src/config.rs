//! Run configuration: TOML file plus environment overrides.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Environment variables win over the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::openai::DEFAULT_BASE_URL;
use crate::gateway::GatewayConfig;
use crate::pipeline::FailurePolicy;
use crate::text_chunking::{
    ChunkingError, ChunkingParams, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE,
};

pub const CONFIG_ENV: &str = "VALUATE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystConfig {
    pub model: ModelSettings,
    pub qa: QaSettings,
    pub peers: PeerSettings,
    pub technical: TechnicalSettings,
    pub pipeline: PipelineSettings,
    pub news: NewsSettings,
    pub market: MarketSettings,
    pub gateway: GatewaySettings,
}

/// Which model to call and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub name: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "gpt-4".to_string(),
            temperature: 0.0,
            max_tokens: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaSettings {
    /// Glob patterns for the macroeconomic document corpus.
    pub documents: Vec<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub question_count: usize,
    pub top_k: usize,
    pub concurrency: usize,
}

impl Default for QaSettings {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            question_count: 10,
            top_k: 4,
            concurrency: 1,
        }
    }
}

impl QaSettings {
    pub fn chunking(&self) -> Result<ChunkingParams, ChunkingError> {
        ChunkingParams::new(self.chunk_size, self.chunk_overlap)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Cap on peer tickers taken from the model; the subject is always kept.
    pub max_peers: usize,
    /// Most recent periods kept per financial statement.
    pub statement_periods: usize,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            max_peers: 12,
            statement_periods: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TechnicalSettings {
    pub range: String,
    pub interval: String,
}

impl Default for TechnicalSettings {
    fn default() -> Self {
        Self {
            range: "1y".to_string(),
            interval: "1wk".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub stage_timeout_seconds: Option<u64>,
    pub run_timeout_seconds: Option<u64>,
    /// Token budget for the combined context fed to the recommendation call.
    pub context_token_budget: usize,
    /// Stage name -> policy, overriding the built-in policy for that stage.
    pub policies: BTreeMap<String, FailurePolicy>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_timeout_seconds: None,
            run_timeout_seconds: None,
            context_token_budget: 6_000,
            policies: BTreeMap::new(),
        }
    }
}

impl PipelineSettings {
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_seconds.map(Duration::from_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_seconds.map(Duration::from_secs)
    }

    pub fn policy_for(&self, stage: &str, default: FailurePolicy) -> FailurePolicy {
        self.policies.get(stage).copied().unwrap_or(default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsSettings {
    /// Directory holding `<keyword>.json` article files.
    pub source_dir: Option<PathBuf>,
    /// Where each run writes `<keyword>_news.json`.
    pub cache_dir: PathBuf,
}

impl Default for NewsSettings {
    fn default() -> Self {
        Self {
            source_dir: None,
            cache_dir: PathBuf::from(".valuate/news"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    /// When set, market data is read from `<dir>/<TICKER>.json` instead of Yahoo.
    pub fixture_dir: Option<PathBuf>,
    pub yahoo_base_url: String,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            fixture_dir: None,
            yahoo_base_url: crate::market::YAHOO_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let d = GatewayConfig::default();
        Self {
            max_retries: d.max_retries,
            retry_base_delay_ms: d.retry_base_delay.as_millis() as u64,
        }
    }
}

impl GatewaySettings {
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

impl AnalystConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Load from `path`, else `$VALUATE_CONFIG`, else defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `VALUATE_MODEL`, `VALUATE_BASE_URL` and `VALUATE_TIMEOUT_SECONDS`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("VALUATE_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model.name = model.trim().to_string();
        }
        if let Some(url) = lookup("VALUATE_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.model.base_url = url.trim().to_string();
        }
        if let Some(secs) = lookup("VALUATE_TIMEOUT_SECONDS").and_then(|v| v.trim().parse().ok()) {
            self.model.timeout_seconds = secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qa.chunk_size == 0 {
            return Err(ConfigError::Invalid("qa.chunk_size must be > 0".into()));
        }
        if self.qa.chunk_overlap >= self.qa.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "qa.chunk_overlap ({}) must be smaller than qa.chunk_size ({})",
                self.qa.chunk_overlap, self.qa.chunk_size
            )));
        }
        if self.qa.question_count == 0 {
            return Err(ConfigError::Invalid("qa.question_count must be > 0".into()));
        }
        if self.qa.top_k == 0 {
            return Err(ConfigError::Invalid("qa.top_k must be > 0".into()));
        }
        if self.model.name.trim().is_empty() {
            return Err(ConfigError::Invalid("model.name is empty".into()));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::Invalid(format!(
                "model.temperature {} outside 0.0..=2.0",
                self.model.temperature
            )));
        }
        Ok(())
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model.timeout_seconds)
    }
}
