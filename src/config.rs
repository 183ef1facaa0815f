use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::extract::{CompletionPort, HttpCompletion};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RapportConfig {
    pub store: StoreConfig,
    pub affect: AffectConfig,
    pub expression: ExpressionConfig,
    pub memory: MemoryConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            namespace: default_namespace(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_namespace() -> String {
    "rapport".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AffectConfig {
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    #[serde(default)]
    pub event_weights: EventWeights,
}

impl Default for AffectConfig {
    fn default() -> Self {
        Self {
            decay_rate: default_decay_rate(),
            event_weights: EventWeights::default(),
        }
    }
}

fn default_decay_rate() -> f64 {
    0.02
}

/// Mood delta applied per event kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventWeights {
    pub praised: f64,
    pub scolded: f64,
    pub ignored: f64,
    pub mentioned: f64,
    pub conversation: f64,
}

impl Default for EventWeights {
    fn default() -> Self {
        Self {
            praised: 0.10,
            scolded: -0.15,
            ignored: -0.05,
            mentioned: 0.05,
            conversation: 0.02,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpressionConfig {
    #[serde(default = "default_min_word_frequency")]
    pub min_word_frequency: u32,
    #[serde(default = "default_max_words")]
    pub max_words: usize,
    #[serde(default)]
    pub blocked_words: Vec<String>,
    #[serde(default = "default_true")]
    pub ai_learning_enabled: bool,
    #[serde(default = "default_ai_threshold")]
    pub ai_learning_message_threshold: usize,
}

impl Default for ExpressionConfig {
    fn default() -> Self {
        Self {
            min_word_frequency: default_min_word_frequency(),
            max_words: default_max_words(),
            blocked_words: Vec::new(),
            ai_learning_enabled: true,
            ai_learning_message_threshold: default_ai_threshold(),
        }
    }
}

fn default_min_word_frequency() -> u32 {
    3
}
fn default_max_words() -> usize {
    50
}
fn default_true() -> bool {
    true
}
fn default_ai_threshold() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_facts")]
    pub max_facts_per_user: usize,
    #[serde(default = "default_max_facts")]
    pub max_facts_per_group: usize,
    #[serde(default = "default_importance_threshold")]
    pub importance_threshold: f64,
    #[serde(default = "default_memory_decay_days")]
    pub memory_decay_days: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_facts_per_user: default_max_facts(),
            max_facts_per_group: default_max_facts(),
            importance_threshold: default_importance_threshold(),
            memory_decay_days: default_memory_decay_days(),
        }
    }
}

fn default_max_facts() -> usize {
    100
}
fn default_importance_threshold() -> f64 {
    0.5
}
fn default_memory_decay_days() -> u32 {
    7
}

/// Extraction port endpoint. An empty URL or API key disables AI
/// extraction entirely; the frequency-based paths keep working.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub url: String,
    pub model: String,
    pub api_key: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "gpt-4o-mini".into(),
            api_key: String::new(),
        }
    }
}

impl ExtractionConfig {
    /// Build the extraction port, or None when not configured.
    pub fn port(&self) -> Option<Arc<dyn CompletionPort>> {
        if self.url.is_empty() || self.api_key.is_empty() {
            return None;
        }
        Some(Arc::new(HttpCompletion::new(
            &self.url,
            &self.model,
            &self.api_key,
        )))
    }
}

impl RapportConfig {
    /// Validate the config and return clear error messages.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.extraction.url.is_empty() {
            url::Url::parse(&self.extraction.url)
                .map_err(|e| anyhow::anyhow!("invalid extraction.url: {e}"))?;
        }
        if self.memory.memory_decay_days == 0 {
            anyhow::bail!("memory.memory_decay_days must be > 0");
        }
        if self.memory.max_facts_per_user == 0 || self.memory.max_facts_per_group == 0 {
            anyhow::bail!("memory fact caps must be > 0");
        }
        if !(0.0..=1.0).contains(&self.memory.importance_threshold) {
            anyhow::bail!("memory.importance_threshold must be within [0, 1]");
        }
        if self.expression.max_words == 0 {
            anyhow::bail!("expression.max_words must be > 0");
        }
        if self.expression.ai_learning_message_threshold == 0 {
            anyhow::bail!("expression.ai_learning_message_threshold must be > 0");
        }
        if self.affect.decay_rate < 0.0 {
            anyhow::bail!("affect.decay_rate must not be negative");
        }
        Ok(())
    }
}

/// Load configuration from file or use defaults.
///
/// Search order:
/// 1. `RAPPORT_CONFIG` env var
/// 2. `~/.rapport/config.toml`
/// 3. Zero-config defaults (no file needed)
pub fn load() -> anyhow::Result<RapportConfig> {
    let path = config_path();

    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config: RapportConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config at {}: {e}", path.display()))?;
        info!("loaded config from {}", path.display());
        config
    } else {
        info!("no config file found, using zero-config defaults");
        RapportConfig::default()
    };

    resolve_api_key(&mut config);
    config.validate()?;
    Ok(config)
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("RAPPORT_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".rapport").join("config.toml")
}

/// Resolve the extraction API key from the environment if not set in
/// the config file.
fn resolve_api_key(config: &mut RapportConfig) {
    if config.extraction.api_key.is_empty() {
        if let Ok(key) = std::env::var("RAPPORT_EXTRACTION_API_KEY") {
            config.extraction.api_key = key;
        }
    }
}
