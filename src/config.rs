use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub atomizer: AtomizerConfig,
    pub linker: LinkerConfig,
    pub graph: GraphConfig,
    pub consolidation: ConsolidationConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// `"sqlite"` or `"memory"`.
    pub backend: String,
    pub db_path: String,
}

/// Extraction, retry and dedup knobs for the Atomizer.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AtomizerConfig {
    pub extract_confidence: f64,
    pub dedup_similarity: f64,
    pub call_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Confidence assigned to claims parsed from a bulleted completion.
    pub bullet_claim_confidence: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LinkerConfig {
    pub top_k: usize,
    pub link_similarity: f64,
    pub max_fanout: usize,
    pub structural_min_overlap: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    pub max_traversal_nodes: usize,
    pub max_commit_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub decay_rate: f64,
    pub half_life_secs: u64,
    pub reinforce_boost: f64,
    pub prune_threshold: f64,
    pub grace_window_secs: u64,
    pub review_interval_secs: u64,
    pub min_cluster_size: usize,
    pub low_centrality_max_degree: usize,
    pub summary_relevance: f64,
    pub summary_max_chars: usize,
    pub default_batch_size: usize,
    /// Scheduler: run a cycle every this many seconds (0 disables the timer).
    pub interval_secs: u64,
    /// Scheduler: also run a cycle after this many ingestions (0 disables).
    pub trigger_after_ingestions: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub max_pending_documents: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_notegraph_dir()
            .join("graph.db")
            .to_string_lossy()
            .into_owned();
        Self {
            backend: "sqlite".into(),
            db_path,
        }
    }
}

impl Default for AtomizerConfig {
    fn default() -> Self {
        Self {
            extract_confidence: 0.5,
            dedup_similarity: 0.9,
            call_timeout_ms: 30_000,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            bullet_claim_confidence: 0.8,
        }
    }
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            link_similarity: 0.7,
            max_fanout: 8,
            structural_min_overlap: 0.3,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_traversal_nodes: 500,
            max_commit_retries: 3,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.5,
            half_life_secs: 7 * 24 * 3600,
            reinforce_boost: 0.3,
            prune_threshold: 0.1,
            grace_window_secs: 3 * 24 * 3600,
            review_interval_secs: 24 * 3600,
            min_cluster_size: 3,
            low_centrality_max_degree: 1,
            summary_relevance: 0.6,
            summary_max_chars: 4000,
            default_batch_size: 128,
            interval_secs: 3600,
            trigger_after_ingestions: 50,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_pending_documents: 64,
        }
    }
}

impl AtomizerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl ConsolidationConfig {
    pub fn half_life(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.half_life_secs as i64)
    }

    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_window_secs as i64)
    }

    pub fn review_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.review_interval_secs as i64)
    }
}

/// Returns `~/.notegraph/`
pub fn default_notegraph_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".notegraph")
}

/// Returns the default config file path: `~/.notegraph/config.toml`
pub fn default_config_path() -> PathBuf {
    default_notegraph_dir().join("config.toml")
}

impl EngineConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, apply env var overrides, then validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            EngineConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (NOTEGRAPH_DB, NOTEGRAPH_BACKEND,
    /// NOTEGRAPH_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("NOTEGRAPH_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("NOTEGRAPH_BACKEND") {
            self.storage.backend = val;
        }
        if let Ok(val) = std::env::var("NOTEGRAPH_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Reject values the decay and linking math cannot work with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.consolidation;
        if !(c.decay_rate > 0.0 && c.decay_rate < 1.0) {
            bail!("consolidation.decay_rate must be in (0, 1), got {}", c.decay_rate);
        }
        if c.half_life_secs == 0 {
            bail!("consolidation.half_life_secs must be positive");
        }
        for (name, value) in [
            ("consolidation.reinforce_boost", c.reinforce_boost),
            ("consolidation.prune_threshold", c.prune_threshold),
            ("consolidation.summary_relevance", c.summary_relevance),
            ("atomizer.extract_confidence", self.atomizer.extract_confidence),
            ("atomizer.dedup_similarity", self.atomizer.dedup_similarity),
            ("linker.link_similarity", self.linker.link_similarity),
            ("linker.structural_min_overlap", self.linker.structural_min_overlap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be in [0, 1], got {value}");
            }
        }
        if c.min_cluster_size < 2 {
            bail!("consolidation.min_cluster_size must be at least 2");
        }
        if self.atomizer.max_attempts == 0 {
            bail!("atomizer.max_attempts must be at least 1");
        }
        if self.ingest.max_pending_documents == 0 {
            bail!("ingest.max_pending_documents must be at least 1");
        }
        match self.storage.backend.as_str() {
            "sqlite" | "memory" => Ok(()),
            other => bail!("unknown storage backend: {other}. Supported: sqlite, memory"),
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
