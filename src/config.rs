//! Engine configuration
//!
//! Defaults → optional JSON file → `HEURISTIC_ENGINE_*` environment overrides.
//! Loading never touches the filesystem beyond reading the config file;
//! directories and schema are created by `Engine::init`.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "HEURISTIC_ENGINE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the database and model cache (defaults to the platform data dir)
    pub data_dir: Option<PathBuf>,
    pub store: StoreConfig,
    pub retrieval: RetrievalConfig,
    pub dedup: DedupConfig,
    pub promotion: PromotionConfig,
    pub fraud: FraudConfig,
    pub blackboard: BlackboardConfig,
    pub workflow: WorkflowConfig,
    pub maintenance: MaintenanceConfig,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file name inside the data dir (or an absolute path)
    pub database: PathBuf,
    /// Max concurrent blocking store jobs
    pub workers: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("knowledge.db"),
            workers: 4,
            max_retries: 3,
            retry_backoff_ms: 50,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub similarity_floor: f32,
    /// Floor used when scoring falls back to keyword overlap
    pub keyword_floor: f32,
    pub top_k: usize,
    /// Only the trailing window of the query text is embedded
    pub query_window_chars: usize,
    pub embed_timeout_ms: u64,
    pub golden_boost: f32,
    pub pattern_boost: f32,
    pub high_value_patterns: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_floor: 0.65,
            keyword_floor: 0.15,
            top_k: 3,
            query_window_chars: 1500,
            embed_timeout_ms: 150,
            golden_boost: 0.20,
            pattern_boost: 0.15,
            high_value_patterns: [
                "sequential thinking",
                "architecture decision record",
                "adr",
                "break down",
                "plan before",
                "design doc",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RetrievalConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_calls: u64,
    pub window_secs: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_calls: 3,
            window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub initial_confidence: f64,
    pub validation_increment: f64,
    pub violation_decrement: f64,
    pub contradiction_decrement: f64,
    /// Golden threshold
    pub confidence_threshold: f64,
    pub min_validations: u32,
    /// Re-run fraud evaluation every N applications
    pub fraud_check_interval: u32,
    pub min_rule_len: usize,
    pub max_rule_len: usize,
    /// Promote inside `apply_outcome` once every gate passes
    pub auto_promote: bool,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            initial_confidence: 0.7,
            validation_increment: 0.05,
            violation_decrement: 0.10,
            contradiction_decrement: 0.05,
            confidence_threshold: 0.9,
            min_validations: 5,
            fraud_check_interval: 10,
            min_rule_len: 8,
            max_rule_len: 2000,
            auto_promote: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudConfig {
    pub suspicious_threshold: f64,
    pub fraudulent_threshold: f64,
    /// Applications below which ratio-based signals stay neutral
    pub min_applications: u32,
    pub prior_fraud_rate: f64,
    pub drift_saturation: f64,
    pub ratio_margin: f64,
    pub velocity_factor: f64,
    pub burst_window_secs: i64,
    pub weights: SignalWeights,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            suspicious_threshold: 0.30,
            fraudulent_threshold: 0.60,
            min_applications: 5,
            prior_fraud_rate: 0.05,
            drift_saturation: 0.5,
            ratio_margin: 0.15,
            velocity_factor: 0.5,
            burst_window_secs: 60,
            weights: SignalWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub baseline_drift: f64,
    pub outcome_ratio: f64,
    pub promotion_velocity: f64,
    pub temporal_burst: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            baseline_drift: 0.30,
            outcome_ratio: 0.30,
            promotion_velocity: 0.20,
            temporal_burst: 0.20,
        }
    }
}

impl SignalWeights {
    pub fn total(&self) -> f64 {
        self.baseline_drift + self.outcome_ratio + self.promotion_velocity + self.temporal_burst
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlackboardBackend {
    #[default]
    Memory,
    /// Shared SQLite file, usable from several processes
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackboardConfig {
    pub backend: BlackboardBackend,
    pub default_ttl_secs: i64,
    /// Agents without a heartbeat for this long drop out of `active_agents`
    pub agent_ttl_secs: i64,
}

impl Default for BlackboardConfig {
    fn default() -> Self {
        Self {
            backend: BlackboardBackend::Memory,
            default_ttl_secs: 3600,
            agent_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub default_node_timeout_secs: u64,
    pub retry_backoff_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_secs: 300,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub fraud_sweep_secs: u64,
    pub blackboard_sweep_secs: u64,
    pub max_backoff_secs: u64,
    pub enabled: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            fraud_sweep_secs: 3600,
            blackboard_sweep_secs: 60,
            max_backoff_secs: 600,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingConfig {
    /// Keyword scoring only
    #[default]
    None,
    /// Local MiniLM model; downloaded into the model dir on first use
    Onnx { model_dir: Option<PathBuf> },
    /// OpenAI-compatible `/embeddings` endpoint
    Http {
        url: String,
        model: String,
        #[serde(default)]
        api_key: Option<String>,
    },
}

impl EngineConfig {
    /// Load defaults, then the optional JSON file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    EngineError::validation(format!("cannot read config {}: {e}", p.display()))
                })?;
                serde_json::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HEURISTIC_ENGINE_*` overrides from the given lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| EngineError::validation(format!("invalid value for {key}: {raw}")))
        }

        macro_rules! env_override {
            ($name:literal, $field:expr) => {
                let key = format!("{ENV_PREFIX}{}", $name);
                if let Some(raw) = lookup(&key) {
                    $field = parse(&key, raw)?;
                }
            };
        }

        if let Some(dir) = lookup(&format!("{ENV_PREFIX}DATA_DIR")) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        env_override!("SIMILARITY_FLOOR", self.retrieval.similarity_floor);
        env_override!("KEYWORD_FLOOR", self.retrieval.keyword_floor);
        env_override!("TOP_K", self.retrieval.top_k);
        env_override!("QUERY_WINDOW_CHARS", self.retrieval.query_window_chars);
        env_override!("EMBED_TIMEOUT_MS", self.retrieval.embed_timeout_ms);
        env_override!("DEDUP_WINDOW_CALLS", self.dedup.window_calls);
        env_override!("DEDUP_WINDOW_SECS", self.dedup.window_secs);
        env_override!("GOLDEN_THRESHOLD", self.promotion.confidence_threshold);
        env_override!("MIN_VALIDATIONS", self.promotion.min_validations);
        env_override!("FRAUD_MIN_APPLICATIONS", self.fraud.min_applications);
        env_override!("FRAUD_SUSPICIOUS", self.fraud.suspicious_threshold);
        env_override!("FRAUD_FRAUDULENT", self.fraud.fraudulent_threshold);
        env_override!("STORE_WORKERS", self.store.workers);
        Ok(())
    }

    /// Reject out-of-range parameters
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(EngineError::validation(format!("{name} must be in [0, 1], got {v}")))
            }
        };
        unit("retrieval.similarity_floor", self.retrieval.similarity_floor as f64)?;
        unit("retrieval.keyword_floor", self.retrieval.keyword_floor as f64)?;
        unit("promotion.initial_confidence", self.promotion.initial_confidence)?;
        unit("promotion.confidence_threshold", self.promotion.confidence_threshold)?;
        unit("fraud.suspicious_threshold", self.fraud.suspicious_threshold)?;
        unit("fraud.fraudulent_threshold", self.fraud.fraudulent_threshold)?;
        unit("fraud.prior_fraud_rate", self.fraud.prior_fraud_rate)?;

        if self.fraud.suspicious_threshold > self.fraud.fraudulent_threshold {
            return Err(EngineError::validation(
                "fraud.suspicious_threshold must not exceed fraud.fraudulent_threshold",
            ));
        }
        if self.promotion.validation_increment < 0.0
            || self.promotion.violation_decrement < 0.0
            || self.promotion.contradiction_decrement < 0.0
        {
            return Err(EngineError::validation("confidence deltas must be non-negative"));
        }
        if self.promotion.min_rule_len > self.promotion.max_rule_len {
            return Err(EngineError::validation(
                "promotion.min_rule_len must not exceed promotion.max_rule_len",
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(EngineError::validation("retrieval.top_k must be at least 1"));
        }
        if self.store.workers == 0 {
            return Err(EngineError::validation("store.workers must be at least 1"));
        }
        if self.maintenance.fraud_sweep_secs == 0 || self.maintenance.blackboard_sweep_secs == 0 {
            return Err(EngineError::validation("maintenance intervals must be at least 1 second"));
        }
        if self.workflow.default_node_timeout_secs == 0 {
            return Err(EngineError::validation("workflow.default_node_timeout_secs must be at least 1"));
        }
        if self.fraud.weights.total() <= 0.0 {
            return Err(EngineError::validation("fraud signal weights must sum to > 0"));
        }
        Ok(())
    }

    /// Resolved data directory (no side effects)
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Resolved database path
    pub fn database_path(&self) -> PathBuf {
        if self.store.database.is_absolute() {
            self.store.database.clone()
        } else {
            self.data_dir().join(&self.store.database)
        }
    }

    /// Where the ONNX model lives when no explicit dir is configured
    pub fn model_dir(&self) -> PathBuf {
        match &self.embedding {
            EmbeddingConfig::Onnx {
                model_dir: Some(dir),
            } => dir.clone(),
            _ => self.data_dir().join("models").join("minilm"),
        }
    }
}

/// Platform data directory for the engine
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("heuristic-engine")
}
