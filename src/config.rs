//! TOML configuration for the retrieval engine.
//!
//! Every section and key is optional; a missing value takes the default
//! below. [`load_config`] and [`Config::from_toml_str`] validate after
//! parsing so bad fusion weights fail at startup, not per request.
//!
//! ```toml
//! [retrieval]
//! result_limit = 20
//! dense_weight = 0.7
//! sparse_weight = 0.3
//! rrf_k = 60.0
//!
//! [quality]
//! min_word_count = 30
//!
//! [sessions]
//! max_sessions = 100
//! timeout_ms = 3600000
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use archive_retrieval_core::anchors::AnchorConfig;
use archive_retrieval_core::fusion::{
    FusionParams, DEFAULT_DENSE_WEIGHT, DEFAULT_RRF_K, DEFAULT_SPARSE_WEIGHT,
};
use archive_retrieval_core::quality::QualityGateConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub anchors: AnchorsConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Candidates fetched per modality = `limit × candidate_multiplier`.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            result_limit: default_result_limit(),
            relevance_threshold: default_relevance_threshold(),
            dense_weight: default_dense_weight(),
            sparse_weight: default_sparse_weight(),
            rrf_k: default_rrf_k(),
            candidate_multiplier: default_candidate_multiplier(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

fn default_result_limit() -> usize {
    20
}
fn default_relevance_threshold() -> f64 {
    0.5
}
fn default_dense_weight() -> f64 {
    DEFAULT_DENSE_WEIGHT
}
fn default_sparse_weight() -> f64 {
    DEFAULT_SPARSE_WEIGHT
}
fn default_rrf_k() -> f64 {
    DEFAULT_RRF_K
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_upstream_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    #[serde(default = "default_min_word_count")]
    pub min_word_count: usize,
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: f64,
    #[serde(default = "default_true")]
    pub expand_context: bool,
    #[serde(default = "default_max_context_levels")]
    pub max_context_levels: usize,
    #[serde(default)]
    pub revalidate_expanded: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_word_count: default_min_word_count(),
            min_quality_score: default_min_quality_score(),
            expand_context: true,
            max_context_levels: default_max_context_levels(),
            revalidate_expanded: false,
        }
    }
}

fn default_min_word_count() -> usize {
    30
}
fn default_min_quality_score() -> f64 {
    0.4
}
fn default_true() -> bool {
    true
}
fn default_max_context_levels() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnchorsConfig {
    #[serde(default = "default_anchor_weight")]
    pub positive_weight: f64,
    #[serde(default = "default_anchor_weight")]
    pub negative_weight: f64,
    #[serde(default = "default_negative_filter_threshold")]
    pub negative_filter_threshold: f64,
}

impl Default for AnchorsConfig {
    fn default() -> Self {
        Self {
            positive_weight: default_anchor_weight(),
            negative_weight: default_anchor_weight(),
            negative_filter_threshold: default_negative_filter_threshold(),
        }
    }
}

fn default_anchor_weight() -> f64 {
    0.3
}
fn default_negative_filter_threshold() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_history_entries")]
    pub max_history_entries: usize,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Create a session when `search` names an unknown id.
    #[serde(default = "default_true")]
    pub create_on_search: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            timeout_ms: default_session_timeout_ms(),
            max_history_entries: default_max_history_entries(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            create_on_search: true,
        }
    }
}

fn default_max_sessions() -> usize {
    100
}
fn default_session_timeout_ms() -> u64 {
    3_600_000
}
fn default_max_history_entries() -> usize {
    50
}
fn default_cleanup_interval_ms() -> u64 {
    300_000
}

impl RetrievalConfig {
    /// Validated fusion parameters from the configured weights.
    pub fn fusion_params(&self) -> Result<FusionParams> {
        Ok(FusionParams::new(
            self.dense_weight,
            self.sparse_weight,
            self.rrf_k,
        )?)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

impl QualityConfig {
    pub fn gate_config(&self) -> QualityGateConfig {
        QualityGateConfig {
            min_word_count: self.min_word_count,
            min_quality_score: self.min_quality_score,
            expand_context: self.expand_context,
            max_context_levels: self.max_context_levels,
            revalidate_expanded: self.revalidate_expanded,
        }
    }
}

impl AnchorsConfig {
    pub fn anchor_config(&self) -> AnchorConfig {
        AnchorConfig {
            positive_weight: self.positive_weight,
            negative_weight: self.negative_weight,
            negative_filter_threshold: self.negative_filter_threshold,
        }
    }
}

/// Upper bound on `sessions.timeout_ms` (ten years).
pub const MAX_SESSION_TIMEOUT_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions < 1 {
            bail!("sessions.max_sessions must be >= 1");
        }
        if self.timeout_ms == 0 {
            bail!("sessions.timeout_ms must be > 0");
        }
        if self.timeout_ms > MAX_SESSION_TIMEOUT_MS {
            bail!("sessions.timeout_ms must be <= {}", MAX_SESSION_TIMEOUT_MS);
        }
        if self.max_history_entries < 1 {
            bail!("sessions.max_history_entries must be >= 1");
        }
        if self.cleanup_interval_ms == 0 {
            bail!("sessions.cleanup_interval_ms must be > 0");
        }
        Ok(())
    }

    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.timeout_ms.min(i64::MAX as u64) as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Validate retrieval
        self.retrieval.fusion_params()?;
        if self.retrieval.result_limit < 1 {
            bail!("retrieval.result_limit must be >= 1");
        }
        if self.retrieval.candidate_multiplier < 1 {
            bail!("retrieval.candidate_multiplier must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.relevance_threshold) {
            bail!("retrieval.relevance_threshold must be in [0.0, 1.0]");
        }
        if self.retrieval.upstream_timeout_ms == 0 {
            bail!("retrieval.upstream_timeout_ms must be > 0");
        }

        // Validate quality
        if !(0.0..=1.0).contains(&self.quality.min_quality_score) {
            bail!("quality.min_quality_score must be in [0.0, 1.0]");
        }
        if self.quality.max_context_levels < 1 {
            bail!("quality.max_context_levels must be >= 1");
        }

        // Validate anchors
        for (name, w) in [
            ("anchors.positive_weight", self.anchors.positive_weight),
            ("anchors.negative_weight", self.anchors.negative_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                bail!("{} must be a finite value >= 0", name);
            }
        }
        if !(0.0..=1.0).contains(&self.anchors.negative_filter_threshold) {
            bail!("anchors.negative_filter_threshold must be in [0.0, 1.0]");
        }

        // Validate sessions
        self.sessions.validate()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.retrieval.result_limit, 20);
        assert_eq!(config.retrieval.dense_weight, 0.7);
        assert_eq!(config.retrieval.sparse_weight, 0.3);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.quality.min_word_count, 30);
        assert!(config.quality.expand_context);
        assert_eq!(config.anchors.negative_filter_threshold, 0.7);
        assert_eq!(config.sessions.max_history_entries, 50);
        assert!(config.sessions.create_on_search);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
[retrieval]
dense_weight = 0.6
sparse_weight = 0.4

[sessions]
max_sessions = 2
timeout_ms = 1000
"#,
        )
        .unwrap();
        let params = config.retrieval.fusion_params().unwrap();
        assert_eq!(params.dense_weight(), 0.6);
        assert_eq!(config.sessions.max_sessions, 2);
        assert_eq!(config.sessions.timeout(), chrono::Duration::milliseconds(1000));
        assert_eq!(config.retrieval.result_limit, 20);
    }

    #[test]
    fn test_rejects_bad_weights() {
        let err = Config::from_toml_str("[retrieval]\ndense_weight = 0.0\nsparse_weight = 0.0\n")
            .unwrap_err();
        assert!(err.to_string().contains("cannot both be 0"));

        assert!(Config::from_toml_str("[retrieval]\ndense_weight = -1.0\n").is_err());
        assert!(Config::from_toml_str("[retrieval]\nrrf_k = 0.0\n").is_err());
    }

    #[test]
    fn test_rejects_bad_sessions_and_thresholds() {
        assert!(Config::from_toml_str("[sessions]\nmax_sessions = 0\n").is_err());
        assert!(Config::from_toml_str("[sessions]\ntimeout_ms = 0\n").is_err());
        assert!(Config::from_toml_str("[quality]\nmin_quality_score = 1.5\n").is_err());
        assert!(Config::from_toml_str("[anchors]\nnegative_filter_threshold = 2.0\n").is_err());
    }

    #[test]
    fn test_rejects_out_of_range_session_timeout() {
        let err = Config::from_toml_str("[sessions]\ntimeout_ms = 9223372036854775807\n")
            .unwrap_err();
        assert!(err.to_string().contains("sessions.timeout_ms must be <="));

        let at_bound = format!("[sessions]\ntimeout_ms = {}\n", MAX_SESSION_TIMEOUT_MS);
        let config = Config::from_toml_str(&at_bound).unwrap();
        assert_eq!(config.sessions.timeout_ms, MAX_SESSION_TIMEOUT_MS);
    }

    #[test]
    fn test_rejects_zero_cleanup_interval_and_context_levels() {
        let err = Config::from_toml_str("[sessions]\ncleanup_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("cleanup_interval_ms"));

        let err = Config::from_toml_str("[quality]\nmax_context_levels = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_context_levels"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[quality]\nmin_word_count = 12\nmax_context_levels = 3").unwrap();
        let config = load_config(file.path()).unwrap();
        let gate = config.quality.gate_config();
        assert_eq!(gate.min_word_count, 12);
        assert_eq!(gate.max_context_levels, 3);
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/retrieval.example.toml");
        let config = load_config(&path).unwrap();
        let defaults = Config::default();
        assert_eq!(config.retrieval.result_limit, defaults.retrieval.result_limit);
        assert_eq!(config.retrieval.upstream_timeout_ms, defaults.retrieval.upstream_timeout_ms);
        assert_eq!(config.quality.max_context_levels, defaults.quality.max_context_levels);
        assert_eq!(config.anchors.anchor_config(), defaults.anchors.anchor_config());
        assert_eq!(config.sessions.timeout_ms, defaults.sessions.timeout_ms);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/retrieval.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
