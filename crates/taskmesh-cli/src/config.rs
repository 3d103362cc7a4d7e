//! `taskmesh.toml` configuration.
//!
//! Every field has a default so a partial (or empty) file is accepted.

use serde::Deserialize;
use std::path::PathBuf;
use taskmesh_core::{DEFAULT_PRIORITY, DEFAULT_TIMEOUT_SECS};
use taskmesh_orchestrator::{
    engine::{DEFAULT_COMPLETED_CACHE_SIZE, DEFAULT_REQUESTED_BY},
    scorer::{DEFAULT_RECENCY_BONUS, DEFAULT_RECENCY_PENALTY, DEFAULT_WINDOW},
    OrchestratorConfig, ScorerConfig, DEFAULT_RESULTS_TOPIC,
};
use taskmesh_store::DEFAULT_RETAINED_OUTCOMES;

#[derive(Debug, Deserialize, Default)]
pub struct TaskmeshConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl TaskmeshConfig {
    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Defaults to `{data_dir}/taskmesh.db`.
    #[serde(default)]
    pub checkpoint_db: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            checkpoint_db: None,
        }
    }
}

impl StorageConfig {
    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("registry")
    }

    pub fn database_path(&self) -> PathBuf {
        self.checkpoint_db
            .clone()
            .unwrap_or_else(|| self.data_dir.join("taskmesh.db"))
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.data_dir.join("trace")
    }
}

#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_requested_by")]
    pub requested_by: String,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_priority")]
    pub default_priority: u8,
    #[serde(default = "default_completed_cache_size")]
    pub completed_cache_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            requested_by: default_requested_by(),
            default_timeout_secs: default_timeout_secs(),
            default_priority: default_priority(),
            completed_cache_size: default_completed_cache_size(),
        }
    }
}

impl From<&SchedulerConfig> for OrchestratorConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        OrchestratorConfig {
            requested_by: cfg.requested_by.clone(),
            default_priority: cfg.default_priority,
            default_timeout_secs: cfg.default_timeout_secs,
            completed_cache_size: cfg.completed_cache_size,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_recency_penalty")]
    pub recency_penalty: f64,
    #[serde(default = "default_recency_bonus")]
    pub recency_bonus: f64,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            recency_penalty: default_recency_penalty(),
            recency_bonus: default_recency_bonus(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
        }
    }
}

impl ScoringConfig {
    /// Outcome rows kept per agent. Never fewer than the scoring window reads.
    pub fn outcome_retention(&self) -> usize {
        self.window.max(DEFAULT_RETAINED_OUTCOMES)
    }
}

impl From<&ScoringConfig> for ScorerConfig {
    fn from(cfg: &ScoringConfig) -> Self {
        ScorerConfig {
            window: cfg.window,
            recency_penalty: cfg.recency_penalty,
            recency_bonus: cfg.recency_bonus,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// In-process bus; agents must live in the same process.
    #[default]
    Memory,
    /// Pub/sub sidecar over HTTP.
    Sidecar,
}

#[derive(Debug, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,
    #[serde(default = "default_sidecar_url")]
    pub sidecar_url: String,
    #[serde(default = "default_pubsub_name")]
    pub pubsub_name: String,
    #[serde(default = "default_results_topic")]
    pub results_topic: String,
    /// Token the sidecar sends in `dapr-api-token` when delivering results.
    #[serde(default)]
    pub app_token: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::default(),
            sidecar_url: default_sidecar_url(),
            pubsub_name: default_pubsub_name(),
            results_topic: default_results_topic(),
            app_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_requested_by() -> String {
    DEFAULT_REQUESTED_BY.to_string()
}
fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}
fn default_completed_cache_size() -> usize {
    DEFAULT_COMPLETED_CACHE_SIZE
}
fn default_window() -> usize {
    DEFAULT_WINDOW
}
fn default_recency_penalty() -> f64 {
    DEFAULT_RECENCY_PENALTY
}
fn default_recency_bonus() -> f64 {
    DEFAULT_RECENCY_BONUS
}
fn default_health_check_timeout_ms() -> u64 {
    2000
}
fn default_sidecar_url() -> String {
    "http://localhost:3500".to_string()
}
fn default_pubsub_name() -> String {
    "pubsub".to_string()
}
fn default_results_topic() -> String {
    DEFAULT_RESULTS_TOPIC.to_string()
}
