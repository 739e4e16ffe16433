use serde::Deserialize;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use strum::IntoEnumIterator;

use crate::models::stage::Stage;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for consumer processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for the read model
    pub database_url: String,

    /// Redis connection string for the message bus
    pub redis_url: String,

    /// Base URL of the analysis collaborators; each stage is served at `{base}/{stage}`
    pub analysis_base_url: String,

    /// Optional bearer token sent to the analysis collaborators
    #[serde(default)]
    pub analysis_api_token: Option<String>,

    /// Comma-separated stages every dispatched image is expected to pass through
    #[serde(default = "default_stages")]
    pub enabled_stages: String,

    /// Comma-separated stages served by a worker process (defaults to `enabled_stages`)
    #[serde(default)]
    pub worker_stages: Option<String>,

    #[serde(default = "default_workers_per_stage")]
    pub workers_per_stage: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Per-call timeout for analysis collaborators
    #[serde(default = "default_analysis_timeout_ms")]
    pub analysis_timeout_ms: u64,

    /// Total attempts (first call included) before a job is dead-lettered
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Pending entries idle longer than this are reclaimed from their consumer
    #[serde(default = "default_reclaim_idle_ms")]
    pub reclaim_idle_ms: u64,

    /// Deliveries after which a message is treated as poison
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u64,

    /// Incomplete posts older than this are aggregated as partial
    #[serde(default = "default_stale_horizon_secs")]
    pub stale_horizon_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// JSON file with event inference rules; built-in rules when unset
    #[serde(default)]
    pub event_rules_path: Option<String>,

    /// Jaro-Winkler similarity needed for a tag to satisfy a rule term
    #[serde(default = "default_tag_match_threshold")]
    pub tag_match_threshold: f64,

    /// Prometheus listener for the consumer binaries
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_stages() -> String {
    Stage::iter().map(|s| s.to_string()).collect::<Vec<_>>().join(",")
}

fn default_workers_per_stage() -> usize {
    2
}

fn default_batch_size() -> usize {
    10
}

fn default_block_timeout_ms() -> u64 {
    5_000
}

fn default_analysis_timeout_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_reclaim_idle_ms() -> u64 {
    60_000
}

fn default_max_deliveries() -> u64 {
    5
}

fn default_stale_horizon_secs() -> u64 {
    900
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_tag_match_threshold() -> f64 {
    0.93
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Unknown stage `{0}`")]
    UnknownStage(String),

    #[error("No stages configured")]
    NoStages,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.stages()?;
        config.worker_stage_set()?;
        Ok(config)
    }

    /// Stages the dispatcher registers per image.
    pub fn stages(&self) -> Result<BTreeSet<Stage>, ConfigError> {
        parse_stages(&self.enabled_stages)
    }

    /// Stages served by this worker process.
    pub fn worker_stage_set(&self) -> Result<BTreeSet<Stage>, ConfigError> {
        match &self.worker_stages {
            Some(list) => parse_stages(list),
            None => self.stages(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }

    pub fn stale_horizon(&self) -> Duration {
        Duration::from_secs(self.stale_horizon_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Parses a comma-separated stage list, ignoring blanks and duplicates.
pub fn parse_stages(list: &str) -> Result<BTreeSet<Stage>, ConfigError> {
    let stages = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Stage::from_str(s).map_err(|_| ConfigError::UnknownStage(s.to_string())))
        .collect::<Result<BTreeSet<_>, _>>()?;
    if stages.is_empty() {
        return Err(ConfigError::NoStages);
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stages() {
        let stages = parse_stages(" tagging, moderation,,tagging ").unwrap();
        assert_eq!(
            stages.into_iter().collect::<Vec<_>>(),
            vec![Stage::Moderation, Stage::Tagging]
        );
    }

    #[test]
    fn test_parse_stages_rejects_unknown_and_empty() {
        assert!(matches!(
            parse_stages("tagging,ocr"),
            Err(ConfigError::UnknownStage(s)) if s == "ocr"
        ));
        assert!(matches!(parse_stages(" , "), Err(ConfigError::NoStages)));
    }

    #[test]
    fn test_default_stage_list_covers_every_stage() {
        assert_eq!(parse_stages(&default_stages()).unwrap().len(), 5);
    }
}
