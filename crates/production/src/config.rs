//! Devnet configuration loaded from TOML.
//!
//! Every field has a default, so an empty file describes a four-node devnet
//! with the engine's default timing.
//!
//! ```toml
//! [committee]
//! size = 4
//! key_seed = 7
//!
//! [consensus]
//! proposal_interval_ms = 300
//! round_timeout_ms = 3000
//!
//! [load]
//! transactions_per_second = 50
//!
//! [metrics]
//! enabled = true
//! port = 9090
//! ```

use crate::telemetry::TelemetryConfig;
use blockmania_bft::BftConfig;
use blockmania_mempool::MempoolConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level devnet configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevnetConfig {
    #[serde(default)]
    pub committee: CommitteeConfig,

    #[serde(default)]
    pub consensus: ConsensusConfig,

    #[serde(default)]
    pub mempool: MempoolSection,

    #[serde(default)]
    pub load: LoadConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Committee shape and key derivation.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitteeConfig {
    /// Number of in-process nodes.
    #[serde(default = "default_committee_size")]
    pub size: u64,

    /// Seed all node keys are derived from.
    #[serde(default)]
    pub key_seed: u64,

    /// Event channel capacity per node.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for CommitteeConfig {
    fn default() -> Self {
        Self {
            size: default_committee_size(),
            key_seed: 0,
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_committee_size() -> u64 {
    4
}

fn default_channel_capacity() -> usize {
    10_000
}

/// Consensus timing and limits. Unset fields keep the engine default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsensusConfig {
    pub proposal_interval_ms: Option<u64>,
    pub round_timeout_ms: Option<u64>,
    pub escalation_timeout_ms: Option<u64>,
    pub view_change_check_ms: Option<u64>,
    pub max_view_spread: Option<u32>,
    pub degraded_after_escalations: Option<u32>,
    pub max_batch_size: Option<usize>,
    pub max_parents: Option<usize>,
    pub cleanup_interval_ms: Option<u64>,
    pub gc_depth: Option<u64>,
    pub max_round_lead: Option<u64>,
}

/// Mempool limits. Unset fields keep the pool default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MempoolSection {
    pub max_pending: Option<usize>,
    pub max_tx_bytes: Option<usize>,
    pub inflight_timeout_ms: Option<u64>,
}

/// Synthetic client load.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    /// Submissions per second across the committee (0 disables load).
    #[serde(default)]
    pub transactions_per_second: u32,

    /// Size of each synthetic payload.
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            transactions_per_second: 0,
            payload_bytes: default_payload_bytes(),
        }
    }
}

fn default_payload_bytes() -> usize {
    128
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl DevnetConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.committee.size == 0 {
            return Err(ConfigError::Invalid("committee.size must be at least 1".into()));
        }
        if self.committee.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "committee.channel_capacity must be positive".into(),
            ));
        }
        let bft = self.bft_config();
        if bft.proposal_interval.is_zero() || bft.round_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "consensus intervals must be positive".into(),
            ));
        }
        if bft.max_view_spread == 0 {
            return Err(ConfigError::Invalid(
                "consensus.max_view_spread must be at least 1".into(),
            ));
        }
        if bft.gc_depth < 2 {
            return Err(ConfigError::Invalid(
                "consensus.gc_depth must cover at least one anchor and its votes".into(),
            ));
        }
        if bft.max_round_lead == 0 {
            return Err(ConfigError::Invalid(
                "consensus.max_round_lead must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Consensus configuration with overrides applied.
    pub fn bft_config(&self) -> BftConfig {
        let c = &self.consensus;
        let mut config = BftConfig::default();
        if let Some(ms) = c.proposal_interval_ms {
            config = config.with_proposal_interval(Duration::from_millis(ms));
        }
        // The round timeout also resets the escalation timeout, so it goes
        // before the explicit escalation override.
        if let Some(ms) = c.round_timeout_ms {
            config = config.with_round_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = c.escalation_timeout_ms {
            config = config.with_escalation_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = c.view_change_check_ms {
            config = config.with_view_change_check_interval(Duration::from_millis(ms));
        }
        if let Some(spread) = c.max_view_spread {
            config = config.with_max_view_spread(spread);
        }
        if let Some(escalations) = c.degraded_after_escalations {
            config = config.with_degraded_after_escalations(escalations);
        }
        if let Some(max) = c.max_batch_size {
            config = config.with_max_batch_size(max);
        }
        if let Some(max) = c.max_parents {
            config = config.with_max_parents(max);
        }
        if let Some(ms) = c.cleanup_interval_ms {
            config = config.with_cleanup_interval(Duration::from_millis(ms));
        }
        if let Some(rounds) = c.gc_depth {
            config = config.with_gc_depth(rounds);
        }
        if let Some(rounds) = c.max_round_lead {
            config = config.with_max_round_lead(rounds);
        }
        config
    }

    /// Mempool configuration with overrides applied.
    pub fn mempool_config(&self) -> MempoolConfig {
        let m = &self.mempool;
        let defaults = MempoolConfig::default();
        MempoolConfig {
            max_pending: m.max_pending.unwrap_or(defaults.max_pending),
            max_tx_bytes: m.max_tx_bytes.unwrap_or(defaults.max_tx_bytes),
            inflight_timeout: m
                .inflight_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.inflight_timeout),
            ..defaults
        }
    }

    /// Telemetry configuration for the devnet process.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "blockmania-devnet".to_string(),
            default_filter: self.logging.filter.clone(),
            json: self.logging.json,
            prometheus_enabled: self.metrics.enabled,
            prometheus_port: self.metrics.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = DevnetConfig::from_toml_str("").unwrap();
        assert_eq!(config.committee.size, 4);
        assert_eq!(config.load.transactions_per_second, 0);
        assert!(!config.metrics.enabled);

        let bft = config.bft_config();
        let defaults = BftConfig::default();
        assert_eq!(bft.proposal_interval, defaults.proposal_interval);
        assert_eq!(bft.gc_depth, defaults.gc_depth);
    }

    #[test]
    fn test_overrides_applied() {
        let config = DevnetConfig::from_toml_str(
            r#"
            [committee]
            size = 7
            key_seed = 42

            [consensus]
            proposal_interval_ms = 100
            round_timeout_ms = 1000
            gc_depth = 16
            max_round_lead = 32

            [mempool]
            inflight_timeout_ms = 2500

            [metrics]
            enabled = true
            port = 9191
            "#,
        )
        .unwrap();

        assert_eq!(config.committee.size, 7);
        assert_eq!(config.committee.key_seed, 42);

        let bft = config.bft_config();
        assert_eq!(bft.proposal_interval, Duration::from_millis(100));
        assert_eq!(bft.round_timeout, Duration::from_secs(1));
        assert_eq!(bft.escalation_timeout, Duration::from_secs(2));
        assert_eq!(bft.gc_depth, 16);
        assert_eq!(bft.max_round_lead, 32);

        let mempool = config.mempool_config();
        assert_eq!(mempool.inflight_timeout, Duration::from_millis(2500));
        assert_eq!(mempool.max_pending, MempoolConfig::default().max_pending);

        let telemetry = config.telemetry_config();
        assert!(telemetry.prometheus_enabled);
        assert_eq!(telemetry.prometheus_port, 9191);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = DevnetConfig::from_toml_str("[committee]\nsize = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = DevnetConfig::from_toml_str("[consensus]\ngc_depth = 1\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = DevnetConfig::from_toml_str("[consensus]\nmax_round_lead = 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let result = DevnetConfig::from_toml_str("[storage]\npath = \"/tmp\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = include_str!("../devnet.toml");
        let config = DevnetConfig::from_toml_str(sample).unwrap();
        assert_eq!(config.committee.size, 4);
    }
}
