//! Scheduler configuration

use anyhow::{Context, Result};
use scheduler_lib::affinity::AffinityWeights;
use scheduler_lib::community::OptimizerConfig;
use scheduler_lib::PipelineConfig;
use serde::Deserialize;
use std::time::Duration;

/// Scheduler configuration, read from `MODSOFT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Namespaces scheduled every cycle (`MODSOFT_NAMESPACES=a,b`)
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,

    /// Instance name attached to structured events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics/placements
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    /// Kiali base URL; traffic is not filtered by a service graph when unset
    #[serde(default)]
    pub kiali_url: Option<String>,

    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,

    /// Cycles running longer than this are abandoned
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// Metrics aggregation window
    #[serde(default = "default_window")]
    pub window_secs: u64,

    #[serde(default = "default_resolution")]
    pub resolution: f64,

    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default = "default_zone_spreading")]
    pub zone_spreading: bool,
}

fn default_namespaces() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "modsoft-scheduler".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_prometheus_url() -> String {
    "http://prometheus:9090".to_string()
}

fn default_cycle_interval() -> u64 {
    60
}

fn default_cycle_timeout() -> u64 {
    45
}

fn default_window() -> u64 {
    600
}

fn default_resolution() -> f64 {
    1.0
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_max_iterations() -> usize {
    100
}

fn default_zone_spreading() -> bool {
    true
}

impl SchedulerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("MODSOFT")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("namespaces"),
            )
            .build()
            .context("Failed to read configuration")?;

        Self::from_config(config)
    }

    /// Deserialize from an already built source, filling in defaults
    pub fn from_config(config: config::Config) -> Result<Self> {
        let loaded: Self = config
            .try_deserialize()
            .context("Invalid scheduler configuration")?;
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<()> {
        if self.namespaces.iter().all(|ns| ns.trim().is_empty()) {
            anyhow::bail!("At least one namespace must be configured");
        }
        if self.cycle_interval_secs == 0 {
            anyhow::bail!("cycle_interval_secs must be positive");
        }
        if self.cycle_timeout_secs == 0 {
            anyhow::bail!("cycle_timeout_secs must be positive");
        }
        self.pipeline_config()
            .validate()
            .context("Invalid pipeline configuration")?;
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            window: Duration::from_secs(self.window_secs),
            weights: AffinityWeights::default(),
            optimizer: OptimizerConfig {
                resolution: self.resolution,
                tolerance: self.tolerance,
                max_iterations: self.max_iterations,
                ..OptimizerConfig::default()
            },
            zone_spreading: self.zone_spreading,
        }
    }
}
