use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use gateway::{GatewayConfig, OllamaSettings, RetryConfig};
use query::PipelineConfig;

pub const CONFIG_ENV: &str = "DRILLDOWN_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: String,
    pub mode: OperationMode,
    pub primary: OllamaSettings,
    pub fallback: Option<OllamaSettings>,
    pub gateway: GatewayConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Fast,     // Shallow drill-down, no verification, short deadline
    Accurate, // Deep drill-down, strict scoring, patient retries
    #[default]
    Balanced,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            mode: OperationMode::Balanced,
            primary: OllamaSettings::default(),
            fallback: None,
            gateway: GatewayConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn fast_mode() -> Self {
        let mut config = Self {
            mode: OperationMode::Fast,
            ..Self::default()
        };
        config.gateway.max_in_flight_calls = 10;
        config.gateway.retry = RetryConfig {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 5000,
        };
        config.pipeline.processing.max_recursive_depth = 1;
        config.pipeline.fact_verification.enabled = false;
        config.pipeline.concurrency.max_concurrent_branches = 8;
        config.pipeline.concurrency.deadline_ms = Some(30_000);
        config
    }

    pub fn accurate_mode() -> Self {
        let mut config = Self {
            mode: OperationMode::Accurate,
            ..Self::default()
        };
        config.gateway.max_in_flight_calls = 2;
        config.gateway.retry = RetryConfig {
            max_retries: 5,
            base_delay_ms: 2000,
            max_delay_ms: 20000,
        };
        config.pipeline.processing.max_recursive_depth = 4;
        config
            .pipeline
            .prompts
            .variants
            .insert("relevance_scoring".to_string(), "strict".to_string());
        config.pipeline.concurrency.max_concurrent_branches = 3;
        config.pipeline.concurrency.deadline_ms = Some(120_000);
        config
    }

    pub fn for_mode(mode: OperationMode) -> Self {
        match mode {
            OperationMode::Fast => Self::fast_mode(),
            OperationMode::Accurate => Self::accurate_mode(),
            OperationMode::Balanced => Self::default(),
        }
    }

    /// Config file named by `DRILLDOWN_CONFIG`, or the balanced defaults.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// The file's `mode` picks a preset; every other field in the file
    /// overrides that preset.
    pub fn from_json(raw: &str) -> Result<Self> {
        let overrides: Value = serde_json::from_str(raw).context("Failed to parse config JSON")?;
        let mode = match overrides.get("mode") {
            Some(mode) => serde_json::from_value(mode.clone()).context("Unknown operation mode")?,
            None => OperationMode::default(),
        };

        let mut merged = serde_json::to_value(Self::for_mode(mode))?;
        merge(&mut merged, overrides);
        let config: Self = serde_json::from_value(merged).context("Failed to decode config")?;
        config.pipeline.validate()?;
        if config.gateway.max_in_flight_calls == 0 {
            anyhow::bail!("gateway.max_in_flight_calls must be greater than zero");
        }
        Ok(config)
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
