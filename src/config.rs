//! Configuration
//!
//! Defaults, overridden by the first config file found, overridden by
//! environment variables, then validated. The engine never reads this
//! directly; the binary turns it into [`EngineSettings`] and a
//! [`PricingManager`].

use crate::cost::NativeCostBounds;
use crate::engine::EngineSettings;
use crate::litellm_pricing::{BuiltinSource, PricingManager, PricingSource, UnavailableSource};
use crate::models::ModelFamily;
use crate::pricing::ModelWeights;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

/// One week.
const MAX_FUTURE_SKEW_MINUTES: i64 = 7 * 24 * 60;
/// About a century.
const MAX_EVENT_AGE_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub pricing: PricingConfig,
    pub cache: CacheConfig,
    pub paths: PathsConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub block_hours: i64,
    /// Reject events stamped further ahead of the clock than this.
    pub max_future_skew_minutes: Option<i64>,
    /// Reject events older than this.
    pub max_event_age_days: Option<i64>,
    pub native_cost_min: f64,
    pub native_cost_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// `litellm`, `builtin` or `none`
    pub source: String,
    pub url: String,
    pub timeout_secs: u64,
    pub retry_after_secs: u64,
    pub opus_weight: f64,
    pub sonnet_weight: f64,
    pub haiku_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub projects_dir: PathBuf,
    pub log_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// Write a cache checkpoint every this many polls.
    pub checkpoint_every: u32,
}

fn claude_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "ERROR".to_string(),
            format: "pretty".to_string(),
            output: "console".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let bounds = NativeCostBounds::default();
        Self {
            block_hours: crate::models::BLOCK_DURATION_HOURS,
            max_future_skew_minutes: None,
            max_event_age_days: None,
            native_cost_min: bounds.min,
            native_cost_max: bounds.max,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            source: "litellm".to_string(),
            url: crate::litellm_pricing::LITELLM_PRICING_URL.to_string(),
            timeout_secs: 5,
            retry_after_secs: 60,
            opus_weight: 5.0,
            sonnet_weight: 1.0,
            haiku_weight: 1.0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: dirs::cache_dir()
                .unwrap_or_else(claude_home)
                .join("usage-window")
                .join("cache.json"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            projects_dir: claude_home().join("projects"),
            log_directory: PathBuf::from("logs"),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            checkpoint_every: 12,
        }
    }
}

impl Config {
    /// Load configuration from defaults, file and environment.
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        #[cfg(feature = "basic")]
        {
            let config_paths = [
                PathBuf::from("usage-window.toml"),
                PathBuf::from(".usage-window.toml"),
                dirs::config_dir()
                    .map(|d| d.join("usage-window").join("config.toml"))
                    .unwrap_or_default(),
            ];

            for path in &config_paths {
                if path.is_file() {
                    info!(config_file = %path.display(), "Loading configuration from file");
                    config = Self::load_from_file(path)?;
                    break;
                }
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    #[cfg(feature = "basic")]
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }

        if let Ok(val) = env::var("USAGE_WINDOW_BLOCK_HOURS") {
            self.engine.block_hours = val.parse().context("Invalid USAGE_WINDOW_BLOCK_HOURS")?;
        }
        if let Ok(val) = env::var("USAGE_WINDOW_PRICING_SOURCE") {
            self.pricing.source = val;
        }
        if let Ok(val) = env::var("USAGE_WINDOW_PRICING_TIMEOUT_SECS") {
            self.pricing.timeout_secs = val
                .parse()
                .context("Invalid USAGE_WINDOW_PRICING_TIMEOUT_SECS")?;
        }
        if let Ok(val) = env::var("USAGE_WINDOW_OPUS_WEIGHT") {
            self.pricing.opus_weight = val.parse().context("Invalid USAGE_WINDOW_OPUS_WEIGHT")?;
        }
        if let Ok(val) = env::var("USAGE_WINDOW_CACHE_ENABLED") {
            self.cache.enabled = val.parse().context("Invalid USAGE_WINDOW_CACHE_ENABLED")?;
        }
        if let Ok(val) = env::var("USAGE_WINDOW_CACHE_PATH") {
            self.cache.path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("USAGE_WINDOW_PROJECTS_DIR") {
            self.paths.projects_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("USAGE_WINDOW_LOG_DIR") {
            self.paths.log_directory = PathBuf::from(val);
        }
        if let Ok(val) = env::var("USAGE_WINDOW_POLL_SECS") {
            self.monitor.poll_interval_secs = val.parse().context("Invalid USAGE_WINDOW_POLL_SECS")?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.block_hours <= 0 || self.engine.block_hours > 24 {
            anyhow::bail!(
                "Block duration must be between 1 and 24 hours, got {}",
                self.engine.block_hours
            );
        }
        if let Some(minutes) = self.engine.max_future_skew_minutes {
            if !(0..=MAX_FUTURE_SKEW_MINUTES).contains(&minutes) {
                anyhow::bail!(
                    "max_future_skew_minutes must be between 0 and {}, got {}",
                    MAX_FUTURE_SKEW_MINUTES,
                    minutes
                );
            }
        }
        if let Some(days) = self.engine.max_event_age_days {
            if !(1..=MAX_EVENT_AGE_DAYS).contains(&days) {
                anyhow::bail!(
                    "max_event_age_days must be between 1 and {}, got {}",
                    MAX_EVENT_AGE_DAYS,
                    days
                );
            }
        }
        if !(self.engine.native_cost_min <= self.engine.native_cost_max) {
            anyhow::bail!(
                "Native cost range is empty: [{}, {}]",
                self.engine.native_cost_min,
                self.engine.native_cost_max
            );
        }

        if !matches!(self.pricing.source.as_str(), "litellm" | "builtin" | "none") {
            anyhow::bail!(
                "Unknown pricing source {:?}, expected litellm, builtin or none",
                self.pricing.source
            );
        }
        for (family, weight) in self.family_weights() {
            if !weight.is_finite() || weight < 0.0 {
                anyhow::bail!("Weight for {} must be a non-negative number, got {}", family, weight);
            }
        }
        if self.pricing.timeout_secs == 0 {
            anyhow::bail!("Pricing timeout must be greater than 0");
        }

        if self.monitor.poll_interval_secs == 0 {
            anyhow::bail!("Poll interval must be greater than 0");
        }
        if self.monitor.checkpoint_every == 0 {
            warn!("checkpoint_every is 0, the cache is only written on shutdown");
        }

        Ok(())
    }

    fn family_weights(&self) -> [(ModelFamily, f64); 3] {
        [
            (ModelFamily::Opus, self.pricing.opus_weight),
            (ModelFamily::Sonnet, self.pricing.sonnet_weight),
            (ModelFamily::Haiku, self.pricing.haiku_weight),
        ]
    }

    pub fn weights(&self) -> ModelWeights {
        ModelWeights::new(HashMap::from(self.family_weights()))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            block_duration: chrono::Duration::hours(self.engine.block_hours),
            weights: self.weights(),
            max_future_skew: self.engine.max_future_skew_minutes.map(chrono::Duration::minutes),
            max_event_age: self.engine.max_event_age_days.map(chrono::Duration::days),
            native_cost_bounds: NativeCostBounds {
                min: self.engine.native_cost_min,
                max: self.engine.native_cost_max,
            },
        }
    }

    pub fn pricing_manager(&self) -> PricingManager {
        let source: Box<dyn PricingSource> = match self.pricing.source.as_str() {
            "builtin" => Box::new(BuiltinSource),
            "none" => Box::new(UnavailableSource),
            #[cfg(feature = "pricing")]
            _ => Box::new(crate::litellm_pricing::LiteLlmSource::new(self.pricing.url.clone())),
            #[cfg(not(feature = "pricing"))]
            _ => {
                warn!("Built without the pricing feature, using builtin prices");
                Box::new(BuiltinSource)
            }
        };

        PricingManager::new(
            source,
            self.weights(),
            StdDuration::from_secs(self.pricing.timeout_secs),
            StdDuration::from_secs(self.pricing.retry_after_secs),
        )
    }

    #[cfg(feature = "basic")]
    #[allow(dead_code)]
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!(path = %path.display(), "Configuration saved to file");
        Ok(())
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Process-wide configuration for the binary, loaded on first use.
pub fn get_config() -> Result<&'static Config> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let config = Config::load()?;
    Ok(CONFIG.get_or_init(|| config))
}
