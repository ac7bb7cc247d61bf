//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::tree::{BoundsPolicy, EngineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineFileConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Engine configuration as it appears in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct EngineFileConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_split_threshold")]
    pub split_threshold: usize,

    #[serde(default = "default_split_factor")]
    pub split_factor: usize,

    /// Per-dimension split factors; empty means uniform `split_factor`
    #[serde(default)]
    pub split_per_dim: Vec<usize>,

    #[serde(default = "default_cache_budget")]
    pub cache_budget: u64,

    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: u64,

    #[serde(default)]
    pub bounds_policy: BoundsPolicy,

    #[serde(default)]
    pub track_dim_stats: bool,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("gridstore").to_string_lossy().to_string())
        .unwrap_or_else(|| "./gridstore_data".to_string())
}

fn default_split_threshold() -> usize {
    1000
}

fn default_split_factor() -> usize {
    2
}

fn default_cache_budget() -> u64 {
    1_000_000
}

fn default_flush_threshold() -> u64 {
    50_000
}

impl Default for EngineFileConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            split_threshold: default_split_threshold(),
            split_factor: default_split_factor(),
            split_per_dim: Vec::new(),
            cache_budget: default_cache_budget(),
            flush_threshold: default_flush_threshold(),
            bounds_policy: BoundsPolicy::default(),
            track_dim_stats: false,
        }
    }
}

impl EngineFileConfig {
    /// Convert to the engine's runtime configuration
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            data_dir: PathBuf::from(&self.data_dir),
            split_threshold: self.split_threshold,
            split_factor: self.split_factor,
            split_per_dim: self.split_per_dim.clone(),
            cache_budget: self.cache_budget,
            flush_threshold: self.flush_threshold,
            bounds_policy: self.bounds_policy,
            track_dim_stats: self.track_dim_stats,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("gridstore").join("config.toml")),
            Some(PathBuf::from("/etc/gridstore/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("GRIDSTORE_DATA_DIR") {
            self.engine.data_dir = data_dir;
        }
        if let Ok(threshold) = std::env::var("GRIDSTORE_SPLIT_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                self.engine.split_threshold = t;
            }
        }
        if let Ok(budget) = std::env::var("GRIDSTORE_CACHE_BUDGET") {
            if let Ok(b) = budget.parse() {
                self.engine.cache_budget = b;
            }
        }
        if let Ok(policy) = std::env::var("GRIDSTORE_BOUNDS_POLICY") {
            match policy.to_lowercase().as_str() {
                "clamp" => self.engine.bounds_policy = BoundsPolicy::Clamp,
                "reject" => self.engine.bounds_policy = BoundsPolicy::Reject,
                other => tracing::warn!("Unknown bounds policy {:?}, keeping current", other),
            }
        }
        if let Ok(level) = std::env::var("GRIDSTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Initialize structured logging from the logging config
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Gridstore Configuration
#
# Environment variables override these settings:
# - GRIDSTORE_DATA_DIR
# - GRIDSTORE_SPLIT_THRESHOLD
# - GRIDSTORE_CACHE_BUDGET
# - GRIDSTORE_BOUNDS_POLICY
# - GRIDSTORE_LOG_LEVEL

[engine]
# Directory for dataset files (manifest + block file)
data_dir = "~/.local/share/gridstore"

# Leaf event count above which a leaf splits into a grid
split_threshold = 1000

# Cells per dimension on split
split_factor = 2

# Per-dimension split factors; empty means uniform split_factor
split_per_dim = []

# Memory budget for resident payloads, in events
cache_budget = 1000000

# Pending-write cost (events) that triggers an automatic flush
flush_threshold = 50000

# How out-of-extent coordinates are handled: "clamp" or "reject"
bounds_policy = "clamp"

# Maintain per-dimension running mean/variance
track_dim_stats = false

[logging]
# Log level: trace, debug, info, warn, error
level = "info"
"#
    .to_string()
}
