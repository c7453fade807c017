//! Immutable run configuration (C1).
//!
//! Loaded once at startup from a TOML file (or `config/` directory of
//! profile-named files) layered with `INGEST_`-prefixed environment
//! variables, then validated and never mutated again.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mode: String,
    pub modes: std::collections::HashMap<String, ModeConfig>,
    #[serde(default)]
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModeConfig {
    /// Seconds to run before a clean shutdown; 0 means run until signaled.
    #[serde(default)]
    pub run_duration: u64,
    /// Upper bound on concurrently spawned symbol workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    pub symbols: Vec<SymbolConfig>,
}

fn default_max_workers() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    #[serde(default = "default_streams")]
    pub streams: Vec<String>,
    #[serde(default = "default_true")]
    pub depth_snapshot: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_streams() -> Vec<String> {
    vec!["depth@0ms".to_string(), "aggTrade".to_string(), "kline_1m".to_string()]
}

fn default_true() -> bool {
    true
}

impl SymbolConfig {
    /// Symbol normalized to upper case, as used for book state and file paths.
    pub fn symbol_upper(&self) -> String {
        self.symbol.to_ascii_uppercase()
    }

    /// Symbol normalized to lower case, as embedded in stream names.
    pub fn symbol_lower(&self) -> String {
        self.symbol.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Snapshot/REST request timeout, seconds.
    #[serde(default = "default_network_timeout")]
    pub timeout: u64,
    /// Combined-stream WebSocket host, e.g. "stream.binancefuture.com".
    #[serde(default = "default_ws_host")]
    pub ws_host: String,
    /// REST host for the depth snapshot endpoint.
    #[serde(default = "default_rest_host")]
    pub rest_host: String,
}

fn default_network_timeout() -> u64 {
    30
}
fn default_ws_host() -> String {
    "fstream.binance.com".to_string()
}
fn default_rest_host() -> String {
    "fapi.binance.com".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: default_network_timeout(),
            ws_host: default_ws_host(),
            rest_host: default_rest_host(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub output_directory: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_queue_maxsize")]
    pub queue_maxsize: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
    /// "high" makes the supervisor attempt a best-effort `nice(-5)` at
    /// startup (unix only); any other value, or a non-unix target, is a no-op.
    #[serde(default)]
    pub process_priority: Option<String>,
}

fn default_queue_maxsize() -> usize {
    10_000
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval() -> u64 {
    1
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            queue_maxsize: default_queue_maxsize(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            process_priority: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a file or `config/` directory, layered with
    /// `INGEST_`-prefixed environment variable overrides.
    pub fn load_from<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let path = config_path.as_ref();

        let mut builder = Config::builder()
            .set_default("network.timeout", 30)?
            .set_default("network.ws_host", default_ws_host())?
            .set_default("network.rest_host", default_rest_host())?
            .set_default("performance.queue_maxsize", 10_000)?
            .set_default("performance.batch_size", 100)?
            .set_default("performance.flush_interval", 1)?
            .set_default("logging.level", "info")?;

        if path.is_file() {
            builder = builder.add_source(File::from(path).required(true));
        } else {
            builder = builder
                .add_source(File::from(path.join("default.toml")).required(false))
                .add_source(
                    File::from(path.join(
                        std::env::var("INGEST_ENV").unwrap_or_else(|_| "development".to_string()),
                    ))
                    .required(false),
                );
        }

        builder = builder.add_source(
            Environment::with_prefix("INGEST")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate config invariants. Returns the list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let Some(active) = self.modes.get(&self.mode) else {
            errors.push(format!("unknown mode \"{}\"", self.mode));
            return errors;
        };

        if active.symbols.is_empty() {
            errors.push(format!("mode \"{}\" has no symbols configured", self.mode));
        }
        if active.max_workers == 0 {
            errors.push("max_workers must be > 0".to_string());
        }
        for sym in &active.symbols {
            if sym.symbol.trim().is_empty() {
                errors.push("symbol entry has an empty symbol".to_string());
            }
            if sym.streams.is_empty() {
                errors.push(format!("symbol {} has no streams configured", sym.symbol));
            }
        }
        if self.storage.output_directory.trim().is_empty() {
            errors.push("storage.output_directory must not be empty".to_string());
        }
        if self.performance.batch_size == 0 {
            errors.push("performance.batch_size must be > 0".to_string());
        }
        if self.performance.queue_maxsize == 0 {
            errors.push("performance.queue_maxsize must be > 0".to_string());
        }

        errors
    }

    /// The active mode's configuration.
    pub fn active_mode(&self) -> &ModeConfig {
        self.modes
            .get(&self.mode)
            .expect("validate() must be called before active_mode()")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        let mut modes = std::collections::HashMap::new();
        modes.insert(
            "live".to_string(),
            ModeConfig {
                run_duration: 0,
                max_workers: 8,
                symbols: vec![SymbolConfig {
                    symbol: "btcusdt".to_string(),
                    streams: default_streams(),
                    depth_snapshot: true,
                    enabled: true,
                }],
            },
        );
        AppConfig {
            mode: "live".to_string(),
            modes,
            network: NetworkConfig::default(),
            storage: StorageConfig {
                output_directory: "/tmp/out".to_string(),
            },
            performance: PerformanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn validate_accepts_well_formed_config() {
        assert!(sample().validate().is_empty());
    }

    #[test]
    fn validate_rejects_unknown_mode() {
        let mut cfg = sample();
        cfg.mode = "missing".to_string();
        let errors = cfg.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("unknown mode"));
    }

    #[test]
    fn symbol_case_normalization() {
        let sym = SymbolConfig {
            symbol: "BtcUsdt".to_string(),
            streams: default_streams(),
            depth_snapshot: true,
            enabled: true,
        };
        assert_eq!(sym.symbol_upper(), "BTCUSDT");
        assert_eq!(sym.symbol_lower(), "btcusdt");
    }
}
