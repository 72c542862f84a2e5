//! TOML configuration with built-in defaults and `HOST`/`PORT` environment overrides.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::{
    DEFAULT_MODEL_KEY, DEFAULT_UNCERTAINTY_SIGMA, DEFAULT_WINDOW_DAYS, MIN_HISTORY_DAYS,
};
use crate::error::{ForecastError, Result};
use crate::projector::ModelFamily;

pub const DEFAULT_CONFIG_PATH: &str = "config/aqicast.toml";
const DEFAULT_DATA_PATH: &str = "data/daily_aqi_by_county.csv";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5001;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BALANCED_MODEL_PATH: &str = "models/balanced.json";
const DEFAULT_PROTOTYPE_MODEL_PATH: &str = "models/prototype.json";
const HOST_ENV: &str = "HOST";
const PORT_ENV: &str = "PORT";

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    data: Option<DataFile>,
    forecast: Option<ForecastFile>,
    server: Option<ServerFile>,
    models: Option<Vec<ModelEntry>>,
}

#[derive(Debug, Deserialize)]
struct DataFile {
    #[serde(alias = "csv")]
    path: Option<PathBuf>,
    window_days: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ForecastFile {
    #[serde(alias = "sigma")]
    uncertainty_sigma: Option<f64>,
    default_model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerFile {
    host: Option<String>,
    port: Option<u16>,
    request_timeout_secs: Option<u64>,
    static_dir: Option<PathBuf>,
}

/// One `[[models]]` entry: registry key, artifact path and feature layout.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ModelEntry {
    pub key: String,
    pub path: PathBuf,
    #[serde(default)]
    pub family: ModelFamily,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataConfig {
    pub path: PathBuf,
    pub window_days: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForecastConfig {
    pub uncertainty_sigma: f64,
    pub default_model: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub static_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub data: DataConfig,
    pub forecast: ForecastConfig,
    pub server: ServerConfig,
    pub models: Vec<ModelEntry>,
}

fn default_models() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            key: DEFAULT_MODEL_KEY.to_string(),
            path: PathBuf::from(DEFAULT_BALANCED_MODEL_PATH),
            family: ModelFamily::Balanced,
        },
        ModelEntry {
            key: "prototype".to_string(),
            path: PathBuf::from(DEFAULT_PROTOTYPE_MODEL_PATH),
            family: ModelFamily::Prototype,
        },
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data: DataConfig {
                path: PathBuf::from(DEFAULT_DATA_PATH),
                window_days: DEFAULT_WINDOW_DAYS,
            },
            forecast: ForecastConfig {
                uncertainty_sigma: DEFAULT_UNCERTAINTY_SIGMA,
                default_model: DEFAULT_MODEL_KEY.to_string(),
            },
            server: ServerConfig {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
                static_dir: None,
            },
            models: default_models(),
        }
    }
}

impl AppConfig {
    /// Reads `path`. The default path may be absent (built-in defaults); any other missing
    /// path is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            if path == Path::new(DEFAULT_CONFIG_PATH) {
                tracing::info!(
                    operation = "startup",
                    "Config {} not found, using built-in defaults",
                    path.display()
                );
                return Ok(Self::default());
            }
            return Err(ForecastError::Config(format!(
                "Config {} does not exist",
                path.display()
            )));
        }

        let raw = fs::read_to_string(path).map_err(|err| {
            ForecastError::Config(format!("Failed to read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|err| ForecastError::Config(format!("Invalid config {}: {err}", path.display())))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(raw).map_err(|err| ForecastError::Config(err.to_string()))?;
        let config = Self::resolve(file);
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile) -> Self {
        let mut cfg = Self::default();
        if let Some(data) = file.data {
            if let Some(path) = data.path {
                cfg.data.path = path;
            }
            if let Some(window_days) = data.window_days {
                cfg.data.window_days = window_days;
            }
        }
        if let Some(forecast) = file.forecast {
            if let Some(sigma) = forecast.uncertainty_sigma {
                cfg.forecast.uncertainty_sigma = sigma;
            }
            if let Some(default_model) = forecast.default_model {
                cfg.forecast.default_model = default_model;
            }
        }
        if let Some(server) = file.server {
            if let Some(host) = server.host {
                cfg.server.host = host;
            }
            if let Some(port) = server.port {
                cfg.server.port = port;
            }
            if let Some(timeout) = server.request_timeout_secs {
                cfg.server.request_timeout_secs = timeout;
            }
            cfg.server.static_dir = server.static_dir;
        }
        if let Some(models) = file.models {
            cfg.models = models;
        }
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        let sigma = self.forecast.uncertainty_sigma;
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(ForecastError::Config(
                "forecast.uncertainty_sigma must be > 0".to_string(),
            ));
        }
        if self.data.window_days < MIN_HISTORY_DAYS {
            return Err(ForecastError::Config(format!(
                "data.window_days must be >= {MIN_HISTORY_DAYS}"
            )));
        }
        if self.server.port == 0 {
            return Err(ForecastError::Config("server.port must be non-zero".to_string()));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(ForecastError::Config(
                "server.request_timeout_secs must be > 0".to_string(),
            ));
        }
        let mut keys = BTreeSet::new();
        for entry in &self.models {
            if entry.key.trim().is_empty() {
                return Err(ForecastError::Config("models.key must not be empty".to_string()));
            }
            if !keys.insert(entry.key.as_str()) {
                return Err(ForecastError::Config(format!(
                    "duplicate model key '{}'",
                    entry.key
                )));
            }
        }
        Ok(())
    }

    /// Applies `HOST`/`PORT` from the process environment (after `.env` has been loaded).
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var(HOST_ENV).ok(),
            std::env::var(PORT_ENV).ok(),
        )
    }

    pub fn apply_overrides(&mut self, host: Option<String>, port: Option<String>) -> Result<()> {
        if let Some(host) = host.filter(|host| !host.trim().is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = port.filter(|port| !port.trim().is_empty()) {
            self.server.port = port.trim().parse().map_err(|err| {
                ForecastError::Config(format!("Invalid {PORT_ENV} value '{port}': {err}"))
            })?;
        }
        self.validate()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn model_entry(&self, key: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|entry| entry.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [data]
            path = "fixtures/aqi.csv"

            [forecast]
            sigma = 12.5

            [[models]]
            key = "balanced"
            path = "artifacts/balanced.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.data.path, PathBuf::from("fixtures/aqi.csv"));
        assert_eq!(config.data.window_days, DEFAULT_WINDOW_DAYS);
        assert_eq!(config.forecast.uncertainty_sigma, 12.5);
        assert_eq!(config.forecast.default_model, "balanced");
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].family, ModelFamily::Balanced);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(AppConfig::from_toml_str("[forecast]\nuncertainty_sigma = 0.0").is_err());
        assert!(AppConfig::from_toml_str("[data]\nwindow_days = 6").is_err());
        assert!(AppConfig::from_toml_str("[server]\nport = 0").is_err());
        let duplicate = r#"
            [[models]]
            key = "balanced"
            path = "a.json"
            [[models]]
            key = "balanced"
            path = "b.json"
            family = "prototype"
        "#;
        assert!(AppConfig::from_toml_str(duplicate).is_err());
    }

    #[test]
    fn missing_default_path_uses_defaults() {
        let config = AppConfig::load(Path::new(DEFAULT_CONFIG_PATH));
        // The repository ships this file; either way it must resolve.
        assert!(config.is_ok());
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ForecastError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aqicast.toml");
        fs::write(&path, "[server]\nhost = \"127.0.0.1\"\nport = 8080\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn env_overrides_server() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(Some("127.0.0.1".into()), Some("9000".into()))
            .unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert!(config.apply_overrides(None, Some("http".into())).is_err());
    }
}
