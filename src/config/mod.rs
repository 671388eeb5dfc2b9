use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Manages the config directory at ~/.config/hive-dispatch (%APPDATA% on Windows)
pub struct ConfigStore {
    base_dir: PathBuf,
}

impl ConfigStore {
    pub fn new() -> Result<Self, ConfigError> {
        let base_dir = Self::get_app_data_dir()?;
        Self::new_with_base(base_dir)
    }

    /// Create a store rooted at a custom directory (for testing)
    pub fn new_with_base(base_dir: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&base_dir)?;
        fs::create_dir_all(base_dir.join("workflows"))?;

        let store = Self { base_dir };
        if !store.config_path().exists() {
            store.save_config(&AppConfig::default())?;
        }

        Ok(store)
    }

    fn get_app_data_dir() -> Result<PathBuf, ConfigError> {
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .map(|p| PathBuf::from(p).join("hive-dispatch"))
                .map_err(|_| ConfigError::InvalidPath("APPDATA not set".to_string()))
        }
        #[cfg(not(windows))]
        {
            std::env::var("HOME")
                .map(|p| PathBuf::from(p).join(".config").join("hive-dispatch"))
                .map_err(|_| ConfigError::InvalidPath("HOME not set".to_string()))
        }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Directory scanned for workflow definitions. An explicit `workflows_dir`
    /// in the config wins over the store default.
    pub fn workflows_dir(&self, config: &AppConfig) -> PathBuf {
        config
            .workflows_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("workflows"))
    }

    pub fn load_config(&self) -> Result<AppConfig, ConfigError> {
        let config_path = self.config_path();
        if !config_path.exists() {
            let config = AppConfig::default();
            self.save_config(&config)?;
            return Ok(config);
        }

        let json = fs::read_to_string(config_path)?;
        let config: AppConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(config)?;
        fs::write(self.config_path(), json)?;
        Ok(())
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Upper bound on live sessions in the pool
    pub max_concurrent: usize,
    /// How long `dispose` waits for a worker to acknowledge shutdown
    pub shutdown_timeout_ms: u64,
    pub default_cli: String,
    pub clis: HashMap<String, CliConfig>,
    pub workflows_dir: Option<PathBuf>,
    pub api: ApiConfig,
}

impl AppConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if !self.clis.contains_key(&self.default_cli) {
            return Err(ConfigError::Invalid(format!(
                "default_cli '{}' is not in the CLI registry",
                self.default_cli
            )));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut clis = HashMap::new();

        clis.insert(
            "pi".to_string(),
            CliConfig {
                command: "pi".to_string(),
                rpc_args: vec!["--mode".to_string(), "rpc".to_string()],
                model_flag: Some("--model".to_string()),
                default_model: None,
                thinking_flag: Some("--thinking".to_string()),
                env: None,
            },
        );

        Self {
            max_concurrent: 4,
            shutdown_timeout_ms: 5_000,
            default_cli: "pi".to_string(),
            clis,
            workflows_dir: None,
            api: ApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 18810,
        }
    }
}

/// Agent CLI that speaks the JSON-lines RPC protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    pub command: String,
    /// Arguments that switch the CLI into RPC mode
    #[serde(default)]
    pub rpc_args: Vec<String>,
    pub model_flag: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub thinking_flag: Option<String>,
    pub env: Option<HashMap<String, String>>,
}
