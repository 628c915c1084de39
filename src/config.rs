use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::CollisionPolicy;
use crate::error::Pacs2TarError;

pub const DEFAULT_CONFIG_FILE: &str = "pacs2tar.json";
pub const DEFAULT_CONNECTION: &str = "CFMM@dicom.cfmm.uwo.ca:11112";
pub const CONNECTION_ENV: &str = "DICOM_CONNECTION";
pub const OPTIONS_ENV: &str = "OTHER_OPTIONS";
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub dcm4che_options: Option<ToolOptions>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub ledger: Option<PathBuf>,
    #[serde(default)]
    pub collision: Option<CollisionPolicy>,
    /// Seconds between the two instance counts of the readiness check; 0 disables it.
    #[serde(default)]
    pub readiness_interval_secs: Option<u64>,
}

/// Extra dcm4che arguments, either one shell-style string or a list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolOptions {
    Shorthand(String),
    Detailed(Vec<String>),
}

impl ToolOptions {
    pub fn into_args(self) -> Vec<String> {
        match self {
            ToolOptions::Shorthand(value) => split_options(&value),
            ToolOptions::Detailed(values) => values,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub connection: String,
    pub dcm4che_options: Vec<String>,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// `None` selects the per-user cache directory.
    pub temp_dir: Option<PathBuf>,
    /// `None` selects `downloaded_uids.txt` in the output directory.
    pub ledger: Option<PathBuf>,
    pub collision: CollisionPolicy,
    /// `None` retrieves without waiting for the archive to finish receiving a study.
    pub readiness_interval: Option<Duration>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            connection: DEFAULT_CONNECTION.to_string(),
            dcm4che_options: Vec::new(),
            timeout: Duration::from_secs(1800),
            retry_attempts: 2,
            retry_delay: Duration::from_secs(5),
            temp_dir: None,
            ledger: None,
            collision: CollisionPolicy::Disambiguate,
            readiness_interval: Some(Duration::from_secs(2)),
        }
    }
}

impl ResolvedConfig {
    /// Environment values replace values that came from the config file.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(connection) = lookup(CONNECTION_ENV).filter(|value| !value.trim().is_empty()) {
            self.connection = connection.trim().to_string();
        }
        if let Some(options) = lookup(OPTIONS_ENV).filter(|value| !value.trim().is_empty()) {
            self.dcm4che_options = split_options(&options);
        }
        self
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `pacs2tar.json` when present; no file at all means defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, Pacs2TarError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| Pacs2TarError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| Pacs2TarError::ConfigParse(err.to_string()))?
        };

        Ok(Self::resolve_config(config)?.apply_env(|key| std::env::var(key).ok()))
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, Pacs2TarError> {
        let defaults = ResolvedConfig::default();

        if let Some(version) = config
            .schema_version
            .filter(|version| *version != CONFIG_SCHEMA_VERSION)
        {
            return Err(Pacs2TarError::ConfigParse(format!(
                "unsupported schema_version {version}, expected {CONFIG_SCHEMA_VERSION}"
            )));
        }

        let connection = match config.connection {
            Some(connection) if connection.trim().is_empty() => {
                return Err(Pacs2TarError::ConfigParse(
                    "connection must not be empty".to_string(),
                ));
            }
            Some(connection) => connection.trim().to_string(),
            None => defaults.connection,
        };

        let timeout = match config.timeout_secs {
            Some(0) => {
                return Err(Pacs2TarError::ConfigParse(
                    "timeout_secs must be greater than zero".to_string(),
                ));
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.timeout,
        };

        Ok(ResolvedConfig {
            connection,
            dcm4che_options: config
                .dcm4che_options
                .map(ToolOptions::into_args)
                .unwrap_or(defaults.dcm4che_options),
            timeout,
            retry_attempts: config.retry_attempts.unwrap_or(defaults.retry_attempts),
            retry_delay: config
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_delay),
            temp_dir: config.temp_dir,
            ledger: config.ledger,
            collision: config.collision.unwrap_or(defaults.collision),
            readiness_interval: match config.readiness_interval_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.readiness_interval,
            },
        })
    }
}

fn split_options(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}
