use std::fs;
use std::io;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::CoreError;
use crate::rate_limiter::RateLimiter;

pub const CONFIG_FILE_NAME: &str = "config.json";
const CONFIG_DIR_NAME: &str = ".instagram_dm_fetcher";
const SAVE_DIR_NAME: &str = "Instagram_DM_Fetcher_Chats";

const MESSAGE_COUNT_RANGE: RangeInclusive<usize> = 1..=10_000;
const BATCH_SIZE_RANGE: RangeInclusive<usize> = 5..=100;
const MAX_RETRIES_RANGE: RangeInclusive<u32> = 1..=10;
const RATE_LIMIT_CALLS_RANGE: RangeInclusive<usize> = 1..=100;
const RATE_LIMIT_WINDOW_RANGE: RangeInclusive<u64> = 10..=300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStorage {
    #[default]
    Keyring,
    File,
    Env,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Txt,
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "txt" => Ok(ExportFormat::Txt),
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(CoreError::Export(format!("unsupported format: {other}"))),
        }
    }
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub config_dir: PathBuf,
    pub save_dir: PathBuf,
    /// Defaults to `<config_dir>/logs` when unset.
    pub log_dir: Option<PathBuf>,
    pub credential_storage: CredentialStorage,
    pub default_message_count: usize,
    /// Initial page size of the safe batch walk.
    pub batch_size: usize,
    /// Consecutive unusable batches before a message walk gives up.
    pub max_retries: u32,
    pub rate_limit_calls: usize,
    /// Seconds.
    pub rate_limit_window: u64,
    pub default_export_format: ExportFormat,
    pub log_level: LogLevel,
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            config_dir: home.join(CONFIG_DIR_NAME),
            save_dir: home.join(SAVE_DIR_NAME),
            log_dir: None,
            credential_storage: CredentialStorage::default(),
            default_message_count: 1000,
            batch_size: 20,
            max_retries: 3,
            rate_limit_calls: 10,
            rate_limit_window: 60,
            default_export_format: ExportFormat::default(),
            log_level: LogLevel::default(),
        }
    }
}

fn check_range<T>(field: &str, value: T, range: RangeInclusive<T>) -> Result<(), CoreError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(CoreError::Config(format!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        )))
    }
}

impl AppConfig {
    /// Defaults rooted at `config_dir`, handy for tests and portable installs.
    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            ..Self::default()
        }
    }

    pub fn default_path() -> PathBuf {
        home_dir().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        check_range("default_message_count", self.default_message_count, MESSAGE_COUNT_RANGE)?;
        check_range("batch_size", self.batch_size, BATCH_SIZE_RANGE)?;
        check_range("max_retries", self.max_retries, MAX_RETRIES_RANGE)?;
        check_range("rate_limit_calls", self.rate_limit_calls, RATE_LIMIT_CALLS_RANGE)?;
        check_range("rate_limit_window", self.rate_limit_window, RATE_LIMIT_WINDOW_RANGE)?;
        Ok(())
    }

    /// Reads `path`, falling back to defaults when it is missing, unreadable or out of range.
    pub fn load(path: &Path) -> AppConfig {
        match Self::try_load(path) {
            Ok(Some(config)) => {
                info!(path = %path.display(), "configuration loaded");
                config
            }
            Ok(None) => {
                info!(path = %path.display(), "no config file found, using defaults");
                AppConfig::default()
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to load configuration, using defaults");
                AppConfig::default()
            }
        }
    }

    pub fn try_load(path: &Path) -> Result<Option<AppConfig>, CoreError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<(), CoreError> {
        for dir in [&self.config_dir, &self.save_dir, &self.log_dir()] {
            fs::create_dir_all(dir)
                .map_err(|e| CoreError::Config(format!("failed to create directory {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join("logs"))
    }

    pub fn session_file(&self) -> PathBuf {
        self.config_dir.join("session.json")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.config_dir.join("credentials.enc")
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(
            self.rate_limit_calls,
            Duration::from_secs(self.rate_limit_window),
        ))
    }
}
