use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/snapmover/config.toml";
const CONFIG_PATH_ENV: &str = "SNAPMOVER_CONFIG";
const ENV_PREFIX: &str = "SNAPMOVER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub channel: NotificationChannelType,
    #[serde(default)]
    pub slack_webhook: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub database_path: PathBuf,
    pub max_concurrent_backups: usize,
    pub max_concurrent_restores: usize,
    /// Look staged resources up by name after bulk deletion.
    pub verify_cleanup: bool,
    pub conflict_retries: u32,
    pub poll_interval_secs: u64,
    pub resync_interval_secs: u64,
    pub error_backoff_secs: u64,
    pub max_error_backoff_secs: u64,
    /// Reconcile workers per job kind.
    pub workers: usize,
    pub rpc_bind: String,
    /// Run the built-in simulated transfer engine.
    pub simulation: bool,
    pub simulated_transfer_secs: u64,
    pub verbose: bool,
    pub log_json: bool,
    pub notifications: NotificationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Memory,
            database_path: PathBuf::from("snapmover.db"),
            max_concurrent_backups: 10,
            max_concurrent_restores: 10,
            verify_cleanup: true,
            conflict_retries: 5,
            poll_interval_secs: 5,
            resync_interval_secs: 60,
            error_backoff_secs: 1,
            max_error_backoff_secs: 60,
            workers: 4,
            rpc_bind: "127.0.0.1:7420".to_string(),
            simulation: false,
            simulated_transfer_secs: 3,
            verbose: false,
            log_json: false,
            notifications: NotificationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `SNAPMOVER_*` environment variables and
    /// finally CLI overrides, then validate.
    pub fn new<T: Serialize>(cli_overrides: Option<&T>) -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load(Figment::new().merge(Toml::file(path)), cli_overrides)
    }

    /// Like [`AppConfig::new`] with an explicit base figment; used by tests.
    pub fn load<T: Serialize>(
        file: Figment,
        cli_overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_backups == 0 || self.max_concurrent_restores == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_backups and max_concurrent_restores must be at least 1".into(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.conflict_retries == 0 {
            return Err(ConfigError::Invalid("conflict_retries must be at least 1".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be at least 1".into()));
        }
        if self.error_backoff_secs > self.max_error_backoff_secs {
            return Err(ConfigError::Invalid(
                "error_backoff_secs exceeds max_error_backoff_secs".into(),
            ));
        }
        self.rpc_addr()?;
        if self.store == StoreBackend::Sqlite && self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database_path must be set for sqlite".into()));
        }
        Ok(())
    }

    pub fn rpc_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.rpc_bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("rpc_bind {:?}: {e}", self.rpc_bind)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn max_error_backoff(&self) -> Duration {
        Duration::from_secs(self.max_error_backoff_secs)
    }

    pub fn simulated_transfer(&self) -> Duration {
        Duration::from_secs(self.simulated_transfer_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        workers: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verify_cleanup: Option<bool>,
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.verify_cleanup);
        assert_eq!(config.store, StoreBackend::Memory);
    }

    #[test]
    fn test_file_then_cli_layering() {
        let file = Figment::new().merge(Toml::string(
            r#"
            max_concurrent_backups = 2
            workers = 8
            store = "sqlite"

            [notifications]
            channel = "slack"
            slack_webhook = "https://hooks.example/abc"
            "#,
        ));
        let overrides = Overrides {
            workers: Some(3),
            verify_cleanup: None,
        };
        let config = AppConfig::load(file, Some(&overrides)).unwrap();
        assert_eq!(config.max_concurrent_backups, 2);
        assert_eq!(config.workers, 3);
        assert_eq!(config.store, StoreBackend::Sqlite);
        assert!(config.verify_cleanup);
        assert_eq!(config.notifications.channel, NotificationChannelType::Slack);
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let file = Figment::new().merge(Toml::string("max_concurrent_restores = 0"));
        let err = AppConfig::load(file, None::<&Overrides>).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
