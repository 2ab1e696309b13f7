use config::{Environment, File};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// One of DEBUG, INFO, WARNING, ERROR, FATAL.
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TLS listening port.
    pub port: u16,
    pub cert_file: String,
    pub key_file: String,
    /// Plain-HTTP listener for debugging only.
    #[serde(default)]
    pub allow_http: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub activesync_db: String,
    pub backend_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load or parse configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, SettingsError> {
        let default_config_path = "./config/default.toml";
        let path = config_path.unwrap_or(default_config_path);

        let builder = config::Config::builder()
            .add_source(File::with_name(path).required(true))
            .add_source(Environment::with_prefix("RUSTYSYNC").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        self.log_level()?;
        if self.server.port == 0 {
            return Err(SettingsError::Invalid("empty or invalid server/port value".into()));
        }
        if !self.server.cert_file.starts_with('/') {
            return Err(SettingsError::Invalid(
                "server/cert_file should be specified as an absolute path".into(),
            ));
        }
        if !self.server.key_file.starts_with('/') {
            return Err(SettingsError::Invalid(
                "server/key_file should be specified as an absolute path".into(),
            ));
        }
        if self.database.host.is_empty() {
            return Err(SettingsError::Invalid("empty database/host value".into()));
        }
        if self.database.port == 0 {
            return Err(SettingsError::Invalid("empty or invalid database/port value".into()));
        }
        if self.database.activesync_db.is_empty() || self.database.backend_db.is_empty() {
            return Err(SettingsError::Invalid(
                "empty database/activesync_db or database/backend_db value".into(),
            ));
        }
        if self.smtp.host.is_empty() {
            return Err(SettingsError::Invalid("empty smtp/host value".into()));
        }
        if self.smtp.port == 0 {
            return Err(SettingsError::Invalid("empty or invalid smtp/port value".into()));
        }
        Ok(())
    }

    pub fn log_level(&self) -> Result<log::LevelFilter, SettingsError> {
        match self.log.level.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(log::LevelFilter::Debug),
            "INFO" => Ok(log::LevelFilter::Info),
            "WARNING" => Ok(log::LevelFilter::Warn),
            // The log crate has no fatal level; both map to error.
            "ERROR" | "FATAL" => Ok(log::LevelFilter::Error),
            other => Err(SettingsError::Invalid(format!("invalid log level: {other}"))),
        }
    }
}
