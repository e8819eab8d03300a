//! Typed configuration.
//!
//! Process-level values come from environment variables, loaded once at
//! startup and failing fast when something required is missing. Tunables
//! live in an optional TOML settings file, see [`settings`].

pub mod settings;

pub use settings::Settings;

use std::path::PathBuf;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// `CASEFLOW_SETTINGS`: path to the TOML settings file.
    pub settings_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok().filter(|v| !v.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            settings_path: std::env::var_os("CASEFLOW_SETTINGS").map(PathBuf::from),
        })
    }

    /// The settings file if one is configured, defaults otherwise.
    pub fn settings(&self) -> Result<Settings> {
        match &self.settings_path {
            Some(path) => Settings::load(path),
            None => Ok(Settings::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
