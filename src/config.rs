//! Process configuration parsed from environment variables.
//!
//! `main` loads a `.env` file first (if present), then reads everything
//! through [`AppConfig::from_env`]. Subsystems with many knobs
//! (analyzer, analysis worker, rate limiter) parse their own sections with
//! the same [`env_parse`] helper.

use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_UPLOAD_MAX_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_TECHNICIAN_MAX_OPEN: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Where and how uploaded photos are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub dir: PathBuf,
    pub max_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from(DEFAULT_UPLOAD_DIR), max_bytes: DEFAULT_UPLOAD_MAX_BYTES }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub uploads: UploadConfig,
    /// Open assignments at which a technician is reported as busy.
    pub technician_max_open: i64,
}

impl AppConfig {
    /// Build the config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `UPLOAD_DIR`: default `uploads`
    /// - `UPLOAD_MAX_BYTES`: default 10 MiB
    /// - `TECHNICIAN_MAX_OPEN`: default 3
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is unset or `PORT` does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid { key: "PORT", value: raw })?,
            Err(_) => DEFAULT_PORT,
        };

        let uploads = UploadConfig {
            dir: std::env::var("UPLOAD_DIR").map_or_else(|_| PathBuf::from(DEFAULT_UPLOAD_DIR), PathBuf::from),
            max_bytes: env_parse("UPLOAD_MAX_BYTES", DEFAULT_UPLOAD_MAX_BYTES),
        };

        Ok(Self {
            database_url,
            port,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            uploads,
            technician_max_open: env_parse("TECHNICIAN_MAX_OPEN", DEFAULT_TECHNICIAN_MAX_OPEN),
        })
    }
}

/// Parse an environment variable, falling back to `default` when it is
/// unset or malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}
