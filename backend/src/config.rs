use std::{env, path::PathBuf};

use crate::error::AppError;

pub const DEFAULT_TOKEN_SECRET: &str = "your-secret-key-change-in-production";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub serve_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub token_secret: String,
    /// Set when `JWT_SECRET` was absent and the built-in secret is in use.
    pub token_secret_is_default: bool,
    pub admin_password: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let host = non_empty("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = non_empty("PORT")
            .unwrap_or_else(|| "8080".into())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid PORT: {err}")))?;

        let serve_dir = PathBuf::from(non_empty("SERVE_DIR").unwrap_or_else(|| "./data".into()));
        let db_path =
            PathBuf::from(non_empty("DB_PATH").unwrap_or_else(|| "filebrowser.db".into()));
        let log_dir = PathBuf::from(non_empty("LOG_DIR").unwrap_or_else(|| "./log".into()));

        let (token_secret, token_secret_is_default) = match non_empty("JWT_SECRET") {
            Some(secret) => (secret, false),
            None => (DEFAULT_TOKEN_SECRET.to_string(), true),
        };

        Ok(Self {
            host,
            port,
            serve_dir,
            db_path,
            log_dir,
            token_secret,
            token_secret_is_default,
            admin_password: non_empty("ADMIN_PASSWORD"),
        })
    }
}
