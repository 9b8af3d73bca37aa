use std::collections::HashMap;
use std::env;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::store::RetentionPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub auth: AuthConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

/// Without a URL the service runs on the in-memory store.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub blob_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub max_datasets: usize,
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.max_datasets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    Basic,
}

#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// username -> password, only consulted in basic mode
    pub users: HashMap<String, String>,
}

// Passwords stay out of logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut users: Vec<&String> = self.users.keys().collect();
        users.sort();
        f.debug_struct("AuthConfig").field("mode", &self.mode).field("users", &users).finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    pub preview_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 3000,
                host: "0.0.0.0".to_string(),
                cors_allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            database: DatabaseConfig { url: None, max_connections: 10, min_connections: 1 },
            storage: StorageConfig { blob_dir: "media/datasets".to_string() },
            retention: RetentionConfig { max_datasets: RetentionPolicy::DEFAULT_MAX_DATASETS },
            auth: AuthConfig { mode: AuthMode::None, users: HashMap::new() },
            report: ReportConfig { preview_limit: 50 },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let max_datasets: usize = env::var("MAX_DATASETS")
            .unwrap_or_else(|_| RetentionPolicy::DEFAULT_MAX_DATASETS.to_string())
            .parse()?;
        if max_datasets == 0 {
            bail!("MAX_DATASETS must be at least 1");
        }

        let mode = match env::var("AUTH_MODE").unwrap_or_else(|_| "none".to_string()).as_str() {
            "none" => AuthMode::None,
            "basic" => AuthMode::Basic,
            other => bail!("Unknown AUTH_MODE {other:?}, expected \"none\" or \"basic\""),
        };
        let users = parse_users(&env::var("AUTH_USERS").unwrap_or_default())?;
        if mode == AuthMode::Basic && users.is_empty() {
            bail!("AUTH_MODE=basic requires AUTH_USERS");
        }

        Ok(Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()?,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                cors_allowed_origins: env::var("ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
                max_connections: env::var("DB_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
                min_connections: env::var("DB_MIN_CONNECTIONS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()?,
            },
            storage: StorageConfig {
                blob_dir: env::var("STORAGE_DIR").unwrap_or_else(|_| "media/datasets".to_string()),
            },
            retention: RetentionConfig { max_datasets },
            auth: AuthConfig { mode, users },
            report: ReportConfig {
                preview_limit: env::var("REPORT_PREVIEW_LIMIT")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()?,
            },
        })
    }
}

/// Parse `user:password,user2:password2`.
fn parse_users(raw: &str) -> Result<HashMap<String, String>> {
    let mut users = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((user, password)) = entry.split_once(':') else {
            bail!("AUTH_USERS entry {entry:?} is not user:password");
        };
        if user.is_empty() {
            bail!("AUTH_USERS entry has an empty user name");
        }
        users.insert(user.to_string(), password.to_string());
    }
    Ok(users)
}
