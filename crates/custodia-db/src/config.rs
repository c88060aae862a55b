//! Database configuration

use serde::{Deserialize, Serialize};

/// Where escrow records live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    /// Process memory; records are lost on restart
    Memory,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    /// SQLite connection URL
    pub url: String,
    /// Maximum pool connections
    pub max_connections: u32,
    /// Minimum pool connections
    pub min_connections: u32,
    /// Connection acquire timeout in seconds
    pub acquire_timeout_secs: u64,
    /// How long a write waits on a locked database, in milliseconds
    pub busy_timeout_ms: u64,
    /// Apply pending migrations on startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            url: "sqlite://custodia.db".to_string(),
            max_connections: 8,
            min_connections: 1,
            acquire_timeout_secs: 30,
            busy_timeout_ms: 5_000,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    /// Create config from environment variables, defaults for anything unset
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend: match std::env::var("DATABASE_BACKEND").ok().as_deref() {
                Some("memory") => StorageBackend::Memory,
                _ => defaults.backend,
            },
            url: std::env::var("DATABASE_URL").unwrap_or(defaults.url),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_connections),
            min_connections: std::env::var("DATABASE_MIN_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.min_connections),
            acquire_timeout_secs: std::env::var("DATABASE_ACQUIRE_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.acquire_timeout_secs),
            busy_timeout_ms: defaults.busy_timeout_ms,
            run_migrations: defaults.run_migrations,
        }
    }

    /// In-memory SQLite, for tests
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Self::default()
        }
    }

    /// An in-memory SQLite database exists per connection
    pub fn is_memory_url(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    /// Mask sensitive parts of the URL for logging
    pub fn url_masked(&self) -> String {
        mask_url(&self.url)
    }
}

fn mask_url(url: &str) -> String {
    if let (Some(at_pos), Some(scheme_end)) = (url.rfind('@'), url.find("://")) {
        let user_pass = &url[scheme_end + 3..at_pos];
        if let Some(colon_pos) = user_pass.find(':') {
            return format!(
                "{}{}:***{}",
                &url[..scheme_end + 3],
                &user_pass[..colon_pos],
                &url[at_pos..]
            );
        }
    }
    url.to_string()
}
