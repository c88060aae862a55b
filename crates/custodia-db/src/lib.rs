//! Custodia Database Layer
//!
//! SQLite persistence for escrow records.
//!
//! # Layout
//!
//! - **escrow_transactions**: one row per escrow, the record as a JSON
//!   document plus indexed lookup columns and the version guard
//! - **escrow_timeline**: insert-only audit entries keyed by
//!   `(escrow_id, sequence_no)`
//!
//! A commit is a single transaction: an `UPDATE ... WHERE version = ?` and
//! the timeline insert land together or not at all.

pub mod config;
pub mod error;
pub mod models;
pub mod repos;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

pub use config::{DatabaseConfig, StorageBackend};
pub use error::{DbError, DbResult};
pub use models::*;
pub use repos::*;

/// SQLite connection pool
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Open the pool, creating the database file when missing
    pub async fn connect(config: &DatabaseConfig) -> DbResult<Self> {
        info!("Connecting to SQLite: {}", config.url_masked());

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| DbError::Connection(format!("SQLite URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        // Every connection to `:memory:` is a separate database, so the pool
        // must keep exactly one alive.
        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
        pool_options = if config.is_memory_url() {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DbError::Connection(format!("SQLite: {}", e)))?;

        info!("Connected to SQLite");
        Ok(Self { pool })
    }

    /// Connect and migrate in one go
    pub async fn open(config: &DatabaseConfig) -> DbResult<Self> {
        let db = Self::connect(config).await?;
        if config.run_migrations {
            db.migrate().await?;
        }
        Ok(db)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> DbResult<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
        info!("Migrations complete");
        Ok(())
    }

    pub async fn health_check(&self) -> HealthStatus {
        let sqlite = sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok();

        HealthStatus {
            sqlite,
            healthy: sqlite,
        }
    }

    pub fn escrow_repo(&self) -> SqliteEscrowRepository {
        SqliteEscrowRepository::new(self.pool.clone())
    }
}

/// Health status of the database connection
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub sqlite: bool,
    pub healthy: bool,
}
