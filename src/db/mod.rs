//! Database layer for the controller.
//!
//! This module provides:
//! - Connection pool management
//! - The repository implementing the scheduling-database query contract
//!
//! The schema is owned by the league site; the controller only reads it and
//! writes back `matches_server_details` and `user_notifications`.

mod error;
mod repository;

pub use error::DbError;
pub use repository::{Division, League, Match, MatchDetails, MatchRound, Repository};

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::info;

use crate::config::DatabaseConfig;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool and verify it is reachable.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DbError> {
        info!(
            host = %config.host,
            database = %config.name,
            max_open_conns = config.max_open_conns,
            "Connecting to database"
        );

        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.name)
            .ssl_mode(parse_ssl_mode(&config.ssl_mode));
        if !config.password.is_empty() {
            options = options.password(&config.password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns.min(config.max_open_conns))
            .max_lifetime(config.conn_max_lifetime)
            .connect_with(options)
            .await
            .map_err(DbError::Connect)?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get a repository handle.
    pub fn repository(&self) -> Repository {
        Repository::new(self.pool.clone())
    }
}

fn parse_ssl_mode(raw: &str) -> PgSslMode {
    match raw.to_lowercase().as_str() {
        "allow" => PgSslMode::Allow,
        "prefer" => PgSslMode::Prefer,
        "require" => PgSslMode::Require,
        "verify-ca" => PgSslMode::VerifyCa,
        "verify-full" => PgSslMode::VerifyFull,
        _ => PgSslMode::Disable,
    }
}
