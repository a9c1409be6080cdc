//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Match row missing for an explicit by-id lookup.
    #[error("match {0} not found")]
    MatchNotFound(i32),

    /// Round row missing for an explicit by-id lookup.
    #[error("round {round_id} for match {match_id} not found")]
    RoundNotFound { match_id: i32, round_id: i32 },
}
