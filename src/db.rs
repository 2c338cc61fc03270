//! SQLite connection pool.

use crate::error::{DbError, Result};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr as _;
use std::time::Duration;

/// Shared database handles.
#[derive(Debug, Clone)]
pub struct Db {
    pub sqlite: SqlitePool,
}

impl Db {
    /// Open a bounded pool, creating the database file if needed.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(DbError::SqliteConnect)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let sqlite = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(DbError::SqliteConnect)?;

        tracing::debug!(%url, max_connections, "sqlite pool opened");
        Ok(Self { sqlite })
    }

    pub async fn close(&self) {
        self.sqlite.close().await;
    }
}
