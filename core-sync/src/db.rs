//! SQLite pool for the sync queue.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, SyncError};

/// Path value that selects a private in-memory database
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Open the queue database at `database_path`, creating the file if needed.
///
/// `:memory:` yields a single-connection pool, since every SQLite memory
/// connection is its own database.
pub async fn open_pool(database_path: &Path) -> Result<SqlitePool> {
    if database_path.as_os_str() == IN_MEMORY_PATH {
        info!("Opening in-memory sync queue database");
        return SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| SyncError::Database(e.to_string()));
    }

    info!(path = %database_path.display(), "Opening sync queue database");

    let options = SqliteConnectOptions::new()
        .filename(database_path)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to open sync queue database");
            SyncError::Database(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool() {
        let pool = open_pool(Path::new(IN_MEMORY_PATH)).await.unwrap();
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_file_pool_uses_wal() {
        let dir = std::env::temp_dir().join(format!("sync-queue-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let pool = open_pool(&dir.join("queue.db")).await.unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        pool.close().await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
