//! Local SQLite database holding the service's own state.

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;

pub const DB_FILENAME: &str = "console.db";

/// Opens (creating if missing) the database file inside `data_dir`.
pub async fn open_local_db(data_dir: &Path) -> Result<SqlitePool, sqlx::Error> {
    tokio::fs::create_dir_all(data_dir).await?;

    let opts = SqliteConnectOptions::new()
        .filename(data_dir.join(DB_FILENAME))
        .journal_mode(SqliteJournalMode::Wal)
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
}

/// In-memory database for tests. A single connection keeps the data alive.
pub async fn open_memory_db() -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_local_db() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_local_db(&dir.path().join("nested")).await.unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        assert!(dir.path().join("nested").join(DB_FILENAME).exists());
    }
}
