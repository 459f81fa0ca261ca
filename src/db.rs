use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Database connection pool wrapper
///
/// Both the catalog and the chunk store live in this database. Every call
/// made through [`Database::timed`] is bounded by the configured operation
/// timeout.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    op_timeout: Duration,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str, max_connections: u32, op_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(op_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(op_timeout)
            .connect_with(options)
            .await?;

        Ok(Self { pool, op_timeout })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a storage call under the per-call timeout
    pub async fn timed<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(AppError::Storage(format!(
                "{} timed out after {:?}",
                op, self.op_timeout
            ))),
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                file_name TEXT NOT NULL,
                length INTEGER NOT NULL DEFAULT 0,
                chunk_size INTEGER NOT NULL,
                upload_date TEXT NOT NULL,
                owner TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_chunks (
                file_id TEXT NOT NULL,
                n INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (file_id, n)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_owner ON files(owner)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_status ON files(status, upload_date)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Migrated database in a throwaway directory; keep the TempDir alive
    pub async fn temp_database() -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mfs-test.db");
        let db = Database::new(path.to_str().unwrap(), 4, Duration::from_secs(10))
            .await
            .unwrap();
        db.run_migrations().await.unwrap();
        (db, dir)
    }
}
