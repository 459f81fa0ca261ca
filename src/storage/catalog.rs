use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{FileRecord, FileStatus, NewFile, OwnerFilter, SortKey};

const RECORD_COLUMNS: &str =
    "id, file_name, length, chunk_size, upload_date, owner, description";

/// Fixed-width UTC timestamp so text order matches time order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Metadata index of stored files
///
/// Rows are inserted `pending`, become visible once committed and are never
/// modified afterwards.
#[derive(Clone)]
pub struct Catalog {
    db: Database,
}

impl Catalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Reserve a new identifier for a file whose chunks are about to be written
    pub async fn insert(&self, file: &NewFile) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());

        self.db
            .timed(
                "insert file",
                sqlx::query(
                    r#"
                    INSERT INTO files (id, file_name, length, chunk_size, upload_date, owner, description, status)
                    VALUES (?, ?, 0, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(&file.file_name)
                .bind(file.chunk_size as i64)
                .bind(&now)
                .bind(&file.owner)
                .bind(&file.description)
                .bind(FileStatus::Pending.as_str())
                .execute(self.db.pool()),
            )
            .await?;

        Ok(id)
    }

    /// Make a pending file visible with its final length and description
    pub async fn commit(&self, id: &str, length: u64, description: &str) -> Result<FileRecord> {
        let result = self
            .db
            .timed(
                "commit file",
                sqlx::query(
                    "UPDATE files SET status = ?, length = ?, description = ? WHERE id = ? AND status = ?",
                )
                .bind(FileStatus::Committed.as_str())
                .bind(length as i64)
                .bind(description)
                .bind(id)
                .bind(FileStatus::Pending.as_str())
                .execute(self.db.pool()),
            )
            .await?;

        // The pending row is gone: swept or already committed
        if result.rows_affected() == 0 {
            return Err(AppError::Storage(format!(
                "Pending file {} vanished before commit",
                id
            )));
        }

        self.find_by_id(id).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<FileRecord> {
        let query = format!("SELECT {} FROM files WHERE id = ? AND status = ?", RECORD_COLUMNS);

        self.db
            .timed(
                "find file",
                sqlx::query_as::<_, FileRecord>(&query)
                    .bind(id)
                    .bind(FileStatus::Committed.as_str())
                    .fetch_optional(self.db.pool()),
            )
            .await?
            .ok_or_else(AppError::not_found)
    }

    pub async fn find_by_filter(
        &self,
        filter: &OwnerFilter,
        sort: Option<SortKey>,
    ) -> Result<Vec<FileRecord>> {
        let order_by = sort.unwrap_or(SortKey::Date).order_by();

        let files = match filter {
            OwnerFilter::All => {
                let query = format!(
                    "SELECT {} FROM files WHERE status = ? ORDER BY {}",
                    RECORD_COLUMNS, order_by
                );
                self.db
                    .timed(
                        "list files",
                        sqlx::query_as::<_, FileRecord>(&query)
                            .bind(FileStatus::Committed.as_str())
                            .fetch_all(self.db.pool()),
                    )
                    .await?
            }
            OwnerFilter::Owner(owner) => {
                let query = format!(
                    "SELECT {} FROM files WHERE status = ? AND owner = ? ORDER BY {}",
                    RECORD_COLUMNS, order_by
                );
                self.db
                    .timed(
                        "list files",
                        sqlx::query_as::<_, FileRecord>(&query)
                            .bind(FileStatus::Committed.as_str())
                            .bind(owner)
                            .fetch_all(self.db.pool()),
                    )
                    .await?
            }
        };

        Ok(files)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = self
            .db
            .timed(
                "delete file",
                sqlx::query("DELETE FROM files WHERE id = ? AND status = ?")
                    .bind(id)
                    .bind(FileStatus::Committed.as_str())
                    .execute(self.db.pool()),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found());
        }
        Ok(())
    }

    /// Drop a row that never got committed
    pub async fn discard_pending(&self, id: &str) -> Result<()> {
        self.db
            .timed(
                "discard pending file",
                sqlx::query("DELETE FROM files WHERE id = ? AND status = ?")
                    .bind(id)
                    .bind(FileStatus::Pending.as_str())
                    .execute(self.db.pool()),
            )
            .await?;
        Ok(())
    }

    /// Identifiers of uploads still pending since before `cutoff`
    pub async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.db
            .timed(
                "find stale uploads",
                sqlx::query_scalar("SELECT id FROM files WHERE status = ? AND upload_date < ?")
                    .bind(FileStatus::Pending.as_str())
                    .bind(format_timestamp(cutoff))
                    .fetch_all(self.db.pool()),
            )
            .await
    }
}
