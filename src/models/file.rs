use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Catalog entry describing one stored file
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub file_name: String,
    pub length: i64,
    pub chunk_size: i64,
    pub upload_date: String,
    pub owner: String,
    pub description: String,
}

/// Attributes known before any chunk is written
#[derive(Debug, Clone)]
pub struct NewFile {
    pub file_name: String,
    pub owner: String,
    pub description: String,
    pub chunk_size: usize,
}

/// Lifecycle state of a catalog row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Chunks are being written; invisible to readers
    Pending,
    Committed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Committed => "committed",
        }
    }
}

/// Ordering for catalog listings (ascending only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Name,
    Date,
}

impl SortKey {
    pub fn order_by(&self) -> &'static str {
        match self {
            SortKey::Name => "file_name ASC, upload_date ASC, id ASC",
            SortKey::Date => "upload_date ASC, id ASC",
        }
    }
}

/// Owner predicate applied to catalog listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerFilter {
    All,
    Owner(String),
}

/// Query parameters of GET /files
#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub sorted_by: Option<SortKey>,
    pub user: Option<String>,
}
