use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::db::Database;
use crate::error::{AppError, Result};

/// Ordered byte stream reassembled from a file's chunks
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// Outcome of writing a byte stream as chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSummary {
    pub count: u64,
    pub length: u64,
}

/// Accounting view over the chunks stored for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    pub count: i64,
    pub total_length: i64,
    /// -1 when the file has no chunks
    pub max_index: i64,
}

/// Binary object store that keeps files as fixed-size chunks
///
/// Chunk `n` of a file holds bytes `[n * chunk_size, (n + 1) * chunk_size)`;
/// only the last chunk may be shorter. Readers never see a file through this
/// store alone: the catalog decides visibility.
#[derive(Clone)]
pub struct ChunkStore {
    db: Database,
    chunk_size: usize,
}

impl ChunkStore {
    pub fn new(db: Database, chunk_size: usize) -> Self {
        Self { db, chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Consume `input` to completion and store it as chunks of `file_id`.
    ///
    /// At most one chunk is buffered at a time. When `limit` is given and the
    /// stream yields more bytes than it allows, writing stops with
    /// `BadRequest`; chunks already written are left for the caller to remove.
    pub async fn create<S>(&self, file_id: &str, input: S, limit: Option<u64>) -> Result<ChunkSummary>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        futures::pin_mut!(input);

        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let mut next_index: i64 = 0;
        let mut total: u64 = 0;

        while let Some(piece) = input.next().await {
            let mut piece = piece?;
            total += piece.len() as u64;
            if let Some(limit) = limit {
                if total > limit {
                    return Err(AppError::BadRequest(format!(
                        "File is too big! (Max size: {} bytes)",
                        limit
                    )));
                }
            }

            while !piece.is_empty() {
                if buf.is_empty() && piece.len() >= self.chunk_size {
                    // Whole chunk available without copying
                    let chunk = piece.split_to(self.chunk_size);
                    self.write_chunk(file_id, next_index, &chunk).await?;
                    next_index += 1;
                    continue;
                }

                let take = (self.chunk_size - buf.len()).min(piece.len());
                buf.extend_from_slice(&piece.split_to(take));
                if buf.len() == self.chunk_size {
                    let chunk = std::mem::replace(&mut buf, BytesMut::with_capacity(self.chunk_size));
                    self.write_chunk(file_id, next_index, &chunk).await?;
                    next_index += 1;
                }
            }
        }

        if !buf.is_empty() {
            self.write_chunk(file_id, next_index, &buf).await?;
            next_index += 1;
        }

        tracing::debug!(
            file_id,
            chunks = next_index,
            length = total,
            "Wrote chunks"
        );

        Ok(ChunkSummary {
            count: next_index as u64,
            length: total,
        })
    }

    async fn write_chunk(&self, file_id: &str, n: i64, data: &[u8]) -> Result<()> {
        self.db
            .timed(
                "write chunk",
                sqlx::query("INSERT INTO file_chunks (file_id, n, data) VALUES (?, ?, ?)")
                    .bind(file_id)
                    .bind(n)
                    .bind(data)
                    .execute(self.db.pool()),
            )
            .await?;
        Ok(())
    }

    /// Open a lazy stream over the chunks of `file_id` in index order.
    ///
    /// Each poll fetches a single chunk, so memory stays bounded by the chunk
    /// size whatever the file length. Dropping the stream stops the reads.
    pub async fn open_read(&self, file_id: &str) -> Result<ChunkStream> {
        let count: i64 = self
            .db
            .timed(
                "count chunks",
                sqlx::query_scalar("SELECT COUNT(*) FROM file_chunks WHERE file_id = ?")
                    .bind(file_id)
                    .fetch_one(self.db.pool()),
            )
            .await?;

        if count == 0 {
            return Err(AppError::NotFound(format!("No chunks for file {}", file_id)));
        }

        let db = self.db.clone();
        let file_id = file_id.to_string();

        let chunks = stream::try_unfold(0i64, move |n| {
            let db = db.clone();
            let file_id = file_id.clone();
            async move {
                if n >= count {
                    return Ok(None);
                }

                let data: Option<Vec<u8>> = db
                    .timed(
                        "read chunk",
                        sqlx::query_scalar("SELECT data FROM file_chunks WHERE file_id = ? AND n = ?")
                            .bind(&file_id)
                            .bind(n)
                            .fetch_optional(db.pool()),
                    )
                    .await?;

                match data {
                    Some(data) => Ok(Some((Bytes::from(data), n + 1))),
                    // Deleted while being read
                    None => Err(AppError::NotFound(format!(
                        "Chunk {} of file {} is missing",
                        n, file_id
                    ))),
                }
            }
        });

        Ok(chunks.boxed())
    }

    /// Remove every chunk of `file_id`
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let result = self
            .db
            .timed(
                "delete chunks",
                sqlx::query("DELETE FROM file_chunks WHERE file_id = ?")
                    .bind(file_id)
                    .execute(self.db.pool()),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("No chunks for file {}", file_id)));
        }

        tracing::debug!(file_id, chunks = result.rows_affected(), "Deleted chunks");
        Ok(())
    }

    pub async fn stats(&self, file_id: &str) -> Result<ChunkStats> {
        let (count, total_length, max_index): (i64, i64, i64) = self
            .db
            .timed(
                "chunk stats",
                sqlx::query_as(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(data)), 0), COALESCE(MAX(n), -1) FROM file_chunks WHERE file_id = ?",
                )
                .bind(file_id)
                .fetch_one(self.db.pool()),
            )
            .await?;

        Ok(ChunkStats {
            count,
            total_length,
            max_index,
        })
    }
}
