use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::{ClaimSet, FileRecord, NewFile, OwnerFilter, SortKey};
use crate::services::authz::{AuthorizationEngine, Operation};
use crate::storage::{Catalog, ChunkStore, ChunkStream, ChunkSummary};

/// Log storage faults with their context before handing them back
fn log_fault(operation: &str, file_id: &str, err: AppError) -> AppError {
    if err.is_storage_fault() {
        tracing::error!(operation, file_id, error = %err, "Storage operation failed");
    }
    err
}

/// Upload whose chunks are written but whose catalog row is still pending
#[derive(Debug)]
#[must_use = "a staged upload must be committed or aborted"]
pub struct StagedUpload {
    pub id: String,
    pub file_name: String,
    pub summary: ChunkSummary,
}

/// A file ready to be streamed to the client
pub struct Download {
    pub record: FileRecord,
    pub body: ChunkStream,
}

/// File operations over the catalog and the chunk store
///
/// Every operation takes the caller's claims explicitly and authorizes before
/// touching storage.
pub struct FileService {
    catalog: Catalog,
    chunks: ChunkStore,
    authz: AuthorizationEngine,
    max_upload_size: u64,
    pending_ttl: Duration,
}

impl FileService {
    pub fn new(
        catalog: Catalog,
        chunks: ChunkStore,
        authz: AuthorizationEngine,
        max_upload_size: u64,
        pending_ttl: Duration,
    ) -> Self {
        Self {
            catalog,
            chunks,
            authz,
            max_upload_size,
            pending_ttl,
        }
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    /// Reject a request body that announces more bytes than allowed
    pub fn check_upload_size(&self, content_length: Option<u64>) -> Result<()> {
        match content_length {
            Some(len) if len > self.max_upload_size => Err(AppError::BadRequest(format!(
                "File is too big! (Max size: {} bytes)",
                self.max_upload_size
            ))),
            _ => Ok(()),
        }
    }

    /// Write `data` as a new file owned by the caller.
    ///
    /// The catalog row stays pending, and thus invisible, until
    /// [`FileService::commit_upload`]. On failure everything written so far
    /// is removed again.
    pub async fn stage_upload<S>(
        &self,
        claims: &ClaimSet,
        file_name: String,
        data: S,
    ) -> Result<StagedUpload>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        if !self.authz.authorize(claims, Operation::Upload, None) {
            return Err(AppError::Forbidden);
        }
        if file_name.is_empty() {
            return Err(AppError::BadRequest("No file name provided".to_string()));
        }

        let id = self
            .catalog
            .insert(&NewFile {
                file_name: file_name.clone(),
                owner: claims.subject.clone(),
                description: String::new(),
                chunk_size: self.chunks.chunk_size(),
            })
            .await
            .map_err(|e| log_fault("upload", "-", e))?;

        match self
            .chunks
            .create(&id, data, Some(self.max_upload_size))
            .await
        {
            Ok(summary) => Ok(StagedUpload {
                id,
                file_name,
                summary,
            }),
            Err(e) => {
                let e = log_fault("upload", &id, e);
                self.discard(&id).await;
                Err(e)
            }
        }
    }

    /// Publish a staged upload
    pub async fn commit_upload(&self, staged: StagedUpload, description: &str) -> Result<FileRecord> {
        match self
            .catalog
            .commit(&staged.id, staged.summary.length, description)
            .await
        {
            Ok(record) => {
                tracing::info!(
                    file_id = %record.id,
                    owner = %record.owner,
                    length = record.length,
                    chunks = staged.summary.count,
                    "Write file to DB was successful"
                );
                Ok(record)
            }
            Err(e) => {
                let e = log_fault("upload", &staged.id, e);
                self.discard(&staged.id).await;
                Err(e)
            }
        }
    }

    pub async fn abort_upload(&self, staged: StagedUpload) {
        tracing::debug!(file_id = %staged.id, "Aborting staged upload");
        self.discard(&staged.id).await;
    }

    /// Remove chunks and the pending row of an unfinished upload
    async fn discard(&self, id: &str) {
        match self.chunks.delete(id).await {
            Ok(()) | Err(AppError::NotFound(_)) => {}
            Err(e) => {
                log_fault("discard upload", id, e);
            }
        }
        if let Err(e) = self.catalog.discard_pending(id).await {
            log_fault("discard upload", id, e);
        }
    }

    /// Metadata of one file
    pub async fn get_file(&self, claims: &ClaimSet, id: &str) -> Result<FileRecord> {
        let record = self
            .catalog
            .find_by_id(id)
            .await
            .map_err(|e| log_fault("get file", id, e))?;

        if !self
            .authz
            .authorize(claims, Operation::Read, Some(&record.owner))
        {
            return Err(AppError::Forbidden);
        }
        Ok(record)
    }

    /// Resolve a file and open its content stream
    pub async fn download(&self, claims: &ClaimSet, id: &str) -> Result<Download> {
        let record = self.get_file(claims, id).await?;

        let body = if record.length == 0 {
            // Empty files have no chunks
            stream::empty().boxed()
        } else {
            self.chunks
                .open_read(id)
                .await
                .map_err(|e| log_fault("download", id, e))?
        };

        Ok(Download { record, body })
    }

    /// Files visible to the caller, or the files of `user` when given
    pub async fn list_files(
        &self,
        claims: &ClaimSet,
        user: Option<&str>,
        sort: Option<SortKey>,
    ) -> Result<Vec<FileRecord>> {
        let filter = match user {
            Some(target) => {
                if !self
                    .authz
                    .authorize(claims, Operation::ListForUser(target), None)
                {
                    return Err(AppError::Forbidden);
                }
                OwnerFilter::Owner(target.to_string())
            }
            None => {
                if !self.authz.authorize(claims, Operation::ListAll, None) {
                    return Err(AppError::Forbidden);
                }
                self.authz.list_filter(claims)
            }
        };

        self.catalog
            .find_by_filter(&filter, sort)
            .await
            .map_err(|e| log_fault("list files", "-", e))
    }

    /// Delete a file: chunks first, then its catalog row.
    ///
    /// A crash between the two steps leaves a catalog row without chunks;
    /// downloading it yields NotFound and deleting it again removes the row.
    pub async fn delete_file(&self, claims: &ClaimSet, id: &str) -> Result<()> {
        let record = self
            .catalog
            .find_by_id(id)
            .await
            .map_err(|e| log_fault("delete", id, e))?;

        if !self
            .authz
            .authorize(claims, Operation::Delete, Some(&record.owner))
        {
            return Err(AppError::Forbidden);
        }

        match self.chunks.delete(id).await {
            Ok(()) => {}
            Err(AppError::NotFound(_)) => {
                if record.length > 0 {
                    tracing::warn!(file_id = id, "Chunks already gone, removing catalog entry");
                }
            }
            Err(e) => return Err(log_fault("delete", id, e)),
        }

        self.catalog
            .delete(id)
            .await
            .map_err(|e| log_fault("delete", id, e))?;

        tracing::info!(file_id = id, by = %claims.subject, "Deleted file");
        Ok(())
    }

    /// Remove uploads that stayed pending longer than the configured TTL
    pub async fn purge_abandoned_uploads(&self) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.pending_ttl)
            .map_err(|e| AppError::Internal(format!("Invalid pending TTL: {}", e)))?;
        let stale = self.catalog.stale_pending(Utc::now() - ttl).await?;

        for id in &stale {
            self.discard(id).await;
        }

        if !stale.is_empty() {
            tracing::info!("Removed {} abandoned uploads", stale.len());
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::db::Database;
    use tempfile::TempDir;

    const CHUNK: usize = 8;
    const MAX: u64 = 100;

    async fn service_with(
        scope: Option<&str>,
        pending_ttl: Duration,
    ) -> (FileService, Database, TempDir) {
        let (db, dir) = temp_database().await;
        let service = FileService::new(
            Catalog::new(db.clone()),
            ChunkStore::new(db.clone(), CHUNK),
            AuthorizationEngine::new("admin", scope.map(str::to_string)),
            MAX,
            pending_ttl,
        );
        (service, db, dir)
    }

    async fn service() -> (FileService, Database, TempDir) {
        service_with(None, Duration::from_secs(3600)).await
    }

    fn user(sub: &str) -> ClaimSet {
        ClaimSet {
            subject: sub.to_string(),
            roles: vec!["user".to_string()],
            scopes: vec![],
        }
    }

    fn admin() -> ClaimSet {
        ClaimSet {
            subject: "root".to_string(),
            roles: vec!["admin".to_string()],
            scopes: vec![],
        }
    }

    fn bytes_of(data: &[u8]) -> impl Stream<Item = Result<Bytes>> {
        stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
    }

    async fn upload(service: &FileService, claims: &ClaimSet, name: &str, data: &[u8]) -> FileRecord {
        let staged = service
            .stage_upload(claims, name.to_string(), bytes_of(data))
            .await
            .unwrap();
        service.commit_upload(staged, "test file").await.unwrap()
    }

    async fn collect(download: Download) -> Vec<u8> {
        let mut body = download.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    async fn row_counts(db: &Database) -> (i64, i64) {
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_chunks")
            .fetch_one(db.pool())
            .await
            .unwrap();
        (files, chunks)
    }

    #[tokio::test]
    async fn test_round_trip_sizes() {
        let (service, _db, _dir) = service().await;
        let alice = user("alice");

        for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 4 * CHUNK] {
            let data: Vec<u8> = (0..len as u8).collect();
            let record = upload(&service, &alice, "data.bin", &data).await;

            assert_eq!(record.length, len as i64);
            assert_eq!(record.chunk_size, CHUNK as i64);
            assert_eq!(record.owner, "alice");
            assert_eq!(record.description, "test file");

            let download = service.download(&alice, &record.id).await.unwrap();
            assert_eq!(download.record, record);
            assert_eq!(collect(download).await, data);
        }
    }

    #[tokio::test]
    async fn test_chunk_accounting() {
        let (service, db, _dir) = service().await;
        let record = upload(&service, &user("alice"), "a", &[7u8; 3 * CHUNK + 2]).await;

        let stats = ChunkStore::new(db, CHUNK).stats(&record.id).await.unwrap();
        assert_eq!(stats.total_length, record.length);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.max_index, 3);
    }

    #[tokio::test]
    async fn test_staged_upload_is_invisible_until_committed() {
        let (service, _db, _dir) = service().await;
        let alice = user("alice");

        let staged = service
            .stage_upload(&alice, "late.txt".to_string(), bytes_of(b"hello"))
            .await
            .unwrap();
        assert!(matches!(
            service.get_file(&alice, &staged.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(service.list_files(&alice, None, None).await.unwrap().is_empty());

        let record = service.commit_upload(staged, "").await.unwrap();
        assert_eq!(service.get_file(&alice, &record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_oversize_upload_leaves_nothing_behind() {
        let (service, db, _dir) = service().await;

        let result = service
            .stage_upload(&user("alice"), "big.bin".to_string(), bytes_of(&[0u8; MAX as usize + 1]))
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(row_counts(&db).await, (0, 0));

        assert!(service.check_upload_size(Some(MAX + 1)).is_err());
        assert!(service.check_upload_size(Some(MAX)).is_ok());
        assert!(service.check_upload_size(None).is_ok());
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing_behind() {
        let (service, db, _dir) = service().await;
        let input = stream::iter(vec![
            Ok(Bytes::from(vec![1u8; 3 * CHUNK])),
            Err(AppError::BadRequest("Failed to read file chunk".to_string())),
        ]);

        let result = service
            .stage_upload(&user("alice"), "broken.bin".to_string(), input)
            .await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(row_counts(&db).await, (0, 0));
    }

    #[tokio::test]
    async fn test_abort_upload() {
        let (service, db, _dir) = service().await;
        let staged = service
            .stage_upload(&user("alice"), "x".to_string(), bytes_of(&[1u8; 20]))
            .await
            .unwrap();
        service.abort_upload(staged).await;
        assert_eq!(row_counts(&db).await, (0, 0));
    }

    #[tokio::test]
    async fn test_ownership_rules() {
        let (service, _db, _dir) = service().await;
        let alice = user("alice");
        let bob = user("bob");
        let record = upload(&service, &alice, "secret.txt", b"top secret").await;

        assert!(matches!(service.download(&bob, &record.id).await, Err(AppError::Forbidden)));
        assert!(matches!(service.get_file(&bob, &record.id).await, Err(AppError::Forbidden)));
        assert!(matches!(service.delete_file(&bob, &record.id).await, Err(AppError::Forbidden)));

        assert_eq!(
            collect(service.download(&admin(), &record.id).await.unwrap()).await,
            b"top secret"
        );
        assert!(service.get_file(&alice, &record.id).await.is_ok());
        service.delete_file(&admin(), &record.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found_for_everyone() {
        let (service, _db, _dir) = service().await;
        let missing = uuid::Uuid::new_v4().to_string();

        for claims in [user("bob"), admin()] {
            assert!(matches!(
                service.download(&claims, &missing).await,
                Err(AppError::NotFound(_))
            ));
            assert!(matches!(
                service.delete_file(&claims, &missing).await,
                Err(AppError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_listing() {
        let (service, _db, _dir) = service().await;
        let alice = user("alice");
        let bob = user("bob");

        let a1 = upload(&service, &alice, "b.txt", b"1").await;
        tokio::time::sleep(Duration::from_millis(3)).await;
        let b1 = upload(&service, &bob, "c.txt", b"2").await;
        tokio::time::sleep(Duration::from_millis(3)).await;
        let a2 = upload(&service, &alice, "a.txt", b"3").await;

        let mine = service.list_files(&alice, None, None).await.unwrap();
        assert_eq!(mine, vec![a1.clone(), a2.clone()]);

        let mine_by_name = service
            .list_files(&alice, None, Some(SortKey::Name))
            .await
            .unwrap();
        assert_eq!(mine_by_name, vec![a2.clone(), a1.clone()]);

        let everything = service.list_files(&admin(), None, None).await.unwrap();
        assert_eq!(everything, vec![a1.clone(), b1.clone(), a2.clone()]);

        assert_eq!(
            service.list_files(&bob, Some("bob"), None).await.unwrap(),
            vec![b1.clone()]
        );
        assert!(matches!(
            service.list_files(&bob, Some("alice"), None).await,
            Err(AppError::Forbidden)
        ));
        assert_eq!(
            service.list_files(&admin(), Some("alice"), None).await.unwrap(),
            vec![a1, a2]
        );
    }

    #[tokio::test]
    async fn test_delete_twice() {
        let (service, db, _dir) = service().await;
        let alice = user("alice");
        let record = upload(&service, &alice, "a", &[5u8; 30]).await;

        service.delete_file(&alice, &record.id).await.unwrap();
        assert!(matches!(
            service.delete_file(&alice, &record.id).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(row_counts(&db).await, (0, 0));
    }

    #[tokio::test]
    async fn test_delete_empty_file() {
        let (service, db, _dir) = service().await;
        let alice = user("alice");
        let record = upload(&service, &alice, "empty", b"").await;

        service.delete_file(&alice, &record.id).await.unwrap();
        assert_eq!(row_counts(&db).await, (0, 0));
    }

    #[tokio::test]
    async fn test_orphaned_catalog_row_can_be_deleted() {
        let (service, db, _dir) = service().await;
        let alice = user("alice");
        let record = upload(&service, &alice, "a", &[5u8; 30]).await;

        // Simulate a crash between chunk and catalog deletion
        ChunkStore::new(db.clone(), CHUNK).delete(&record.id).await.unwrap();
        assert!(matches!(
            service.download(&alice, &record.id).await,
            Err(AppError::NotFound(_))
        ));

        service.delete_file(&alice, &record.id).await.unwrap();
        assert_eq!(row_counts(&db).await, (0, 0));
    }

    #[tokio::test]
    async fn test_scope_gate() {
        let (service, db, _dir) = service_with(Some("mfs"), Duration::from_secs(3600)).await;
        let mut alice = user("alice");

        let result = service
            .stage_upload(&alice, "a".to_string(), bytes_of(b"data"))
            .await;
        assert!(matches!(result, Err(AppError::Forbidden)));
        assert_eq!(row_counts(&db).await, (0, 0));

        alice.scopes.push("mfs".to_string());
        let record = upload(&service, &alice, "a", b"data").await;

        alice.scopes.clear();
        assert!(matches!(service.download(&alice, &record.id).await, Err(AppError::Forbidden)));
        assert!(matches!(service.list_files(&alice, None, None).await, Err(AppError::Forbidden)));
    }

    #[tokio::test]
    async fn test_purge_abandoned_uploads() {
        let (service, db, _dir) = service_with(None, Duration::ZERO).await;
        let alice = user("alice");

        let committed = upload(&service, &alice, "kept", &[1u8; 20]).await;
        let _abandoned = service
            .stage_upload(&alice, "lost".to_string(), bytes_of(&[2u8; 20]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(service.purge_abandoned_uploads().await.unwrap(), 1);
        assert_eq!(row_counts(&db).await, (1, 3));
        assert!(service.get_file(&alice, &committed.id).await.is_ok());
        assert_eq!(service.purge_abandoned_uploads().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_after_sweep_is_a_storage_fault() {
        let (service, db, _dir) = service_with(None, Duration::ZERO).await;
        let staged = service
            .stage_upload(&user("alice"), "slow".to_string(), bytes_of(&[3u8; 20]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(service.purge_abandoned_uploads().await.unwrap(), 1);

        let result = service.commit_upload(staged, "late").await;
        assert!(matches!(result, Err(AppError::Storage(_))), "{result:?}");
        assert_eq!(row_counts(&db).await, (0, 0));
    }

    #[tokio::test]
    async fn test_purge_keeps_fresh_uploads() {
        let (service, db, _dir) = service().await;
        let _fresh = service
            .stage_upload(&user("alice"), "in-flight".to_string(), bytes_of(&[2u8; 20]))
            .await
            .unwrap();

        assert_eq!(service.purge_abandoned_uploads().await.unwrap(), 0);
        assert_eq!(row_counts(&db).await, (1, 3));
    }
}
