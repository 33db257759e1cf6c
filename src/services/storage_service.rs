//! src/services/storage_service.rs
//!
//! FileStorage - persists uploaded exports. Metadata lives in SQLite; payloads
//! live on disk:
//!
//! - `base_path/files/{file_id}/{filename}` for stored files
//! - `base_path/staging/{upload_id}/{chunk_index}.part` for chunks of
//!   uploads that have not been completed yet
//!
//! Chunks may arrive in any order and a repeated index replaces the earlier
//! part. Completion assembles parts strictly by index and refuses to run while
//! any index is missing.

use super::conversations::count_conversations;
use crate::{
    limits::{
        CHUNK_SIZE, FILE_TOO_LARGE_MESSAGE, MAX_FILE_SIZE, MAX_TOTAL_CHUNKS,
        invalid_type_message, is_allowed_extension,
    },
    models::{
        file::StoredFile,
        staging::{StagedChunk, StagedUpload},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{}", invalid_type_message())]
    InvalidFileType,
    #[error("{}", FILE_TOO_LARGE_MESSAGE)]
    FileTooLarge,
    #[error("Chunk {index} exceeds the maximum chunk size of 5MB")]
    ChunkTooLarge { index: u64 },
    #[error("Missing form field `{0}`")]
    MissingField(&'static str),
    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Missing chunks: {0:?}")]
    MissingChunks(Vec<u64>),
    #[error("Invalid JSON file: {0}")]
    InvalidJson(String),
    #[error("Upload `{upload_id}` does not match earlier chunks: {reason}")]
    SessionMismatch { upload_id: String, reason: String },
    #[error("Upload session `{0}` not found")]
    UploadNotFound(String),
    #[error("File `{0}` not found")]
    FileNotFound(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Failures caused by the uploaded data itself. A chunked upload that
    /// fails this way cannot succeed on retry and is dropped.
    pub fn discards_upload(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidJson(_) | StorageError::FileTooLarge | StorageError::InvalidFileType
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One received chunk, already parsed out of the request.
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub upload_id: String,
    pub filename: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub data: Bytes,
}

/// What the service knows about an upload after accepting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub chunk_index: u64,
    pub received_chunks: u64,
    pub total_chunks: u64,
}

#[derive(Clone)]
pub struct FileStorage {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk for stored files and staged chunks.
    pub base_path: PathBuf,
}

const MAX_FILENAME_LEN: usize = 255;
const MAX_UPLOAD_ID_LEN: usize = 128;

const FILE_COLUMNS: &str = "id, filename, size_bytes, etag, conversations_count, uploaded_at";

impl FileStorage {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    fn files_root(&self) -> PathBuf {
        self.base_path.join("files")
    }

    fn staging_root(&self) -> PathBuf {
        self.base_path.join("staging")
    }

    fn file_dir(&self, id: Uuid) -> PathBuf {
        self.files_root().join(id.to_string())
    }

    fn staging_dir(&self, upload_id: &str) -> PathBuf {
        self.staging_root().join(upload_id)
    }

    fn part_path(&self, upload_id: &str, index: u64) -> PathBuf {
        self.staging_dir(upload_id).join(format!("{:05}.part", index))
    }

    /// Store a whole file sent in one request.
    ///
    /// Streams into a temp file while computing size and MD5, so nothing
    /// larger than one body frame is held in memory.
    pub async fn store_file_stream<S>(&self, filename: &str, stream: S) -> StorageResult<StoredFile>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        ensure_filename_safe(filename)?;
        fs::create_dir_all(self.files_root()).await?;
        let tmp_path = self.files_root().join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if size_bytes > MAX_FILE_SIZE {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::FileTooLarge);
            }
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = sync_file(&mut file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        drop(file);

        let etag = format!("{:x}", digest.compute());
        self.persist(&tmp_path, filename, size_bytes, etag).await
    }

    /// Accept one chunk of a chunked upload.
    ///
    /// The first chunk of an upload id creates the session; later chunks must
    /// agree with it on filename and chunk count.
    pub async fn stage_chunk(&self, chunk: IncomingChunk) -> StorageResult<ChunkReceipt> {
        ensure_upload_id_safe(&chunk.upload_id)?;
        ensure_filename_safe(&chunk.filename)?;
        if chunk.total_chunks == 0 || chunk.total_chunks > MAX_TOTAL_CHUNKS {
            return Err(StorageError::InvalidField {
                field: "total_chunks",
                reason: format!("must be between 1 and {}", MAX_TOTAL_CHUNKS),
            });
        }
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(StorageError::InvalidField {
                field: "chunk_index",
                reason: format!("must be below total_chunks ({})", chunk.total_chunks),
            });
        }
        if chunk.data.len() as u64 > CHUNK_SIZE {
            return Err(StorageError::ChunkTooLarge {
                index: chunk.chunk_index,
            });
        }

        let now = Utc::now();
        let session = sqlx::query_as::<_, StagedUpload>(
            r#"
            INSERT INTO upload_sessions (upload_id, filename, total_chunks, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id) DO UPDATE SET updated_at = excluded.updated_at
            RETURNING upload_id, filename, total_chunks, created_at, updated_at
            "#,
        )
        .bind(&chunk.upload_id)
        .bind(&chunk.filename)
        .bind(chunk.total_chunks as i64)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        if session.filename != chunk.filename {
            return Err(StorageError::SessionMismatch {
                upload_id: chunk.upload_id,
                reason: format!("filename was `{}`", session.filename),
            });
        }
        if session.total_chunks != chunk.total_chunks as i64 {
            return Err(StorageError::SessionMismatch {
                upload_id: chunk.upload_id,
                reason: format!("total_chunks was {}", session.total_chunks),
            });
        }

        let dir = self.staging_dir(&chunk.upload_id);
        fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let final_path = self.part_path(&chunk.upload_id, chunk.chunk_index);
        if let Err(err) = write_atomically(&tmp_path, &final_path, &chunk.data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        let etag = format!("{:x}", md5::compute(&chunk.data));
        sqlx::query(
            r#"
            INSERT INTO upload_chunks (upload_id, chunk_index, size_bytes, etag, received_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, chunk_index) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                received_at = excluded.received_at
            "#,
        )
        .bind(&chunk.upload_id)
        .bind(chunk.chunk_index as i64)
        .bind(chunk.data.len() as i64)
        .bind(&etag)
        .bind(now)
        .execute(&*self.db)
        .await?;

        let received: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ?")
                .bind(&chunk.upload_id)
                .fetch_one(&*self.db)
                .await?;

        debug!(
            upload_id = %chunk.upload_id,
            index = chunk.chunk_index,
            received,
            total = chunk.total_chunks,
            "staged chunk"
        );

        Ok(ChunkReceipt {
            chunk_index: chunk.chunk_index,
            received_chunks: received.max(0) as u64,
            total_chunks: chunk.total_chunks,
        })
    }

    /// Assemble a chunked upload and persist it.
    ///
    /// A gap leaves the session untouched so the missing chunks can still be
    /// sent. Once assembly starts the session is claimed, so a concurrent
    /// completion for the same id sees `UploadNotFound`. The claim is undone
    /// unless the failure lies in the data itself.
    pub async fn complete_upload(&self, upload_id: &str) -> StorageResult<StoredFile> {
        ensure_upload_id_safe(upload_id)?;
        let session = self.fetch_session(upload_id).await?;
        let chunks = self.fetch_chunks(upload_id).await?;

        let missing = missing_indices(session.total_chunks.max(0) as u64, &chunks);
        if !missing.is_empty() {
            return Err(StorageError::MissingChunks(missing));
        }

        self.claim_session(upload_id).await?;
        let result = self.assemble(&session).await;

        match &result {
            Ok(file) => {
                self.remove_staging_dir(upload_id).await;
                info!(
                    upload_id,
                    file_id = %file.id,
                    size = file.size_bytes,
                    "completed chunked upload"
                );
            }
            Err(err) if err.discards_upload() => {
                self.remove_staging_dir(upload_id).await;
                debug!(upload_id, error = %err, "chunked upload discarded");
            }
            Err(err) => {
                self.restore_session(&session, &chunks).await;
                warn!(upload_id, error = %err, "chunked upload kept for retry");
            }
        }
        result
    }

    async fn assemble(&self, session: &StagedUpload) -> StorageResult<StoredFile> {
        let total = session.total_chunks.max(0) as u64;
        let mut lost = Vec::new();
        for index in 0..total {
            if !fs::try_exists(self.part_path(&session.upload_id, index)).await? {
                lost.push(index);
            }
        }
        if !lost.is_empty() {
            return Err(StorageError::MissingChunks(lost));
        }

        fs::create_dir_all(self.files_root()).await?;
        let tmp_path = self.files_root().join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        for index in 0..total {
            let part = match fs::read(self.part_path(&session.upload_id, index)).await {
                Ok(part) => part,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += part.len() as u64;
            if size_bytes > MAX_FILE_SIZE {
                drop(out);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::FileTooLarge);
            }
            digest.consume(&part);
            if let Err(err) = out.write_all(&part).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = sync_file(&mut out).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        drop(out);

        let etag = format!("{:x}", digest.compute());
        self.persist(&tmp_path, &session.filename, size_bytes, etag)
            .await
    }

    /// Move a fully written temp file into place and record it.
    async fn persist(
        &self,
        tmp_path: &Path,
        filename: &str,
        size_bytes: u64,
        etag: String,
    ) -> StorageResult<StoredFile> {
        let conversations_count = match self.count_file_conversations(tmp_path, filename).await {
            Ok(count) => count,
            Err(err) => {
                let _ = fs::remove_file(tmp_path).await;
                return Err(err);
            }
        };

        let id = Uuid::new_v4();
        let dir = self.file_dir(id);
        let final_path = dir.join(filename);
        if let Err(err) = fs::create_dir_all(&dir).await {
            let _ = fs::remove_file(tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = fs::rename(tmp_path, &final_path).await {
            let _ = fs::remove_file(tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let insert_result = sqlx::query_as::<_, StoredFile>(&format!(
            "INSERT INTO files ({FILE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?) RETURNING {FILE_COLUMNS}"
        ))
        .bind(id)
        .bind(filename)
        .bind(size_bytes as i64)
        .bind(&etag)
        .bind(conversations_count)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(file) => Ok(file),
            Err(err) => {
                let _ = fs::remove_dir_all(&dir).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    async fn count_file_conversations(&self, path: &Path, filename: &str) -> StorageResult<i64> {
        if !filename.to_ascii_lowercase().ends_with(".json") {
            return Ok(0);
        }
        let data = fs::read(path).await?;
        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || count_conversations(&filename, &data))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err)))?
    }

    async fn fetch_session(&self, upload_id: &str) -> StorageResult<StagedUpload> {
        sqlx::query_as::<_, StagedUpload>(
            "SELECT upload_id, filename, total_chunks, created_at, updated_at
             FROM upload_sessions WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::UploadNotFound(upload_id.to_string()))
    }

    async fn fetch_chunks(&self, upload_id: &str) -> StorageResult<Vec<StagedChunk>> {
        let chunks = sqlx::query_as::<_, StagedChunk>(
            "SELECT upload_id, chunk_index, size_bytes, etag, received_at
             FROM upload_chunks WHERE upload_id = ? ORDER BY chunk_index ASC",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(chunks)
    }

    /// Delete the session rows; fails if another caller already did.
    async fn claim_session(&self, upload_id: &str) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::UploadNotFound(upload_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Put back the rows of a claimed session whose assembly failed for a
    /// reason unrelated to its data. Chunks whose part file is gone are left
    /// out so the next completion reports them missing.
    async fn restore_session(&self, session: &StagedUpload, chunks: &[StagedChunk]) {
        let restored = async {
            let mut tx = self.db.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO upload_sessions (upload_id, filename, total_chunks, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(upload_id) DO NOTHING
                "#,
            )
            .bind(&session.upload_id)
            .bind(&session.filename)
            .bind(session.total_chunks)
            .bind(session.created_at)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            for chunk in chunks {
                let part = self.part_path(&chunk.upload_id, chunk.chunk_index.max(0) as u64);
                if !fs::try_exists(&part).await.unwrap_or(false) {
                    continue;
                }
                sqlx::query(
                    r#"
                    INSERT INTO upload_chunks (upload_id, chunk_index, size_bytes, etag, received_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(upload_id, chunk_index) DO NOTHING
                    "#,
                )
                .bind(&chunk.upload_id)
                .bind(chunk.chunk_index)
                .bind(chunk.size_bytes)
                .bind(&chunk.etag)
                .bind(chunk.received_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        }
        .await;

        if let Err(err) = restored {
            warn!(upload_id = %session.upload_id, error = %err, "could not restore upload session");
        }
    }

    async fn remove_staging_dir(&self, upload_id: &str) {
        let dir = self.staging_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!("failed to remove staging dir {}: {}", dir.display(), err),
        }
    }

    /// Discard chunked uploads that have not received a chunk within `ttl`.
    ///
    /// Returns how many sessions were removed.
    pub async fn purge_stale_uploads(&self, ttl: Duration) -> StorageResult<usize> {
        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Ok(0);
        };

        let sessions = sqlx::query_as::<_, StagedUpload>(
            "SELECT upload_id, filename, total_chunks, created_at, updated_at FROM upload_sessions",
        )
        .fetch_all(&*self.db)
        .await?;

        let mut purged = 0;
        for session in sessions.into_iter().filter(|s| s.updated_at < cutoff) {
            match self.claim_session(&session.upload_id).await {
                Ok(()) => {}
                Err(StorageError::UploadNotFound(_)) => continue,
                Err(err) => return Err(err),
            }
            self.remove_staging_dir(&session.upload_id).await;
            debug!(upload_id = %session.upload_id, "purged stale upload");
            purged += 1;
        }
        Ok(purged)
    }

    /// Stored files, newest first.
    pub async fn list_files(&self, limit: usize) -> StorageResult<Vec<StoredFile>> {
        let files = sqlx::query_as::<_, StoredFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM files ORDER BY uploaded_at DESC, id ASC LIMIT ?"
        ))
        .bind(limit.clamp(1, 1000) as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(files)
    }

    pub async fn get_file(&self, id: Uuid) -> StorageResult<StoredFile> {
        sqlx::query_as::<_, StoredFile>(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?"))
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(StorageError::FileNotFound(id))
    }

    /// Metadata plus an open handle for streaming the payload.
    pub async fn open_file(&self, id: Uuid) -> StorageResult<(StoredFile, File)> {
        let meta = self.get_file(id).await?;
        let path = self.file_dir(id).join(&meta.filename);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::FileNotFound(id)
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok((meta, file))
    }

    /// Remove a stored file's record and payload.
    pub async fn delete_file(&self, id: Uuid) -> StorageResult<StoredFile> {
        let meta = self.get_file(id).await?;
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::FileNotFound(id));
        }

        let dir = self.file_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("removed {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("directory {} already missing", dir.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        Ok(meta)
    }
}

/// Indices in `0..total` with no received chunk.
fn missing_indices(total: u64, chunks: &[StagedChunk]) -> Vec<u64> {
    let mut seen = vec![false; total as usize];
    for chunk in chunks {
        if let Some(slot) = usize::try_from(chunk.chunk_index)
            .ok()
            .and_then(|i| seen.get_mut(i))
        {
            *slot = true;
        }
    }
    seen.iter()
        .enumerate()
        .filter(|(_, present)| !**present)
        .map(|(i, _)| i as u64)
        .collect()
}

async fn sync_file(file: &mut File) -> StorageResult<()> {
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Write `data` to `tmp`, fsync, then rename over `dest`.
async fn write_atomically(tmp: &Path, dest: &Path, data: &[u8]) -> StorageResult<()> {
    let mut file = File::create(tmp).await?;
    file.write_all(data).await?;
    sync_file(&mut file).await?;
    drop(file);

    if let Err(err) = fs::rename(tmp, dest).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(dest).await?;
            fs::rename(tmp, dest).await?;
        } else {
            return Err(StorageError::Io(err));
        }
    }
    Ok(())
}

/// Reject filenames that are not a single, allowed path component.
pub fn ensure_filename_safe(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidField {
        field: "filename",
        reason: reason.into(),
    };
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(invalid("must be between 1 and 255 bytes"));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(invalid("must not contain path separators"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(invalid("must not contain control characters"));
    }
    if !is_allowed_extension(name) {
        return Err(StorageError::InvalidFileType);
    }
    Ok(())
}

/// Upload ids become directory names: keep them short and plain.
pub fn ensure_upload_id_safe(upload_id: &str) -> StorageResult<()> {
    let ok = !upload_id.is_empty()
        && upload_id.len() <= MAX_UPLOAD_ID_LEN
        && upload_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidField {
            field: "upload_id",
            reason: "expected 1-128 characters of [A-Za-z0-9_-]".into(),
        })
    }
}
