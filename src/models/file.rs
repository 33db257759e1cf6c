//! Represents a persisted upload and the result returned to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A file that finished uploading, either in one request or by assembling chunks.
///
/// The payload lives on disk at `base_path/{id}/{filename}`; this row holds its metadata.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredFile {
    /// Identifier handed back to clients as `file_id`.
    pub id: Uuid,

    /// Original filename as sent by the client.
    pub filename: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload.
    pub etag: String,

    /// Number of conversations found in the export.
    pub conversations_count: i64,

    /// When the file was stored.
    pub uploaded_at: DateTime<Utc>,
}

/// Body of a successful `POST /files/upload` or `POST /files/complete-upload`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub file_id: String,
    pub filename: String,
    pub conversations_count: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadResult {
    pub fn from_stored(file: &StoredFile, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            file_id: file.id.to_string(),
            filename: file.filename.clone(),
            conversations_count: file.conversations_count.max(0) as u64,
            uploaded_at: file.uploaded_at,
        }
    }
}
