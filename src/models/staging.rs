//! Server-side state of chunked uploads that have not been completed yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A chunked upload in progress, created by its first chunk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StagedUpload {
    /// Client-generated upload id.
    pub upload_id: String,

    /// Filename announced with the chunks.
    pub filename: String,

    /// Number of chunks the client intends to send.
    pub total_chunks: i64,

    pub created_at: DateTime<Utc>,

    /// Last time a chunk arrived; drives stale-session expiry.
    pub updated_at: DateTime<Utc>,
}

/// A single received chunk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StagedChunk {
    pub upload_id: String,

    /// 0-based position in the file.
    pub chunk_index: i64,

    pub size_bytes: i64,

    /// MD5 of the chunk payload.
    pub etag: String,

    pub received_at: DateTime<Utc>,
}
