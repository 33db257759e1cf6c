//! HTTP handlers for the upload protocol and stored-file access.
//! Whole-file bodies are streamed to disk; chunk bodies are bounded by the
//! chunk size and buffered.

use crate::{
    errors::AppError,
    limits::{CHUNK_SIZE, extension_of},
    models::file::{StoredFile, UploadResult},
    services::storage_service::{FileStorage, IncomingChunk, StorageError},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::Field},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Response to `POST /files/upload-chunk`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub message: String,
    pub upload_id: String,
    pub chunk_index: u64,
    pub received_chunks: u64,
    pub total_chunks: u64,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub limit: Option<usize>,
}

/// Fields of a chunk form, collected in whatever order they arrive.
#[derive(Default)]
struct ChunkForm {
    chunk: Option<Bytes>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    filename: Option<String>,
    upload_id: Option<String>,
}

impl ChunkForm {
    fn into_incoming(self) -> Result<IncomingChunk, StorageError> {
        Ok(IncomingChunk {
            data: self.chunk.ok_or(StorageError::MissingField("chunk"))?,
            chunk_index: parse_count(
                "chunk_index",
                self.chunk_index
                    .ok_or(StorageError::MissingField("chunk_index"))?,
            )?,
            total_chunks: parse_count(
                "total_chunks",
                self.total_chunks
                    .ok_or(StorageError::MissingField("total_chunks"))?,
            )?,
            filename: base_name(&self.filename.ok_or(StorageError::MissingField("filename"))?),
            upload_id: self
                .upload_id
                .ok_or(StorageError::MissingField("upload_id"))?
                .trim()
                .to_string(),
        })
    }
}

fn parse_count(field: &'static str, raw: String) -> Result<u64, StorageError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| StorageError::InvalidField {
            field,
            reason: format!("expected a non-negative integer, got `{}`", raw),
        })
}

/// Browsers may send a full client-side path; keep the last component.
fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}

/// Buffer a field, stopping one byte past `limit` so oversize is detectable
/// without reading the rest.
async fn read_bounded(mut field: Field<'_>, limit: u64) -> Result<Bytes, AppError> {
    let mut buf = BytesMut::new();
    while let Some(piece) = field.chunk().await? {
        let room = (limit as usize + 1).saturating_sub(buf.len());
        buf.extend_from_slice(&piece[..piece.len().min(room)]);
        if buf.len() as u64 > limit {
            break;
        }
    }
    Ok(buf.freeze())
}

/// `POST /files/upload`: store a file sent in one multipart field `file`.
pub async fn upload_file(
    State(storage): State<FileStorage>,
    mut multipart: Multipart,
) -> Result<Json<UploadResult>, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(base_name)
            .ok_or_else(|| AppError::bad_request("Missing filename for field `file`"))?;

        let stream = field.map(|chunk| chunk.map_err(io::Error::other));
        let stored = storage.store_file_stream(&filename, stream).await?;
        tracing::info!(file_id = %stored.id, filename = %stored.filename, size = stored.size_bytes, "stored file");
        return Ok(Json(UploadResult::from_stored(
            &stored,
            "File uploaded successfully",
        )));
    }
    Err(StorageError::MissingField("file").into())
}

/// `POST /files/upload-chunk`: stage one chunk of a chunked upload.
pub async fn upload_chunk(
    State(storage): State<FileStorage>,
    mut multipart: Multipart,
) -> Result<Json<ChunkResponse>, AppError> {
    let mut form = ChunkForm::default();
    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "chunk" => form.chunk = Some(read_bounded(field, CHUNK_SIZE).await?),
            "chunk_index" => form.chunk_index = Some(field.text().await?),
            "total_chunks" => form.total_chunks = Some(field.text().await?),
            "filename" => form.filename = Some(field.text().await?),
            "upload_id" => form.upload_id = Some(field.text().await?),
            _ => {}
        }
    }

    let chunk = form.into_incoming()?;
    let upload_id = chunk.upload_id.clone();
    let receipt = storage.stage_chunk(chunk).await?;
    Ok(Json(ChunkResponse {
        message: "Chunk received".into(),
        upload_id,
        chunk_index: receipt.chunk_index,
        received_chunks: receipt.received_chunks,
        total_chunks: receipt.total_chunks,
    }))
}

/// `POST /files/complete-upload`: assemble staged chunks into a stored file.
pub async fn complete_upload(
    State(storage): State<FileStorage>,
    mut multipart: Multipart,
) -> Result<Json<UploadResult>, AppError> {
    let mut upload_id = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("upload_id") {
            upload_id = Some(field.text().await?.trim().to_string());
        }
    }
    let upload_id = upload_id.ok_or(StorageError::MissingField("upload_id"))?;

    let stored = storage.complete_upload(&upload_id).await?;
    Ok(Json(UploadResult::from_stored(
        &stored,
        "File upload completed successfully",
    )))
}

/// `GET /files`: stored files, newest first.
pub async fn list_files(
    State(storage): State<FileStorage>,
    Query(q): Query<ListFilesQuery>,
) -> Result<Json<Vec<StoredFile>>, AppError> {
    let files = storage.list_files(q.limit.unwrap_or(100)).await?;
    Ok(Json(files))
}

fn parse_file_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found(format!("File `{}` not found", raw)))
}

/// `GET /files/{file_id}`: metadata only.
pub async fn get_file(
    State(storage): State<FileStorage>,
    Path(file_id): Path<String>,
) -> Result<Json<StoredFile>, AppError> {
    let id = parse_file_id(&file_id)?;
    Ok(Json(storage.get_file(id).await?))
}

/// `GET /files/{file_id}/content`: stream the stored payload.
pub async fn download_file(
    State(storage): State<FileStorage>,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_file_id(&file_id)?;
    let (meta, file) = storage.open_file(id).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `DELETE /files/{file_id}`
pub async fn delete_file(
    State(storage): State<FileStorage>,
    Path(file_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_file_id(&file_id)?;
    storage.delete_file(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn content_type_for(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some("json") => "application/json",
        Some("md") => "text/markdown; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn set_file_headers(headers: &mut HeaderMap, meta: &StoredFile) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&meta.filename)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    let disposition = format!(
        "attachment; filename=\"{}\"",
        meta.filename.replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.uploaded_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
