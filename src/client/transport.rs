//! The three requests of the upload protocol, behind a trait so the
//! uploader can be driven against something other than a live service.

use super::error::{RequestKind, UploadError};
use crate::models::file::UploadResult;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    Client, Response,
    multipart::{Form, Part},
};
use serde::Deserialize;

/// One chunk submission.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: String,
    pub filename: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// `POST /files/upload` with the whole file.
    async fn upload_file(
        &self,
        token: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<UploadResult, UploadError>;

    /// `POST /files/upload-chunk`. The response body is ignored.
    async fn upload_chunk(&self, token: &str, chunk: ChunkRequest) -> Result<(), UploadError>;

    /// `POST /files/complete-upload` carrying only the upload id.
    async fn complete_upload(
        &self,
        token: &str,
        upload_id: &str,
    ) -> Result<UploadResult, UploadError>;
}

/// HTTP implementation of [`UploadTransport`] using multipart forms.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_form(&self, token: &str, path: &str, form: Form) -> Result<Response, UploadError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        Ok(resp)
    }
}

/// Turn a non-2xx response into a rejection carrying the service's `detail`.
async fn reject(resp: Response, kind: RequestKind) -> UploadError {
    let status = resp.status();
    let detail = resp
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.detail)
        .and_then(|value| match value {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        });
    UploadError::rejected(kind, status.as_u16(), detail)
}

async fn parse_result(resp: Response, kind: RequestKind) -> Result<UploadResult, UploadError> {
    if !resp.status().is_success() {
        return Err(reject(resp, kind).await);
    }
    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|err| UploadError::InvalidResponse(err.to_string()))
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn upload_file(
        &self,
        token: &str,
        filename: &str,
        data: Bytes,
    ) -> Result<UploadResult, UploadError> {
        let len = data.len() as u64;
        let part = Part::stream_with_length(data, len).file_name(filename.to_string());
        let form = Form::new().part("file", part);
        let resp = self.post_form(token, "/files/upload", form).await?;
        parse_result(resp, RequestKind::File).await
    }

    async fn upload_chunk(&self, token: &str, chunk: ChunkRequest) -> Result<(), UploadError> {
        let len = chunk.data.len() as u64;
        let part = Part::stream_with_length(chunk.data, len).file_name(chunk.filename.clone());
        let form = Form::new()
            .part("chunk", part)
            .text("chunk_index", chunk.chunk_index.to_string())
            .text("total_chunks", chunk.total_chunks.to_string())
            .text("filename", chunk.filename)
            .text("upload_id", chunk.upload_id);
        let resp = self.post_form(token, "/files/upload-chunk", form).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(reject(resp, RequestKind::Chunk).await)
        }
    }

    async fn complete_upload(
        &self,
        token: &str,
        upload_id: &str,
    ) -> Result<UploadResult, UploadError> {
        let form = Form::new().text("upload_id", upload_id.to_string());
        let resp = self.post_form(token, "/files/complete-upload", form).await?;
        parse_result(resp, RequestKind::Completion).await
    }
}
