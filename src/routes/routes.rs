//! Defines routes for the upload protocol and stored-file access.
//!
//! ## Structure
//! - **Probes** (no auth)
//!   - `GET    /healthz`
//!   - `GET    /readyz`
//!
//! - **Files** (bearer token required)
//!   - `POST   /files/upload`          - whole file in one request
//!   - `POST   /files/upload-chunk`    - one chunk of a chunked upload
//!   - `POST   /files/complete-upload` - assemble staged chunks
//!   - `GET    /files`                 - list stored files
//!   - `GET    /files/{file_id}`       - metadata
//!   - `GET    /files/{file_id}/content` - payload
//!   - `DELETE /files/{file_id}`

use crate::{
    handlers::{
        auth::{AuthState, require_bearer},
        file_handlers::{
            complete_upload, delete_file, download_file, get_file, list_files, upload_chunk,
            upload_file,
        },
        health_handlers::{healthz, readyz},
    },
    limits::{MAX_FILE_SIZE, MIB},
    services::storage_service::FileStorage,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

/// Request bodies may carry a maximum-size file plus multipart framing.
const BODY_LIMIT: usize = (MAX_FILE_SIZE + MIB) as usize;

/// Build the router. The returned `Router<FileStorage>` still needs its state.
pub fn routes(api_token: Option<String>) -> Router<FileStorage> {
    let auth = AuthState::new(api_token);

    let files = Router::new()
        .route("/files", get(list_files))
        .route("/files/upload", post(upload_file))
        .route("/files/upload-chunk", post(upload_chunk))
        .route("/files/complete-upload", post(complete_upload))
        .route("/files/{file_id}", get(get_file).delete(delete_file))
        .route("/files/{file_id}/content", get(download_file))
        .route_layer(middleware::from_fn_with_state(auth, require_bearer))
        .layer(DefaultBodyLimit::max(BODY_LIMIT));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(files)
}
