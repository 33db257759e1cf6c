//! End-to-end: the real router on an ephemeral port, driven by the real
//! HTTP transport.

use insightvault::{
    client::{HttpTransport, UploadClient, UploadError, UploadFile, UploadPhase, UploadTransport},
    db,
    limits::MIB,
    models::file::StoredFile,
    services::storage_service::FileStorage,
};
use axum::{Json, Router, routing::post};
use reqwest::{StatusCode, multipart::Form};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::mpsc};

const TOKEN: &str = "test-token";

struct TestService {
    base_url: String,
    storage: FileStorage,
    _dir: TempDir,
}

async fn spawn_service(api_token: Option<&str>) -> TestService {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::connect_in_memory().await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let storage = FileStorage::new(Arc::new(pool), dir.path());
    let app = insightvault::app(storage.clone(), api_token.map(String::from));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestService {
        base_url: format!("http://{}", addr),
        storage,
        _dir: dir,
    }
}

fn client_for(svc: &TestService, token: Option<&str>) -> UploadClient {
    UploadClient::new(HttpTransport::new(&svc.base_url), token.map(String::from))
}

async fn download(svc: &TestService, file_id: &str) -> Vec<u8> {
    let resp = reqwest::Client::new()
        .get(format!("{}/files/{}/content", svc.base_url, file_id))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    resp.bytes().await.unwrap().to_vec()
}

#[tokio::test]
async fn small_export_is_stored_and_listed() {
    let svc = spawn_service(Some(TOKEN)).await;
    let client = client_for(&svc, Some(TOKEN));
    let export = br#"[{"title":"a","mapping":{}},{"title":"b","mapping":{}},{"title":"c","mapping":{}}]"#;
    let file = UploadFile::from_bytes("conversations.json", &export[..]);

    let result = client.upload(&file).await.unwrap();

    assert_eq!(result.filename, "conversations.json");
    assert_eq!(result.conversations_count, 3);
    assert_eq!(result.message.as_deref(), Some("File uploaded successfully"));
    assert_eq!(download(&svc, &result.file_id).await, export.to_vec());

    let listed: Vec<StoredFile> = reqwest::Client::new()
        .get(format!("{}/files", svc.base_url))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id.to_string(), result.file_id);
}

#[tokio::test]
async fn large_file_round_trips_through_chunks() {
    let svc = spawn_service(Some(TOKEN)).await;
    let client = client_for(&svc, Some(TOKEN));
    let data: Vec<u8> = (0..(55 * MIB) as usize).map(|i| (i % 251) as u8).collect();
    let file = UploadFile::from_bytes("history.txt", data.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let result = client.upload_with_progress(&file, Some(tx)).await.unwrap();

    assert_eq!(
        result.message.as_deref(),
        Some("File upload completed successfully")
    );
    assert_eq!(result.conversations_count, 0);
    assert!(download(&svc, &result.file_id).await == data);

    let mut chunk_events = 0;
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        if matches!(event.phase, UploadPhase::SendingChunk(_)) {
            chunk_events += 1;
        }
        last = Some(event);
    }
    assert_eq!(chunk_events, 11);
    assert_eq!(last.unwrap().phase, UploadPhase::Succeeded);

    let staged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
        .fetch_one(&*svc.storage.db)
        .await
        .unwrap();
    assert_eq!(staged, 0);
}

#[tokio::test]
async fn wrong_token_is_rejected_with_detail() {
    let svc = spawn_service(Some(TOKEN)).await;
    let client = client_for(&svc, Some("someone-else"));
    let file = UploadFile::from_bytes("notes.md", &b"# hello"[..]);

    let err = client.upload(&file).await.unwrap_err();

    assert!(matches!(err, UploadError::Rejected { status: 401, .. }));
    assert_eq!(err.to_string(), "Invalid authentication credentials");
}

#[tokio::test]
async fn requests_without_bearer_get_401() {
    let svc = spawn_service(None).await;
    let form = Form::new().text("upload_id", "upload_1_abc");
    let resp = reqwest::Client::new()
        .post(format!("{}/files/complete-upload", svc.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["detail"], "Not authenticated");
}

#[tokio::test]
async fn completion_with_a_gap_reports_missing_chunks() {
    let svc = spawn_service(None).await;
    let transport = HttpTransport::new(&svc.base_url);
    transport
        .upload_chunk(
            "any",
            insightvault::client::ChunkRequest {
                upload_id: "upload_1_gap".into(),
                filename: "notes.txt".into(),
                chunk_index: 0,
                total_chunks: 3,
                data: bytes::Bytes::from_static(b"first"),
            },
        )
        .await
        .unwrap();

    let err = transport
        .complete_upload("any", "upload_1_gap")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Missing chunks: [1, 2]");

    let err = transport
        .complete_upload("any", "upload_1_unknown")
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Rejected { status: 404, .. }));
}

#[tokio::test]
async fn invalid_json_export_is_rejected() {
    let svc = spawn_service(None).await;
    let client = client_for(&svc, Some("any"));
    let file = UploadFile::from_bytes("conversations.json", &b"[{\"title\":"[..]);

    let err = client.upload(&file).await.unwrap_err();

    assert!(matches!(err, UploadError::Rejected { status: 400, .. }));
    assert!(err.to_string().starts_with("Invalid JSON file: "));
}

#[tokio::test]
async fn probes_answer_without_auth() {
    let svc = spawn_service(Some(TOKEN)).await;
    let http = reqwest::Client::new();
    for path in ["/healthz", "/readyz"] {
        let resp = http
            .get(format!("{}{}", svc.base_url, path))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{path}");
    }
}

/// A service that fails every upload request in ways that carry no usable
/// `detail`.
async fn spawn_failing_service() -> String {
    let app = Router::new()
        .route(
            "/files/upload",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream unavailable") }),
        )
        .route(
            "/files/upload-chunk",
            post(|| async {
                (
                    axum::http::StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({"detail": [{"loc": ["body", "chunk"], "msg": "field required"}]})),
                )
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn plain_text_error_falls_back_to_generic_message() {
    let base_url = spawn_failing_service().await;
    let client = UploadClient::new(HttpTransport::new(&base_url), Some("any".into()));
    let file = UploadFile::from_bytes("notes.txt", &b"hello"[..]);

    let err = client.upload(&file).await.unwrap_err();

    assert!(matches!(err, UploadError::Rejected { status: 502, .. }));
    assert_eq!(err.to_string(), "Upload failed");
}

#[tokio::test]
async fn structured_detail_falls_back_to_chunk_message() {
    let base_url = spawn_failing_service().await;
    let transport = HttpTransport::new(&base_url);

    let err = transport
        .upload_chunk(
            "any",
            insightvault::client::ChunkRequest {
                upload_id: "upload_1_list".into(),
                filename: "notes.txt".into(),
                chunk_index: 0,
                total_chunks: 2,
                data: bytes::Bytes::from_static(b"first"),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Rejected { status: 422, .. }));
    assert_eq!(err.to_string(), "Chunk upload failed");
}

#[tokio::test]
async fn unreachable_service_fails_with_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = UploadClient::new(
        HttpTransport::new(format!("http://{}", addr)),
        Some("any".into()),
    );
    let file = UploadFile::from_bytes("notes.md", &b"# hello"[..]);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let err = client.upload_with_progress(&file, Some(tx)).await.unwrap_err();

    assert!(matches!(err, UploadError::Transport(_)), "{err}");
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.phase, UploadPhase::Failed);
    assert_eq!(last.completed_chunks, 0);
    assert_eq!(last.total_chunks, 0);
    assert_eq!(last.percent, 0.0);
}
