//! Drives one upload attempt from a file handle to an [`UploadResult`].

use super::{
    error::UploadError,
    session::{ProgressSender, ProgressTracker, UploadSession},
    source::UploadFile,
    transport::{ChunkRequest, HttpTransport, UploadTransport},
    validation::{requires_chunking, validate},
};
use crate::{config::ClientConfig, models::file::UploadResult};
use tracing::{debug, info, warn};

/// Uploads files to the upload service, one request at a time.
///
/// Files up to the chunking threshold go out in a single request; larger
/// ones are sliced into fixed-size chunks sent strictly in order, followed by
/// a completion call. Any failure ends the attempt: there is no retry and no
/// cleanup request, and staged chunks are left for the service to expire.
#[derive(Debug, Clone)]
pub struct UploadClient<T = HttpTransport> {
    transport: T,
    token: Option<String>,
}

impl UploadClient<HttpTransport> {
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self::new(HttpTransport::new(cfg.api_url.clone()), cfg.token.clone())
    }
}

impl<T: UploadTransport> UploadClient<T> {
    pub fn new(transport: T, token: Option<String>) -> Self {
        Self { transport, token }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn upload(&self, file: &UploadFile) -> Result<UploadResult, UploadError> {
        self.upload_with_progress(file, None).await
    }

    /// Upload `file`, publishing every phase transition on `progress`.
    ///
    /// The last event is always `Succeeded` or `Failed`.
    pub async fn upload_with_progress(
        &self,
        file: &UploadFile,
        progress: Option<ProgressSender>,
    ) -> Result<UploadResult, UploadError> {
        let mut tracker = ProgressTracker::new(progress);
        match self.run(file, &mut tracker).await {
            Ok(result) => {
                tracker.succeeded();
                info!(
                    file_id = %result.file_id,
                    filename = %result.filename,
                    conversations = result.conversations_count,
                    "upload finished"
                );
                Ok(result)
            }
            Err(err) => {
                tracker.failed();
                warn!(filename = %file.name(), error = %err, "upload failed");
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        file: &UploadFile,
        tracker: &mut ProgressTracker,
    ) -> Result<UploadResult, UploadError> {
        let token = self
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(UploadError::AuthenticationRequired)?;

        tracker.validating();
        validate(file.name(), file.size())?;

        if !requires_chunking(file.size()) {
            tracker.sending_file();
            let data = file.read_all().await?;
            debug!(filename = %file.name(), size = file.size(), "sending file in one request");
            return self.transport.upload_file(token, file.name(), data).await;
        }

        let mut session = UploadSession::new(file.name(), file.size());
        let total = session.total_chunks;
        info!(
            upload_id = %session.upload_id,
            filename = %session.filename,
            size = session.size,
            total_chunks = total,
            "starting chunked upload"
        );

        for index in 0..total {
            session.current_chunk_index = index;
            tracker.sending_chunk(index, total);
            let data = file.read_range(session.chunk_range(index)).await?;
            debug!(upload_id = %session.upload_id, index, len = data.len(), "sending chunk");
            self.transport
                .upload_chunk(
                    token,
                    ChunkRequest {
                        upload_id: session.upload_id.clone(),
                        filename: session.filename.clone(),
                        chunk_index: index,
                        total_chunks: total,
                        data,
                    },
                )
                .await?;
        }

        tracker.completing(total);
        self.transport
            .complete_upload(token, &session.upload_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{
            error::RequestKind,
            session::{ProgressEvent, UploadPhase},
        },
        limits::MIB,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        File { filename: String, len: usize },
        Chunk { upload_id: String, index: u64, total: u64, len: usize },
        Complete { upload_id: String },
    }

    /// Records every request and fails on demand.
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        fail_chunk: Option<(u64, Option<String>)>,
        fail_completion: bool,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn result(filename: &str) -> UploadResult {
            UploadResult {
                message: None,
                file_id: "f-1".into(),
                filename: filename.into(),
                conversations_count: 2,
                uploaded_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl UploadTransport for RecordingTransport {
        async fn upload_file(
            &self,
            _token: &str,
            filename: &str,
            data: Bytes,
        ) -> Result<UploadResult, UploadError> {
            self.calls.lock().unwrap().push(Call::File {
                filename: filename.into(),
                len: data.len(),
            });
            Ok(Self::result(filename))
        }

        async fn upload_chunk(&self, _token: &str, chunk: ChunkRequest) -> Result<(), UploadError> {
            self.calls.lock().unwrap().push(Call::Chunk {
                upload_id: chunk.upload_id,
                index: chunk.chunk_index,
                total: chunk.total_chunks,
                len: chunk.data.len(),
            });
            match &self.fail_chunk {
                Some((index, detail)) if *index == chunk.chunk_index => Err(
                    UploadError::rejected(RequestKind::Chunk, 500, detail.clone()),
                ),
                _ => Ok(()),
            }
        }

        async fn complete_upload(
            &self,
            _token: &str,
            upload_id: &str,
        ) -> Result<UploadResult, UploadError> {
            self.calls.lock().unwrap().push(Call::Complete {
                upload_id: upload_id.into(),
            });
            if self.fail_completion {
                return Err(UploadError::rejected(RequestKind::Completion, 500, None));
            }
            Ok(Self::result("assembled"))
        }
    }

    fn client(transport: RecordingTransport) -> UploadClient<RecordingTransport> {
        UploadClient::new(transport, Some("token".into()))
    }

    async fn sparse_file(dir: &tempfile::TempDir, name: &str, size: u64) -> UploadFile {
        let path = dir.path().join(name);
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        UploadFile::open(&path).await.unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn small_file_goes_out_in_one_request() {
        let client = client(RecordingTransport::default());
        let file = UploadFile::from_bytes("export.json", vec![b' '; (12 * MIB) as usize]);

        let result = client.upload(&file).await.unwrap();

        assert_eq!(result.filename, "export.json");
        assert_eq!(
            client.transport().calls(),
            vec![Call::File {
                filename: "export.json".into(),
                len: (12 * MIB) as usize
            }]
        );
    }

    #[tokio::test]
    async fn threshold_sized_file_is_not_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport::default());
        let file = sparse_file(&dir, "edge.md", 50 * MIB).await;

        client.upload(&file).await.unwrap();

        let calls = client.transport().calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::File { .. }));
    }

    #[tokio::test]
    async fn large_file_is_sent_in_ordered_chunks_then_completed() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport::default());
        let file = sparse_file(&dir, "big.txt", 60 * MIB).await;

        client.upload(&file).await.unwrap();

        let calls = client.transport().calls();
        assert_eq!(calls.len(), 13);
        let Call::Chunk { upload_id: first_id, .. } = &calls[0] else {
            panic!("first call should be a chunk");
        };
        for (i, call) in calls[..12].iter().enumerate() {
            assert_eq!(
                call,
                &Call::Chunk {
                    upload_id: first_id.clone(),
                    index: i as u64,
                    total: 12,
                    len: (5 * MIB) as usize,
                }
            );
        }
        assert_eq!(
            calls[12],
            Call::Complete {
                upload_id: first_id.clone()
            }
        );
    }

    #[tokio::test]
    async fn each_attempt_gets_its_own_upload_id() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport::default());
        let file = sparse_file(&dir, "big.json", 51 * MIB).await;

        client.upload(&file).await.unwrap();
        client.upload(&file).await.unwrap();

        let ids: Vec<String> = client
            .transport()
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Complete { upload_id } => Some(upload_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn oversize_file_makes_no_requests() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport::default());
        let file = sparse_file(&dir, "huge.json", 150 * MIB).await;

        let err = client.upload(&file).await.unwrap_err();

        assert!(matches!(err, UploadError::FileTooLarge));
        assert!(client.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn disallowed_extension_makes_no_requests() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport::default());
        for (name, size) in [("a.csv", 10), ("b.pdf", 60 * MIB), ("c.zip", 150 * MIB)] {
            let file = sparse_file(&dir, name, size).await;
            let err = client.upload(&file).await.unwrap_err();
            assert_eq!(err.to_string(), "Invalid file type. Allowed: .json, .txt, .md");
        }
        assert!(client.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn missing_credential_fails_before_any_io() {
        let client = UploadClient::new(RecordingTransport::default(), None);
        let file = UploadFile::from_bytes("export.json", &b"[]"[..]);

        let err = client.upload(&file).await.unwrap_err();

        assert!(matches!(err, UploadError::AuthenticationRequired));
        assert!(client.transport().calls().is_empty());
    }

    #[tokio::test]
    async fn failed_chunk_stops_the_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport {
            fail_chunk: Some((3, Some("disk full".into()))),
            ..Default::default()
        });
        let file = sparse_file(&dir, "big.txt", 60 * MIB).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = client.upload_with_progress(&file, Some(tx)).await.unwrap_err();

        assert_eq!(err.to_string(), "disk full");
        let calls = client.transport().calls();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|c| matches!(c, Call::Chunk { .. })));

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.phase, UploadPhase::Failed);
        assert_eq!(last.percent, 0.0);
        assert_eq!(last.completed_chunks, 0);
    }

    #[tokio::test]
    async fn failed_chunk_without_detail_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport {
            fail_chunk: Some((0, None)),
            ..Default::default()
        });
        let file = sparse_file(&dir, "big.txt", 55 * MIB).await;

        let err = client.upload(&file).await.unwrap_err();

        assert_eq!(err.to_string(), "Chunk upload failed");
        assert_eq!(client.transport().calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_completion_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport {
            fail_completion: true,
            ..Default::default()
        });
        let file = sparse_file(&dir, "big.md", 52 * MIB).await;

        let err = client.upload(&file).await.unwrap_err();

        assert_eq!(err.to_string(), "Upload completion failed");
        assert_eq!(client.transport().calls().len(), 12);
    }

    #[tokio::test]
    async fn progress_events_follow_the_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(RecordingTransport::default());
        let file = sparse_file(&dir, "big.txt", 60 * MIB).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        client.upload_with_progress(&file, Some(tx)).await.unwrap();

        let events = drain(&mut rx);
        let phases: Vec<UploadPhase> = events.iter().map(|e| e.phase).collect();
        let mut expected = vec![UploadPhase::Validating];
        expected.extend((0..12).map(UploadPhase::SendingChunk));
        expected.push(UploadPhase::Completing);
        expected.push(UploadPhase::Succeeded);
        assert_eq!(phases, expected);

        // entering chunk i means i chunks were acknowledged: 0.9 * i / 12
        let sixth = &events[7];
        assert_eq!(sixth.completed_chunks, 6);
        assert!((sixth.percent - 45.0).abs() < 1e-9);
        assert_eq!(events[13].percent, 90.0);
        assert_eq!(events[14].percent, 100.0);
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
    }
}
