//! Bounded-concurrency chunk dispatcher.

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use chunklift_chunker::{ChunkPlan, Etag};
use chunklift_client::Session;

use crate::{MAX_IN_FLIGHT, TransferError, aggregate};

/// Progress events emitted during a run.
///
/// Delivered best-effort on a bounded channel; the transfer never blocks on
/// a slow or absent consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// Geometry is known and the remote session is open.
    Started { total_chunks: u64 },
    /// One chunk finished (uploaded, or skipped because the server already
    /// had identical content).
    ChunkCompleted { index: u64, deduplicated: bool },
    /// The ordered manifest was committed.
    Finalized,
}

/// Outcome of one chunk worker, consumed exactly once by the collector.
struct ChunkOutcome {
    index: u64,
    result: Result<Etag, TransferError>,
}

/// Drives a whole-file upload through a remote [`Session`].
///
/// The file is read strictly sequentially; a semaphore permit is acquired
/// before each read, so at most [`MAX_IN_FLIGHT`] chunk buffers and remote
/// calls exist at any moment. Workers complete in arbitrary order and the
/// collector re-establishes index order before finalize.
pub struct Uploader {
    session: Arc<Session>,
    max_in_flight: usize,
    chunk_size: Option<u64>,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl Uploader {
    /// Creates an uploader over an open session.
    pub fn new(session: Session) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            session: Arc::new(session),
            max_in_flight: MAX_IN_FLIGHT,
            chunk_size: None,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Overrides the planned chunk size in bytes.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Overrides the in-flight cap.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Returns a cancellation token for this run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads `path` end to end: create, per-chunk probe/upload, finalize.
    ///
    /// Either every chunk is stored and the manifest committed, or the
    /// first surfaced error aborts the run; there is no partial success.
    pub async fn run(&self, path: &Path, mime_type: &str) -> Result<(), TransferError> {
        let size = tokio::fs::metadata(path).await?.len();
        let mut plan = ChunkPlan::for_size(size);
        if let Some(chunk_size) = self.chunk_size {
            plan = plan.with_chunk_size(chunk_size);
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let upload_id = self.session.create().await?;
        info!(
            file = %file_name,
            size,
            chunk_size = plan.chunk_size(),
            upload_id = %upload_id,
            "upload started"
        );
        let _ = self.events_tx.try_send(UploadEvent::Started {
            total_chunks: plan.chunk_count(),
        });

        let mut file = tokio::fs::File::open(path).await?;
        let gate = Arc::new(Semaphore::new(self.max_in_flight));
        let (tx, mut rx) = mpsc::unbounded_channel::<ChunkOutcome>();

        // Single sequential reader: indices are assigned in file order, and
        // the permit is taken before the read so buffer allocation itself is
        // throttled by the gate.
        let mut index: u64 = 0;
        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&gate).acquire_owned() => {
                    permit.expect("admission gate never closed")
                }
            };

            let Some(data) = read_chunk(&mut file, plan.chunk_size() as usize).await? else {
                break;
            };

            let session = Arc::clone(&self.session);
            let upload_id = upload_id.clone();
            let file_name = file_name.clone();
            let tx = tx.clone();
            let events_tx = self.events_tx.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = process_chunk(&session, &upload_id, index, &data, &file_name).await;
                match &result {
                    Ok((_, deduplicated)) => {
                        let _ = events_tx.try_send(UploadEvent::ChunkCompleted {
                            index,
                            deduplicated: *deduplicated,
                        });
                    }
                    Err(err) => {
                        error!(index, error = %err, "chunk failed");
                        if err.is_auth() {
                            // No point admitting further chunks.
                            cancel.cancel();
                        }
                    }
                }
                let _ = tx.send(ChunkOutcome {
                    index,
                    result: result.map(|(etag, _)| etag),
                });
            });
            index += 1;
        }
        drop(tx);

        // Collect every outcome; in-flight workers drain even after a
        // failure is latched, their results are discarded.
        let enumerated = index;
        let mut completed: Vec<(u64, Etag)> = Vec::with_capacity(enumerated as usize);
        let mut first_error: Option<TransferError> = None;
        while let Some(outcome) = rx.recv().await {
            match outcome.result {
                Ok(etag) => completed.push((outcome.index, etag)),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let etags = aggregate::into_ordered(completed, enumerated)?;
        self.session
            .finalize(&upload_id, &etags, &file_name, mime_type)
            .await?;
        let _ = self.events_tx.try_send(UploadEvent::Finalized);
        info!(file = %file_name, chunks = enumerated, "upload finalized");
        Ok(())
    }
}

/// Reads the next chunk, filling up to `chunk_size` bytes. A short final
/// chunk is expected; `None` means EOF.
async fn read_chunk(
    file: &mut tokio::fs::File,
    chunk_size: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(buf))
}

/// One worker: etag the bytes, probe, upload only when absent.
async fn process_chunk(
    session: &Session,
    upload_id: &str,
    index: u64,
    data: &[u8],
    file_name: &str,
) -> Result<(Etag, bool), TransferError> {
    let etag = Etag::of(data);

    let exists = session
        .probe(upload_id, &etag)
        .await
        .map_err(|source| TransferError::Chunk {
            index,
            operation: "probe",
            source,
        })?;

    if exists {
        debug!(index, etag = %etag, "chunk already stored, skipping upload");
    } else {
        // Part numbers are 1-based on the wire.
        session
            .upload(upload_id, &etag, data, index + 1, file_name)
            .await
            .map_err(|source| TransferError::Chunk {
                index,
                operation: "upload",
                source,
            })?;
        debug!(index, etag = %etag, "chunk uploaded");
    }

    Ok((etag, exists))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunklift_client::{Credentials, RetryConfig, Transport};
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    // -----------------------------------------------------------------
    // Mock remote implementing the whole create/probe/upload/finalize
    // protocol, one request per connection.
    // -----------------------------------------------------------------

    #[derive(Clone, Copy)]
    enum ProbeBehavior {
        /// Every probe reports the chunk as absent.
        Absent,
        /// Every probe reports the chunk as already stored.
        Present,
        /// Every probe is rejected as unauthorized.
        Unauthorized,
    }

    struct Captured {
        head: String,
        body: Vec<u8>,
    }

    async fn read_request(stream: &mut TcpStream) -> Captured {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut tmp = [0u8; 8192];
        loop {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
                let content_length = head
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(str::trim)
                            .map(str::to_string)
                    })
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + content_length {
                    let body = buf[pos + 4..pos + 4 + content_length].to_vec();
                    return Captured { head, body };
                }
            }
        }
        Captured {
            head: String::from_utf8_lossy(&buf).into_owned(),
            body: Vec::new(),
        }
    }

    /// Starts a mock upload service; records every request it sees.
    async fn mock_remote(
        probe: ProbeBehavior,
    ) -> (String, Arc<Mutex<Vec<Captured>>>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_srv = Arc::clone(&requests);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let req = read_request(&mut stream).await;
                let path = req.head.split_whitespace().nth(1).unwrap_or("").to_string();

                let (status, body) = if path.contains("/create") {
                    (201, r#"{"uploadId":"mock-upload"}"#.to_string())
                } else if path.contains("/chunk/probe") {
                    match probe {
                        ProbeBehavior::Absent => (200, r#"{"data":{"results":{}}}"#.to_string()),
                        ProbeBehavior::Present => {
                            // Echo the probed chunk back as existing.
                            let sent: serde_json::Value =
                                serde_json::from_slice(&req.body).unwrap();
                            let hash = sent["chunks"][0]["hash"].as_str().unwrap();
                            let size = sent["chunks"][0]["size"].as_str().unwrap();
                            (
                                200,
                                format!(
                                    r#"{{"data":{{"results":{{"sha256-{hash}-{size}":{{"exists":true}}}}}}}}"#
                                ),
                            )
                        }
                        ProbeBehavior::Unauthorized => (401, "unauthorized".to_string()),
                    }
                } else if path.contains("/file/chunked") {
                    (200, "{}".to_string())
                } else {
                    // Chunk upload.
                    (200, "{}".to_string())
                };

                requests_srv.lock().unwrap().push(req);

                let resp = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (url, requests, handle)
    }

    fn uploader(url: &str) -> Uploader {
        let transport = Transport::new(Credentials {
            user: "alice".into(),
            token: "secret".into(),
        })
        .unwrap();
        let session = Session::new(transport, url, "KEY-1").with_retry(RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            max_attempts: Some(3),
        });
        Uploader::new(session)
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    // -----------------------------------------------------------------
    // read_chunk
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn read_chunk_short_final_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "f.bin", b"AABBCCDDEE");

        let mut file = tokio::fs::File::open(&path).await.unwrap();
        assert_eq!(read_chunk(&mut file, 4).await.unwrap().unwrap(), b"AABB");
        assert_eq!(read_chunk(&mut file, 4).await.unwrap().unwrap(), b"CCDD");
        assert_eq!(read_chunk(&mut file, 4).await.unwrap().unwrap(), b"EE");
        assert!(read_chunk(&mut file, 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_chunk_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "f.bin", b"");

        let mut file = tokio::fs::File::open(&path).await.unwrap();
        assert!(read_chunk(&mut file, 4).await.unwrap().is_none());
    }

    // -----------------------------------------------------------------
    // End-to-end runs against the mock remote
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn run_uploads_three_chunks_in_order() {
        let (url, requests, handle) = mock_remote(ProbeBehavior::Absent).await;
        let dir = tempfile::tempdir().unwrap();
        // 12 bytes at chunk size 5 -> chunks of 5, 5, 2.
        let path = write_file(&dir, "big.bin", b"AAAAABBBBBCC");

        let up = uploader(&url).with_chunk_size(5);
        up.run(&path, "application/octet-stream").await.unwrap();

        let reqs = requests.lock().unwrap();

        // Every part number 1..=3 was uploaded exactly once.
        let mut parts: Vec<u64> = reqs
            .iter()
            .filter(|r| r.head.contains("partNumber="))
            .map(|r| {
                let head = &r.head;
                let at = head.find("partNumber=").unwrap() + "partNumber=".len();
                head[at..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap()
            })
            .collect();
        parts.sort_unstable();
        assert_eq!(parts, vec![1, 2, 3]);

        // Finalize carries the manifest in index order with exact sizes.
        let finalize = reqs
            .iter()
            .find(|r| r.head.contains("/file/chunked"))
            .expect("finalize request");
        assert!(finalize.head.contains("uploadId=mock-upload"));
        let sent: serde_json::Value = serde_json::from_slice(&finalize.body).unwrap();
        assert_eq!(sent["name"], "big.bin");
        assert_eq!(sent["mimeType"], "application/octet-stream");
        let chunks = sent["chunks"].as_array().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0]["size"], "5");
        assert_eq!(chunks[1]["size"], "5");
        assert_eq!(chunks[2]["size"], "2");
        assert_eq!(chunks[0]["hash"], Etag::of(b"AAAAA").digest());
        assert_eq!(chunks[1]["hash"], Etag::of(b"BBBBB").digest());
        assert_eq!(chunks[2]["hash"], Etag::of(b"CC").digest());

        handle.abort();
    }

    #[tokio::test]
    async fn run_skips_uploads_when_chunks_already_stored() {
        let (url, requests, handle) = mock_remote(ProbeBehavior::Present).await;
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "big.bin", b"AAAAABBBBBCC");

        let up = uploader(&url).with_chunk_size(5);
        up.run(&path, "").await.unwrap();

        let reqs = requests.lock().unwrap();
        // Zero upload calls, yet finalize still carries the full manifest.
        assert!(!reqs.iter().any(|r| r.head.contains("partNumber=")));
        let finalize = reqs
            .iter()
            .find(|r| r.head.contains("/file/chunked"))
            .expect("finalize request");
        let sent: serde_json::Value = serde_json::from_slice(&finalize.body).unwrap();
        assert_eq!(sent["chunks"].as_array().unwrap().len(), 3);

        handle.abort();
    }

    #[tokio::test]
    async fn run_aborts_on_unauthorized_without_finalize() {
        let (url, requests, handle) = mock_remote(ProbeBehavior::Unauthorized).await;
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "big.bin", b"AAAAABBBBBCC");

        let up = uploader(&url).with_chunk_size(5);
        let err = up.run(&path, "").await.unwrap_err();
        assert!(err.is_auth());
        assert!(matches!(
            err,
            TransferError::Chunk {
                operation: "probe",
                ..
            }
        ));

        let reqs = requests.lock().unwrap();
        assert!(!reqs.iter().any(|r| r.head.contains("/file/chunked")));

        handle.abort();
    }

    #[tokio::test]
    async fn run_empty_file_finalizes_empty_manifest() {
        let (url, requests, handle) = mock_remote(ProbeBehavior::Absent).await;
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "empty.bin", b"");

        let up = uploader(&url);
        up.run(&path, "").await.unwrap();

        let reqs = requests.lock().unwrap();
        let finalize = reqs
            .iter()
            .find(|r| r.head.contains("/file/chunked"))
            .expect("finalize request");
        let sent: serde_json::Value = serde_json::from_slice(&finalize.body).unwrap();
        assert!(sent["chunks"].as_array().unwrap().is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn run_emits_progress_events() {
        let (url, _requests, handle) = mock_remote(ProbeBehavior::Absent).await;
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "big.bin", b"AAAAABBBBBCC");

        let mut up = uploader(&url).with_chunk_size(5);
        let mut events_rx = up.take_events().unwrap();
        up.run(&path, "").await.unwrap();
        drop(up);

        let mut events = Vec::new();
        while let Some(e) = events_rx.recv().await {
            events.push(e);
        }
        assert_eq!(events[0], UploadEvent::Started { total_chunks: 3 });
        let completed = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::ChunkCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
        assert_eq!(events.last(), Some(&UploadEvent::Finalized));

        handle.abort();
    }

    #[tokio::test]
    async fn run_cancelled_token_stops_admission() {
        let (url, requests, handle) = mock_remote(ProbeBehavior::Absent).await;
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "big.bin", b"AAAAABBBBBCC");

        let up = uploader(&url).with_chunk_size(5);
        up.cancel_token().cancel();
        let err = up.run(&path, "").await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));

        let reqs = requests.lock().unwrap();
        assert!(!reqs.iter().any(|r| r.head.contains("/file/chunked")));

        handle.abort();
    }

    #[tokio::test]
    async fn take_events_once() {
        let transport = Transport::new(Credentials {
            user: "a".into(),
            token: "b".into(),
        })
        .unwrap();
        let mut up = Uploader::new(Session::new(transport, "http://127.0.0.1:1", "K"));
        assert!(up.take_events().is_some());
        assert!(up.take_events().is_none());
    }

    #[tokio::test]
    async fn missing_file_fails_before_any_request() {
        let (url, requests, handle) = mock_remote(ProbeBehavior::Absent).await;

        let up = uploader(&url);
        let err = up
            .run(Path::new("/nonexistent/definitely-not-here.bin"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert!(requests.lock().unwrap().is_empty());

        handle.abort();
    }
}
