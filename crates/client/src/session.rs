//! Remote upload session: create, probe, upload, finalize.

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use tracing::debug;

use chunklift_chunker::Etag;

use crate::retry::{RetryConfig, retry};
use crate::transport::{ClientError, Transport};
use crate::types::{ChunkRef, CreateResponse, FinalizeRequest, ProbeRequest, ProbeResponse};

/// One logical transfer against the upload service.
///
/// Holds the transport, base endpoint and target resource key; the session
/// id issued by [`create`](Session::create) is threaded through the other
/// operations by the caller. Every operation is individually wrapped in the
/// backoff retry loop with the fatal-auth short-circuit.
pub struct Session {
    transport: Transport,
    base_url: String,
    key: String,
    retry: RetryConfig,
}

impl Session {
    /// Creates a session scoped to `key` under `base_url`.
    pub fn new(transport: Transport, base_url: &str, key: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            retry: RetryConfig::default(),
        }
    }

    /// Replaces the default retry policy.
    pub fn with_retry(self, retry: RetryConfig) -> Self {
        Self { retry, ..self }
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}/api/upload/{}/{}", self.base_url, self.key, suffix)
    }

    /// Opens a remote upload session and returns its id.
    pub async fn create(&self) -> Result<String, ClientError> {
        retry(&self.retry, "create", || async move {
            let url = self.endpoint("create");
            let body = self
                .transport
                .execute(
                    "create",
                    self.transport
                        .post(&url)
                        .header(CONTENT_TYPE, "application/json"),
                    &[StatusCode::CREATED],
                )
                .await?;
            let resp: CreateResponse = serde_json::from_slice(&body)?;
            debug!(upload_id = %resp.upload_id, "upload session created");
            Ok(resp.upload_id)
        })
        .await
    }

    /// Asks whether a chunk with this etag is already stored for the
    /// session. A missing entry in the response counts as not stored.
    pub async fn probe(&self, upload_id: &str, etag: &Etag) -> Result<bool, ClientError> {
        retry(&self.retry, "probe", || async move {
            let url = self.endpoint("chunk/probe");
            let request = ProbeRequest {
                chunks: vec![ChunkRef::from(etag)],
            };
            let body = self
                .transport
                .execute(
                    "probe",
                    self.transport
                        .post(&url)
                        .query(&[("uploadId", upload_id)])
                        .json(&request),
                    &[StatusCode::OK],
                )
                .await?;
            let resp: ProbeResponse = serde_json::from_slice(&body)?;
            let key = format!("sha256-{etag}");
            Ok(resp.data.results.get(&key).is_some_and(|e| e.exists))
        })
        .await
    }

    /// Transmits chunk bytes as a multipart body. `part_number` is 1-based.
    pub async fn upload(
        &self,
        upload_id: &str,
        etag: &Etag,
        chunk: &[u8],
        part_number: u64,
        file_name: &str,
    ) -> Result<(), ClientError> {
        retry(&self.retry, "upload", || async move {
            let url = self.endpoint(&format!("chunk/{etag}"));
            // The form is consumed by the request, so rebuild it per attempt.
            let part = Part::bytes(chunk.to_vec()).file_name(file_name.to_string());
            let form = Form::new().part("chunk", part);
            self.transport
                .execute(
                    "upload",
                    self.transport
                        .post(&url)
                        .query(&[
                            ("uploadId", upload_id.to_string()),
                            ("partNumber", part_number.to_string()),
                        ])
                        .multipart(form),
                    &[StatusCode::OK, StatusCode::CREATED],
                )
                .await?;
            Ok(())
        })
        .await
    }

    /// Commits the session with the index-ordered chunk manifest.
    pub async fn finalize(
        &self,
        upload_id: &str,
        etags: &[Etag],
        name: &str,
        mime_type: &str,
    ) -> Result<(), ClientError> {
        retry(&self.retry, "finalize", || async move {
            let url = self.endpoint("file/chunked");
            let request = FinalizeRequest {
                chunks: etags.iter().map(ChunkRef::from).collect(),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
            };
            self.transport
                .execute(
                    "finalize",
                    self.transport
                        .post(&url)
                        .query(&[("uploadId", upload_id)])
                        .json(&request),
                    &[StatusCode::OK, StatusCode::CREATED],
                )
                .await?;
            Ok(())
        })
        .await
    }
}
