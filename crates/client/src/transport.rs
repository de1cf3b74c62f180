//! Authenticated request primitive with uniform failure classification.

use std::time::Duration;

use reqwest::StatusCode;

/// Request timeout applied to every remote call. Retries get a fresh one.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Basic-auth credentials for the upload service.
///
/// Always passed in explicitly; the client crates never read the
/// environment or any global state.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub token: String,
}

/// Errors from the upload client.
///
/// Every failure falls into one of two retry classes: [`Unauthorized`] is
/// fatal and must never be retried, everything else is transient. The retry
/// loop keys off [`ClientError::is_fatal`] alone.
///
/// [`Unauthorized`]: ClientError::Unauthorized
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed")]
    Unauthorized,

    #[error("{operation}: unexpected status {status}: {body}")]
    Api {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// True when retrying can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Unauthorized)
    }
}

/// Authenticated HTTP transport shared by all session operations.
pub struct Transport {
    http: reqwest::Client,
    creds: Credentials,
}

impl Transport {
    /// Creates a transport with the given credentials and a fixed
    /// per-request timeout.
    pub fn new(creds: Credentials) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, creds })
    }

    /// Starts a POST request carrying basic auth.
    pub(crate) fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .basic_auth(&self.creds.user, Some(&self.creds.token))
    }

    /// Sends a request and classifies the response.
    ///
    /// 401 is fatal; any status outside `expect` is a transient API error;
    /// an expected status yields the raw body bytes.
    pub(crate) async fn execute(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
        expect: &[StatusCode],
    ) -> Result<Vec<u8>, ClientError> {
        let resp = request.send().await?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        if !expect.contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                operation,
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.bytes().await?.to_vec())
    }
}
