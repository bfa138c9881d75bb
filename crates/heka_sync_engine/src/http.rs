//! HTTP uploader.
//!
//! The actual HTTP client is abstracted via a trait so hosts can plug in
//! reqwest, hyper, or a platform networking stack.

use crate::error::{SyncError, SyncResult};
use crate::types::Credentials;
use crate::uploader::Uploader;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

/// Header carrying the collector API key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header carrying the user id.
pub const USER_ID_HEADER: &str = "x-user-uuid";

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request.
    ///
    /// `Err` means no response was received.
    async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, String>;

    /// Returns false if the network is known to be unreachable.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Configuration of an [`HttpUploader`].
#[derive(Debug, Clone)]
pub struct HttpUploaderConfig {
    /// Collector base URL, e.g. `https://collector.example.com/watch_sdk`.
    pub base_url: String,
    /// Path appended to the base URL.
    pub upload_path: String,
}

impl HttpUploaderConfig {
    /// Creates a configuration posting to `<base_url>/upload`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            upload_path: "/upload".into(),
        }
    }

    /// Sets the upload path.
    pub fn with_upload_path(mut self, path: impl Into<String>) -> Self {
        self.upload_path = path.into();
        self
    }

    /// Full upload URL.
    pub fn upload_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.upload_path
        )
    }
}

/// Uploads JSON batches over HTTP.
///
/// 2xx confirms delivery, 4xx is a refusal, anything else is a retryable
/// failure with unknown outcome.
pub struct HttpUploader<C: HttpClient> {
    config: HttpUploaderConfig,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpUploader<C> {
    /// Creates a new HTTP uploader.
    pub fn new(config: HttpUploaderConfig, client: C) -> Self {
        Self {
            config,
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HttpUploaderConfig {
        &self.config
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }
}

#[async_trait]
impl<C: HttpClient> Uploader for HttpUploader<C> {
    async fn upload(&self, payload: &[u8], credentials: &Credentials) -> SyncResult<bool> {
        if !self.client.is_healthy() {
            self.set_error("network unreachable");
            return Err(SyncError::upload_retryable("network unreachable"));
        }

        let url = self.config.upload_url();
        let headers = [
            ("Content-Type", "application/json"),
            (API_KEY_HEADER, credentials.api_key.as_str()),
            (USER_ID_HEADER, credentials.user_id.as_str()),
        ];
        let response = self
            .client
            .post(&url, &headers, payload.to_vec())
            .await
            .map_err(|e| {
                self.set_error(&e);
                SyncError::upload_retryable(e)
            })?;

        match response.status {
            200..=299 => {
                debug!(status = response.status, bytes = payload.len(), "batch accepted");
                *self.last_error.write() = None;
                Ok(true)
            }
            400..=499 => {
                let message = format!(
                    "collector rejected batch with status {}: {}",
                    response.status,
                    String::from_utf8_lossy(&response.body)
                );
                warn!(status = response.status, "batch rejected");
                self.set_error(&message);
                Ok(false)
            }
            status => {
                let message = format!("collector returned status {status}");
                self.set_error(&message);
                Err(SyncError::upload_retryable(message))
            }
        }
    }
}
