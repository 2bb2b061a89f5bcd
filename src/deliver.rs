//! Authenticated HTTP delivery to the remote MDM service.
//!
//! One client instance is built at startup and shared read-only. Check-in
//! messages are PUT to the migration endpoint; command payloads are
//! forwarded to `<base>/<UDID>` the way the remote's enqueue API expects.
//! The client performs no retries; a single failed attempt is surfaced to
//! the caller, who decides whether to skip or abort.

use reqwest::{Method, StatusCode};

/// Fixed Basic-auth username the remote service expects; only the API key
/// varies per deployment.
const REMOTE_AUTH_USER: &str = "nanomdm";

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("request to remote failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote answered with anything other than HTTP 200.
    #[error("remote returned HTTP {status}: {body}")]
    RemoteStatus { status: StatusCode, body: String },
}

/// HTTP transport to the remote MDM ingestion API.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl DeliveryClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// PUTs an encoded check-in message to the migration endpoint.
    /// Success is exactly HTTP 200.
    pub async fn put_checkin(&self, body: Vec<u8>) -> Result<(), DeliveryError> {
        self.send(Method::PUT, &self.base_url, body).await
    }

    /// Forwards an encoded command payload for one device. The remote's
    /// enqueue API reads the body off a GET request.
    pub async fn send_command(&self, udid: &str, body: Vec<u8>) -> Result<(), DeliveryError> {
        let url = format!("{}/{udid}", self.base_url.trim_end_matches('/'));
        self.send(Method::GET, &url, body).await
    }

    async fn send(&self, method: Method, url: &str, body: Vec<u8>) -> Result<(), DeliveryError> {
        let response = self
            .http
            .request(method, url)
            .basic_auth(REMOTE_AUTH_USER, Some(&self.api_key))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            return Err(DeliveryError::RemoteStatus { status, body });
        }
        Ok(())
    }
}
