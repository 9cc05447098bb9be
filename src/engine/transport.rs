//! HTTP hop between the host and a running engine.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::error::TransportError;

/// Path of the lightweight status probe used for polling readiness.
pub const STATUS_PATH: &str = "/status";

/// Carries batches to the engine and probes its status endpoint.
///
/// The supervisor and dispatcher only talk to the engine through this trait,
/// so the network hop can be replaced in tests.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// POST a JSON body to the engine root and return the response body.
    async fn post_batch(&self, base_url: &str, body: String) -> Result<String, TransportError>;

    /// Check whether the engine answers its status endpoint.
    async fn probe(&self, base_url: &str) -> Result<(), TransportError>;
}

/// [`EngineTransport`] backed by a reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Option<Duration>,
}

impl HttpTransport {
    /// Build a client that never routes the loopback hop through a proxy.
    pub fn new(timeout: Option<Duration>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| TransportError::Other(Box::new(e)))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            return TransportError::Timeout(self.timeout.unwrap_or_default());
        }

        match connection_failure(&err) {
            Some(io::ErrorKind::ConnectionRefused) => {
                TransportError::ConnectionRefused(err.to_string())
            }
            Some(_) => TransportError::ConnectionReset(err.to_string()),
            None if err.is_connect() => TransportError::ConnectionRefused(err.to_string()),
            // The connection was up, then the peer went away before a full response.
            None if err.is_request() || err.is_body() || err.is_decode() => {
                TransportError::ConnectionReset(err.to_string())
            }
            None => TransportError::Other(Box::new(err)),
        }
    }
}

/// Find an I/O failure in the error chain that means the connection is gone.
fn connection_failure(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return Some(io_err.kind()),
                _ => {}
            }
        }
        current = e.source();
    }
    None
}

#[async_trait]
impl EngineTransport for HttpTransport {
    async fn post_batch(&self, base_url: &str, body: String) -> Result<String, TransportError> {
        let mut request = self
            .client
            .post(base_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.classify(e))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(text)
    }

    async fn probe(&self, base_url: &str) -> Result<(), TransportError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), STATUS_PATH);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout.unwrap_or(Duration::from_secs(2)))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            debug!(%url, status = status.as_u16(), "status probe rejected");
            Err(TransportError::Status {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }
}
