//! ntopng REST client with retry and back-off.

use std::future::Future;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::AUTHORIZATION;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::{Clock, RetryError, RetryPolicy, Retryable, retry_with_backoff};
use crate::enumerator::InterfaceId;

/// Body ntopng returns for an interface it cannot report on.
pub const INVALID_INTERFACE_BODY: &str = "1";

/// Errors from a single upstream request.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The request never produced a response (connect, DNS, reset).
    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },
    /// A response arrived but its body could not be read.
    #[error("Failed to read response body from {url}: {message}")]
    Body { url: String, message: String },
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }
}

/// Pre-encoded HTTP Basic credential.
#[derive(Clone)]
pub struct BasicCredential {
    header: String,
}

impl BasicCredential {
    pub fn new(username: &str, password: &str) -> Self {
        let token = STANDARD.encode(format!("{}:{}", username, password));
        Self {
            header: format!("Basic {}", token),
        }
    }

    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> &str {
        &self.header
    }
}

impl std::fmt::Debug for BasicCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BasicCredential(***)")
    }
}

/// URLs of the ntopng endpoints used by the exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtopngEndpoints {
    base_url: String,
}

impl NtopngEndpoints {
    /// `base_url` is scheme, host and port, e.g. `http://localhost:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn interfaces(&self) -> String {
        format!("{}/lua/rest/v2/get/ntopng/interfaces.lua", self.base_url)
    }

    pub fn interface_data(&self, ifid: InterfaceId) -> String {
        format!(
            "{}/lua/rest/v2/get/interface/data.lua?ifid={}",
            self.base_url, ifid
        )
    }
}

/// One upstream GET attempt, without retries.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// [`Transport`] over `reqwest` with Basic authentication.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    credential: BasicCredential,
}

impl HttpTransport {
    pub fn new(credential: BasicCredential) -> Self {
        Self::with_client(reqwest::Client::new(), credential)
    }

    pub fn with_client(client: reqwest::Client, credential: BasicCredential) -> Self {
        Self { client, credential }
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.credential.header_value())
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "ntopng returned a non-success status");
        }

        let body = response.text().await.map_err(|e| FetchError::Body {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        debug!(url = %url, status = %status, bytes = body.len(), "Fetched");
        Ok(body)
    }
}

/// Upstream fetcher that retries transport failures with back-off.
pub struct ResilientFetcher<T, C> {
    transport: T,
    clock: C,
    policy: RetryPolicy,
    endpoints: NtopngEndpoints,
}

impl<T: Transport, C: Clock> ResilientFetcher<T, C> {
    pub fn new(transport: T, clock: C, policy: RetryPolicy, endpoints: NtopngEndpoints) -> Self {
        Self {
            transport,
            clock,
            policy,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &NtopngEndpoints {
        &self.endpoints
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// GET `url` with retries.
    pub async fn fetch(&self, url: &str, label: &str) -> Result<String, RetryError<FetchError>> {
        retry_with_backoff(&self.policy, &self.clock, label, || self.transport.get(url)).await
    }

    /// Fetch the interface list body.
    pub async fn fetch_interfaces(&self) -> Result<String, RetryError<FetchError>> {
        let url = self.endpoints.interfaces();
        self.fetch(&url, "list interfaces").await
    }

    /// Fetch the data body of one interface.
    pub async fn fetch_interface_data(
        &self,
        ifid: InterfaceId,
    ) -> Result<String, RetryError<FetchError>> {
        let url = self.endpoints.interface_data(ifid);
        self.fetch(&url, "interface data").await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use crate::backoff::testing::RecordingClock;
    use std::time::Duration;

    fn fetcher(transport: ScriptedTransport, clock: RecordingClock) -> ResilientFetcher<ScriptedTransport, RecordingClock> {
        ResilientFetcher::new(
            transport,
            clock,
            RetryPolicy::new(4, Duration::from_secs(1), 2.0),
            NtopngEndpoints::new("http://ntopng:3000"),
        )
    }

    #[test]
    fn test_basic_credential_encoding() {
        let cred = BasicCredential::new("admin", "admin");
        assert_eq!(cred.header_value(), "Basic YWRtaW46YWRtaW4=");
        assert_eq!(format!("{:?}", cred), "BasicCredential(***)");
    }

    #[test]
    fn test_endpoints() {
        let endpoints = NtopngEndpoints::new("http://localhost:3000/");
        assert_eq!(endpoints.base_url(), "http://localhost:3000");
        assert_eq!(
            endpoints.interfaces(),
            "http://localhost:3000/lua/rest/v2/get/ntopng/interfaces.lua"
        );
        assert_eq!(
            endpoints.interface_data(InterfaceId(7)),
            "http://localhost:3000/lua/rest/v2/get/interface/data.lua?ifid=7"
        );
    }

    #[test]
    fn test_error_retryability() {
        let transport = FetchError::Transport {
            url: "u".into(),
            message: "m".into(),
        };
        let body = FetchError::Body {
            url: "u".into(),
            message: "m".into(),
        };
        assert!(transport.is_retryable());
        assert!(!body.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_retries_transport_errors() {
        let transport = ScriptedTransport::default();
        let clock = RecordingClock::default();
        let f = fetcher(transport.clone(), clock.clone());
        let url = f.endpoints().interface_data(InterfaceId(0));

        transport.push_transport_error(url.clone());
        transport.push_transport_error(url.clone());
        transport.push_ok(url.clone(), "{}");

        let body = f.fetch_interface_data(InterfaceId(0)).await.unwrap();

        assert_eq!(body, "{}");
        assert_eq!(transport.request_count(&url), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn test_fetch_sentinel_is_not_retried() {
        let transport = ScriptedTransport::default();
        let clock = RecordingClock::default();
        let f = fetcher(transport.clone(), clock.clone());
        let url = f.endpoints().interface_data(InterfaceId(2));

        transport.push_ok(url.clone(), INVALID_INTERFACE_BODY);

        let body = f.fetch_interface_data(InterfaceId(2)).await.unwrap();

        assert_eq!(body, INVALID_INTERFACE_BODY);
        assert_eq!(transport.request_count(&url), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_body_error_not_retried() {
        let transport = ScriptedTransport::default();
        let clock = RecordingClock::default();
        let f = fetcher(transport.clone(), clock.clone());
        let url = f.endpoints().interfaces();

        transport.push(
            url.clone(),
            Err(FetchError::Body {
                url: url.clone(),
                message: "truncated".into(),
            }),
        );

        let err = f.fetch_interfaces().await.unwrap_err();

        assert!(matches!(err, RetryError::Aborted(FetchError::Body { .. })));
        assert_eq!(transport.request_count(&url), 1);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_attempts() {
        let transport = ScriptedTransport::default();
        let clock = RecordingClock::default();
        let f = fetcher(transport.clone(), clock.clone());
        let url = f.endpoints().interfaces();

        transport.push_transport_error(url.clone());

        let err = f.fetch_interfaces().await.unwrap_err();

        assert!(err.is_exhausted());
        assert_eq!(transport.request_count(&url), 4);
        assert_eq!(clock.sleeps().len(), 3);
    }
}
