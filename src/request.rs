//! The crawl request passed from submitters through the dispatcher to a fetcher.

use crate::error::SpiderError;
use crate::host_key::HostKey;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A single crawl request.
///
/// Each request carries its own cancellation token and optional deadline. They
/// cancel only this request's exchange; global shutdown is signalled separately.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Set when the request should bypass duplicate filtering in an external middleware.
    pub skip_dedup: bool,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Request {
    /// Creates a GET request for `url`.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            skip_dedup: false,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Parses `url` and creates a GET request for it.
    pub fn get(url: &str) -> Result<Self, SpiderError> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attaches a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets an absolute deadline for the exchange.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn skip_dedup(mut self) -> Self {
        self.skip_dedup = true;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Resolves once the request's token fires or its deadline passes.
    pub async fn cancelled(&self) {
        wait_cancelled(&self.cancel, self.deadline).await
    }

    /// An owned form of [`Request::cancelled`] that outlives a move of the request.
    pub(crate) fn cancellation(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let token = self.cancel.clone();
        let deadline = self.deadline;
        async move { wait_cancelled(&token, deadline).await }
    }

    /// The politeness domain this request belongs to.
    pub fn host_key(&self) -> Result<HostKey, SpiderError> {
        HostKey::from_url(&self.url)
    }

    /// The `host[:port]/path` string used to route the response to a handler.
    pub fn route_target(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}{}", host, port, self.url.path()),
            None => format!("{}{}", host, self.url.path()),
        }
    }
}

async fn wait_cancelled(token: &CancellationToken, deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        None => token.cancelled().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_target_includes_port_and_path() {
        let req = Request::get("http://localhost:8080/search?q=1").unwrap();
        assert_eq!(req.route_target(), "localhost:8080/search");

        let req = Request::get("https://example.com").unwrap();
        assert_eq!(req.route_target(), "example.com/");
    }

    #[tokio::test]
    async fn deadline_counts_as_cancellation() {
        let req = Request::get("https://example.com/")
            .unwrap()
            .with_timeout(Duration::from_millis(10));
        assert!(!req.is_cancelled());
        req.cancelled().await;
        assert!(req.is_cancelled());
    }

    #[test]
    fn caller_token_cancels_request() {
        let token = CancellationToken::new();
        let req = Request::get("https://example.com/")
            .unwrap()
            .with_cancellation(token.clone());
        token.cancel();
        assert!(req.is_cancelled());
    }
}
