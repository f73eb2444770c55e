//! The downloader boundary and the default `reqwest` implementation.
//!
//! The scheduling core never talks to the network itself. Every exchange goes
//! through a [`Downloader`], which the fetcher calls under the per-request
//! timeout and the request's cancellation token.

use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Performs the network exchange for one request.
///
/// Implementations must return promptly once `request.cancelled()` resolves.
/// The engine also drops the returned future on cancellation or timeout.
#[async_trait]
pub trait Downloader: Send + Sync + 'static {
    async fn download(&self, request: Request) -> Result<Response, SpiderError>;
}

#[async_trait]
impl<D: Downloader + ?Sized> Downloader for Arc<D> {
    async fn download(&self, request: Request) -> Result<Response, SpiderError> {
        (**self).download(request).await
    }
}

/// Default downloader backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestDownloader {
    client: reqwest::Client,
    user_agent: Option<HeaderValue>,
}

impl ReqwestDownloader {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self, SpiderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| SpiderError::ConfigurationError(format!("http client: {e}")))?;
        Self::with_client(client, user_agent)
    }

    /// Wraps an existing client. Fails if `user_agent` is not a valid header value.
    pub fn with_client(client: reqwest::Client, user_agent: &str) -> Result<Self, SpiderError> {
        let user_agent = HeaderValue::from_str(user_agent).map_err(|e| {
            SpiderError::ConfigurationError(format!("user_agent {user_agent:?}: {e}"))
        })?;
        Ok(Self {
            client,
            user_agent: Some(user_agent),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl Downloader for ReqwestDownloader {
    async fn download(&self, request: Request) -> Result<Response, SpiderError> {
        let url = request.url.clone();
        let mut headers = request.headers.clone();
        if let Some(agent) = &self.user_agent {
            headers.entry(USER_AGENT).or_insert_with(|| agent.clone());
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(headers);
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        trace!("Sending {} {}", request.method, url);
        let exchange = async {
            let res = builder
                .send()
                .await
                .map_err(|e| SpiderError::transport(&url, e))?;
            let status = res.status();
            let final_url = res.url().clone();
            let headers = res.headers().clone();
            let body = res
                .bytes()
                .await
                .map_err(|e| SpiderError::transport(&url, e))?;
            Ok::<_, SpiderError>((status, final_url, headers, body))
        };

        tokio::select! {
            _ = request.cancelled() => Err(SpiderError::Cancelled(url.to_string())),
            result = exchange => {
                let (status, final_url, headers, body) = result?;
                Ok(Response::new(request, status, headers, body).with_url(final_url))
            }
        }
    }
}
