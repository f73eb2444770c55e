//! Request/response interceptors composed around a downloader.
//!
//! Middlewares are registered on the builder and folded once, at build time,
//! into a [`DownloaderStack`]. The stack is itself a [`Downloader`], so the
//! fetcher never knows whether it is talking to a bare transport or a chain.

use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use tracing::{debug, trace};

/// What a middleware wants done with the value it was handed.
#[derive(Debug)]
pub enum MiddlewareAction<T> {
    /// Pass the (possibly modified) value to the next middleware.
    Continue(T),
    /// Stop processing; the request is reported as dropped.
    Drop,
    /// Short-circuit with a ready response, skipping the downloader.
    ReturnResponse(Response),
}

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        Ok(MiddlewareAction::Continue(request))
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        Ok(MiddlewareAction::Continue(response))
    }
}

/// A downloader wrapped by an ordered list of middlewares.
///
/// Request hooks run in registration order, response hooks in reverse.
pub struct DownloaderStack {
    inner: Box<dyn Downloader>,
    middlewares: Vec<Box<dyn Middleware>>,
}

impl DownloaderStack {
    pub fn new(inner: Box<dyn Downloader>, middlewares: Vec<Box<dyn Middleware>>) -> Self {
        Self { inner, middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    async fn process_request(&self, request: Request) -> Result<Response, SpiderError> {
        let mut current = request;
        for middleware in &self.middlewares {
            let url = current.url.to_string();
            match middleware.process_request(current).await? {
                MiddlewareAction::Continue(req) => current = req,
                MiddlewareAction::Drop => {
                    debug!("Request dropped by middleware '{}': {}", middleware.name(), url);
                    return Err(SpiderError::Dropped {
                        url,
                        middleware: middleware.name().to_string(),
                    });
                }
                MiddlewareAction::ReturnResponse(resp) => {
                    trace!("Middleware '{}' answered {} early", middleware.name(), url);
                    return Ok(resp);
                }
            }
        }
        self.inner.download(current).await
    }

    async fn process_response(&self, response: Response) -> Result<Response, SpiderError> {
        let mut current = response;
        for middleware in self.middlewares.iter().rev() {
            let url = current.request().url.to_string();
            match middleware.process_response(current).await? {
                MiddlewareAction::Continue(res) => current = res,
                MiddlewareAction::ReturnResponse(res) => current = res,
                MiddlewareAction::Drop => {
                    debug!("Response dropped by middleware '{}': {}", middleware.name(), url);
                    return Err(SpiderError::Dropped {
                        url,
                        middleware: middleware.name().to_string(),
                    });
                }
            }
        }
        Ok(current)
    }
}

#[async_trait]
impl Downloader for DownloaderStack {
    async fn download(&self, request: Request) -> Result<Response, SpiderError> {
        let response = self.process_request(request).await?;
        self.process_response(response).await
    }
}
