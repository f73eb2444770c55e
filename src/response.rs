use crate::request::Request;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use url::Url;

/// A downloaded response together with the request that produced it.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after any redirects followed by the downloader.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    request: Request,
}

impl Response {
    pub fn new(request: Request, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url: request.url.clone(),
            status,
            headers,
            body,
            request,
        }
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    /// The originating request. Routing uses its URL, not the final one.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
