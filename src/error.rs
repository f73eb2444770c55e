//! Error types shared by every part of the engine.
//!
//! Failures never cross task boundaries on their own: a transport error travels
//! back on its request's reply channel, a panicking handler or pipeline stage is
//! caught where it runs, and only submission and configuration errors reach the
//! caller directly.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpiderError {
    /// The global pool stayed saturated for longer than the submitter was willing to wait.
    #[error("submission timed out after {0:?}")]
    SubmitTimeout(Duration),

    /// The downloader failed to complete the exchange.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// The request's own cancellation token fired or its deadline passed.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// The per-request timeout elapsed before the downloader answered.
    #[error("request to {url} timed out after {timeout:?}")]
    RequestTimeout { url: String, timeout: Duration },

    #[error("handler panicked while processing {0}")]
    HandlerPanic(String),

    #[error("pipeline stage '{0}' panicked")]
    PipelinePanic(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("crawler is shutting down")]
    ShuttingDown,

    #[error("multiple registrations for pattern '{0}'")]
    DuplicateHandler(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("request to {url} dropped by middleware '{middleware}'")]
    Dropped { url: String, middleware: String },

    #[error("queue error: {0}")]
    Queue(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    GeneralError(String),
}

impl SpiderError {
    /// Builds a transport error for `url` from any displayable cause.
    pub fn transport(url: impl ToString, cause: impl std::fmt::Display) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: cause.to_string(),
        }
    }

    /// True for errors caused by cancellation, deadlines or shutdown rather than a failed exchange.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_) | Self::RequestTimeout { .. } | Self::ShuttingDown
        )
    }
}

impl From<url::ParseError> for SpiderError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_classification() {
        assert!(SpiderError::Cancelled("https://a.test/".into()).is_cancellation());
        assert!(SpiderError::ShuttingDown.is_cancellation());
        assert!(!SpiderError::transport("https://a.test/", "reset").is_cancellation());
    }

    #[test]
    fn parse_errors_become_invalid_url() {
        let err: SpiderError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, SpiderError::InvalidUrl(_)));
    }
}
