//! # Builder Module
//!
//! Provides the `CrawlerBuilder`, a fluent API for configuring and starting a
//! [`Crawler`].
//!
//! ## Overview
//!
//! The builder collects the configuration, the downloader and its middlewares,
//! the handler registrations and the pipeline stages. `build()` validates all
//! of it, composes the middlewares around the downloader, composes the pipeline
//! chain, and starts the engine.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! async fn setup() -> Result<(), SpiderError> {
//!     let crawler = CrawlerBuilder::<String>::new()
//!         .max_concurrent_requests(16)
//!         .max_requests_per_host(2)
//!         .download_delay(Duration::from_millis(500))
//!         .handle("example.com", handler_fn(|res: Response, items: ItemSink<String>| async move {
//!             items.emit(res.text()).await
//!         }))
//!         .add_pipeline(pipeline_fn("print", |title: String| async move {
//!             println!("{title}");
//!             Ok(Some(title))
//!         }))
//!         .build()
//!         .await?;
//!
//!     crawler.start_urls(["https://example.com/"]).await?;
//!     crawler.run_until_idle().await;
//!     Ok(())
//! }
//! ```

use crate::config::CrawlerConfig;
use crate::crawler::Crawler;
use crate::downloader::{Downloader, ReqwestDownloader};
use crate::error::SpiderError;
use crate::middleware::{DownloaderStack, Middleware};
use crate::pipeline::{Pipeline, PipelineChain};
use crate::router::ResponseRouter;
use crate::spider::Handler;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct CrawlerBuilder<I: Send + 'static> {
    config: CrawlerConfig,
    downloader: Option<Box<dyn Downloader>>,
    middlewares: Vec<Box<dyn Middleware>>,
    handlers: Vec<(String, Arc<dyn Handler<I>>)>,
    pipelines: Vec<Box<dyn Pipeline<I>>>,
    shutdown: Option<CancellationToken>,
}

impl<I: Send + 'static> Default for CrawlerBuilder<I> {
    fn default() -> Self {
        Self {
            config: CrawlerConfig::default(),
            downloader: None,
            middlewares: Vec::new(),
            handlers: Vec::new(),
            pipelines: Vec::new(),
            shutdown: None,
        }
    }
}

impl<I: Send + 'static> CrawlerBuilder<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing configuration, e.g. one loaded with [`CrawlerConfig::load`].
    pub fn with_config(config: CrawlerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Sets the size of the global dispatcher pool.
    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.config.max_concurrent_requests = limit;
        self
    }

    /// Sets how many requests may be in flight to one host at once.
    pub fn max_requests_per_host(mut self, limit: usize) -> Self {
        self.config.max_requests_per_host = limit;
        self
    }

    /// Sets the minimum gap between dispatches to the same host.
    pub fn download_delay(mut self, delay: Duration) -> Self {
        self.config.download_delay = delay;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Connect timeout of the default `reqwest` downloader. Ignored with a custom downloader.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets how long a host's fetcher may sit idle before it is removed.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Sets the number of item pipeline workers.
    pub fn max_concurrent_items(mut self, limit: usize) -> Self {
        self.config.max_concurrent_items = limit;
        self
    }

    pub fn submit_timeout(mut self, timeout: Duration) -> Self {
        self.config.submit_timeout = timeout;
        self
    }

    pub fn resize_interval(mut self, interval: Duration) -> Self {
        self.config.resize_interval = interval;
        self
    }

    pub fn queue_poll_interval(mut self, interval: Duration) -> Self {
        self.config.queue_poll_interval = interval;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Replaces the default `reqwest` downloader.
    pub fn downloader<D: Downloader>(mut self, downloader: D) -> Self {
        self.downloader = Some(Box::new(downloader));
        self
    }

    /// Adds a middleware. Request hooks run in the order middlewares are added.
    pub fn add_middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middlewares.push(Box::new(middleware));
        self
    }

    /// Registers `handler` for responses whose request matches `pattern`.
    ///
    /// `pattern` is a host (`"example.com"`), a host and path prefix
    /// (`"example.com/search"`) or `"*"`. Registering a pattern twice fails at `build()`.
    pub fn handle<H: Handler<I>>(mut self, pattern: impl Into<String>, handler: H) -> Self {
        self.handlers.push((pattern.into(), Arc::new(handler)));
        self
    }

    /// Adds a pipeline stage. Stages run in the order they are added.
    pub fn add_pipeline<P: Pipeline<I>>(mut self, pipeline: P) -> Self {
        self.pipelines.push(Box::new(pipeline));
        self
    }

    /// Uses `token` as the shutdown signal. Cancelling it stops the engine.
    pub fn shutdown_signal(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Validates the configuration and starts the crawler.
    pub async fn build(self) -> Result<Crawler<I>, SpiderError> {
        self.config.validate()?;

        let mut router = ResponseRouter::new();
        for (pattern, handler) in self.handlers {
            router.register(pattern, handler)?;
        }

        let downloader: Box<dyn Downloader> = match self.downloader {
            Some(downloader) => downloader,
            None => Box::new(ReqwestDownloader::new(
                &self.config.user_agent,
                self.config.connect_timeout,
            )?),
        };
        let downloader: Arc<dyn Downloader> = if self.middlewares.is_empty() {
            Arc::from(downloader)
        } else {
            debug!("Composing {} middlewares", self.middlewares.len());
            Arc::new(DownloaderStack::new(downloader, self.middlewares))
        };

        // A child token lets dropping the crawler stop it without cancelling the caller's token.
        let shutdown = self.shutdown.unwrap_or_default().child_token();

        debug!(
            "Building crawler with {} handlers and {} pipeline stages",
            router.len(),
            self.pipelines.len()
        );
        Crawler::start(
            self.config,
            downloader,
            router,
            PipelineChain::new(self.pipelines),
            shutdown,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spider::NoOpHandler;

    #[tokio::test]
    async fn zero_caps_fail_at_build() {
        let err = CrawlerBuilder::<()>::new()
            .max_requests_per_host(0)
            .build()
            .await
            .err();
        assert!(matches!(err, Some(SpiderError::ConfigurationError(_))));

        let err = CrawlerBuilder::<()>::new()
            .max_concurrent_requests(0)
            .build()
            .await
            .err();
        assert!(matches!(err, Some(SpiderError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn duplicate_patterns_fail_at_build() {
        let err = CrawlerBuilder::<()>::new()
            .handle("example.com", NoOpHandler)
            .handle("example.com", NoOpHandler)
            .build()
            .await
            .err();
        assert!(matches!(err, Some(SpiderError::DuplicateHandler(p)) if p == "example.com"));
    }

    #[tokio::test]
    async fn setters_reach_the_config() {
        let crawler = CrawlerBuilder::<()>::new()
            .max_concurrent_requests(3)
            .max_requests_per_host(2)
            .download_delay(Duration::from_millis(5))
            .idle_timeout(Duration::from_secs(1))
            .connect_timeout(Duration::from_secs(2))
            .user_agent("unit-test")
            .build()
            .await
            .unwrap();
        let cfg = crawler.config();
        assert_eq!(cfg.max_concurrent_requests, 3);
        assert_eq!(cfg.max_requests_per_host, 2);
        assert_eq!(cfg.download_delay, Duration::from_millis(5));
        assert_eq!(cfg.user_agent, "unit-test");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(2));
        crawler.shutdown().await;
    }
}
