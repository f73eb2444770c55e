//! # spider-engine
//!
//! Crawl scheduling engine of the `spider-lib` web scraping framework.
//!
//! Requests are admitted into a global dispatcher pool, handed to a per-host
//! fetcher that enforces politeness (a concurrency cap and a download delay),
//! and their responses are routed by host and path to a [`Handler`]. Items a
//! handler emits flow through an ordered chain of [`Pipeline`] stages on a
//! bounded worker pool. Idle per-host fetchers remove themselves.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! struct Titles;
//!
//! #[async_trait]
//! impl Handler<String> for Titles {
//!     async fn handle(&self, response: Response, items: &ItemSink<String>) -> Result<(), SpiderError> {
//!         items.emit(response.text()).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SpiderError> {
//!     spider_engine::logging::init_logging();
//!     let crawler = CrawlerBuilder::new()
//!         .handle("example.com", Titles)
//!         .build()
//!         .await?;
//!
//!     crawler.run(std::sync::Arc::new(SimpleQueue::from_iter(["https://example.com/"])));
//!     crawler.run_until_idle().await;
//!     println!("{}", crawler.stats());
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod concurrency;
pub mod config;
pub mod crawler;
pub mod downloader;
pub mod error;
pub mod host_key;
pub mod logging;
pub mod middleware;
pub mod pipeline;
pub mod prelude;
pub mod queue;
pub mod request;
pub mod response;
pub mod router;
pub mod spider;
pub mod state;
pub mod stats;

pub use builder::CrawlerBuilder;
pub use config::CrawlerConfig;
pub use crawler::{Crawler, ItemSink};
pub use downloader::{Downloader, ReqwestDownloader};
pub use error::SpiderError;
pub use host_key::HostKey;
pub use middleware::{DownloaderStack, Middleware, MiddlewareAction};
pub use pipeline::{Pipeline, pipeline_fn};
pub use queue::{Queue, SimpleQueue};
pub use request::Request;
pub use response::Response;
pub use router::ResponseRouter;
pub use spider::{Handler, NoOpHandler, handler_fn};
pub use state::CrawlerState;
pub use stats::StatCollector;

pub use async_trait::async_trait;
pub use tokio;
pub use tokio_util::sync::CancellationToken;
