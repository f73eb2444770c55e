//! A "prelude" for users of the `spider-engine` crate.
//!
//! Re-exports the traits, structs and helpers most crawlers need.
//!
//! # Example
//!
//! ```
//! use spider_engine::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Crawler,
    CrawlerBuilder,
    CrawlerConfig,
    ItemSink,
    Request,
    Response,
    SimpleQueue,
    // Core traits
    Downloader,
    Handler,
    Middleware,
    MiddlewareAction,
    Pipeline,
    Queue,
    // Closure adapters
    handler_fn,
    pipeline_fn,
    // Errors
    SpiderError,
    // Essential re-exports for trait implementation
    async_trait,
    CancellationToken,
};

pub use std::time::Duration;
