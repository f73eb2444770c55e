//! # Spider Module
//!
//! Defines the [`Handler`] trait that turns downloaded responses into items.
//!
//! ## Overview
//!
//! A handler is registered on the crawler builder under a host or host+path
//! pattern. The dispatcher hands every response whose originating request
//! matches that pattern to the handler, together with an [`ItemSink`] that
//! feeds the item pipeline. Handlers own the response, including its body.
//!
//! Each call runs in its own task. A panicking handler is caught at that task
//! boundary, logged and counted; the dispatcher worker that spawned it keeps
//! going.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! struct TitleSpider;
//!
//! #[async_trait]
//! impl Handler<String> for TitleSpider {
//!     async fn handle(&self, response: Response, items: &ItemSink<String>) -> Result<(), SpiderError> {
//!         items.emit(response.text()).await
//!     }
//! }
//! ```

use crate::crawler::ItemSink;
use crate::error::SpiderError;
use crate::response::Response;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Processes a response, emitting zero or more items.
#[async_trait]
pub trait Handler<I: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, response: Response, items: &ItemSink<I>) -> Result<(), SpiderError>;
}

/// Adapter allowing an async closure to be used as a [`Handler`].
pub struct HandlerFn<F, I> {
    f: F,
    _item: PhantomData<fn() -> I>,
}

/// Wraps `f` as a handler. The closure receives an owned clone of the sink.
pub fn handler_fn<F, Fut, I>(f: F) -> HandlerFn<F, I>
where
    F: Fn(Response, ItemSink<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SpiderError>> + Send + 'static,
    I: Send + 'static,
{
    HandlerFn {
        f,
        _item: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, I> Handler<I> for HandlerFn<F, I>
where
    F: Fn(Response, ItemSink<I>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SpiderError>> + Send + 'static,
    I: Send + 'static,
{
    async fn handle(&self, response: Response, items: &ItemSink<I>) -> Result<(), SpiderError> {
        (self.f)(response, items.clone()).await
    }
}

/// Fallback handler used when nothing matches. It drops the response unread.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

#[async_trait]
impl<I: Send + 'static> Handler<I> for NoOpHandler {
    async fn handle(&self, response: Response, _items: &ItemSink<I>) -> Result<(), SpiderError> {
        drop(response);
        Ok(())
    }
}
