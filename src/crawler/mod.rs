//! # Crawler Module
//!
//! The scheduling engine behind [`Crawler`].
//!
//! ## Overview
//!
//! A request travels through four stages, each a pool of Tokio tasks talking
//! over bounded channels:
//!
//! - **Dispatcher**: admits submissions into a global pool of workers. A worker
//!   resolves the request's fetcher, forwards it, waits for the result and
//!   routes the response to its handler.
//! - **Host registry**: at most one live fetcher per `scheme://host[:port]`,
//!   created on demand and removed after it sits idle.
//! - **Fetcher**: enforces the per-host concurrency cap and download delay, and
//!   runs the downloader under the request's cancellation and timeout.
//! - **Item processor**: a fixed pool draining emitted items through the
//!   pipeline chain.
//!
//! ## Internal Components
//!
//! Only [`Crawler`] and [`ItemSink`] are public. The registry, fetchers and
//! dispatcher are implementation details.

mod core;
mod dispatcher;
mod fetcher;
mod item_processor;
mod registry;

pub use core::Crawler;
pub use item_processor::ItemSink;
