//! Live activity gauges for the crawler.
//!
//! `CrawlerState` is shared by the dispatcher, the fetchers and the item sink.
//! Each gauge is raised when work enters a stage and lowered when it leaves, so
//! the sum of all four is zero only when nothing is left anywhere in the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct CrawlerState {
    /// Requests admitted but not yet picked up by a dispatcher worker.
    pub queued_requests: AtomicUsize,
    /// Requests forwarded to a fetcher and awaiting their reply.
    pub in_flight_requests: AtomicUsize,
    /// Responses currently inside a handler.
    pub handling_responses: AtomicUsize,
    /// Items emitted but not yet through the pipeline chain.
    pub processing_items: AtomicUsize,
}

impl CrawlerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_idle(&self) -> bool {
        self.queued_requests.load(Ordering::SeqCst) == 0
            && self.in_flight_requests.load(Ordering::SeqCst) == 0
            && self.handling_responses.load(Ordering::SeqCst) == 0
            && self.processing_items.load(Ordering::SeqCst) == 0
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight_requests.load(Ordering::SeqCst)
    }
}

/// Raises a gauge for as long as the guard lives.
pub(crate) struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    pub(crate) fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
