//! Shared helpers for the engine integration tests.

#![allow(dead_code)]

pub mod http_server;

use parking_lot::Mutex;
use spider_engine::prelude::*;
use spider_engine::HostKey;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;

/// What the mock downloader saw, shared with the test body.
#[derive(Default)]
pub struct Recorder {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    per_host: Mutex<HashMap<HostKey, (usize, usize)>>,
    started: Mutex<Vec<(String, Instant)>>,
}

impl Recorder {
    fn enter(&self, request: &Request) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let key = request.host_key().unwrap();
        let mut hosts = self.per_host.lock();
        let entry = hosts.entry(key).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
        drop(hosts);

        self.started
            .lock()
            .push((request.url.to_string(), Instant::now()));
    }

    fn leave(&self, request: &Request) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let key = request.host_key().unwrap();
        if let Some(entry) = self.per_host.lock().get_mut(&key) {
            entry.0 -= 1;
        }
    }

    /// Highest number of downloads observed running at once.
    pub fn peak_global(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn peak_for(&self, url: &str) -> usize {
        let key = HostKey::parse(url).unwrap();
        self.per_host.lock().get(&key).map(|e| e.1).unwrap_or(0)
    }

    /// URLs in the order the downloader started them.
    pub fn order(&self) -> Vec<String> {
        self.started.lock().iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.started.lock().iter().map(|(_, t)| *t).collect()
    }

    pub fn count(&self) -> usize {
        self.started.lock().len()
    }
}

/// A downloader that sleeps for `latency`, fails selected URLs and records everything.
#[derive(Clone)]
pub struct MockDownloader {
    latency: std::time::Duration,
    failing: Arc<HashSet<String>>,
    recorder: Arc<Recorder>,
}

impl MockDownloader {
    pub fn new(latency: std::time::Duration) -> Self {
        Self {
            latency,
            failing: Arc::new(HashSet::new()),
            recorder: Arc::new(Recorder::default()),
        }
    }

    pub fn failing_on(mut self, urls: &[&str]) -> Self {
        self.failing = Arc::new(urls.iter().map(|u| u.to_string()).collect());
        self
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }
}

struct LeaveOnDrop<'a>(&'a Recorder, &'a Request);

impl Drop for LeaveOnDrop<'_> {
    fn drop(&mut self) {
        self.0.leave(self.1);
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn download(&self, request: Request) -> Result<Response, SpiderError> {
        self.recorder.enter(&request);
        {
            let _leave = LeaveOnDrop(&self.recorder, &request);
            tokio::time::sleep(self.latency).await;
        }

        let url = request.url.to_string();
        if self.failing.contains(&url) {
            return Err(SpiderError::transport(&url, "connection reset by peer"));
        }
        let body = format!("body of {url}");
        Ok(Response::new(
            request,
            reqwest::StatusCode::OK,
            Default::default(),
            body.into(),
        ))
    }
}

/// Handler that records the URL of every response it sees.
#[derive(Clone, Default)]
pub struct Collect {
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl Collect {
    pub fn urls(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl<I: Send + 'static> Handler<I> for Collect {
    async fn handle(&self, response: Response, _items: &ItemSink<I>) -> Result<(), SpiderError> {
        self.seen.lock().push(response.request().url.to_string());
        Ok(())
    }
}

/// Polls `check` every 10ms until it holds, panicking after `within`.
pub async fn eventually<F, Fut>(within: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + within;
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "condition not met within {within:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A builder with short intervals suited to tests.
pub fn test_builder<I: Send + 'static>(downloader: MockDownloader) -> CrawlerBuilder<I> {
    CrawlerBuilder::new()
        .downloader(downloader)
        .max_concurrent_requests(4)
        .max_requests_per_host(1)
        .download_delay(Duration::ZERO)
        .request_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(60))
        .max_concurrent_items(2)
        .submit_timeout(Duration::from_secs(5))
        .resize_interval(Duration::from_millis(20))
        .queue_poll_interval(Duration::from_millis(10))
        .shutdown_timeout(Duration::from_secs(5))
}
