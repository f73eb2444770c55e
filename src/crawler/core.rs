//! The `Crawler` handle.
//!
//! A `Crawler` is built by [`CrawlerBuilder`](crate::CrawlerBuilder) and is live
//! from that moment: the dispatcher, the item workers and the resize loop are
//! already running. Work enters through [`Crawler::submit`], the seed helpers
//! or a [`Queue`] attached with [`Crawler::run`], and [`Crawler::shutdown`]
//! drains everything in order.

use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::fetcher::FetcherContext;
use super::item_processor::PipelineSink;
use super::registry::HostRegistry;
use crate::config::CrawlerConfig;
use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::host_key::HostKey;
use crate::pipeline::PipelineChain;
use crate::queue::Queue;
use crate::request::Request;
use crate::router::ResponseRouter;
use crate::state::CrawlerState;
use crate::stats::StatCollector;

use reqwest::header::{HeaderValue, USER_AGENT};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub struct Crawler<I: Send + 'static> {
    config: CrawlerConfig,
    dispatcher: Arc<Dispatcher<I>>,
    registry: Arc<HostRegistry>,
    pipeline: PipelineSink<I>,
    state: Arc<CrawlerState>,
    stats: Arc<StatCollector>,
    shutdown: CancellationToken,
    feeds: parking_lot::Mutex<JoinSet<()>>,
    user_agent: HeaderValue,
    stopped: AtomicBool,
}

impl<I: Send + 'static> Crawler<I> {
    /// Spawns every engine task. Must be called inside a Tokio runtime.
    pub(crate) fn start(
        config: CrawlerConfig,
        downloader: Arc<dyn Downloader>,
        router: ResponseRouter<I>,
        chain: PipelineChain<I>,
        shutdown: CancellationToken,
    ) -> Result<Self, SpiderError> {
        config.validate()?;
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| SpiderError::ConfigurationError(format!("user_agent: {e}")))?;

        let state = CrawlerState::new();
        let stats = Arc::new(StatCollector::new());

        let (pipeline, items) = PipelineSink::spawn(
            chain,
            config.max_concurrent_items,
            Arc::clone(&state),
            Arc::clone(&stats),
        );

        let registry = HostRegistry::new(FetcherContext {
            downloader,
            stats: Arc::clone(&stats),
            shutdown: shutdown.clone(),
            max_requests_per_host: config.max_requests_per_host,
            download_delay: config.download_delay,
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
        });

        let dispatcher = Arc::new(Dispatcher::spawn(
            DispatcherConfig {
                workers: config.max_concurrent_requests,
                resize_interval: config.resize_interval,
                shutdown_timeout: config.shutdown_timeout,
            },
            Arc::clone(&registry),
            router,
            items,
            Arc::clone(&state),
            Arc::clone(&stats),
            shutdown.clone(),
        ));

        info!(
            "Crawler started: max_concurrent_requests={}, max_requests_per_host={}, download_delay={:?}, max_concurrent_items={}",
            config.max_concurrent_requests,
            config.max_requests_per_host,
            config.download_delay,
            config.max_concurrent_items
        );

        Ok(Self {
            config,
            dispatcher,
            registry,
            pipeline,
            state,
            stats,
            shutdown,
            feeds: parking_lot::Mutex::new(JoinSet::new()),
            user_agent,
            stopped: AtomicBool::new(false),
        })
    }

    /// Submits `request`, waiting at most `timeout` for a free slot in the global pool.
    pub async fn submit(&self, request: Request, timeout: Duration) -> Result<(), SpiderError> {
        self.dispatcher.submit(request, timeout).await
    }

    /// Parses `url` into a GET request carrying the configured User-Agent and submits it.
    pub async fn submit_url(&self, url: &str, timeout: Duration) -> Result<(), SpiderError> {
        let request = Request::get(url)?.with_header(USER_AGENT, self.user_agent.clone());
        self.submit(request, timeout).await
    }

    /// Submits seed URLs, retrying while the pool is saturated.
    ///
    /// Invalid URLs are logged and skipped. Returns how many were accepted.
    pub async fn start_urls<S: AsRef<str>>(
        &self,
        urls: impl IntoIterator<Item = S>,
    ) -> Result<usize, SpiderError> {
        let mut accepted = 0;
        for url in urls {
            let url = url.as_ref();
            let request = match Request::get(url) {
                Ok(request) => request.with_header(USER_AGENT, self.user_agent.clone()),
                Err(e) => {
                    warn!("Skipping seed {}: {}", url, e);
                    continue;
                }
            };
            match submit_patiently(&self.dispatcher, request, self.config.submit_timeout).await {
                Ok(()) => accepted += 1,
                Err(e @ SpiderError::InvalidUrl(_)) => warn!("Skipping seed {}: {}", url, e),
                Err(e) => return Err(e),
            }
        }
        debug!("Submitted {} seed URLs", accepted);
        Ok(accepted)
    }

    /// Starts a feed loop that moves URLs from `queue` into the dispatcher until shutdown.
    pub fn run<Q: Queue + ?Sized>(&self, queue: Arc<Q>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = self.shutdown.clone();
        let user_agent = self.user_agent.clone();
        let submit_timeout = self.config.submit_timeout;
        let poll_interval = self.config.queue_poll_interval;

        self.feeds.lock().spawn(async move {
            trace!("Queue feed started");
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                match queue.dequeue() {
                    Ok(Some(url)) => {
                        let request = match Request::get(&url) {
                            Ok(request) => request.with_header(USER_AGENT, user_agent.clone()),
                            Err(e) => {
                                warn!("Dropping queued url {}: {}", url, e);
                                continue;
                            }
                        };
                        match submit_patiently(&dispatcher, request, submit_timeout).await {
                            Ok(()) => {}
                            Err(SpiderError::ShuttingDown) => break,
                            Err(e) => warn!("Dropping queued url {}: {}", url, e),
                        }
                    }
                    Ok(None) => {
                        if sleep_or_shutdown(poll_interval, &shutdown).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Queue error: {}", e);
                        if sleep_or_shutdown(poll_interval, &shutdown).await {
                            break;
                        }
                    }
                }
            }
            trace!("Queue feed stopped");
        });
    }

    /// Resolves once nothing is queued, in flight, being handled or in the pipeline,
    /// or once shutdown begins.
    pub async fn wait_idle(&self) {
        let idle = async {
            loop {
                if self.state.is_idle() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if self.state.is_idle() {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::select! {
            _ = idle => trace!("Crawler is idle"),
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Waits for the crawl to go idle, the shutdown signal or Ctrl-C, then shuts down.
    pub async fn run_until_idle(&self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, initiating graceful shutdown."),
            _ = self.wait_idle() => info!("Crawl has become idle, initiating shutdown."),
        }
        self.shutdown().await;
    }

    /// Drains and stops the engine. Later calls return immediately.
    ///
    /// Queued submissions that no worker picked up yet are dropped; requests
    /// already handed to a fetcher run to completion.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down crawler");
        let timeout = self.config.shutdown_timeout;
        self.shutdown.cancel();

        self.dispatcher.shutdown().await;

        let mut feeds = std::mem::take(&mut *self.feeds.lock());
        if tokio::time::timeout(timeout, async {
            while let Some(res) = feeds.join_next().await {
                if let Err(e) = res {
                    error!("Queue feed failed: {:?}", e);
                }
            }
        })
        .await
        .is_err()
        {
            warn!("Queue feeds did not stop within {:?}, aborting", timeout);
            feeds.abort_all();
        }

        self.registry.join_all(timeout).await;
        self.pipeline.shutdown(timeout).await;

        info!(
            "Crawl finished. requests_submitted={}, requests_succeeded={}, items_processed={}",
            self.stats.requests_submitted.load(Ordering::SeqCst),
            self.stats.requests_succeeded.load(Ordering::SeqCst),
            self.stats.items_processed.load(Ordering::SeqCst)
        );
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> Arc<CrawlerState> {
        Arc::clone(&self.state)
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Number of hosts with a live fetcher.
    pub fn live_fetchers(&self) -> usize {
        self.registry.len()
    }

    pub fn has_fetcher(&self, key: &HostKey) -> bool {
        self.registry.contains(key)
    }

    /// Requests currently inside a downloader, summed over every live fetcher.
    pub fn downloads_in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    /// Dispatcher workers currently running.
    pub fn worker_count(&self) -> usize {
        self.dispatcher.live_workers()
    }

    /// Resizes the global pool. The worker count follows on the next resize tick.
    pub fn set_max_concurrent_requests(&self, n: usize) -> Result<(), SpiderError> {
        self.dispatcher.set_max_concurrent_requests(n)
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.dispatcher.desired_workers()
    }
}

impl<I: Send + 'static> Drop for Crawler<I> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Submits, retrying on `SubmitTimeout` until accepted or refused for another reason.
async fn submit_patiently<I: Send + 'static>(
    dispatcher: &Dispatcher<I>,
    request: Request,
    timeout: Duration,
) -> Result<(), SpiderError> {
    loop {
        match dispatcher.submit(request.clone(), timeout).await {
            Err(SpiderError::SubmitTimeout(_)) => {
                debug!("Pool saturated, retrying {}", request.url);
            }
            other => return other,
        }
    }
}

/// Sleeps for `period`. Returns `true` if shutdown began first.
async fn sleep_or_shutdown(period: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        _ = shutdown.cancelled() => true,
    }
}
