//! Per-host fetchers.
//!
//! A fetcher owns one host's politeness budget: a bounded inbound queue, a
//! pool of at most `max_requests_per_host` sub-workers and the delay gate that
//! spaces consecutive dispatches. It exits after sitting idle for
//! `idle_timeout`, or when global shutdown begins.
//!
//! Lifecycle: `active -> active (timer reset) -> draining -> gone`. Draining
//! answers every queued item with `ShuttingDown` and lets in-flight sub-workers
//! finish. A drained fetcher never comes back; the registry creates a new one
//! for the next request to that host.

use crate::concurrency::{DelayGate, GateOutcome};
use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::host_key::HostKey;
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatCollector;

use super::registry::HostRegistry;

use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A request on its way to a fetcher, with the channel its result goes back on.
///
/// Exactly one result is sent. Dropping the item unsent is seen by the waiting
/// dispatcher worker as cancellation.
pub(crate) struct WorkItem {
    pub request: Request,
    pub reply: oneshot::Sender<Result<Response, SpiderError>>,
}

impl WorkItem {
    fn answer(self, result: Result<Response, SpiderError>) {
        if self.reply.send(result).is_err() {
            trace!("Reply receiver dropped before the result arrived");
        }
    }
}

/// Settings and shared services every fetcher is built with.
#[derive(Clone)]
pub(crate) struct FetcherContext {
    pub downloader: Arc<dyn Downloader>,
    pub stats: Arc<StatCollector>,
    pub shutdown: CancellationToken,
    pub max_requests_per_host: usize,
    pub download_delay: Duration,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

/// The registry's view of a running fetcher.
pub(crate) struct FetcherHandle {
    id: u64,
    key: HostKey,
    tx: mpsc::Sender<WorkItem>,
    reservations: AtomicUsize,
    active: AtomicUsize,
    last_activity: Mutex<Instant>,
}

impl FetcherHandle {
    pub(crate) fn new(id: u64, key: HostKey, tx: mpsc::Sender<WorkItem>) -> Self {
        Self {
            id,
            key,
            tx,
            reservations: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> &HostKey {
        &self.key
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<WorkItem> {
        &self.tx
    }

    pub(crate) fn reserve(&self) {
        self.reservations.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.reservations.fetch_sub(1, Ordering::SeqCst);
    }

    /// Nothing reserved, nothing queued (or about to be), nothing in flight.
    ///
    /// Only meaningful under the registry lock, which is what stops new
    /// reservations from appearing.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.reservations.load(Ordering::SeqCst) == 0
            && self.tx.capacity() == self.tx.max_capacity()
            && self.active.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        *self.last_activity.lock() + idle_timeout
    }
}

/// Lowers the handle's in-flight count when a sub-worker ends, even by panic.
struct ActiveGuard(Arc<FetcherHandle>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Exit {
    Idle,
    Shutdown,
}

/// The fetcher's main loop. Runs until idle eviction succeeds or shutdown.
pub(crate) async fn run_fetcher(
    handle: Arc<FetcherHandle>,
    mut rx: mpsc::Receiver<WorkItem>,
    registry: Arc<HostRegistry>,
    ctx: FetcherContext,
) {
    debug!("Fetcher #{} for {} started", handle.id(), handle.key());
    let slots = Arc::new(Semaphore::new(ctx.max_requests_per_host));
    let mut gate = DelayGate::new(ctx.download_delay);
    let mut tasks: JoinSet<()> = JoinSet::new();

    let exit = loop {
        let idle_at = handle.idle_deadline(ctx.idle_timeout);
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break Exit::Shutdown,
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = res {
                    error!("Sub-worker for {} failed: {:?}", handle.key(), e);
                }
            }
            work = rx.recv() => {
                // The handle keeps a sender alive, so the channel cannot close here.
                let Some(work) = work else { break Exit::Shutdown };
                if let Some(work) = wait_for_turn(&ctx, &mut gate, work).await {
                    match acquire_slot(&ctx, &slots, work).await {
                        Some((work, permit)) => {
                            gate.mark_dispatched();
                            handle.active.fetch_add(1, Ordering::SeqCst);
                            let guard = ActiveGuard(Arc::clone(&handle));
                            let ctx = ctx.clone();
                            tasks.spawn(async move {
                                let handle = Arc::clone(&guard.0);
                                let result = exchange(&ctx, work.request).await;
                                handle.touch();
                                drop(permit);
                                drop(guard);
                                work.reply.send(result).ok();
                            });
                        }
                        None => continue,
                    }
                }
            }
            _ = tokio::time::sleep_until(idle_at), if tasks.is_empty() => {
                if Instant::now() < handle.idle_deadline(ctx.idle_timeout) {
                    continue;
                }
                if registry.try_evict(&handle) {
                    break Exit::Idle;
                }
                trace!("Fetcher for {} is busy, postponing eviction", handle.key());
                handle.touch();
            }
        }
    };

    match exit {
        Exit::Idle => debug!("Fetcher #{} for {} idle, draining", handle.id(), handle.key()),
        Exit::Shutdown => {
            registry.remove(&handle);
            debug!("Fetcher #{} for {} draining for shutdown", handle.id(), handle.key());
        }
    }

    rx.close();
    let mut refused = 0usize;
    while let Some(work) = rx.recv().await {
        work.answer(Err(SpiderError::ShuttingDown));
        refused += 1;
    }
    if refused > 0 {
        warn!("Fetcher for {} refused {} queued requests", handle.key(), refused);
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!("Sub-worker for {} failed: {:?}", handle.key(), e);
        }
    }
    debug!("Fetcher #{} for {} stopped", handle.id(), handle.key());
}

/// Waits out the delay gate. Answers and consumes the item if it is cancelled
/// or shutdown begins first.
async fn wait_for_turn(ctx: &FetcherContext, gate: &mut DelayGate, work: WorkItem) -> Option<WorkItem> {
    let cancelled = work.request.cancellation();
    match gate.wait(cancelled, &ctx.shutdown).await {
        GateOutcome::Open => Some(work),
        GateOutcome::Cancelled => {
            let url = work.request.url.to_string();
            work.answer(Err(SpiderError::Cancelled(url)));
            None
        }
        GateOutcome::ShuttingDown => {
            work.answer(Err(SpiderError::ShuttingDown));
            None
        }
    }
}

async fn acquire_slot(
    ctx: &FetcherContext,
    slots: &Arc<Semaphore>,
    work: WorkItem,
) -> Option<(WorkItem, tokio::sync::OwnedSemaphorePermit)> {
    let cancelled = work.request.cancellation();
    let outcome = tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => Err(SpiderError::ShuttingDown),
        _ = cancelled => Err(SpiderError::Cancelled(work.request.url.to_string())),
        permit = Arc::clone(slots).acquire_owned() => {
            permit.map_err(|_| SpiderError::ShuttingDown)
        }
    };
    match outcome {
        Ok(permit) => Some((work, permit)),
        Err(e) => {
            work.answer(Err(e));
            None
        }
    }
}

/// Runs one download under the request's cancellation and the per-request timeout.
async fn exchange(ctx: &FetcherContext, request: Request) -> Result<Response, SpiderError> {
    let url = request.url.to_string();
    let cancelled = request.cancellation();
    trace!("Dispatching {}", url);
    ctx.stats.increment_requests_sent();

    tokio::select! {
        biased;
        _ = cancelled => Err(SpiderError::Cancelled(url)),
        res = tokio::time::timeout(ctx.request_timeout, ctx.downloader.download(request)) => {
            match res {
                Ok(result) => result,
                Err(_) => Err(SpiderError::RequestTimeout {
                    url,
                    timeout: ctx.request_timeout,
                }),
            }
        }
    }
}
