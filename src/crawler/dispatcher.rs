//! The global dispatcher: admission, a resizable worker pool and response routing.
//!
//! Submissions pass an admission semaphore sized to the global request cap and
//! travel on an unbounded channel to the workers. A worker carries one request
//! at a time from its fetcher's reply to the matched handler, so the number of
//! live workers bounds the number of requests in flight.
//!
//! The pool is resized by a reconciler task that compares the desired and the
//! live worker counts once per `resize_interval`. Shrinking sends `Retire`
//! messages that a worker only sees between requests; nothing in flight is
//! interrupted.

use super::item_processor::ItemSink;
use super::registry::HostRegistry;
use crate::concurrency::Resize;
use crate::error::SpiderError;
use crate::pipeline::panic_message;
use crate::request::Request;
use crate::response::Response;
use crate::router::ResponseRouter;
use crate::state::{CrawlerState, GaugeGuard};
use crate::stats::StatCollector;

use super::fetcher::WorkItem;
use kanal::{AsyncReceiver, AsyncSender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub(crate) struct Submission {
    request: Request,
    permit: OwnedSemaphorePermit,
}

pub(crate) enum DispatchMessage {
    Request(Submission),
    Retire,
}

enum WorkerExit {
    Retired,
    Closed,
}

/// State shared by the dispatcher handle, the reconciler and every worker.
struct Shared<I: Send + 'static> {
    registry: Arc<HostRegistry>,
    router: ResponseRouter<I>,
    items: ItemSink<I>,
    state: Arc<CrawlerState>,
    stats: Arc<StatCollector>,
    shutdown: CancellationToken,
    /// Admission permits still to be retired after a shrink.
    admission_debt: AtomicUsize,
}

pub(crate) struct DispatcherConfig {
    pub workers: usize,
    pub resize_interval: Duration,
    pub shutdown_timeout: Duration,
}

pub(crate) struct Dispatcher<I: Send + 'static> {
    shared: Arc<Shared<I>>,
    tx: AsyncSender<DispatchMessage>,
    admission: Arc<Semaphore>,
    desired: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    resize_lock: Mutex<()>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl<I: Send + 'static> Dispatcher<I> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        config: DispatcherConfig,
        registry: Arc<HostRegistry>,
        router: ResponseRouter<I>,
        items: ItemSink<I>,
        state: Arc<CrawlerState>,
        stats: Arc<StatCollector>,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = kanal::unbounded_async();
        let shared = Arc::new(Shared {
            registry,
            router,
            items,
            state,
            stats,
            shutdown,
            admission_debt: AtomicUsize::new(0),
        });
        let desired = Arc::new(AtomicUsize::new(config.workers));
        let live = Arc::new(AtomicUsize::new(0));

        let reconciler = tokio::spawn(run_reconciler(
            Arc::clone(&shared),
            rx,
            tx.clone(),
            Arc::clone(&desired),
            Arc::clone(&live),
            config.resize_interval,
            config.shutdown_timeout,
        ));

        Self {
            shared,
            tx,
            admission: Arc::new(Semaphore::new(config.workers)),
            desired,
            live,
            resize_lock: Mutex::new(()),
            reconciler: Mutex::new(Some(reconciler)),
        }
    }

    /// Admits `request`, waiting at most `timeout` for room in the pool.
    ///
    /// Nothing is enqueued when this returns an error.
    pub(crate) async fn submit(&self, request: Request, timeout: Duration) -> Result<(), SpiderError> {
        let stats = &self.shared.stats;
        if self.shared.shutdown.is_cancelled() {
            stats.increment_requests_rejected();
            return Err(SpiderError::ShuttingDown);
        }
        request.host_key()?;

        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.admission).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                stats.increment_requests_rejected();
                return Err(SpiderError::ShuttingDown);
            }
            Err(_) => {
                stats.increment_requests_rejected();
                warn!("Submission of {} timed out after {:?}", request.url, timeout);
                return Err(SpiderError::SubmitTimeout(timeout));
            }
        };

        let url = request.url.clone();
        self.shared.state.queued_requests.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(DispatchMessage::Request(Submission { request, permit }))
            .await
            .is_err()
        {
            self.shared.state.queued_requests.fetch_sub(1, Ordering::SeqCst);
            stats.increment_requests_rejected();
            return Err(SpiderError::ShuttingDown);
        }
        stats.increment_requests_submitted();
        trace!("Submitted {}", url);
        Ok(())
    }

    /// Changes the desired worker count and the admission window with it.
    ///
    /// Workers follow on the next reconciliation tick.
    pub(crate) fn set_max_concurrent_requests(&self, n: usize) -> Result<(), SpiderError> {
        if n == 0 {
            return Err(SpiderError::ConfigurationError(
                "max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        let _guard = self.resize_lock.lock();
        let previous = self.desired.swap(n, Ordering::SeqCst);
        let debt = &self.shared.admission_debt;

        if n > previous {
            let mut grow = n - previous;
            let repaid = debt
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(grow)))
                .unwrap_or(0)
                .min(grow);
            grow -= repaid;
            self.admission.add_permits(grow);
        } else if n < previous {
            let shrink = previous - n;
            let forgotten = self.admission.forget_permits(shrink);
            debt.fetch_add(shrink - forgotten, Ordering::SeqCst);
        }
        info!("Dispatcher pool resized from {} to {}", previous, n);
        Ok(())
    }

    pub(crate) fn desired_workers(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }

    pub(crate) fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Stops admission and waits for the workers. The shutdown token must already be cancelled.
    pub(crate) async fn shutdown(&self) {
        self.admission.close();
        let reconciler = self.reconciler.lock().take();
        if let Some(handle) = reconciler {
            if let Err(e) = handle.await {
                error!("Dispatcher reconciler failed: {:?}", e);
            }
        }
    }
}

impl<I: Send + 'static> Shared<I> {
    async fn process(&self, submission: Submission) {
        let Submission { request, permit } = submission;
        let url = request.url.to_string();

        let result = {
            let _in_flight = GaugeGuard::enter(&self.state.in_flight_requests);
            self.forward(request).await
        };

        match result {
            Ok(response) => {
                self.stats.increment_requests_succeeded();
                self.stats.record_response_status(response.status.as_u16());
                self.stats.add_bytes_downloaded(response.body.len());
                self.route(response).await;
            }
            Err(e @ SpiderError::Dropped { .. }) => debug!("{}", e),
            Err(e) if e.is_cancellation() => {
                self.stats.increment_requests_cancelled();
                warn!("Request to {} did not complete: {}", url, e);
            }
            Err(e) => {
                self.stats.increment_requests_failed();
                error!("Request to {} failed: {}", url, e);
            }
        }

        self.release_admission(permit);
    }

    /// Hands `request` to its host's fetcher and waits for the result.
    async fn forward(&self, request: Request) -> Result<Response, SpiderError> {
        let key = request.host_key()?;
        let url = request.url.to_string();
        let cancelled = request.cancellation();
        tokio::pin!(cancelled);

        loop {
            let reservation = self.registry.get_or_create(&key)?;
            let reserved = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(SpiderError::ShuttingDown),
                _ = &mut cancelled => return Err(SpiderError::Cancelled(url)),
                permit = reservation.sender().clone().reserve_owned() => permit,
            };

            match reserved {
                Ok(permit) => {
                    let (reply, response) = oneshot::channel();
                    // Queued before the reservation is released, so eviction sees it.
                    permit.send(WorkItem { request, reply });
                    drop(reservation);
                    return response
                        .await
                        .unwrap_or_else(|_| Err(SpiderError::Cancelled(url)));
                }
                Err(_) => {
                    // The fetcher stopped between lookup and send.
                    trace!("Fetcher for {} closed, looking up again", key);
                    self.registry.remove(reservation.handle());
                }
            }
        }
    }

    async fn route(&self, response: Response) {
        let (handler, pattern) = self.router.resolve(response.request());
        let pattern = pattern.unwrap_or("<none>").to_string();
        let url = response.url.to_string();
        let items = self.items.clone();

        let _handling = GaugeGuard::enter(&self.state.handling_responses);
        let task = tokio::spawn(async move { handler.handle(response, &items).await });
        match task.await {
            Ok(Ok(())) => {
                trace!("Handler '{}' finished {}", pattern, url);
                self.stats.increment_responses_handled();
            }
            Ok(Err(e)) => {
                self.stats.increment_responses_handled();
                error!("Handler '{}' failed on {}: {}", pattern, url, e);
            }
            Err(e) if e.is_panic() => {
                self.stats.increment_handler_panics();
                let message = panic_message(e.into_panic().as_ref());
                error!("{} (handler '{}'): {}", SpiderError::HandlerPanic(url), pattern, message);
            }
            Err(e) => warn!("Handler task for {} was cancelled: {}", url, e),
        }
    }

    fn release_admission(&self, permit: OwnedSemaphorePermit) {
        let retire = self
            .admission_debt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
            .is_ok();
        if retire {
            permit.forget();
        }
    }
}

async fn run_worker<I: Send + 'static>(
    id: usize,
    rx: AsyncReceiver<DispatchMessage>,
    shared: Arc<Shared<I>>,
    live: Arc<AtomicUsize>,
) -> WorkerExit {
    live.fetch_add(1, Ordering::SeqCst);
    trace!("Dispatcher worker {} started", id);

    let mut exit = WorkerExit::Closed;
    while let Ok(message) = rx.recv().await {
        match message {
            DispatchMessage::Retire => {
                exit = WorkerExit::Retired;
                break;
            }
            DispatchMessage::Request(submission) => {
                shared.state.queued_requests.fetch_sub(1, Ordering::SeqCst);
                if shared.shutdown.is_cancelled() {
                    debug!("Discarding queued {} during shutdown", submission.request.url);
                    continue;
                }
                shared.process(submission).await;
            }
        }
    }

    live.fetch_sub(1, Ordering::SeqCst);
    trace!("Dispatcher worker {} stopped", id);
    exit
}

#[allow(clippy::too_many_arguments)]
async fn run_reconciler<I: Send + 'static>(
    shared: Arc<Shared<I>>,
    rx: AsyncReceiver<DispatchMessage>,
    tx: AsyncSender<DispatchMessage>,
    desired: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    resize_interval: Duration,
    shutdown_timeout: Duration,
) {
    let mut workers: JoinSet<WorkerExit> = JoinSet::new();
    let mut retiring = 0usize;
    let mut next_id = 0usize;
    let mut ticker = tokio::time::interval(resize_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                reap(&mut workers, &mut retiring);
                let effective = workers.len().saturating_sub(retiring);
                match Resize::reconcile(desired.load(Ordering::SeqCst), effective) {
                    Resize::Steady => {}
                    Resize::Grow(n) => {
                        for _ in 0..n {
                            workers.spawn(run_worker(next_id, rx.clone(), Arc::clone(&shared), Arc::clone(&live)));
                            next_id += 1;
                        }
                        debug!("Spawned {} dispatcher workers ({} total)", n, workers.len());
                    }
                    Resize::Shrink(n) => {
                        for _ in 0..n {
                            if tx.send(DispatchMessage::Retire).await.is_err() {
                                break;
                            }
                            retiring += 1;
                        }
                        debug!("Retiring {} dispatcher workers", n);
                    }
                }
            }
        }
    }

    debug!("Stopping {} dispatcher workers", workers.len());
    for _ in 0..workers.len() {
        if tx.send(DispatchMessage::Retire).await.is_err() {
            break;
        }
    }

    let joined = tokio::time::timeout(shutdown_timeout, async {
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!("Dispatcher worker failed: {:?}", e);
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!(
            "Dispatcher workers did not finish within {:?}, aborting {}",
            shutdown_timeout,
            workers.len()
        );
        workers.abort_all();
        live.store(0, Ordering::SeqCst);
    }
}

fn reap(workers: &mut JoinSet<WorkerExit>, retiring: &mut usize) {
    while let Some(res) = workers.try_join_next() {
        match res {
            Ok(WorkerExit::Retired) => *retiring = retiring.saturating_sub(1),
            Ok(WorkerExit::Closed) => {}
            Err(e) => error!("Dispatcher worker failed: {:?}", e),
        }
    }
}
