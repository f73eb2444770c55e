//! The host registry: at most one live fetcher per host key.
//!
//! All lookups, creations and evictions go through one `parking_lot::Mutex`.
//! The lock is never held across an `.await`.
//!
//! A lookup takes a reservation on the fetcher it returns. A fetcher with an
//! outstanding reservation, a non-empty queue or a running sub-worker cannot be
//! evicted, so a request either lands on a live fetcher or finds the entry gone
//! and creates a fresh one.

use super::fetcher::{run_fetcher, FetcherContext, FetcherHandle, WorkItem};
use crate::error::SpiderError;
use crate::host_key::HostKey;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Default)]
struct Inner {
    fetchers: HashMap<HostKey, Arc<FetcherHandle>>,
    tasks: JoinSet<()>,
}

pub(crate) struct HostRegistry {
    inner: Mutex<Inner>,
    ctx: FetcherContext,
    next_id: AtomicU64,
}

/// A claim on a fetcher that blocks its eviction until dropped.
pub(crate) struct Reservation {
    handle: Arc<FetcherHandle>,
}

impl Reservation {
    pub(crate) fn handle(&self) -> &Arc<FetcherHandle> {
        &self.handle
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<WorkItem> {
        self.handle.sender()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl HostRegistry {
    pub(crate) fn new(ctx: FetcherContext) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            ctx,
            next_id: AtomicU64::new(1),
        })
    }

    /// Returns the live fetcher for `key`, spawning one if there is none.
    pub(crate) fn get_or_create(self: &Arc<Self>, key: &HostKey) -> Result<Reservation, SpiderError> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.fetchers.get(key) {
            handle.reserve();
            return Ok(Reservation {
                handle: Arc::clone(handle),
            });
        }

        if self.ctx.shutdown.is_cancelled() {
            return Err(SpiderError::ShuttingDown);
        }

        // Reap fetchers that already exited.
        while let Some(res) = inner.tasks.try_join_next() {
            if let Err(e) = res {
                warn!("Fetcher task failed: {:?}", e);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.ctx.max_requests_per_host);
        let handle = Arc::new(FetcherHandle::new(id, key.clone(), tx));
        handle.reserve();
        inner.fetchers.insert(key.clone(), Arc::clone(&handle));
        inner.tasks.spawn(run_fetcher(
            Arc::clone(&handle),
            rx,
            Arc::clone(self),
            self.ctx.clone(),
        ));
        self.ctx.stats.increment_fetchers_created();
        debug!("Created fetcher #{} for {}", id, key);

        Ok(Reservation { handle })
    }

    /// Removes `handle`'s entry if it is still the registered instance.
    pub(crate) fn remove(&self, handle: &FetcherHandle) -> bool {
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, handle)
    }

    fn remove_locked(inner: &mut Inner, handle: &FetcherHandle) -> bool {
        match inner.fetchers.get(handle.key()) {
            Some(live) if live.id() == handle.id() => {
                inner.fetchers.remove(handle.key());
                true
            }
            _ => false,
        }
    }

    /// Deregisters an idle fetcher. Fails while any work is reserved, queued or running.
    pub(crate) fn try_evict(&self, handle: &FetcherHandle) -> bool {
        let mut inner = self.inner.lock();
        if !handle.is_quiescent() {
            return false;
        }
        if Self::remove_locked(&mut inner, handle) {
            self.ctx.stats.increment_fetchers_evicted();
            debug!("Evicted idle fetcher #{} for {}", handle.id(), handle.key());
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().fetchers.len()
    }

    pub(crate) fn contains(&self, key: &HostKey) -> bool {
        self.inner.lock().fetchers.contains_key(key)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .fetchers
            .values()
            .map(|handle| handle.in_flight())
            .sum()
    }

    /// Waits for every fetcher task to exit, aborting stragglers after `timeout`.
    ///
    /// Call after the shutdown token is cancelled.
    pub(crate) async fn join_all(&self, timeout: Duration) {
        let mut tasks = std::mem::take(&mut self.inner.lock().tasks);
        let joined = tokio::time::timeout(timeout, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    warn!("Fetcher task failed during shutdown: {:?}", e);
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!(
                "Fetchers did not drain within {:?}, aborting {} remaining",
                timeout,
                tasks.len()
            );
            tasks.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::Downloader;
    use crate::request::Request;
    use crate::response::Response;
    use crate::stats::StatCollector;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Ok200;

    #[async_trait]
    impl Downloader for Ok200 {
        async fn download(&self, request: Request) -> Result<Response, SpiderError> {
            Ok(Response::new(
                request,
                reqwest::StatusCode::OK,
                Default::default(),
                bytes::Bytes::new(),
            ))
        }
    }

    fn registry(idle: Duration) -> Arc<HostRegistry> {
        HostRegistry::new(FetcherContext {
            downloader: Arc::new(Ok200),
            stats: Arc::new(StatCollector::new()),
            shutdown: CancellationToken::new(),
            max_requests_per_host: 1,
            download_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            idle_timeout: idle,
        })
    }

    #[tokio::test]
    async fn one_fetcher_per_host() {
        let reg = registry(Duration::from_secs(60));
        let a = HostKey::parse("https://a.test/").unwrap();
        let first = reg.get_or_create(&a).unwrap();
        let second = reg.get_or_create(&a).unwrap();
        assert_eq!(first.handle().id(), second.handle().id());
        assert_eq!(reg.len(), 1);

        let b = HostKey::parse("https://b.test/").unwrap();
        let other = reg.get_or_create(&b).unwrap();
        assert_ne!(other.handle().id(), first.handle().id());
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn reservation_blocks_eviction() {
        let reg = registry(Duration::from_secs(60));
        let key = HostKey::parse("https://a.test/").unwrap();
        let reservation = reg.get_or_create(&key).unwrap();
        let handle = Arc::clone(reservation.handle());

        assert!(!reg.try_evict(&handle));
        assert!(reg.contains(&key));

        drop(reservation);
        assert!(reg.try_evict(&handle));
        assert!(!reg.contains(&key));
    }

    #[tokio::test]
    async fn remove_ignores_stale_instances() {
        let reg = registry(Duration::from_secs(60));
        let key = HostKey::parse("https://a.test/").unwrap();
        let old = Arc::clone(reg.get_or_create(&key).unwrap().handle());
        assert!(reg.remove(&old));

        let fresh = Arc::clone(reg.get_or_create(&key).unwrap().handle());
        assert_ne!(old.id(), fresh.id());
        assert!(!reg.remove(&old));
        assert!(reg.contains(&key));
    }

    #[tokio::test]
    async fn no_new_fetchers_after_shutdown() {
        let reg = registry(Duration::from_secs(60));
        reg.ctx.shutdown.cancel();
        let key = HostKey::parse("https://a.test/").unwrap();
        assert!(matches!(reg.get_or_create(&key), Err(SpiderError::ShuttingDown)));
        reg.join_all(Duration::from_secs(1)).await;
    }
}
