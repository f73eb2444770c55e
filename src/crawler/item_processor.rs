//! Item processing: a fixed pool of workers draining emitted items through the
//! pipeline chain.
//!
//! The item channel is bounded, so a handler emitting faster than the pipeline
//! can process waits in [`ItemSink::emit`].

use crate::error::SpiderError;
use crate::pipeline::{ChainOutcome, PipelineChain};
use crate::state::CrawlerState;
use crate::stats::StatCollector;

use kanal::{AsyncReceiver, AsyncSender};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Counts items between `emit` and the end of the chain, and wakes the
/// shutdown path when the last one leaves.
struct Outstanding {
    state: Arc<CrawlerState>,
    drained: Notify,
}

impl Outstanding {
    fn enter(&self) {
        self.state.processing_items.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        if self.state.processing_items.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once no item is queued or inside the chain.
    async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.processing_items.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Handle through which handlers emit items into the pipeline.
pub struct ItemSink<I> {
    tx: AsyncSender<I>,
    outstanding: Arc<Outstanding>,
    stats: Arc<StatCollector>,
}

impl<I> Clone for ItemSink<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            outstanding: Arc::clone(&self.outstanding),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<I: Send + 'static> ItemSink<I> {
    /// Hands `item` to the pipeline, waiting while the item channel is full.
    ///
    /// Fails with `ShuttingDown` once the pipeline has stopped accepting items.
    pub async fn emit(&self, item: I) -> Result<(), SpiderError> {
        self.outstanding.enter();
        match self.tx.send(item).await {
            Ok(()) => {
                self.stats.increment_items_emitted();
                Ok(())
            }
            Err(_) => {
                self.outstanding.leave();
                Err(SpiderError::ShuttingDown)
            }
        }
    }

    /// Items waiting for a free pipeline worker.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

pub(crate) struct PipelineSink<I: Send + 'static> {
    rx: AsyncReceiver<I>,
    chain: PipelineChain<I>,
    outstanding: Arc<Outstanding>,
    workers: parking_lot::Mutex<JoinSet<()>>,
}

impl<I: Send + 'static> PipelineSink<I> {
    /// Spawns `workers` pipeline workers and returns the sink with its first sender.
    pub(crate) fn spawn(
        chain: PipelineChain<I>,
        workers: usize,
        state: Arc<CrawlerState>,
        stats: Arc<StatCollector>,
    ) -> (Self, ItemSink<I>) {
        let (tx, rx) = kanal::bounded_async(workers);
        let outstanding = Arc::new(Outstanding {
            state,
            drained: Notify::new(),
        });
        let mut set = JoinSet::new();
        trace!(
            "Starting {} item workers over {} pipeline stages",
            workers,
            chain.len()
        );
        for id in 0..workers {
            set.spawn(run_worker(
                id,
                rx.clone(),
                chain.clone(),
                Arc::clone(&outstanding),
                Arc::clone(&stats),
            ));
        }

        let sink = ItemSink {
            tx,
            outstanding: Arc::clone(&outstanding),
            stats,
        };
        let pipeline = Self {
            rx,
            chain,
            outstanding,
            workers: parking_lot::Mutex::new(set),
        };
        (pipeline, sink)
    }

    /// Lets the workers finish every emitted item, stops them and closes every stage.
    ///
    /// Call once no handler can emit any more. Anything still running after
    /// `timeout` is aborted.
    pub(crate) async fn shutdown(&self, timeout: Duration) {
        let mut workers = std::mem::take(&mut *self.workers.lock());

        if tokio::time::timeout(timeout, self.outstanding.drained())
            .await
            .is_err()
        {
            warn!(
                "Pipeline still held {} items at shutdown",
                self.outstanding.state.processing_items.load(Ordering::SeqCst)
            );
        }
        let _ = self.rx.close();

        let joined = tokio::time::timeout(timeout, async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    error!("An item worker failed: {:?}", e);
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Item workers did not finish within {:?}, aborting", timeout);
            workers.abort_all();
        }

        debug!("Closing {} pipeline stages", self.chain.len());
        for (stage, e) in self.chain.close().await {
            error!("Pipeline '{}' failed to close: {}", stage, e);
        }
    }
}

async fn run_worker<I: Send + 'static>(
    id: usize,
    rx: AsyncReceiver<I>,
    chain: PipelineChain<I>,
    outstanding: Arc<Outstanding>,
    stats: Arc<StatCollector>,
) {
    while let Ok(item) = rx.recv().await {
        match chain.run(item).await {
            ChainOutcome::Completed => {
                trace!("Item worker {} finished an item", id);
                stats.increment_items_processed();
            }
            ChainOutcome::Dropped { stage } => {
                debug!("Pipeline '{}' dropped item", stage);
                stats.increment_items_dropped_by_pipeline();
            }
            ChainOutcome::Failed { stage, error } => {
                error!("Pipeline '{}' error: {}", stage, error);
                stats.increment_items_dropped_by_pipeline();
            }
            ChainOutcome::Panicked { stage, message } => {
                let err = SpiderError::PipelinePanic(stage);
                error!("{}: {}", err, message);
                stats.increment_pipeline_panics();
                stats.increment_items_dropped_by_pipeline();
            }
        }
        outstanding.leave();
    }
    trace!("Item worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{pipeline_fn, Pipeline};
    use parking_lot::Mutex;

    #[tokio::test]
    async fn every_item_processed_exactly_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record: Box<dyn Pipeline<u32>> = {
            let seen = Arc::clone(&seen);
            Box::new(pipeline_fn("record", move |v: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    tokio::task::yield_now().await;
                    seen.lock().push(v);
                    Ok(Some(v))
                }
            }))
        };
        let state = CrawlerState::new();
        let stats = Arc::new(StatCollector::new());
        let (pipeline, sink) =
            PipelineSink::spawn(PipelineChain::new(vec![record]), 4, Arc::clone(&state), Arc::clone(&stats));

        for i in 0..100 {
            sink.emit(i).await.unwrap();
        }
        pipeline.shutdown(Duration::from_secs(5)).await;

        let mut got = seen.lock().clone();
        got.sort_unstable();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        assert_eq!(stats.items_processed.load(Ordering::SeqCst), 100);
        assert!(state.is_idle());
    }

    #[tokio::test]
    async fn emit_after_shutdown_is_refused() {
        let state = CrawlerState::new();
        let (pipeline, sink) = PipelineSink::<u32>::spawn(
            PipelineChain::new(Vec::new()),
            2,
            Arc::clone(&state),
            Arc::new(StatCollector::new()),
        );
        pipeline.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(sink.emit(1).await, Err(SpiderError::ShuttingDown)));
        assert!(state.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_slow_items() {
        let slow: Box<dyn Pipeline<u32>> = Box::new(pipeline_fn("slow", |v: u32| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Some(v))
        }));
        let state = CrawlerState::new();
        let stats = Arc::new(StatCollector::new());
        let (pipeline, sink) =
            PipelineSink::spawn(PipelineChain::new(vec![slow]), 1, Arc::clone(&state), Arc::clone(&stats));

        sink.emit(1).await.unwrap();
        sink.emit(2).await.unwrap();
        let started = tokio::time::Instant::now();
        pipeline.shutdown(Duration::from_secs(10)).await;

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(stats.items_processed.load(Ordering::SeqCst), 2);
        assert!(state.is_idle());
    }
}
