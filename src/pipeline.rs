//! Item pipeline stages and the chain they are composed into.

use crate::error::SpiderError;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// One step in the item-processing chain.
///
/// Returning `Ok(Some(item))` hands the item to the next stage, `Ok(None)`
/// drops it, and `Err` drops it and logs the error.
#[async_trait]
pub trait Pipeline<I: Send + 'static>: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process_item(&self, item: I) -> Result<Option<I>, SpiderError>;

    /// Called once during crawler shutdown, after the last item was processed.
    async fn close(&self) -> Result<(), SpiderError> {
        Ok(())
    }
}

/// Adapter allowing an async closure to be used as a [`Pipeline`] stage.
pub struct PipelineFn<F, I> {
    name: String,
    f: F,
    _item: PhantomData<fn() -> I>,
}

pub fn pipeline_fn<F, Fut, I>(name: impl Into<String>, f: F) -> PipelineFn<F, I>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<I>, SpiderError>> + Send + 'static,
    I: Send + 'static,
{
    PipelineFn {
        name: name.into(),
        f,
        _item: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, I> Pipeline<I> for PipelineFn<F, I>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<I>, SpiderError>> + Send + 'static,
    I: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_item(&self, item: I) -> Result<Option<I>, SpiderError> {
        (self.f)(item).await
    }
}

/// How an item left the chain.
#[derive(Debug)]
pub enum ChainOutcome {
    /// Passed every stage and reached the terminal no-op.
    Completed,
    /// A stage returned `Ok(None)`.
    Dropped { stage: String },
    /// A stage returned an error.
    Failed { stage: String, error: SpiderError },
    /// A stage panicked. The panic was contained to this item.
    Panicked { stage: String, message: String },
}

/// The ordered stages, composed once and shared by every sink worker.
pub struct PipelineChain<I: Send + 'static> {
    stages: Arc<[Box<dyn Pipeline<I>>]>,
}

impl<I: Send + 'static> Clone for PipelineChain<I> {
    fn clone(&self) -> Self {
        Self {
            stages: Arc::clone(&self.stages),
        }
    }
}

impl<I: Send + 'static> PipelineChain<I> {
    pub fn new(stages: Vec<Box<dyn Pipeline<I>>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs `item` through every stage in registration order.
    pub async fn run(&self, item: I) -> ChainOutcome {
        let mut current = item;
        for stage in self.stages.iter() {
            let result = AssertUnwindSafe(stage.process_item(current))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(Some(next))) => current = next,
                Ok(Ok(None)) => {
                    return ChainOutcome::Dropped {
                        stage: stage.name().to_string(),
                    }
                }
                Ok(Err(error)) => {
                    return ChainOutcome::Failed {
                        stage: stage.name().to_string(),
                        error,
                    }
                }
                Err(payload) => {
                    return ChainOutcome::Panicked {
                        stage: stage.name().to_string(),
                        message: panic_message(payload.as_ref()),
                    }
                }
            }
        }
        drop(current);
        ChainOutcome::Completed
    }

    /// Closes every stage, returning the failures by stage name.
    pub async fn close(&self) -> Vec<(String, SpiderError)> {
        let results = join_all(self.stages.iter().map(|s| s.close())).await;
        self.stages
            .iter()
            .zip(results)
            .filter_map(|(stage, result)| result.err().map(|e| (stage.name().to_string(), e)))
            .collect()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
