//! URL queues feeding the crawler.

use crate::error::SpiderError;
use crossbeam::queue::SegQueue;

/// A source of URLs to crawl.
///
/// `dequeue` returns `Ok(None)` when the queue is currently empty. That is not
/// end-of-crawl: the feed loop keeps polling until the crawler shuts down.
pub trait Queue: Send + Sync + 'static {
    fn enqueue(&self, url: String);

    fn dequeue(&self) -> Result<Option<String>, SpiderError>;
}

/// Lock-free FIFO queue.
#[derive(Debug, Default)]
pub struct SimpleQueue {
    urls: SegQueue<String>,
}

impl SimpleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for SimpleQueue {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let queue = Self::new();
        for url in iter {
            queue.enqueue(url.into());
        }
        queue
    }
}

impl Queue for SimpleQueue {
    fn enqueue(&self, url: String) {
        self.urls.push(url);
    }

    fn dequeue(&self) -> Result<Option<String>, SpiderError> {
        Ok(self.urls.pop())
    }
}
