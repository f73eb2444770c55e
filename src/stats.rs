//! Engine counters.
//!
//! One `StatCollector` is shared by every task. The dispatcher counts
//! submissions and their outcomes, fetchers count their own lifecycle and the
//! item sink counts what the pipeline chain did with each item:
//!
//! - requests: submitted, rejected at admission, sent, succeeded, failed, cancelled
//! - responses: handled, handler panics, status code distribution, bytes
//! - items: emitted, processed, dropped by a stage, pipeline panics
//! - fetchers: created and evicted
//!
//! ```rust,ignore
//! println!("{}", crawler.stats());
//! std::fs::write("stats.md", crawler.stats().to_markdown_string())?;
//! ```

use crate::error::SpiderError;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// Point-in-time copy of every counter, shared by the export formats.
#[derive(Debug, Serialize)]
struct StatsSnapshot {
    elapsed_ms: u128,
    requests_submitted: usize,
    requests_rejected: usize,
    requests_sent: usize,
    requests_succeeded: usize,
    requests_failed: usize,
    requests_cancelled: usize,
    responses_handled: usize,
    handler_panics: usize,
    items_emitted: usize,
    items_processed: usize,
    items_dropped_by_pipeline: usize,
    pipeline_panics: usize,
    fetchers_created: usize,
    fetchers_evicted: usize,
    bytes_downloaded: usize,
    response_status_counts: BTreeMap<u16, usize>,
    #[serde(skip)]
    elapsed: Duration,
}

impl StatsSnapshot {
    fn per_second(&self, count: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { count as f64 / secs } else { 0.0 }
    }

    fn formatted_bytes(&self) -> String {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;

        let bytes = self.bytes_downloaded;
        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }

    fn status_line(&self, sep: &str, fmt: impl Fn(u16, usize) -> String) -> Option<String> {
        if self.response_status_counts.is_empty() {
            return None;
        }
        Some(
            self.response_status_counts
                .iter()
                .map(|(code, count)| fmt(*code, *count))
                .collect::<Vec<_>>()
                .join(sep),
        )
    }
}

/// Thread-safe crawl counters.
#[derive(Debug)]
pub struct StatCollector {
    start_time: Instant,

    pub requests_submitted: AtomicUsize,
    pub requests_rejected: AtomicUsize,
    pub requests_sent: AtomicUsize,
    pub requests_succeeded: AtomicUsize,
    pub requests_failed: AtomicUsize,
    pub requests_cancelled: AtomicUsize,

    pub responses_handled: AtomicUsize,
    pub handler_panics: AtomicUsize,
    pub response_status_counts: DashMap<u16, usize>,
    pub bytes_downloaded: AtomicUsize,

    pub items_emitted: AtomicUsize,
    pub items_processed: AtomicUsize,
    pub items_dropped_by_pipeline: AtomicUsize,
    pub pipeline_panics: AtomicUsize,

    pub fetchers_created: AtomicUsize,
    pub fetchers_evicted: AtomicUsize,
}

macro_rules! counter {
    ($($(#[$doc:meta])* $fn_name:ident => $field:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub(crate) fn $fn_name(&self) {
                self.$field.fetch_add(1, Ordering::SeqCst);
            }
        )*
    };
}

impl StatCollector {
    pub(crate) fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests_submitted: AtomicUsize::new(0),
            requests_rejected: AtomicUsize::new(0),
            requests_sent: AtomicUsize::new(0),
            requests_succeeded: AtomicUsize::new(0),
            requests_failed: AtomicUsize::new(0),
            requests_cancelled: AtomicUsize::new(0),
            responses_handled: AtomicUsize::new(0),
            handler_panics: AtomicUsize::new(0),
            response_status_counts: DashMap::new(),
            bytes_downloaded: AtomicUsize::new(0),
            items_emitted: AtomicUsize::new(0),
            items_processed: AtomicUsize::new(0),
            items_dropped_by_pipeline: AtomicUsize::new(0),
            pipeline_panics: AtomicUsize::new(0),
            fetchers_created: AtomicUsize::new(0),
            fetchers_evicted: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let response_status_counts = self
            .response_status_counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        let elapsed = self.start_time.elapsed();

        StatsSnapshot {
            elapsed_ms: elapsed.as_millis(),
            requests_submitted: self.requests_submitted.load(Ordering::SeqCst),
            requests_rejected: self.requests_rejected.load(Ordering::SeqCst),
            requests_sent: self.requests_sent.load(Ordering::SeqCst),
            requests_succeeded: self.requests_succeeded.load(Ordering::SeqCst),
            requests_failed: self.requests_failed.load(Ordering::SeqCst),
            requests_cancelled: self.requests_cancelled.load(Ordering::SeqCst),
            responses_handled: self.responses_handled.load(Ordering::SeqCst),
            handler_panics: self.handler_panics.load(Ordering::SeqCst),
            items_emitted: self.items_emitted.load(Ordering::SeqCst),
            items_processed: self.items_processed.load(Ordering::SeqCst),
            items_dropped_by_pipeline: self.items_dropped_by_pipeline.load(Ordering::SeqCst),
            pipeline_panics: self.pipeline_panics.load(Ordering::SeqCst),
            fetchers_created: self.fetchers_created.load(Ordering::SeqCst),
            fetchers_evicted: self.fetchers_evicted.load(Ordering::SeqCst),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::SeqCst),
            response_status_counts,
            elapsed,
        }
    }

    counter! {
        increment_requests_submitted => requests_submitted,
        /// Counts a submission refused with `SubmitTimeout` or `ShuttingDown`.
        increment_requests_rejected => requests_rejected,
        increment_requests_sent => requests_sent,
        increment_requests_succeeded => requests_succeeded,
        increment_requests_failed => requests_failed,
        increment_requests_cancelled => requests_cancelled,
        increment_responses_handled => responses_handled,
        increment_handler_panics => handler_panics,
        increment_items_emitted => items_emitted,
        increment_items_processed => items_processed,
        increment_items_dropped_by_pipeline => items_dropped_by_pipeline,
        increment_pipeline_panics => pipeline_panics,
        increment_fetchers_created => fetchers_created,
        increment_fetchers_evicted => fetchers_evicted,
    }

    pub(crate) fn record_response_status(&self, status_code: u16) {
        *self.response_status_counts.entry(status_code).or_insert(0) += 1;
    }

    pub(crate) fn add_bytes_downloaded(&self, bytes: usize) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn to_json_string(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    pub fn to_markdown_string(&self) -> String {
        let s = self.snapshot();
        let status_codes = s
            .status_line("\n", |code, count| format!("- **{}**: {}", code, count))
            .unwrap_or_else(|| "N/A".to_string());

        format!(
            r#"# Crawl Statistics Report

- **Duration**: {:?}
- **Average Speed**: {:.2} req/s, {:.2} item/s

## Requests
| Metric     | Count |
|------------|-------|
| Submitted  | {} |
| Rejected   | {} |
| Sent       | {} |
| Succeeded  | {} |
| Failed     | {} |
| Cancelled  | {} |

## Responses
| Metric         | Count |
|----------------|-------|
| Handled        | {} |
| Handler panics | {} |
| Downloaded     | {} |

## Items
| Metric          | Count |
|-----------------|-------|
| Emitted         | {} |
| Processed       | {} |
| Dropped         | {} |
| Pipeline panics | {} |

## Fetchers
| Metric  | Count |
|---------|-------|
| Created | {} |
| Evicted | {} |

## Status Codes
{}
"#,
            s.elapsed,
            s.per_second(s.requests_sent),
            s.per_second(s.items_emitted),
            s.requests_submitted,
            s.requests_rejected,
            s.requests_sent,
            s.requests_succeeded,
            s.requests_failed,
            s.requests_cancelled,
            s.responses_handled,
            s.handler_panics,
            s.formatted_bytes(),
            s.items_emitted,
            s.items_processed,
            s.items_dropped_by_pipeline,
            s.pipeline_panics,
            s.fetchers_created,
            s.fetchers_evicted,
            status_codes,
        )
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {:?}", s.elapsed)?;
        writeln!(
            f,
            "  speed    : req/s: {:.2}, item/s: {:.2}",
            s.per_second(s.requests_sent),
            s.per_second(s.items_emitted)
        )?;
        writeln!(
            f,
            "  requests : submitted: {}, rejected: {}, sent: {}, ok: {}, fail: {}, cancelled: {}",
            s.requests_submitted,
            s.requests_rejected,
            s.requests_sent,
            s.requests_succeeded,
            s.requests_failed,
            s.requests_cancelled
        )?;
        writeln!(
            f,
            "  response : handled: {}, panics: {}, downloaded: {}",
            s.responses_handled,
            s.handler_panics,
            s.formatted_bytes()
        )?;
        writeln!(
            f,
            "  items    : emitted: {}, processed: {}, dropped: {}, panics: {}",
            s.items_emitted, s.items_processed, s.items_dropped_by_pipeline, s.pipeline_panics
        )?;
        writeln!(
            f,
            "  fetchers : created: {}, evicted: {}",
            s.fetchers_created, s.fetchers_evicted
        )?;

        let status = s
            .status_line(", ", |code, count| format!("{}: {}", code, count))
            .unwrap_or_else(|| "none".to_string());
        writeln!(f, "  status   : {}\n", status)
    }
}
