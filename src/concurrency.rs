//! Concurrency primitives used by the dispatcher and the per-host fetchers.
//!
//! - [`DelayGate`] spaces out consecutive dispatches to one host.
//! - [`Resize`] is the reconciliation decision taken once per resize tick.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of waiting at a [`DelayGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The delay has elapsed; the caller may dispatch.
    Open,
    /// The request was cancelled while waiting.
    Cancelled,
    /// Global shutdown was observed while waiting.
    ShuttingDown,
}

/// Enforces a minimum interval between dispatches to the same host.
///
/// Owned by a single fetcher loop, so it needs no synchronisation.
#[derive(Debug)]
pub struct DelayGate {
    delay: Duration,
    last_dispatch: Option<Instant>,
}

impl DelayGate {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_dispatch: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Earliest instant the next dispatch may happen.
    pub fn ready_at(&self) -> Option<Instant> {
        self.last_dispatch.map(|last| last + self.delay)
    }

    /// Waits until the gate opens, the request is cancelled or shutdown begins.
    ///
    /// `request_cancelled` must resolve when the pending request is cancelled.
    pub async fn wait<F>(&self, request_cancelled: F, shutdown: &CancellationToken) -> GateOutcome
    where
        F: std::future::Future<Output = ()>,
    {
        let Some(ready_at) = self.ready_at() else {
            return GateOutcome::Open;
        };
        if Instant::now() >= ready_at {
            return GateOutcome::Open;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => GateOutcome::ShuttingDown,
            _ = request_cancelled => GateOutcome::Cancelled,
            _ = tokio::time::sleep_until(ready_at) => GateOutcome::Open,
        }
    }

    /// Records that a request was handed to a sub-worker just now.
    pub fn mark_dispatched(&mut self) {
        self.last_dispatch = Some(Instant::now());
    }
}

/// Action needed to bring a worker pool from `actual` to `desired` workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    Steady,
    Grow(usize),
    Shrink(usize),
}

impl Resize {
    pub fn reconcile(desired: usize, actual: usize) -> Self {
        match desired.cmp(&actual) {
            std::cmp::Ordering::Equal => Resize::Steady,
            std::cmp::Ordering::Greater => Resize::Grow(desired - actual),
            std::cmp::Ordering::Less => Resize::Shrink(actual - desired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_dispatch_is_not_delayed() {
        let gate = DelayGate::new(Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let outcome = gate.wait(std::future::pending(), &shutdown).await;
        assert_eq!(outcome, GateOutcome::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_dispatches_are_spaced() {
        let mut gate = DelayGate::new(Duration::from_millis(100));
        let shutdown = CancellationToken::new();

        gate.mark_dispatched();
        let first = Instant::now();
        assert_eq!(
            gate.wait(std::future::pending(), &shutdown).await,
            GateOutcome::Open
        );
        assert!(first.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let mut gate = DelayGate::new(Duration::from_secs(10));
        let shutdown = CancellationToken::new();
        gate.mark_dispatched();

        let request = CancellationToken::new();
        request.cancel();
        assert_eq!(
            gate.wait(request.cancelled(), &shutdown).await,
            GateOutcome::Cancelled
        );

        shutdown.cancel();
        assert_eq!(
            gate.wait(std::future::pending(), &shutdown).await,
            GateOutcome::ShuttingDown
        );
    }

    #[test]
    fn reconcile_compares_desired_and_actual() {
        assert_eq!(Resize::reconcile(4, 4), Resize::Steady);
        assert_eq!(Resize::reconcile(6, 4), Resize::Grow(2));
        assert_eq!(Resize::reconcile(1, 4), Resize::Shrink(3));
    }
}
