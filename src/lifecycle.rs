//! Service lifecycle: the cycle/failure state machine shared by Finder,
//! Validator, Monitor, and Synchronizer (§4.3).
//!
//! Grounded in the scheduled-task runner used elsewhere in the pack: a
//! `tokio::sync::watch` shutdown signal raced against an interval tick via
//! `tokio::select!`, first tick firing immediately (see DESIGN.md).

use crate::metrics::ServiceMetrics;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// One iteration of a service's work. Implementations own their own error
/// type and report it as a short `kind` string for metrics labeling; the
/// lifecycle runner never inspects the error's contents (§4.3, §7).
#[async_trait]
pub trait Service: Send + Sync {
    type Error: std::fmt::Display + Send + Sync + 'static;

    /// The service's name, used for metrics labels and log targets.
    fn name(&self) -> &'static str;

    /// Runs one cycle. Called immediately on startup and then every
    /// `interval`.
    async fn run_cycle(&self) -> Result<(), Self::Error>;
}

/// Observed outcome of one lifecycle iteration, used by tests and by
/// one-shot (`--once`) binaries that want a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    Failure,
}

/// Drives a [`Service`] through repeated cycles until shutdown is requested
/// or `max_consecutive_failures` is exceeded, tracking metrics along the
/// way (§4.3).
pub struct Lifecycle<S: Service> {
    service: Arc<S>,
    interval: Duration,
    max_consecutive_failures: u32,
    metrics: Arc<ServiceMetrics>,
    consecutive_failures: AtomicU32,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: Service + 'static> Lifecycle<S> {
    pub fn new(
        service: Arc<S>,
        interval: Duration,
        max_consecutive_failures: u32,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            service,
            interval,
            max_consecutive_failures,
            metrics,
            consecutive_failures: AtomicU32::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Signals shutdown to a running [`Lifecycle::run_forever`] loop. Safe
    /// to call from another task or a signal handler.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Runs exactly one cycle and returns its outcome, without touching the
    /// shutdown channel. Used by `--once` invocations (§4.3).
    pub async fn run_once(&self) -> CycleOutcome {
        let started = Instant::now();
        let outcome = self.service.run_cycle().await;
        let now = now_unix();

        match outcome {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.metrics.record_success(started, now);
                tracing::info!(target: "bigbrotr::lifecycle", service = self.service.name(), "cycle succeeded");
                CycleOutcome::Success
            }
            Err(e) => {
                let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                self.metrics
                    .record_failure(started, now, consecutive, "cycle");
                tracing::warn!(
                    target: "bigbrotr::lifecycle",
                    service = self.service.name(),
                    consecutive,
                    error = %e,
                    "cycle failed"
                );
                CycleOutcome::Failure
            }
        }
    }

    /// Runs cycles on `interval` until shutdown is requested or
    /// `max_consecutive_failures` consecutive cycles fail, whichever comes
    /// first. The first cycle fires immediately.
    pub async fn run_forever(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.run_once().await == CycleOutcome::Failure
                        && self.consecutive_failures.load(Ordering::SeqCst) >= self.max_consecutive_failures
                    {
                        tracing::error!(
                            target: "bigbrotr::lifecycle",
                            service = self.service.name(),
                            max = self.max_consecutive_failures,
                            "exceeded max consecutive failures, stopping"
                        );
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!(
                        target: "bigbrotr::lifecycle",
                        service = self.service.name(),
                        "shutdown requested"
                    );
                    break;
                }
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FlakyService {
        calls: AtomicUsize,
        fail_every: usize,
    }

    #[async_trait]
    impl Service for FlakyService {
        type Error = String;

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn run_cycle(&self) -> Result<(), String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every != 0 && n % self.fail_every == 0 {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn run_once_reports_success() {
        let service = Arc::new(FlakyService {
            calls: AtomicUsize::new(0),
            fail_every: 0,
        });
        let lifecycle = Lifecycle::new(
            service,
            Duration::from_secs(60),
            5,
            Arc::new(ServiceMetrics::new("flaky")),
        );
        assert_eq!(lifecycle.run_once().await, CycleOutcome::Success);
        assert_eq!(lifecycle.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn run_once_tracks_consecutive_failures() {
        let service = Arc::new(FlakyService {
            calls: AtomicUsize::new(0),
            fail_every: 1,
        });
        let lifecycle = Lifecycle::new(
            service,
            Duration::from_secs(60),
            5,
            Arc::new(ServiceMetrics::new("flaky")),
        );
        lifecycle.run_once().await;
        lifecycle.run_once().await;
        assert_eq!(lifecycle.consecutive_failures(), 2);
    }
}
