//! Periodic fetch with last-good-value retention.
//!
//! Each subscription runs one task. The fetch is awaited inside the tick, so a
//! slow request simply swallows the ticks that fall due meanwhile; there is
//! never more than one request in flight per subscription.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const ENABLE_LOGS: bool = true;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

use crate::{log_debug, log_warn};

#[derive(Debug, Default)]
pub struct PollStats {
    ticks: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl PollStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PollSpec {
    pub name: &'static str,
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn new(name: &'static str, interval: Duration, timeout: Duration) -> Self {
        Self {
            name,
            interval,
            timeout,
        }
    }
}

/// Handle to a running poll loop. Dropping it stops the loop.
pub struct Subscription<T> {
    name: &'static str,
    latest: watch::Receiver<Option<T>>,
    stats: Arc<PollStats>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<T: Clone> Subscription<T> {
    /// Last successfully parsed value.
    pub fn latest(&self) -> Option<T> {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.latest.clone()
    }
}

impl<T> Subscription<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the timer. A request already in flight finishes on its own but
    /// its result is never delivered.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.handle.take();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts polling `fetch` every `spec.interval` until `parent` is cancelled or
/// the returned subscription is stopped. `deliver` sees every successful value
/// in order. Intervals below one millisecond are raised to one.
pub fn start<T, F, Fut, D>(
    spec: PollSpec,
    parent: &CancellationToken,
    mut fetch: F,
    mut deliver: D,
) -> Subscription<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    D: FnMut(&T) + Send + 'static,
{
    let cancel = parent.child_token();
    let token = cancel.clone();
    let (latest_tx, latest_rx) = watch::channel(None);
    let stats = Arc::new(PollStats::default());
    let loop_stats = stats.clone();
    let PollSpec {
        name,
        interval,
        timeout,
    } = spec;
    // tokio::time::interval panics on a zero period
    let interval = interval.max(MIN_INTERVAL);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    loop_stats.ticks.fetch_add(1, Ordering::Relaxed);
                    let outcome = tokio::time::timeout(timeout, fetch()).await;

                    if token.is_cancelled() {
                        log_debug!("{name} poll: discarding result that resolved after stop");
                        break;
                    }

                    match outcome {
                        Ok(Ok(value)) => {
                            loop_stats.successes.fetch_add(1, Ordering::Relaxed);
                            deliver(&value);
                            latest_tx.send_replace(Some(value));
                        }
                        Ok(Err(err)) => {
                            loop_stats.failures.fetch_add(1, Ordering::Relaxed);
                            log_warn!("{name} poll failed: {err:#}");
                        }
                        Err(_) => {
                            loop_stats.failures.fetch_add(1, Ordering::Relaxed);
                            log_warn!("{name} poll timed out (> {}ms)", timeout.as_millis());
                        }
                    }
                }
                _ = token.cancelled() => {
                    log_debug!("{name} poll stopped");
                    break;
                }
            }
        }
    });

    Subscription {
        name,
        latest: latest_rx,
        stats,
        cancel,
        handle: Some(handle),
    }
}
