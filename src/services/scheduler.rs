//! Debounced refresh and fixed-period ticks, both cancelable and cancelled on drop.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// Collapses bursts of triggers into one run of an async action.
///
/// A run starts once `quiet` has passed without a new trigger. Two runs are at
/// least `min_interval` apart; a burst that settles inside that window waits
/// for it to elapse and then runs once.
#[derive(Debug)]
pub struct Debouncer {
    trigger: DebounceTrigger,
    task: JoinHandle<()>,
}

/// Cloneable handle that requests a debounced run.
#[derive(Debug, Clone)]
pub struct DebounceTrigger {
    tx: mpsc::UnboundedSender<()>,
}

impl DebounceTrigger {
    pub fn fire(&self) {
        // Closed once the debouncer is cancelled; nothing left to run.
        let _ = self.tx.send(());
    }
}

impl Debouncer {
    pub fn spawn<F, Fut>(quiet: Duration, min_interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let task = tokio::spawn(async move {
            let mut last_run: Option<Instant> = None;
            loop {
                if rx.recv().await.is_none() {
                    break;
                }

                let quiet_period = time::sleep(quiet);
                tokio::pin!(quiet_period);
                loop {
                    tokio::select! {
                        _ = &mut quiet_period => break,
                        msg = rx.recv() => {
                            if msg.is_none() {
                                return;
                            }
                            quiet_period.as_mut().reset(Instant::now() + quiet);
                        }
                    }
                }

                if let Some(last) = last_run {
                    let earliest = last + min_interval;
                    if Instant::now() < earliest {
                        debug!(wait_ms = (earliest - Instant::now()).as_millis() as u64, "refresh deferred");
                        time::sleep_until(earliest).await;
                    }
                }
                // Triggers that arrived while waiting are covered by this run.
                while rx.try_recv().is_ok() {}

                last_run = Some(Instant::now());
                action().await;
            }
        });
        Self {
            trigger: DebounceTrigger { tx },
            task,
        }
    }

    pub fn fire(&self) {
        self.trigger.fire();
    }

    pub fn trigger(&self) -> DebounceTrigger {
        self.trigger.clone()
    }

    /// Drop any pending run. Idempotent.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs an async action every `period`, first one `period` after spawning.
#[derive(Debug)]
pub struct IntervalTimer {
    task: JoinHandle<()>,
}

impl IntervalTimer {
    pub fn spawn<F, Fut>(period: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                action().await;
            }
        });
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
