//! Due-Task Sweeper
//!
//! A background task wakes on a fixed interval, loads every pending follow-up whose
//! scheduled time has passed, and drives each one through the dispatcher. Each
//! record's terminal status is written as soon as its delivery finishes, and only
//! if the record is still pending, so a record written as `sent` is never retried.
//!
//! Only one sweep runs at a time: the loop awaits each sweep before the next tick,
//! and `Sweeper::sweep_at` skips if another caller's sweep is still in flight.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::DeliveryDispatcher;
use crate::followup::{FollowUpStatus, FollowUpStore};

/// Counts from one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    pub failed_no_email: usize,
    /// Left `pending` through another path (e.g. cancelled) before the status was written
    pub skipped: usize,
    /// Status writes that failed; the record stays pending for the next sweep
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, status: FollowUpStatus) {
        match status {
            FollowUpStatus::Sent => self.sent += 1,
            FollowUpStatus::Failed => self.failed += 1,
            FollowUpStatus::FailedNoEmail => self.failed_no_email += 1,
            FollowUpStatus::Pending | FollowUpStatus::Cancelled => {}
        }
    }
}

pub struct Sweeper {
    store: Arc<dyn FollowUpStore>,
    dispatcher: DeliveryDispatcher,
    in_flight: tokio::sync::Mutex<()>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn FollowUpStore>, dispatcher: DeliveryDispatcher) -> Self {
        Self {
            store,
            dispatcher,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Sweep against the current time
    pub async fn sweep(&self) -> Result<Option<SweepReport>> {
        self.sweep_at(Utc::now()).await
    }

    /// Process every record due at `now`.
    ///
    /// Returns `Ok(None)` without touching the store if a sweep is already running.
    /// An error means the due set could not be loaded and nothing was processed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Option<SweepReport>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Sweep already in flight, skipping");
            return Ok(None);
        };

        let due = self
            .store
            .due(now)
            .context("Failed to load due follow-ups")?;

        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };

        for record in due {
            debug!("Found due follow-up: {} ({})", record.topic, record.id);

            let status = self.dispatcher.dispatch(&record).await;

            match self.store.finish(record.id, status, Utc::now()) {
                Ok(true) => report.record(status),
                Ok(false) => {
                    warn!(
                        "Follow-up {} left pending before it could be marked {}",
                        record.id,
                        status.as_str()
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(
                        "Failed to mark follow-up {} as {}: {:#}",
                        record.id,
                        status.as_str(),
                        e
                    );
                    report.errors += 1;
                }
            }
        }

        Ok(Some(report))
    }
}

/// Handle to the background sweep task
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop ticking and wait for an in-flight sweep to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }
}

/// Spawn the background sweep loop
pub fn spawn_sweeper(sweeper: Arc<Sweeper>, interval: Duration) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweeper.sweep().await {
                        Ok(Some(report)) if report.due > 0 => {
                            info!(
                                "⏰ Sweep processed {} due follow-up(s): {} sent, {} failed, {} without email, {} skipped, {} errors",
                                report.due,
                                report.sent,
                                report.failed,
                                report.failed_no_email,
                                report.skipped,
                                report.errors
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Sweep aborted, retrying next tick: {:#}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Stopping follow-up sweeper");
                        break;
                    }
                }
            }
        }
    });

    SweeperHandle {
        shutdown: shutdown_tx,
        task,
    }
}
