use crate::clock::to_unix_ms;
use crate::{Reindexer, ReindexerError, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintainerHealth {
    pub runs: u64,
    pub running: bool,
    pub lock_contentions: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_unix_ms: Option<u64>,
    pub last_duration_ms: Option<u64>,
}

enum MaintainerCommand {
    Trigger,
    Shutdown,
}

/// Runs [`Reindexer::reindex`] on a fixed interval, starting immediately.
///
/// Lock contention is expected when another controller holds the cluster lock; such runs are
/// simply retried on the next tick.
#[derive(Clone)]
pub struct ReindexingMaintainer {
    inner: Arc<MaintainerInner>,
}

struct MaintainerInner {
    reindexer: Arc<Reindexer>,
    command_tx: mpsc::Sender<MaintainerCommand>,
    health_tx: watch::Sender<MaintainerHealth>,
}

impl ReindexingMaintainer {
    /// Must be called within a tokio runtime.
    pub fn start(reindexer: Arc<Reindexer>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(ReindexerError::Other(
                "maintenance interval must be positive".to_string(),
            ));
        }

        let (command_tx, command_rx) = mpsc::channel(16);
        let (health_tx, _) = watch::channel(MaintainerHealth::default());

        spawn_maintenance_loop(reindexer.clone(), interval, command_rx, health_tx.clone());

        Ok(Self {
            inner: Arc::new(MaintainerInner {
                reindexer,
                command_tx,
                health_tx,
            }),
        })
    }

    /// Requests a run right away, on top of the regular schedule.
    pub async fn trigger(&self) -> Result<()> {
        self.inner
            .command_tx
            .send(MaintainerCommand::Trigger)
            .await
            .map_err(|e| ReindexerError::Other(format!("failed to send trigger: {e}")))
    }

    /// Stops the reindexer and ends the loop once the current run, if any, has drained.
    pub fn shutdown(&self) {
        self.inner.reindexer.shutdown();
        let _ = self.inner.command_tx.try_send(MaintainerCommand::Shutdown);
    }

    #[must_use]
    pub fn health_snapshot(&self) -> MaintainerHealth {
        self.inner.health_tx.borrow().clone()
    }

    #[must_use]
    pub fn health_stream(&self) -> watch::Receiver<MaintainerHealth> {
        self.inner.health_tx.subscribe()
    }
}

impl Drop for ReindexingMaintainer {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.shutdown();
        }
    }
}

fn spawn_maintenance_loop(
    reindexer: Arc<Reindexer>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<MaintainerCommand>,
    health_tx: watch::Sender<MaintainerHealth>,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = MaintainerHealth::default();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(MaintainerCommand::Trigger) => {}
                    Some(MaintainerCommand::Shutdown) | None => break,
                },
                _ = ticker.tick() => {}
            }
            if reindexer.is_shut_down() {
                break;
            }

            health.running = true;
            health_tx.send_replace(health.clone());

            let started = Instant::now();
            let outcome = reindexer.reindex().await;
            #[allow(clippy::cast_possible_truncation)]
            let duration = started.elapsed().as_millis() as u64;

            health.runs += 1;
            health.running = false;
            health.last_duration_ms = Some(duration);
            match outcome {
                Ok(()) => {
                    debug!("Reindexing maintenance run finished in {duration}ms");
                    health.consecutive_failures = 0;
                    health.last_error = None;
                    health.last_success_unix_ms = Some(to_unix_ms(SystemTime::now()));
                }
                Err(err) if err.is_lock_contention() => {
                    debug!("Reindexing lock busy, retrying next run: {err}");
                    health.lock_contentions += 1;
                }
                Err(err) => {
                    warn!("Reindexing maintenance run failed: {err}");
                    health.consecutive_failures += 1;
                    health.last_error = Some(err.to_string());
                }
            }
            health_tx.send_replace(health.clone());
        }

        info!(
            "Reindexing maintainer for cluster '{}' stopped",
            reindexer.cluster().name
        );
    });
}
