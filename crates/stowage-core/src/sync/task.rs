//! Timer-driven background task that ticks a [`SyncEngine`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::SyncEngine;
use crate::error::SyncError;
use crate::repository::Entity;

pub(crate) struct SyncTask {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl SyncTask {
    /// Spawn the sync loop on the current tokio runtime.
    pub(crate) fn spawn<T: Entity>(
        engine: Arc<SyncEngine<T>>,
        period: Duration,
    ) -> Result<Self, SyncError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = runtime.spawn(run_sync_loop(engine, period, shutdown_rx));
        Ok(Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Stop after the current tick and wait for the final persist.
    pub(crate) async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            if !e.is_cancelled() {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_sync_loop<T: Entity>(
    engine: Arc<SyncEngine<T>>,
    period: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate tick emitted by `interval` so the first flush happens one period in
    ticker.tick().await;
    info!(endpoint = %engine.endpoint(), period_ms = period.as_millis() as u64, "Sync task started");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                if let Err(e) = engine.persist() {
                    warn!(endpoint = %engine.endpoint(), error = %e, "Final persist failed");
                }
                info!(endpoint = %engine.endpoint(), "Sync task stopped");
                break;
            }
            _ = ticker.tick() => {
                let report = engine.tick().await;
                if report.attempted > 0 {
                    debug!(endpoint = %engine.endpoint(), ?report, "Sync tick");
                }
            }
        }
    }
}
