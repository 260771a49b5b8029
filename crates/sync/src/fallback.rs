use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::events::ConnectionState;
use crate::page_store::PageStore;

/// Polls the newest page while the live connection is down.
///
/// Polling is armed on every transition to `Disconnected` (first refresh one interval
/// later) and disarmed on `Connected`. A refresh already running when the connection comes
/// back finishes and its result is merged.
pub struct FallbackScheduler {
    cancel_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl FallbackScheduler {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(
        store: Arc<PageStore>,
        connection: watch::Receiver<ConnectionState>,
        interval: Duration,
    ) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = tokio::spawn(run_fallback(store, connection, interval, cancel_rx));
        Self {
            cancel_tx: Some(cancel_tx),
            worker: Some(worker),
        }
    }

    /// Stops polling and waits for an in-flight refresh to settle.
    pub async fn shutdown(mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        if let Some(worker) = self.worker.take()
            && let Err(error) = worker.await
        {
            tracing::warn!(error = %error, "fallback worker ended abnormally");
        }
    }
}

impl Drop for FallbackScheduler {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

async fn run_fallback(
    store: Arc<PageStore>,
    mut connection: watch::Receiver<ConnectionState>,
    interval: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let scope = store.scope();
    let mut connection_open = true;

    loop {
        while connection_open && connection.borrow_and_update().is_connected() {
            tokio::select! {
                _ = &mut cancel_rx => return,
                changed = connection.changed() => {
                    if changed.is_err() {
                        // The last state reported was connected and can no longer change.
                        tracing::debug!(scope = %scope, "connection feed closed while connected");
                        let _ = (&mut cancel_rx).await;
                        return;
                    }
                }
            }
        }

        tracing::debug!(scope = %scope, interval_ms = interval.as_millis() as u64, "fallback polling armed");
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel_rx => return,
                changed = connection.changed(), if connection_open => {
                    if changed.is_err() {
                        connection_open = false;
                    } else if connection.borrow_and_update().is_connected() {
                        tracing::debug!(scope = %scope, "fallback polling disarmed");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match store.refresh_newest().await {
                        Ok(changed) => {
                            tracing::trace!(scope = %scope, changed, "fallback refresh completed");
                        }
                        Err(error) => {
                            tracing::warn!(scope = %scope, error = %error, "fallback refresh failed");
                        }
                    }
                }
            }
        }
    }
}
