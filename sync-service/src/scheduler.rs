use anyhow::{anyhow, Result};
use shared::{SyncRequest, SyncSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

use crate::auth::{AuthManager, KEEPALIVE_MIN_DELAY};
use crate::sync::Synchronizer;

const TRIGGER_QUEUE: usize = 8;

/// A "sync now" request with an optional reply channel
pub struct ManualSync {
    pub request: SyncRequest,
    pub reply: Option<oneshot::Sender<SyncSummary>>,
}

/// Handle for requesting runs outside the schedule
#[derive(Clone)]
pub struct SyncTrigger {
    tx: mpsc::Sender<ManualSync>,
}

impl SyncTrigger {
    /// Queue a manual run and wait for its summary
    pub async fn sync_now(&self, force_full: bool) -> Result<SyncSummary> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManualSync {
                request: SyncRequest::manual(force_full),
                reply: Some(reply),
            })
            .await
            .map_err(|_| anyhow!("Scheduler is not running"))?;

        rx.await
            .map_err(|_| anyhow!("Scheduler stopped before the run finished"))
    }
}

pub struct SyncScheduler {
    synchronizer: Arc<Synchronizer>,
    auth: Option<Arc<AuthManager>>,
    interval: Duration,
    triggers: mpsc::Receiver<ManualSync>,
}

impl SyncScheduler {
    /// `auth` enables the session keep-alive loop
    pub fn new(
        synchronizer: Arc<Synchronizer>,
        auth: Option<Arc<AuthManager>>,
        interval: Duration,
    ) -> (Self, SyncTrigger) {
        let (tx, triggers) = mpsc::channel(TRIGGER_QUEUE);
        let scheduler = Self {
            synchronizer,
            auth,
            interval,
            triggers,
        };
        (scheduler, SyncTrigger { tx })
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(
            installation = self.synchronizer.installation_id(),
            "Starting sync scheduler"
        );

        let periodic_handle = tokio::spawn(Self::run_periodic_sync(
            self.synchronizer.clone(),
            self.interval,
        ));

        let manual_handle = tokio::spawn(Self::run_manual_triggers(
            self.synchronizer.clone(),
            self.triggers,
        ));

        let auth = self.auth;
        let keepalive_handle = tokio::spawn(async move {
            match auth {
                Some(auth) => Self::run_keepalive(auth).await,
                None => std::future::pending().await,
            }
        });

        // Only returns if a task panics or the trigger channel closes
        tokio::select! {
            result = periodic_handle => {
                if let Err(e) = result {
                    tracing::error!("Periodic sync task error: {:?}", e);
                }
            }
            result = manual_handle => {
                if let Err(e) = result {
                    tracing::error!("Manual trigger task error: {:?}", e);
                }
            }
            result = keepalive_handle => {
                if let Err(e) = result {
                    tracing::error!("Keep-alive task error: {:?}", e);
                }
            }
        }

        Ok(())
    }

    async fn run_periodic_sync(synchronizer: Arc<Synchronizer>, interval: Duration) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("Periodic sync started (interval: {:?})", interval);

        loop {
            ticker.tick().await;
            tracing::debug!("Running scheduled sync");

            let summary = synchronizer.trigger(SyncRequest::scheduled()).await;
            if summary.success {
                tracing::info!("Scheduled sync: {}", summary.message);
            } else {
                // Keep the schedule going on error
                tracing::warn!("Scheduled sync failed: {}", summary.message);
            }
        }
    }

    async fn run_manual_triggers(
        synchronizer: Arc<Synchronizer>,
        mut triggers: mpsc::Receiver<ManualSync>,
    ) {
        while let Some(manual) = triggers.recv().await {
            tracing::info!(force_full = manual.request.force_full, "Manual sync requested");
            let summary = synchronizer.trigger(manual.request).await;
            if let Some(reply) = manual.reply {
                // The requester may have given up waiting
                let _ = reply.send(summary);
            }
        }
        tracing::info!("Manual trigger channel closed");
    }

    async fn run_keepalive(auth: Arc<AuthManager>) {
        tracing::info!("Session keep-alive started");
        // The startup sync performs the first login
        time::sleep(KEEPALIVE_MIN_DELAY).await;
        loop {
            let delay = auth.keepalive().await;
            tracing::debug!("Next session keep-alive in {:?}", delay);
            time::sleep(delay).await;
        }
    }
}
