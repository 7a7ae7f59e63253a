// ABOUTME: Task lease acquisition, release and background heartbeat renewal
// ABOUTME: Serializes one active syncer per task through a destination-side lease row

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{SyncError, SyncResult};
use crate::store::{Connector, DestinationStore};

/// Acquires and releases the lease row for one task on behalf of one instance.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    task_id: String,
    owner: String,
    timeout: Duration,
    heartbeat: Duration,
}

impl LeaseManager {
    pub fn new(task_id: &str, owner: &str, timeout: Duration, heartbeat: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            owner: owner.to_string(),
            timeout,
            heartbeat,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Claim the lease, or report who holds it.
    ///
    /// Succeeds when the lease is unowned, already ours, or older than the
    /// timeout. A held lease is [`SyncError::LockHeld`]; callers skip the cycle.
    pub async fn acquire<D>(&self, destination: &mut D) -> SyncResult<()>
    where
        D: DestinationStore + ?Sized,
    {
        let holder = destination
            .acquire_lease(&self.task_id, &self.owner, self.timeout.as_secs())
            .await
            .map_err(|source| SyncError::Connection {
                endpoint: destination.endpoint(),
                source,
            })?;

        match holder {
            None => {
                tracing::debug!("Acquired lease for {} as {}", self.task_id, self.owner);
                Ok(())
            }
            Some(owner) => Err(SyncError::LockHeld {
                task_id: self.task_id.clone(),
                owner,
            }),
        }
    }

    /// Release the lease if we still own it. Failures are logged only; an
    /// unreleased lease simply expires.
    pub async fn release<D>(&self, destination: &mut D)
    where
        D: DestinationStore + ?Sized,
    {
        if let Err(e) = destination.release_lease(&self.task_id, &self.owner).await {
            tracing::warn!("Failed to release lease for {}: {:#}", self.task_id, e);
        }
    }

    /// Start renewing the lease on a dedicated destination connection.
    pub fn start_heartbeat(&self, connector: Arc<dyn Connector>) -> Heartbeat {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(heartbeat_loop(self.clone(), connector, stop_rx));
        Heartbeat {
            stop: stop_tx,
            handle,
        }
    }
}

/// Handle to a running heartbeat task.
pub struct Heartbeat {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Signal the heartbeat to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!("Heartbeat task ended abnormally: {}", e);
        }
    }
}

async fn heartbeat_loop(
    lease: LeaseManager,
    connector: Arc<dyn Connector>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + lease.heartbeat, lease.heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut conn: Option<Box<dyn DestinationStore>> = None;

    loop {
        tokio::select! {
            biased;

            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if conn.is_none() {
                    match connector.destination().await {
                        Ok(c) => conn = Some(c),
                        Err(e) => {
                            tracing::warn!("Heartbeat for {} could not connect: {:#}", lease.task_id, e);
                            continue;
                        }
                    }
                }
                let Some(store) = conn.as_mut() else {
                    continue;
                };
                match store.renew_lease(&lease.task_id, &lease.owner).await {
                    Ok(true) => tracing::trace!("Renewed lease for {}", lease.task_id),
                    Ok(false) => tracing::warn!(
                        "Lease for {} is no longer held by {}",
                        lease.task_id,
                        lease.owner
                    ),
                    Err(e) => {
                        tracing::warn!("Heartbeat for {} failed, reconnecting: {:#}", lease.task_id, e);
                        conn = None;
                    }
                }
            }
        }
    }

    tracing::debug!("Heartbeat for {} stopped", lease.task_id);
}
