//! Supervisor loop: per-process coordination.
//!
//! Registers a worker identity, periodically recovers orphaned job
//! leases, promotes eligible retries, sweeps aged scratch files, and
//! reports queue depths. Graceful drain of the forwarders is owned by
//! `crate::run`; the supervisor only provides the periodic recovery that
//! makes crashed peers' work claimable again.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::queue::JobQueue;
use crate::store::ObjectStore;

/// Build the stable identity under which this process claims leases:
/// `{instance}-{host}-{pid}-{run}`. The run id makes identities unique
/// across restarts so a new process never masquerades as its crashed
/// predecessor.
pub fn worker_identity(instance_id: &str) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let run = Uuid::new_v4().simple().to_string();
    format!("{instance_id}-{host}-{}-{}", std::process::id(), &run[..8])
}

/// Periodic recovery and housekeeping
pub struct Supervisor {
    queue: Arc<JobQueue>,
    store: Arc<ObjectStore>,
    config: SupervisorConfig,
    scratch_horizon: Duration,
}

impl Supervisor {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<ObjectStore>,
        config: SupervisorConfig,
        scratch_horizon: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            config,
            scratch_horizon,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.sweep_interval_ms,
            "Supervisor started"
        );
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; that is wanted, so a restart
        // recovers orphans from the previous run without delay.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
        info!("Supervisor stopped");
    }

    async fn tick(&self) {
        match self.queue.recover_expired_leases().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Returned expired leases to pending"),
            Err(e) => warn!("Lease recovery failed: {}", e),
        }

        match self.queue.promote_eligible_retries().await {
            Ok(0) => {}
            Ok(promoted) => debug!(promoted, "Promoted eligible retries to pending"),
            Err(e) => warn!("Retry promotion failed: {}", e),
        }

        match self.store.sweep_scratch(self.scratch_horizon).await {
            Ok(0) => {}
            Ok(swept) => info!(swept, "Swept orphan scratch files"),
            Err(e) => warn!("Scratch sweep failed: {}", e),
        }

        match self.queue.stats().await {
            Ok(stats) => debug!(
                pending = stats.pending,
                in_progress = stats.in_progress,
                retry_scheduled = stats.retry_scheduled,
                completed = stats.completed,
                dead_letter = stats.dead_letter,
                canceled = stats.canceled,
                "Queue depths"
            ),
            Err(e) => warn!("Queue stats unavailable: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_identity_is_unique_per_call() {
        let a = worker_identity("gw");
        let b = worker_identity("gw");
        assert_ne!(a, b);
        assert!(a.starts_with("gw-"));
        assert!(a.contains(&std::process::id().to_string()));
    }
}
