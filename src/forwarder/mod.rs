//! Forwarder workers: drain the job queue by retransmitting stored
//! objects to destination peers.
//!
//! Each worker claims a batch, resolves the destination, opens or reuses
//! an association, streams the exact stored bytes, and resolves every
//! claimed job to ok / retryable-fail / permanent-fail before the lease
//! runs out. Long transfers heartbeat the lease; a failed heartbeat
//! aborts the transfer and lets recovery proceed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dimse::{
    DimseError, RemoteNode, RemoteTlsPolicy, StatusClass, StoreContext, StoreScu, StoreSession,
};

use crate::catalog::models::{DestinationRow, ForwardJobRow};
use crate::catalog::Catalog;
use crate::config::ForwarderConfig;
use crate::errors::ErrorKind;
use crate::queue::{Finalize, JobListener, JobQueue};
use crate::store::ObjectStore;

/// TLS policy as stored on the destination row
#[derive(Debug, Default, Deserialize)]
struct DestinationTlsPolicy {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    ca_bundle_path: Option<std::path::PathBuf>,
    #[serde(default)]
    insecure_skip_verify: bool,
}

/// How one claimed job resolved
#[derive(Debug)]
enum Resolution {
    /// Peer acknowledged delivery, possibly with a warning status
    Delivered { warning: Option<String> },
    Retry { kind: ErrorKind, detail: String },
    Permanent { kind: ErrorKind, detail: String },
    /// Already handled (lease lost, canceled, or released on shutdown);
    /// nothing further may be written
    Observed,
}

enum HeartbeatStop {
    LeaseLost,
    Canceled,
    DatabaseLost,
}

/// One forwarder worker
pub struct ForwarderWorker {
    worker_id: String,
    queue: Arc<JobQueue>,
    catalog: Arc<Catalog>,
    store: Arc<ObjectStore>,
    scu: StoreScu,
    config: ForwarderConfig,
    sessions: HashMap<Uuid, StoreSession>,
}

impl ForwarderWorker {
    pub fn new(
        worker_id: String,
        local_aet: &str,
        queue: Arc<JobQueue>,
        catalog: Arc<Catalog>,
        store: Arc<ObjectStore>,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            worker_id,
            queue,
            catalog,
            store,
            scu: StoreScu::new(local_aet),
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Worker loop: claim, process, wait for hints; drain on shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(worker_id = %self.worker_id, "Forwarder worker started");
        let mut listener = match JobListener::connect(self.catalog.pool()).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    "Job listener unavailable, polling only: {}", e
                );
                None
            }
        };
        let poll_interval = self.config.poll_interval();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let batch = match self
                .queue
                .claim(&self.worker_id, self.config.claim_batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, "Claim failed: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = wait_for_work(&mut listener, poll_interval) => {}
                }
                continue;
            }

            for job in batch {
                if shutdown.is_cancelled() {
                    // Drained: hand the claim straight back.
                    if let Err(e) = self.queue.release(job.id, &self.worker_id).await {
                        warn!(job_id = %job.id, "Release on drain failed: {}", e);
                    }
                    continue;
                }
                self.process(job, &shutdown).await;
            }
        }

        self.close_sessions().await;
        info!(worker_id = %self.worker_id, "Forwarder worker stopped");
    }

    async fn process(&mut self, job: ForwardJobRow, shutdown: &CancellationToken) {
        let job_id = job.id;
        let resolution = self.forward(&job, shutdown).await;
        debug!(job_id = %job_id, attempt = job.attempts, "Job resolved: {:?}", resolution);

        let finalize = match &resolution {
            Resolution::Delivered { warning } => {
                if let Err(e) = self.catalog.record_destination_success(job.destination_id).await
                {
                    warn!(job_id = %job_id, "Destination health update failed: {}", e);
                }
                self.queue
                    .complete(&job, &self.worker_id, warning.clone())
                    .await
            }
            Resolution::Retry { kind, detail } => {
                if let Err(e) = self.catalog.record_destination_failure(job.destination_id).await
                {
                    warn!(job_id = %job_id, "Destination health update failed: {}", e);
                }
                self.queue
                    .fail_retryable(&job, &self.worker_id, *kind, detail)
                    .await
            }
            Resolution::Permanent { kind, detail } => {
                if let Err(e) = self.catalog.record_destination_failure(job.destination_id).await
                {
                    warn!(job_id = %job_id, "Destination health update failed: {}", e);
                }
                self.queue
                    .fail_permanent(&job, &self.worker_id, *kind, detail)
                    .await
            }
            Resolution::Observed => return,
        };

        match finalize {
            Ok(Finalize::Applied) => {}
            Ok(Finalize::CanceledByOperator) => {
                info!(job_id = %job_id, "Cancellation observed at finalization");
            }
            Ok(Finalize::LeaseLost) => {
                warn!(job_id = %job_id, "Lease lost before finalization");
            }
            Err(e) => {
                // The transition could not be written; lease recovery will
                // return the job to pending.
                warn!(job_id = %job_id, "Finalization failed: {}", e);
            }
        }
    }

    async fn forward(&mut self, job: &ForwardJobRow, shutdown: &CancellationToken) -> Resolution {
        let destination = match self.catalog.destination(job.destination_id).await {
            Ok(Some(destination)) => destination,
            Ok(None) => {
                return Resolution::Permanent {
                    kind: ErrorKind::Validation,
                    detail: format!("destination {} no longer exists", job.destination_id),
                }
            }
            Err(e) => {
                return Resolution::Retry {
                    kind: ErrorKind::CatalogUnavailable,
                    detail: e.to_string(),
                }
            }
        };

        if !destination.enabled {
            return Resolution::Permanent {
                kind: ErrorKind::Validation,
                detail: "destination disabled after claim".to_string(),
            };
        }

        let instance = match self.catalog.instance(&job.instance_uid).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                return Resolution::Permanent {
                    kind: ErrorKind::Validation,
                    detail: format!("instance {} has no catalog row", job.instance_uid),
                }
            }
            Err(e) => {
                return Resolution::Retry {
                    kind: ErrorKind::CatalogUnavailable,
                    detail: e.to_string(),
                }
            }
        };

        let (mut reader, byte_length) = match self.store.read(&instance.storage_path).await {
            Ok(opened) => opened,
            Err(e) => {
                // One local read retry, then give up for the operator.
                let already_io = job.last_error_kind.as_deref()
                    == Some(ErrorKind::StorageIo.as_str());
                let detail = format!("stored file unreadable: {e}");
                return if already_io {
                    Resolution::Permanent { kind: ErrorKind::StorageIo, detail }
                } else {
                    Resolution::Retry { kind: ErrorKind::StorageIo, detail }
                };
            }
        };

        if byte_length != instance.byte_length as u64 {
            return Resolution::Permanent {
                kind: ErrorKind::Validation,
                detail: format!(
                    "stored file length {} disagrees with catalog {}",
                    byte_length, instance.byte_length
                ),
            };
        }

        let context = StoreContext {
            sop_class_uid: instance.sop_class_uid.clone(),
            sop_instance_uid: instance.instance_uid.clone(),
            transfer_syntax_uid: instance.transfer_syntax_uid.clone(),
        };

        let mut session = match self.session_for(&destination, &context).await {
            Ok(session) => session,
            Err(resolution) => return *resolution,
        };

        // Transfer with a lease heartbeat racing it. The heartbeat future
        // only completes on failure.
        let heartbeat_interval = self.config.heartbeat_interval();
        let queue = self.queue.clone();
        let worker_id = self.worker_id.clone();
        let job_id = job.id;
        let heartbeat = async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.extend_lease(job_id, &worker_id).await {
                    Ok(Finalize::Applied) => {}
                    Ok(Finalize::CanceledByOperator) => return HeartbeatStop::Canceled,
                    Ok(Finalize::LeaseLost) => return HeartbeatStop::LeaseLost,
                    Err(e) => {
                        warn!(job_id = %job_id, "Lease heartbeat failed: {}", e);
                        return HeartbeatStop::DatabaseLost;
                    }
                }
            }
        };

        enum Outcome {
            Transfer(dimse::Result<dimse::StoreReply>),
            Stop(HeartbeatStop),
            Shutdown,
        }

        // The transfer future's borrow of the session must end before the
        // session can be aborted or cached, hence the scope.
        let outcome = {
            let transfer = session.store(&context, &mut reader);
            tokio::pin!(transfer);
            tokio::select! {
                reply = &mut transfer => Outcome::Transfer(reply),
                stop = heartbeat => Outcome::Stop(stop),
                _ = shutdown.cancelled() => Outcome::Shutdown,
            }
        };

        match outcome {
            Outcome::Transfer(Ok(reply)) => {
                // Keep the association warm for the next job to this
                // destination.
                self.sessions.insert(destination.id, session);
                classify_reply(reply.status, reply.class)
            }
            Outcome::Transfer(Err(e)) => classify_transfer_error(e, &self.config),
            Outcome::Stop(stop) => {
                session.abort().await;
                match stop {
                    HeartbeatStop::Canceled => {
                        info!(job_id = %job.id, "Transfer aborted: canceled by operator");
                    }
                    HeartbeatStop::LeaseLost | HeartbeatStop::DatabaseLost => {
                        warn!(job_id = %job.id, "Transfer aborted: lease cannot be held");
                    }
                }
                Resolution::Observed
            }
            Outcome::Shutdown => {
                session.abort().await;
                if let Err(e) = self.queue.release(job.id, &self.worker_id).await {
                    warn!(job_id = %job.id, "Release on shutdown failed: {}", e);
                }
                Resolution::Observed
            }
        }
    }

    /// Reuse a cached association when it is fresh and carries the needed
    /// context; otherwise open a new one.
    async fn session_for(
        &mut self,
        destination: &DestinationRow,
        context: &StoreContext,
    ) -> Result<StoreSession, Box<Resolution>> {
        if let Some(session) = self.sessions.remove(&destination.id) {
            if session.idle() < self.config.association_idle_timeout() && session.supports(context)
            {
                return Ok(session);
            }
            // Idle expiry or missing context; closing is a neutral event.
            let _ = session.release().await;
        }

        let node = match remote_node(destination) {
            Ok(node) => node,
            Err(detail) => {
                return Err(Box::new(Resolution::Permanent {
                    kind: ErrorKind::Validation,
                    detail,
                }))
            }
        };

        let session = match self
            .scu
            .open(&node, StoreScu::proposals_for(context))
            .await
        {
            Ok(session) => session,
            Err(e) => return Err(Box::new(classify_open_error(e))),
        };

        if !session.supports(context) {
            let _ = session.release().await;
            let detail = format!(
                "peer refused context for {} / {}",
                context.sop_class_uid, context.transfer_syntax_uid
            );
            return Err(Box::new(if self.config.context_reject_retryable {
                Resolution::Retry { kind: ErrorKind::PeerRejectContext, detail }
            } else {
                Resolution::Permanent { kind: ErrorKind::PeerRejectContext, detail }
            }));
        }

        Ok(session)
    }

    async fn close_sessions(&mut self) {
        for (_, session) in self.sessions.drain() {
            let _ = session.release().await;
        }
    }
}

/// Map a destination row onto a remote node for the SCU.
fn remote_node(destination: &DestinationRow) -> Result<RemoteNode, String> {
    if destination.port <= 0 || destination.port > u16::MAX as i32 {
        return Err(format!("destination port {} out of range", destination.port));
    }
    let mut node = RemoteNode::new(
        destination.ae_title.clone(),
        destination.host.clone(),
        destination.port as u16,
    );

    if let Some(value) = &destination.tls_policy {
        let policy: DestinationTlsPolicy = serde_json::from_value(value.clone())
            .map_err(|e| format!("unparseable TLS policy: {e}"))?;
        if policy.enabled {
            node = node.with_tls(RemoteTlsPolicy {
                ca_bundle_path: policy.ca_bundle_path,
                insecure_skip_verify: policy.insecure_skip_verify,
            });
        }
    }

    node.validate().map_err(|e| e.to_string())?;
    Ok(node)
}

/// Classify the peer's C-STORE status per the status-class ranges.
fn classify_reply(status: u16, class: StatusClass) -> Resolution {
    match class {
        StatusClass::Success => Resolution::Delivered { warning: None },
        StatusClass::Warning => Resolution::Delivered {
            warning: Some(format!("peer returned warning status 0x{status:04X}")),
        },
        StatusClass::RefusedOutOfResources => Resolution::Retry {
            kind: ErrorKind::NetworkTransient,
            detail: format!("refused: out of resources (0x{status:04X})"),
        },
        // 0x0110 is how several archives report a transient internal
        // error; the remaining failure codes are data-format refusals.
        StatusClass::Failure if status == dimse::status::PROCESSING_FAILURE => Resolution::Retry {
            kind: ErrorKind::PeerStatusFailure,
            detail: format!("peer returned status 0x{status:04X}"),
        },
        StatusClass::Failure | StatusClass::Cancel | StatusClass::Pending => {
            Resolution::Permanent {
                kind: ErrorKind::PeerStatusFailure,
                detail: format!("peer returned status 0x{status:04X}"),
            }
        }
    }
}

/// Classify an association-open failure.
fn classify_open_error(error: DimseError) -> Resolution {
    match error {
        DimseError::AssociationRejected { result, abort_source, reason } => Resolution::Permanent {
            kind: ErrorKind::PeerRejectAssociation,
            detail: format!(
                "association rejected (result={result}, source={abort_source}, reason={reason})"
            ),
        },
        DimseError::Network(e) => Resolution::Retry {
            kind: ErrorKind::NetworkTransient,
            detail: format!("connect failed: {e}"),
        },
        DimseError::Timeout(what) => Resolution::Retry {
            kind: ErrorKind::NetworkTransient,
            detail: format!("timeout {what}"),
        },
        DimseError::AssociationAborted { abort_source, reason } => Resolution::Retry {
            kind: ErrorKind::NetworkTransient,
            detail: format!("association aborted (source={abort_source}, reason={reason})"),
        },
        other => Resolution::Permanent {
            kind: ErrorKind::PeerRejectAssociation,
            detail: other.to_string(),
        },
    }
}

/// Classify a mid-transfer failure.
fn classify_transfer_error(error: DimseError, config: &ForwarderConfig) -> Resolution {
    match error {
        DimseError::ContextRejected(detail) => {
            if config.context_reject_retryable {
                Resolution::Retry { kind: ErrorKind::PeerRejectContext, detail }
            } else {
                Resolution::Permanent { kind: ErrorKind::PeerRejectContext, detail }
            }
        }
        DimseError::Network(e) => Resolution::Retry {
            kind: ErrorKind::NetworkTransient,
            detail: format!("transfer failed: {e}"),
        },
        DimseError::Timeout(what) => Resolution::Retry {
            kind: ErrorKind::NetworkTransient,
            detail: format!("timeout {what}"),
        },
        DimseError::AssociationAborted { abort_source, reason } => Resolution::Retry {
            kind: ErrorKind::NetworkTransient,
            detail: format!("association aborted (source={abort_source}, reason={reason})"),
        },
        other => Resolution::Permanent {
            kind: ErrorKind::PeerStatusFailure,
            detail: other.to_string(),
        },
    }
}

async fn wait_for_work(listener: &mut Option<JobListener>, poll_interval: Duration) {
    match listener {
        Some(listener) => {
            listener.wait(poll_interval).await;
        }
        None => tokio::time::sleep(poll_interval).await,
    }
}
