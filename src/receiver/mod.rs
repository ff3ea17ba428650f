//! Receiver service: the pipeline behind the SCP.
//!
//! Streams each incoming object to a scratch file, verifies the Part-10
//! prefix, publishes atomically, admits the instance to the catalog, and
//! appends the ingest audit event. The peer sees success only after the
//! object is durable and admitted.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dicom_object::mem::InMemDicomObject;
use dicom_object::OpenFileOptions;
use tracing::{debug, info, warn};

use dimse::scp::{ObjectSink, StoreHandler, StoreOutcome};
use dimse::status;
use dimse::{AssociationInfo, Command, DimseError, NegotiatedContext};

use crate::catalog::{AdmitOutcome, Catalog, CatalogError, NewIngestEvent, NewInstance};
use crate::errors::{truncate_detail, ErrorKind};
use crate::rules::InstanceFacts;
use crate::store::{self, ObjectStore, ScratchFile, StoreError};

/// Handler wired into the SCP; one instance serves every association.
pub struct ReceiverService {
    store: Arc<ObjectStore>,
    catalog: Arc<Catalog>,
}

impl ReceiverService {
    pub fn new(store: Arc<ObjectStore>, catalog: Arc<Catalog>) -> Arc<Self> {
        Arc::new(Self { store, catalog })
    }
}

#[async_trait]
impl StoreHandler for ReceiverService {
    async fn begin_object(
        &self,
        assoc: &AssociationInfo,
        context: &NegotiatedContext,
        command: &Command,
    ) -> dimse::Result<Box<dyn ObjectSink>> {
        let sop_instance_uid = command
            .affected_sop_instance_uid
            .clone()
            .ok_or_else(|| DimseError::protocol("C-STORE-RQ without AffectedSOPInstanceUID"))?;

        let scratch = self
            .store
            .begin_scratch()
            .await
            .map_err(|e| DimseError::internal(format!("scratch allocation: {e}")))?;

        debug!(
            association = %assoc.id,
            sop_instance_uid = %sop_instance_uid,
            "Receiving object into {:?}", scratch.path()
        );

        Ok(Box::new(IncomingObject {
            store: self.store.clone(),
            catalog: self.catalog.clone(),
            assoc: assoc.clone(),
            context: context.clone(),
            command_sop_class_uid: command.affected_sop_class_uid.clone(),
            command_sop_instance_uid: sop_instance_uid,
            scratch: Some(scratch),
            prefix: Vec::with_capacity(store::PREAMBLE_SIZE + store::DICM_MAGIC.len()),
            started: Instant::now(),
            started_at: Utc::now(),
        }))
    }
}

/// One in-flight object
struct IncomingObject {
    store: Arc<ObjectStore>,
    catalog: Arc<Catalog>,
    assoc: AssociationInfo,
    context: NegotiatedContext,
    command_sop_class_uid: Option<String>,
    command_sop_instance_uid: String,
    scratch: Option<ScratchFile>,
    /// First 132 bytes, for the preamble/magic check
    prefix: Vec<u8>,
    started: Instant,
    started_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl ObjectSink for IncomingObject {
    async fn write_chunk(&mut self, chunk: &[u8]) -> dimse::Result<()> {
        let want = (store::PREAMBLE_SIZE + store::DICM_MAGIC.len()).saturating_sub(self.prefix.len());
        if want > 0 {
            self.prefix.extend_from_slice(&chunk[..chunk.len().min(want)]);
        }
        let scratch = self
            .scratch
            .as_mut()
            .ok_or_else(|| DimseError::internal("object sink reused after completion"))?;
        scratch
            .write_chunk(chunk)
            .await
            .map_err(|e| DimseError::internal(format!("scratch write: {e}")))
    }

    async fn complete(mut self: Box<Self>) -> dimse::Result<StoreOutcome> {
        let scratch = self
            .scratch
            .take()
            .ok_or_else(|| DimseError::internal("object sink completed twice"))?;
        let receive_ms = self.started.elapsed().as_millis() as i64;
        let byte_length = scratch.length() as i64;

        // Byte-level validation before anything touches the catalog.
        if let Err(e) = store::verify_part10_prefix(&self.prefix) {
            scratch.discard().await;
            return self
                .refuse(ErrorKind::Validation, &e.to_string(), receive_ms, byte_length)
                .await;
        }

        // Metadata comes from a read-only parse of the scratch bytes,
        // stopped before pixel data. The streamed bytes are never
        // rewritten.
        let parsed = match OpenFileOptions::new()
            .read_until(dicom_dictionary_std::tags::PIXEL_DATA)
            .open_file(scratch.path())
        {
            Ok(obj) => obj,
            Err(e) => {
                scratch.discard().await;
                return self
                    .refuse(
                        ErrorKind::Validation,
                        &format!("unparseable DICOM stream: {e}"),
                        receive_ms,
                        byte_length,
                    )
                    .await;
            }
        };

        let meta_transfer_syntax = parsed.meta().transfer_syntax.trim_end_matches('\0').to_string();
        let dataset: &InMemDicomObject = &parsed;

        let study_uid = match required_uid(dataset, "StudyInstanceUID") {
            Ok(uid) => uid,
            Err(detail) => {
                scratch.discard().await;
                return self
                    .refuse(ErrorKind::Validation, &detail, receive_ms, byte_length)
                    .await;
            }
        };
        let series_uid = match required_uid(dataset, "SeriesInstanceUID") {
            Ok(uid) => uid,
            Err(detail) => {
                scratch.discard().await;
                return self
                    .refuse(ErrorKind::Validation, &detail, receive_ms, byte_length)
                    .await;
            }
        };
        let dataset_instance_uid = match required_uid(dataset, "SOPInstanceUID") {
            Ok(uid) => uid,
            Err(detail) => {
                scratch.discard().await;
                return self
                    .refuse(ErrorKind::Validation, &detail, receive_ms, byte_length)
                    .await;
            }
        };

        if dataset_instance_uid != self.command_sop_instance_uid {
            scratch.discard().await;
            let detail = format!(
                "SOPInstanceUID mismatch: command {} vs data set {}",
                self.command_sop_instance_uid, dataset_instance_uid
            );
            return self
                .refuse(ErrorKind::Validation, &detail, receive_ms, byte_length)
                .await;
        }

        let sop_class_uid = optional_str(dataset, "SOPClassUID")
            .or_else(|| self.command_sop_class_uid.clone())
            .unwrap_or_else(|| self.context.abstract_syntax.clone());
        let modality = optional_str(dataset, "Modality");
        let patient_id = optional_str(dataset, "PatientID");
        let accession_number = optional_str(dataset, "AccessionNumber");

        // Publish: fsync, then atomic rename into the final path.
        let publish_started = Instant::now();
        let published = match scratch
            .publish(&self.store, &study_uid, &series_uid, &dataset_instance_uid)
            .await
        {
            Ok(published) => published,
            Err(StoreError::Conflict(detail)) => {
                warn!(
                    association = %self.assoc.id,
                    sop_instance_uid = %dataset_instance_uid,
                    "Collision on publish: {}", detail
                );
                return self
                    .refuse(ErrorKind::CatalogConflict, &detail, receive_ms, byte_length)
                    .await;
            }
            Err(StoreError::Validation(detail)) => {
                return self
                    .refuse(ErrorKind::Validation, &detail, receive_ms, byte_length)
                    .await;
            }
            Err(StoreError::Io(e)) => {
                return self
                    .refuse(
                        ErrorKind::StorageIo,
                        &format!("publish failed: {e}"),
                        receive_ms,
                        byte_length,
                    )
                    .await;
            }
        };
        let storage_ms = publish_started.elapsed().as_millis() as i64;

        let new_instance = NewInstance {
            study_uid,
            series_uid,
            instance_uid: dataset_instance_uid.clone(),
            sop_class_uid: sop_class_uid.clone(),
            transfer_syntax_uid: if meta_transfer_syntax.is_empty() {
                self.context.transfer_syntax.clone()
            } else {
                meta_transfer_syntax
            },
            byte_length: published.byte_length as i64,
            content_hash: published.content_hash.clone(),
            storage_path: published.relative_path.clone(),
            patient_id,
            accession_number,
            modality: modality.clone(),
        };
        let facts = InstanceFacts {
            modality,
            sop_class_uid,
            calling_aet: self.assoc.calling_aet.clone(),
            labels: Default::default(),
        };

        match self.catalog.admit(&new_instance, &facts).await {
            Ok(AdmitOutcome::Admitted { jobs_created }) => {
                info!(
                    association = %self.assoc.id,
                    sop_instance_uid = %dataset_instance_uid,
                    bytes = published.byte_length,
                    jobs_created,
                    "Stored instance"
                );
                self.record_event("stored", None, byte_length, receive_ms, Some(storage_ms))
                    .await;
                Ok(StoreOutcome::Stored)
            }
            Ok(AdmitOutcome::Duplicate) => {
                debug!(
                    association = %self.assoc.id,
                    sop_instance_uid = %dataset_instance_uid,
                    "Duplicate receipt, idempotent success"
                );
                self.record_event("duplicate", None, byte_length, receive_ms, Some(storage_ms))
                    .await;
                Ok(StoreOutcome::DuplicateIgnored)
            }
            Err(CatalogError::DuplicateConflict { .. }) => {
                self.refuse(
                    ErrorKind::CatalogConflict,
                    "instance UID collision with differing content hash",
                    receive_ms,
                    byte_length,
                )
                .await
            }
            Err(e) => {
                // The object is durable but unadmitted; refuse so the peer
                // resends and the publish path dedups on retry.
                warn!(
                    association = %self.assoc.id,
                    sop_instance_uid = %dataset_instance_uid,
                    "Admit failed after publish: {}", e
                );
                self.refuse(
                    ErrorKind::CatalogUnavailable,
                    &e.to_string(),
                    receive_ms,
                    byte_length,
                )
                .await
            }
        }
    }

    async fn abort(mut self: Box<Self>) {
        if let Some(scratch) = self.scratch.take() {
            scratch.discard().await;
        }
        self.record_event(
            &format!("failed:{}", ErrorKind::NetworkTransient),
            Some("transfer aborted mid-stream".to_string()),
            0,
            self.started.elapsed().as_millis() as i64,
            None,
        )
        .await;
    }
}

impl IncomingObject {
    /// Refuse the object with a classified status, recording the audit
    /// event. Scratch state is already discarded by the caller.
    async fn refuse(
        &self,
        kind: ErrorKind,
        detail: &str,
        receive_ms: i64,
        byte_length: i64,
    ) -> dimse::Result<StoreOutcome> {
        self.record_event(
            &format!("failed:{kind}"),
            Some(truncate_detail(detail)),
            byte_length,
            receive_ms,
            None,
        )
        .await;

        let status = match kind {
            ErrorKind::CatalogConflict => status::DUPLICATE_SOP_INSTANCE,
            ErrorKind::CatalogUnavailable => status::OUT_OF_RESOURCES,
            ErrorKind::StorageIo => status::OUT_OF_RESOURCES,
            _ => status::PROCESSING_FAILURE,
        };
        Ok(StoreOutcome::Rejected {
            status,
            reason: detail.to_string(),
        })
    }

    async fn record_event(
        &self,
        result: &str,
        error_detail: Option<String>,
        byte_count: i64,
        receive_ms: i64,
        storage_ms: Option<i64>,
    ) {
        let event = NewIngestEvent {
            association_id: self.assoc.id,
            peer_ae: Some(self.assoc.calling_aet.clone()),
            sop_instance_uid: Some(self.command_sop_instance_uid.clone()),
            result: result.to_string(),
            error_detail,
            byte_count: Some(byte_count),
            receive_ms: Some(receive_ms),
            storage_ms,
            started_at: self.started_at,
            finished_at: Some(Utc::now()),
        };
        if let Err(e) = self.catalog.record_ingest_event(&event).await {
            warn!(association = %self.assoc.id, "Failed to append ingest event: {}", e);
        }
    }
}

fn required_uid(dataset: &InMemDicomObject, name: &str) -> Result<String, String> {
    optional_str(dataset, name).ok_or_else(|| format!("data set is missing {name}"))
}

fn optional_str(dataset: &InMemDicomObject, name: &str) -> Option<String> {
    dataset
        .element_by_name(name)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim_start().to_string())
        .filter(|s| !s.is_empty())
}
