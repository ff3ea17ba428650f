//! Catalog integration tests against a disposable PostgreSQL.

mod common;

use common::postgres_or_skip;
use gantry::catalog::{AdmitOutcome, CatalogError, NewDestination, NewInstance, StudyForwardState};
use gantry::rules::InstanceFacts;
use uuid::Uuid;

fn new_instance(study: &str, series: &str, instance: &str, hash: &str) -> NewInstance {
    NewInstance {
        study_uid: study.to_string(),
        series_uid: series.to_string(),
        instance_uid: instance.to_string(),
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
        transfer_syntax_uid: "1.2.840.10008.1.2.1".to_string(),
        byte_length: 2048,
        content_hash: hash.to_string(),
        storage_path: format!("storage/studies/{study}/{series}/{instance}"),
        patient_id: Some("PAT-001".to_string()),
        accession_number: Some("ACC-001".to_string()),
        modality: Some("CT".to_string()),
    }
}

fn ct_facts() -> InstanceFacts {
    InstanceFacts {
        modality: Some("CT".to_string()),
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
        calling_aet: "MODALITY_A".to_string(),
        labels: Default::default(),
    }
}

fn destination(name: &str) -> NewDestination {
    NewDestination {
        name: name.to_string(),
        ae_title: "ARCHIVE".to_string(),
        host: "127.0.0.1".to_string(),
        port: 11112,
        tls_policy: None,
        enabled: true,
        forwarding_rule: None,
        concurrency_limit: 2,
    }
}

#[tokio::test]
async fn admit_creates_rows_and_jobs() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let catalog = &db.catalog;

    catalog.create_destination(&destination("d1")).await.expect("dest");
    catalog.create_destination(&destination("d2")).await.expect("dest");

    let outcome = catalog
        .admit(&new_instance("1.10", "1.10.1", "1.10.1.1", "hash-a"), &ct_facts())
        .await
        .expect("admit");
    assert_eq!(outcome, AdmitOutcome::Admitted { jobs_created: 2 });

    let instance = catalog
        .instance("1.10.1.1")
        .await
        .expect("query")
        .expect("row");
    assert_eq!(instance.study_uid, "1.10");
    assert_eq!(instance.byte_length, 2048);

    let study = catalog.study("1.10").await.expect("query").expect("row");
    assert_eq!(study.instance_count, 1);
    assert_eq!(study.byte_count, 2048);
    assert_eq!(study.patient_id.as_deref(), Some("PAT-001"));

    let series = catalog.series("1.10.1").await.expect("query").expect("row");
    assert_eq!(series.instance_count, 1);
    assert_eq!(series.modality.as_deref(), Some("CT"));

    let jobs = catalog.jobs_for_instance("1.10.1.1").await.expect("jobs");
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == "pending" && j.attempts == 0));
}

#[tokio::test]
async fn admit_is_idempotent_for_identical_content() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let catalog = &db.catalog;
    catalog.create_destination(&destination("d1")).await.expect("dest");

    let instance = new_instance("1.11", "1.11.1", "1.11.1.1", "hash-b");
    let first = catalog.admit(&instance, &ct_facts()).await.expect("admit");
    assert_eq!(first, AdmitOutcome::Admitted { jobs_created: 1 });

    let second = catalog.admit(&instance, &ct_facts()).await.expect("admit");
    assert_eq!(second, AdmitOutcome::Duplicate);

    // Counters advanced exactly once; no extra jobs.
    let study = catalog.study("1.11").await.expect("query").expect("row");
    assert_eq!(study.instance_count, 1);
    assert_eq!(catalog.jobs_for_instance("1.11.1.1").await.expect("jobs").len(), 1);
}

#[tokio::test]
async fn admit_with_differing_hash_is_a_conflict() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let catalog = &db.catalog;

    catalog
        .admit(&new_instance("1.12", "1.12.1", "1.12.1.1", "hash-c"), &ct_facts())
        .await
        .expect("admit");

    let result = catalog
        .admit(&new_instance("1.12", "1.12.1", "1.12.1.1", "hash-d"), &ct_facts())
        .await;
    assert!(matches!(
        result,
        Err(CatalogError::DuplicateConflict { .. })
    ));
}

#[tokio::test]
async fn forwarding_rules_select_destinations() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let catalog = &db.catalog;

    let mut ct_only = destination("ct-only");
    ct_only.forwarding_rule = Some(serde_json::json!({"op": "modality_in", "values": ["CT"]}));
    catalog.create_destination(&ct_only).await.expect("dest");

    let mut mr_only = destination("mr-only");
    mr_only.forwarding_rule = Some(serde_json::json!({"op": "modality_in", "values": ["MR"]}));
    catalog.create_destination(&mr_only).await.expect("dest");

    let mut disabled = destination("disabled");
    disabled.enabled = false;
    catalog.create_destination(&disabled).await.expect("dest");

    let outcome = catalog
        .admit(&new_instance("1.13", "1.13.1", "1.13.1.1", "hash-e"), &ct_facts())
        .await
        .expect("admit");
    // Only the enabled CT destination matches.
    assert_eq!(outcome, AdmitOutcome::Admitted { jobs_created: 1 });
}

#[tokio::test]
async fn study_forward_state_derivation() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let catalog = &db.catalog;

    // No destinations yet: no jobs.
    catalog
        .admit(&new_instance("1.14", "1.14.1", "1.14.1.1", "hash-f"), &ct_facts())
        .await
        .expect("admit");
    assert_eq!(
        catalog.study_forward_state("1.14").await.expect("state"),
        StudyForwardState::Idle
    );

    catalog.create_destination(&destination("d1")).await.expect("dest");
    catalog
        .admit(&new_instance("1.14", "1.14.1", "1.14.1.2", "hash-g"), &ct_facts())
        .await
        .expect("admit");
    assert_eq!(
        catalog.study_forward_state("1.14").await.expect("state"),
        StudyForwardState::Active
    );
}

#[tokio::test]
async fn ingest_events_are_appended() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let catalog = &db.catalog;

    let event = gantry::catalog::NewIngestEvent {
        association_id: Uuid::new_v4(),
        peer_ae: Some("MODALITY_A".to_string()),
        sop_instance_uid: Some("1.15.1.1".to_string()),
        result: "stored".to_string(),
        error_detail: None,
        byte_count: Some(2048),
        receive_ms: Some(12),
        storage_ms: Some(3),
        started_at: chrono::Utc::now(),
        finished_at: Some(chrono::Utc::now()),
    };
    catalog.record_ingest_event(&event).await.expect("event");

    let events = catalog
        .ingest_events_for_instance("1.15.1.1")
        .await
        .expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].result, "stored");
    assert_eq!(events[0].byte_count, Some(2048));
}

#[tokio::test]
async fn destination_health_counters() {
    let Some(db) = postgres_or_skip().await else {
        return;
    };
    let catalog = &db.catalog;

    let id = catalog.create_destination(&destination("health")).await.expect("dest");

    catalog.record_destination_failure(id).await.expect("failure");
    catalog.record_destination_failure(id).await.expect("failure");
    let row = catalog.destination(id).await.expect("query").expect("row");
    assert_eq!(row.consecutive_failures, 2);
    assert!(row.last_failure_at.is_some());

    catalog.record_destination_success(id).await.expect("success");
    let row = catalog.destination(id).await.expect("query").expect("row");
    assert_eq!(row.consecutive_failures, 0);
    assert!(row.last_success_at.is_some());
}
