//! Row types for the catalog tables.
//!
//! Plain records per table; relationships are foreign keys and traversal
//! is explicit queries, which keeps transaction boundaries visible at the
//! call site.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One row of `studies`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StudyRow {
    pub study_uid: String,
    pub patient_id: Option<String>,
    pub accession_number: Option<String>,
    pub first_received_at: DateTime<Utc>,
    pub last_received_at: DateTime<Utc>,
    pub instance_count: i64,
    pub byte_count: i64,
}

/// One row of `series`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SeriesRow {
    pub series_uid: String,
    pub study_uid: String,
    pub modality: Option<String>,
    pub instance_count: i64,
}

/// One row of `instances`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    pub instance_uid: String,
    pub series_uid: String,
    pub study_uid: String,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    pub byte_length: i64,
    pub content_hash: String,
    pub storage_path: String,
    pub received_at: DateTime<Utc>,
}

/// One row of `destinations`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DestinationRow {
    pub id: Uuid,
    pub name: String,
    pub ae_title: String,
    pub host: String,
    pub port: i32,
    pub tls_policy: Option<serde_json::Value>,
    pub enabled: bool,
    pub forwarding_rule: Option<serde_json::Value>,
    pub concurrency_limit: i32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
}

/// One row of `forward_jobs`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ForwardJobRow {
    pub id: Uuid,
    pub instance_uid: String,
    pub destination_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub priority: i32,
    pub next_eligible_at: DateTime<Utc>,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error_kind: Option<String>,
    pub last_error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One row of `ingest_events`
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IngestEventRow {
    pub id: Uuid,
    pub association_id: Uuid,
    pub peer_ae: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub result: String,
    pub error_detail: Option<String>,
    pub byte_count: Option<i64>,
    pub receive_ms: Option<i64>,
    pub storage_ms: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Job status strings as stored in `forward_jobs.status`
pub mod job_status {
    pub const PENDING: &str = "pending";
    pub const IN_PROGRESS: &str = "in_progress";
    pub const RETRY_SCHEDULED: &str = "retry_scheduled";
    pub const COMPLETED: &str = "completed";
    pub const DEAD_LETTER: &str = "dead_letter";
    pub const CANCELED: &str = "canceled";

    /// Statuses no transition may leave, except dead-letter via operator
    /// retry.
    pub fn is_terminal(status: &str) -> bool {
        matches!(status, COMPLETED | DEAD_LETTER | CANCELED)
    }
}

#[cfg(test)]
mod tests {
    use super::job_status;

    #[test]
    fn terminal_statuses() {
        assert!(job_status::is_terminal(job_status::COMPLETED));
        assert!(job_status::is_terminal(job_status::DEAD_LETTER));
        assert!(job_status::is_terminal(job_status::CANCELED));
        assert!(!job_status::is_terminal(job_status::PENDING));
        assert!(!job_status::is_terminal(job_status::IN_PROGRESS));
        assert!(!job_status::is_terminal(job_status::RETRY_SCHEDULED));
    }
}
