//! The catalog: authoritative relational state in PostgreSQL.
//!
//! Owns the schema and the admit path. The job queue layers its state
//! machine over the same pool (see `crate::queue`); everything else reads.

pub mod models;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::rules::{ForwardRule, InstanceFacts};
use models::{DestinationRow, ForwardJobRow, IngestEventRow, InstanceRow, SeriesRow, StudyRow};

/// Schema (embedded).
const SCHEMA: &str = include_str!("schema.sql");

/// Notification channel carrying job-arrival hints.
pub const JOB_CHANNEL: &str = "gantry_jobs";

/// Error type for catalog operations
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("instance {instance_uid} already admitted with different content")]
    DuplicateConflict { instance_uid: String },

    #[error("not found: {0}")]
    NotFound(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

impl CatalogError {
    /// Whether this is a lost/overloaded database rather than a semantic
    /// failure. Classified as `catalog-unavailable` at the job boundary.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CatalogError::Sqlx(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
            )
        )
    }
}

/// What `admit` observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// New instance row; one forward job per matching enabled destination
    Admitted { jobs_created: usize },
    /// Same instance, same content: nothing changed
    Duplicate,
}

/// Metadata for a newly published instance
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub study_uid: String,
    pub series_uid: String,
    pub instance_uid: String,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    pub byte_length: i64,
    pub content_hash: String,
    pub storage_path: String,
    pub patient_id: Option<String>,
    pub accession_number: Option<String>,
    pub modality: Option<String>,
}

/// A new destination record. Administration lives outside the core; this
/// exists for bootstrap and tests.
#[derive(Debug, Clone)]
pub struct NewDestination {
    pub name: String,
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    pub tls_policy: Option<serde_json::Value>,
    pub enabled: bool,
    pub forwarding_rule: Option<serde_json::Value>,
    pub concurrency_limit: i32,
}

/// Append-only audit record for one receive attempt
#[derive(Debug, Clone)]
pub struct NewIngestEvent {
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

/// Derived forwarding state of a study
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyForwardState {
    /// No forward jobs exist
    Idle,
    /// At least one job is not yet terminal
    Active,
    /// All jobs terminal, none dead-lettered
    Completed,
    /// All jobs terminal, at least one dead-lettered
    Attention,
}

/// PostgreSQL-backed catalog
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    /// Connect a bounded pool and apply the schema.
    pub async fn connect(config: &DatabaseConfig) -> CatalogResult<Self> {
        let mut opts = PgConnectOptions::from_str(&config.url)?;
        if let Some(timeout_ms) = config.statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_millis(config.acquire_timeout_ms))
            .connect_with(opts)
            .await?;

        let catalog = Self { pool };
        catalog.migrate().await?;
        Ok(catalog)
    }

    /// Wrap an existing pool (test support).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema. PostgreSQL does not allow multiple
    /// statements in one prepared statement, so the schema is split and
    /// executed piecewise.
    pub async fn migrate(&self) -> CatalogResult<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Admit a published instance: one transaction that upserts the study
    /// and series aggregates, inserts the instance row, and creates one
    /// pending forward job per enabled destination whose rule matches.
    ///
    /// A re-admission of the same instance with the same content hash is
    /// a no-op; with a differing hash it is a conflict.
    pub async fn admit(
        &self,
        new: &NewInstance,
        facts: &InstanceFacts,
    ) -> CatalogResult<AdmitOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        // Fast path for the common duplicate case.
        if let Some(existing) = instance_in_tx(&mut tx, &new.instance_uid).await? {
            tx.rollback().await?;
            return duplicate_outcome(&existing, new);
        }

        // Row locks are taken in the documented order: destinations are
        // read first, then the study row, then the series row.
        let destinations = sqlx::query_as::<_, DestinationRow>(
            "SELECT * FROM destinations WHERE enabled = TRUE ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO studies (
                study_uid, patient_id, accession_number,
                first_received_at, last_received_at, instance_count, byte_count
            ) VALUES ($1, $2, $3, $4, $4, 1, $5)
            ON CONFLICT (study_uid) DO UPDATE SET
                last_received_at = EXCLUDED.last_received_at,
                instance_count = studies.instance_count + 1,
                byte_count = studies.byte_count + EXCLUDED.byte_count,
                patient_id = COALESCE(studies.patient_id, EXCLUDED.patient_id),
                accession_number = COALESCE(studies.accession_number, EXCLUDED.accession_number)
            "#,
        )
        .bind(&new.study_uid)
        .bind(&new.patient_id)
        .bind(&new.accession_number)
        .bind(now)
        .bind(new.byte_length)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO series (series_uid, study_uid, modality, instance_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (series_uid) DO UPDATE SET
                instance_count = series.instance_count + 1,
                modality = COALESCE(series.modality, EXCLUDED.modality)
            "#,
        )
        .bind(&new.series_uid)
        .bind(&new.study_uid)
        .bind(&new.modality)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO instances (
                instance_uid, series_uid, study_uid, sop_class_uid,
                transfer_syntax_uid, byte_length, content_hash, storage_path,
                received_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (instance_uid) DO NOTHING
            "#,
        )
        .bind(&new.instance_uid)
        .bind(&new.series_uid)
        .bind(&new.study_uid)
        .bind(&new.sop_class_uid)
        .bind(&new.transfer_syntax_uid)
        .bind(new.byte_length)
        .bind(&new.content_hash)
        .bind(&new.storage_path)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // A concurrent admit won the race. Undo the counter bumps and
            // report against the committed row.
            tx.rollback().await?;
            let existing = self
                .instance(&new.instance_uid)
                .await?
                .ok_or_else(|| CatalogError::NotFound(new.instance_uid.clone()))?;
            return duplicate_outcome(&existing, new);
        }

        let mut jobs_created = 0usize;
        for destination in &destinations {
            let rule = match ForwardRule::from_column(destination.forwarding_rule.as_ref()) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(
                        destination = %destination.name,
                        "Unparseable forwarding rule, destination skipped: {}", e
                    );
                    continue;
                }
            };
            if !rule.matches(facts) {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO forward_jobs (
                    id, instance_uid, destination_id, status, attempts,
                    priority, next_eligible_at, created_at
                ) VALUES ($1, $2, $3, 'pending', 0, 0, $4, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&new.instance_uid)
            .bind(destination.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            jobs_created += 1;
        }

        if jobs_created > 0 {
            // Delivered on commit; workers treat it purely as a hint.
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(JOB_CHANNEL)
                .bind(&new.instance_uid)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            instance_uid = %new.instance_uid,
            jobs_created, "Admitted instance"
        );
        Ok(AdmitOutcome::Admitted { jobs_created })
    }

    pub async fn instance(&self, instance_uid: &str) -> CatalogResult<Option<InstanceRow>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE instance_uid = $1",
        )
        .bind(instance_uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn study(&self, study_uid: &str) -> CatalogResult<Option<StudyRow>> {
        let row = sqlx::query_as::<_, StudyRow>("SELECT * FROM studies WHERE study_uid = $1")
            .bind(study_uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn series(&self, series_uid: &str) -> CatalogResult<Option<SeriesRow>> {
        let row = sqlx::query_as::<_, SeriesRow>("SELECT * FROM series WHERE series_uid = $1")
            .bind(series_uid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn instances_for_study(&self, study_uid: &str) -> CatalogResult<Vec<InstanceRow>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE study_uid = $1 ORDER BY received_at, instance_uid",
        )
        .bind(study_uid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn destination(&self, id: Uuid) -> CatalogResult<Option<DestinationRow>> {
        let row = sqlx::query_as::<_, DestinationRow>("SELECT * FROM destinations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn enabled_destinations(&self) -> CatalogResult<Vec<DestinationRow>> {
        let rows = sqlx::query_as::<_, DestinationRow>(
            "SELECT * FROM destinations WHERE enabled = TRUE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert a destination. Administration of destinations is external;
    /// this supports bootstrap and the test suite.
    pub async fn create_destination(&self, new: &NewDestination) -> CatalogResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO destinations (
                id, name, ae_title, host, port, tls_policy, enabled,
                forwarding_rule, concurrency_limit
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&new.name)
        .bind(&new.ae_title)
        .bind(&new.host)
        .bind(new.port as i32)
        .bind(&new.tls_policy)
        .bind(new.enabled)
        .bind(&new.forwarding_rule)
        .bind(new.concurrency_limit)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn set_destination_enabled(&self, id: Uuid, enabled: bool) -> CatalogResult<()> {
        sqlx::query("UPDATE destinations SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a forward success on the destination's health counters.
    pub async fn record_destination_success(&self, id: Uuid) -> CatalogResult<()> {
        sqlx::query(
            "UPDATE destinations SET last_success_at = $2, consecutive_failures = 0 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a forward failure on the destination's health counters.
    pub async fn record_destination_failure(&self, id: Uuid) -> CatalogResult<()> {
        sqlx::query(
            r#"
            UPDATE destinations
            SET last_failure_at = $2,
                consecutive_failures = consecutive_failures + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append one ingest event. Outside the admit transaction on purpose:
    /// the audit trail records attempts, including ones whose admit never
    /// happened.
    pub async fn record_ingest_event(&self, event: &NewIngestEvent) -> CatalogResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_events (
                id, association_id, peer_ae, sop_instance_uid, result,
                error_detail, byte_count, receive_ms, storage_ms,
                started_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.association_id)
        .bind(&event.peer_ae)
        .bind(&event.sop_instance_uid)
        .bind(&event.result)
        .bind(&event.error_detail)
        .bind(event.byte_count)
        .bind(event.receive_ms)
        .bind(event.storage_ms)
        .bind(event.started_at)
        .bind(event.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ingest_events_for_instance(
        &self,
        sop_instance_uid: &str,
    ) -> CatalogResult<Vec<IngestEventRow>> {
        let rows = sqlx::query_as::<_, IngestEventRow>(
            "SELECT * FROM ingest_events WHERE sop_instance_uid = $1 ORDER BY started_at",
        )
        .bind(sop_instance_uid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn job(&self, id: Uuid) -> CatalogResult<Option<ForwardJobRow>> {
        let row = sqlx::query_as::<_, ForwardJobRow>("SELECT * FROM forward_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn jobs_for_instance(
        &self,
        instance_uid: &str,
    ) -> CatalogResult<Vec<ForwardJobRow>> {
        let rows = sqlx::query_as::<_, ForwardJobRow>(
            "SELECT * FROM forward_jobs WHERE instance_uid = $1 ORDER BY created_at, id",
        )
        .bind(instance_uid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn jobs_for_study(&self, study_uid: &str) -> CatalogResult<Vec<ForwardJobRow>> {
        let rows = sqlx::query_as::<_, ForwardJobRow>(
            r#"
            SELECT j.* FROM forward_jobs j
            JOIN instances i ON i.instance_uid = j.instance_uid
            WHERE i.study_uid = $1
            ORDER BY j.created_at, j.id
            "#,
        )
        .bind(study_uid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Derive the aggregate forwarding state of a study from its jobs.
    /// There is no stored "study failed" record.
    pub async fn study_forward_state(&self, study_uid: &str) -> CatalogResult<StudyForwardState> {
        let (total, terminal, dead_letter): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                count(*),
                count(*) FILTER (WHERE j.status IN ('completed', 'dead_letter', 'canceled')),
                count(*) FILTER (WHERE j.status = 'dead_letter')
            FROM forward_jobs j
            JOIN instances i ON i.instance_uid = j.instance_uid
            WHERE i.study_uid = $1
            "#,
        )
        .bind(study_uid)
        .fetch_one(&self.pool)
        .await?;

        Ok(if total == 0 {
            StudyForwardState::Idle
        } else if terminal < total {
            StudyForwardState::Active
        } else if dead_letter > 0 {
            StudyForwardState::Attention
        } else {
            StudyForwardState::Completed
        })
    }
}

async fn instance_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    instance_uid: &str,
) -> CatalogResult<Option<InstanceRow>> {
    let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE instance_uid = $1")
        .bind(instance_uid)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row)
}

fn duplicate_outcome(existing: &InstanceRow, new: &NewInstance) -> CatalogResult<AdmitOutcome> {
    if existing.content_hash == new.content_hash {
        Ok(AdmitOutcome::Duplicate)
    } else {
        Err(CatalogError::DuplicateConflict {
            instance_uid: new.instance_uid.clone(),
        })
    }
}

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_statements() {
        let statements = schema_statements(SCHEMA);
        assert!(statements.len() >= 10);
        assert!(statements
            .iter()
            .all(|s| s.to_uppercase().starts_with("CREATE")));
    }

    #[test]
    fn duplicate_outcome_compares_hashes() {
        let existing = InstanceRow {
            instance_uid: "1.2.3".into(),
            series_uid: "1.2".into(),
            study_uid: "1".into(),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".into(),
            transfer_syntax_uid: "1.2.840.10008.1.2.1".into(),
            byte_length: 10,
            content_hash: "abc".into(),
            storage_path: "storage/studies/1/1.2/1.2.3".into(),
            received_at: Utc::now(),
        };
        let mut new = NewInstance {
            study_uid: "1".into(),
            series_uid: "1.2".into(),
            instance_uid: "1.2.3".into(),
            sop_class_uid: existing.sop_class_uid.clone(),
            transfer_syntax_uid: existing.transfer_syntax_uid.clone(),
            byte_length: 10,
            content_hash: "abc".into(),
            storage_path: existing.storage_path.clone(),
            patient_id: None,
            accession_number: None,
            modality: None,
        };
        assert!(matches!(
            duplicate_outcome(&existing, &new),
            Ok(AdmitOutcome::Duplicate)
        ));
        new.content_hash = "different".into();
        assert!(matches!(
            duplicate_outcome(&existing, &new),
            Err(CatalogError::DuplicateConflict { .. })
        ));
    }
}
