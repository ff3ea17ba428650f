//! Durable job queue over the catalog.
//!
//! At-least-once delivery with claim-with-lease, bounded retries with
//! exponential backoff, and a terminal dead-letter state. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so any number of workers can pull from the
//! same table without contention; a `NOTIFY` channel carries wakeup hints
//! and bounded-interval polling remains the correctness fallback.

pub mod backoff;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::models::{job_status, ForwardJobRow};
use crate::catalog::{CatalogError, CatalogResult, JOB_CHANNEL};
use crate::errors::{truncate_detail, ErrorKind};
use backoff::BackoffPolicy;

/// Queue behavior knobs, derived from the forwarder configuration
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Retryable attempts before dead-letter
    pub max_attempts: i32,
    /// How long one claim holds a job without a heartbeat
    pub lease_duration: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            lease_duration: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Result of finalizing a claimed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// The transition was written
    Applied,
    /// An operator canceled the job while it was in flight
    CanceledByOperator,
    /// The lease no longer belongs to this worker
    LeaseLost,
}

/// Per-status queue depths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub in_progress: i64,
    pub retry_scheduled: i64,
    pub completed: i64,
    pub dead_letter: i64,
    pub canceled: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CandidateRow {
    id: Uuid,
    destination_id: Uuid,
    concurrency_limit: i32,
    destination_active: i64,
}

/// PostgreSQL-backed forward-job queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: PgPool,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(pool: PgPool, settings: QueueSettings) -> Self {
        Self { pool, settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Claim up to `limit` eligible jobs for `worker_id`.
    ///
    /// Eligibility: status pending or retry-scheduled, next-eligible-at
    /// reached, no live lease, destination enabled and below its
    /// concurrency limit. Ordering is (priority desc, next-eligible-at
    /// asc, id asc). Rows the per-destination cap excludes stay locked
    /// only until this transaction commits and are never transitioned.
    pub async fn claim(&self, worker_id: &str, limit: i64) -> CatalogResult<Vec<ForwardJobRow>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let candidates = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT j.id, j.destination_id, d.concurrency_limit,
                   (SELECT count(*) FROM forward_jobs a
                     WHERE a.destination_id = j.destination_id
                       AND a.status = 'in_progress') AS destination_active
            FROM forward_jobs j
            JOIN destinations d ON d.id = j.destination_id
            WHERE j.status IN ('pending', 'retry_scheduled')
              AND j.next_eligible_at <= $1
              AND (j.lease_expires_at IS NULL OR j.lease_expires_at < $1)
              AND d.enabled = TRUE
            ORDER BY j.priority DESC, j.next_eligible_at ASC, j.id ASC
            LIMIT $2
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed_per_destination: HashMap<Uuid, i64> = HashMap::new();
        let mut picked: Vec<Uuid> = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let extra = claimed_per_destination
                .entry(candidate.destination_id)
                .or_insert(0);
            if candidate.destination_active + *extra < candidate.concurrency_limit as i64 {
                *extra += 1;
                picked.push(candidate.id);
            }
        }

        if picked.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let lease_expires = now
            + chrono::Duration::milliseconds(self.settings.lease_duration.as_millis() as i64);
        let mut rows = sqlx::query_as::<_, ForwardJobRow>(
            r#"
            UPDATE forward_jobs
            SET status = 'in_progress',
                lease_holder = $1,
                lease_expires_at = $2,
                attempts = attempts + 1
            WHERE id = ANY($3)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(lease_expires)
        .bind(&picked)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // RETURNING does not preserve the claim ordering.
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_eligible_at.cmp(&b.next_eligible_at))
                .then(a.id.cmp(&b.id))
        });

        debug!(worker_id, claimed = rows.len(), "Claimed job batch");
        Ok(rows)
    }

    /// Mark a claimed job completed. A warning-class peer status is still
    /// a completion; the status detail is recorded for the operator.
    pub async fn complete(
        &self,
        job: &ForwardJobRow,
        worker_id: &str,
        warning: Option<String>,
    ) -> CatalogResult<Finalize> {
        let (kind, detail) = match warning {
            Some(detail) => (
                Some(ErrorKind::PeerStatusWarning.as_str()),
                Some(truncate_detail(&detail)),
            ),
            None => (None, None),
        };
        let result = sqlx::query(
            r#"
            UPDATE forward_jobs
            SET status = 'completed',
                finished_at = $3,
                lease_holder = NULL,
                lease_expires_at = NULL,
                last_error_kind = COALESCE($4, last_error_kind),
                last_error_detail = COALESCE($5, last_error_detail)
            WHERE id = $1 AND lease_holder = $2 AND status = 'in_progress'
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(Utc::now())
        .bind(kind)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        self.interpret_guard(job.id, result.rows_affected()).await
    }

    /// Fail a claimed job retryably. Schedules the next attempt with
    /// exponential backoff, or dead-letters once the attempt budget is
    /// spent.
    pub async fn fail_retryable(
        &self,
        job: &ForwardJobRow,
        worker_id: &str,
        kind: ErrorKind,
        detail: &str,
    ) -> CatalogResult<Finalize> {
        if job.attempts >= self.settings.max_attempts {
            info!(
                job_id = %job.id,
                attempts = job.attempts,
                "Attempt budget exhausted, dead-lettering"
            );
            return self.fail_permanent(job, worker_id, kind, detail).await;
        }

        let delay = self.settings.backoff.delay(job.attempts.max(1) as u32);
        let next_eligible =
            Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let result = sqlx::query(
            r#"
            UPDATE forward_jobs
            SET status = 'retry_scheduled',
                next_eligible_at = $3,
                lease_holder = NULL,
                lease_expires_at = NULL,
                last_error_kind = $4,
                last_error_detail = $5
            WHERE id = $1 AND lease_holder = $2 AND status = 'in_progress'
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(next_eligible)
        .bind(kind.as_str())
        .bind(truncate_detail(detail))
        .execute(&self.pool)
        .await?;

        self.interpret_guard(job.id, result.rows_affected()).await
    }

    /// Fail a claimed job terminally.
    pub async fn fail_permanent(
        &self,
        job: &ForwardJobRow,
        worker_id: &str,
        kind: ErrorKind,
        detail: &str,
    ) -> CatalogResult<Finalize> {
        let result = sqlx::query(
            r#"
            UPDATE forward_jobs
            SET status = 'dead_letter',
                finished_at = $3,
                lease_holder = NULL,
                lease_expires_at = NULL,
                last_error_kind = $4,
                last_error_detail = $5
            WHERE id = $1 AND lease_holder = $2 AND status = 'in_progress'
            "#,
        )
        .bind(job.id)
        .bind(worker_id)
        .bind(Utc::now())
        .bind(kind.as_str())
        .bind(truncate_detail(detail))
        .execute(&self.pool)
        .await?;

        self.interpret_guard(job.id, result.rows_affected()).await
    }

    /// Extend the lease on a claimed job. Returns `LeaseLost` when the
    /// job no longer belongs to this worker; the caller must abort its
    /// transfer.
    pub async fn extend_lease(&self, job_id: Uuid, worker_id: &str) -> CatalogResult<Finalize> {
        let lease_expires = Utc::now()
            + chrono::Duration::milliseconds(self.settings.lease_duration.as_millis() as i64);
        let result = sqlx::query(
            r#"
            UPDATE forward_jobs
            SET lease_expires_at = $3
            WHERE id = $1 AND lease_holder = $2 AND status = 'in_progress'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_expires)
        .execute(&self.pool)
        .await?;

        self.interpret_guard(job_id, result.rows_affected()).await
    }

    /// Return a claimed-but-unfinished job to the queue, e.g. on drain.
    /// The attempt spent on the claim is kept.
    pub async fn release(&self, job_id: Uuid, worker_id: &str) -> CatalogResult<Finalize> {
        let result = sqlx::query(
            r#"
            UPDATE forward_jobs
            SET status = 'pending',
                next_eligible_at = $3,
                lease_holder = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND lease_holder = $2 AND status = 'in_progress'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.interpret_guard(job_id, result.rows_affected()).await
    }

    /// Return expired leases to pending, whoever held them. Supervisor
    /// duty.
    pub async fn recover_expired_leases(&self) -> CatalogResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE forward_jobs
            SET status = 'pending',
                lease_holder = NULL,
                lease_expires_at = NULL,
                last_error_kind = $2,
                last_error_detail = 'lease expired; reclaimed by supervisor'
            WHERE status = 'in_progress' AND lease_expires_at < $1
            "#,
        )
        .bind(Utc::now())
        .bind(ErrorKind::LeaseLost.as_str())
        .execute(&self.pool)
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "Recovered expired job leases");
            self.notify().await?;
        }
        Ok(recovered)
    }

    /// Promote retry-scheduled jobs whose eligibility time has arrived.
    /// Claiming accepts retry-scheduled rows directly, so this only makes
    /// the documented pending transition observable.
    pub async fn promote_eligible_retries(&self) -> CatalogResult<u64> {
        let result = sqlx::query(
            "UPDATE forward_jobs SET status = 'pending'
             WHERE status = 'retry_scheduled' AND next_eligible_at <= $1",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Operator verb: move dead-letter jobs back to pending. Attempt
    /// counts are deliberately kept.
    pub async fn retry_dead_letter(&self, ids: Option<&[Uuid]>) -> CatalogResult<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE forward_jobs
            SET status = 'pending',
                next_eligible_at = $1,
                finished_at = NULL,
                lease_holder = NULL,
                lease_expires_at = NULL
            WHERE status = 'dead_letter'
              AND ($2::uuid[] IS NULL OR id = ANY($2))
            "#,
        )
        .bind(now)
        .bind(ids.map(|s| s.to_vec()))
        .execute(&self.pool)
        .await?;
        let retried = result.rows_affected();
        if retried > 0 {
            info!(retried, "Operator retried dead-letter jobs");
            self.notify().await?;
        }
        Ok(retried)
    }

    /// Operator verb: create fresh forward jobs for every instance of a
    /// study, for the given destinations (or all enabled ones).
    /// Historical jobs are untouched; replays start with a zero attempt
    /// count.
    pub async fn replay_study(
        &self,
        study_uid: &str,
        destinations: Option<&[Uuid]>,
    ) -> CatalogResult<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO forward_jobs (
                id, instance_uid, destination_id, status, attempts,
                priority, next_eligible_at, created_at
            )
            SELECT gen_random_uuid(), i.instance_uid, d.id, 'pending', 0, 0, $2, $2
            FROM instances i
            CROSS JOIN destinations d
            WHERE i.study_uid = $1
              AND d.enabled = TRUE
              AND ($3::uuid[] IS NULL OR d.id = ANY($3))
            "#,
        )
        .bind(study_uid)
        .bind(now)
        .bind(destinations.map(|s| s.to_vec()))
        .execute(&self.pool)
        .await?;
        let created = result.rows_affected();
        if created > 0 {
            info!(study_uid, created, "Replay created forward jobs");
            self.notify().await?;
        }
        Ok(created)
    }

    /// Operator verb: cancel jobs that are not yet terminal. A job in
    /// progress is marked immediately; its worker observes the
    /// cancellation at the next heartbeat or finalization.
    pub async fn cancel(&self, ids: &[Uuid]) -> CatalogResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE forward_jobs
            SET status = 'canceled',
                finished_at = $2,
                lease_holder = NULL,
                lease_expires_at = NULL,
                last_error_kind = $3
            WHERE id = ANY($1)
              AND status NOT IN ('completed', 'dead_letter', 'canceled')
            "#,
        )
        .bind(ids.to_vec())
        .bind(Utc::now())
        .bind(ErrorKind::Canceled.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Per-status depths, for the supervisor's periodic report.
    pub async fn stats(&self) -> CatalogResult<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM forward_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                job_status::PENDING => stats.pending = count,
                job_status::IN_PROGRESS => stats.in_progress = count,
                job_status::RETRY_SCHEDULED => stats.retry_scheduled = count,
                job_status::COMPLETED => stats.completed = count,
                job_status::DEAD_LETTER => stats.dead_letter = count,
                job_status::CANCELED => stats.canceled = count,
                other => warn!("Unknown job status in catalog: {other}"),
            }
        }
        Ok(stats)
    }

    /// Publish a job-arrival hint. Payload is not load-bearing.
    pub async fn notify(&self) -> CatalogResult<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(JOB_CHANNEL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Distinguish why a guarded transition wrote no row.
    async fn interpret_guard(&self, job_id: Uuid, rows_affected: u64) -> CatalogResult<Finalize> {
        if rows_affected == 1 {
            return Ok(Finalize::Applied);
        }
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM forward_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        match status.as_deref() {
            Some(job_status::CANCELED) => Ok(Finalize::CanceledByOperator),
            Some(_) => Ok(Finalize::LeaseLost),
            None => Err(CatalogError::NotFound(format!("forward job {job_id}"))),
        }
    }
}

/// Wake reason for a forwarder worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A notification hint arrived
    Notified,
    /// The bounded poll interval elapsed
    Poll,
}

/// LISTEN wrapper with a polling fallback.
///
/// Notification delivery is best-effort; correctness rests on the poll
/// interval.
pub struct JobListener {
    listener: PgListener,
}

impl JobListener {
    pub async fn connect(pool: &PgPool) -> CatalogResult<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(JOB_CHANNEL).await?;
        Ok(Self { listener })
    }

    /// Wait for a hint or for the poll interval, whichever comes first.
    pub async fn wait(&mut self, poll_interval: Duration) -> WakeReason {
        tokio::select! {
            received = self.listener.recv() => match received {
                Ok(_) => WakeReason::Notified,
                Err(e) => {
                    // The listener reconnects lazily on the next recv;
                    // until then the poll fallback carries the load.
                    warn!("Job listener error, falling back to polling: {e}");
                    tokio::time::sleep(poll_interval).await;
                    WakeReason::Poll
                }
            },
            _ = tokio::time::sleep(poll_interval) => WakeReason::Poll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_sane() {
        let settings = QueueSettings::default();
        assert!(settings.max_attempts >= 5 && settings.max_attempts <= 10);
        assert!(settings.lease_duration >= Duration::from_secs(10));
    }
}
