//! Job queue backed by PostgreSQL.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so any number of fleetd processes
//! can poll the same table without handing a job to two workers. Rows whose
//! dependencies have not completed are filtered out in SQL, so blocked jobs
//! never crowd runnable ones out of a claim batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetd_core::job::{Dependency, Job, JobRecord, JobStatus, JobType};
use fleetd_core::registry::JobRegistry;
use fleetd_core::{Error, JobId, Result};
use fleetd_db::DbError;
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Dispatch, Queue, QueueEntry, QueueState, fail_record, lost_claim};

/// Pending rows examined per claim.
const CLAIM_BATCH: i64 = 32;

/// A job row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: String,
    type_name: String,
    type_version: i32,
    status: String,
    dependency: Json<Dependency>,
    job_status: Json<JobStatus>,
    body: serde_json::Value,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl JobRow {
    fn into_entry(self) -> Result<QueueEntry> {
        let version = u32::try_from(self.type_version).map_err(|_| {
            Error::Deserialization(format!("job {} has negative version", self.id))
        })?;
        Ok(QueueEntry {
            state: self.status.parse()?,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at,
            record: JobRecord {
                id: JobId::new(self.id),
                job_type: JobType::new(self.type_name, version),
                dependency: self.dependency.0,
                status: self.job_status.0,
                body: self.body,
                created_at: self.created_at,
            },
        })
    }
}

fn db_err(err: sqlx::Error) -> Error {
    DbError::from(err).into()
}

/// Job queue shared by every process connected to the same database.
///
/// Cancelling a running job trips its token only in the process that claimed
/// it; other processes see the cancellation once the job completes.
pub struct PgQueue {
    pool: PgPool,
    registry: JobRegistry,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

impl PgQueue {
    pub fn new(pool: PgPool, registry: JobRegistry) -> Self {
        Self {
            pool,
            registry,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn track(&self, id: JobId, token: CancellationToken) {
        if let Ok(mut running) = self.running.lock() {
            running.insert(id, token);
        }
    }

    fn untrack(&self, id: &JobId) -> Option<CancellationToken> {
        self.running.lock().ok().and_then(|mut running| running.remove(id))
    }
}

#[async_trait]
impl Queue for PgQueue {
    async fn put(&self, job: &dyn Job) -> Result<()> {
        let record = job.to_record()?;
        let version = i32::try_from(record.job_type.version).map_err(|_| {
            Error::InvalidInput(format!(
                "job {} has version {} which does not fit a column",
                record.id, record.job_type.version
            ))
        })?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, type_name, type_version, status, dependency, job_status, body, created_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.job_type.name)
        .bind(version)
        .bind(Json(&record.dependency))
        .bind(Json(&record.status))
        .bind(&record.body)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            return Err(Error::Conflict(format!("job {} is already queued", record.id)));
        }
        debug!(job_id = %record.id, job_type = %record.job_type.name, "Queued job");
        Ok(())
    }

    async fn next(&self, worker_id: &str) -> Result<Option<Dispatch>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT j.* FROM jobs j
            WHERE j.status = 'pending'
              AND NOT EXISTS (
                SELECT 1
                FROM jsonb_array_elements_text(
                    CASE WHEN j.dependency->>'type' = 'after_jobs'
                         THEN j.dependency->'ids'
                         ELSE '[]'::jsonb
                    END
                ) AS dep(id)
                WHERE NOT EXISTS (
                    SELECT 1 FROM jobs d WHERE d.id = dep.id AND d.status = 'completed'
                )
              )
            ORDER BY j.created_at ASC
            LIMIT $1
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(CLAIM_BATCH)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        for row in rows {
            let mut record = row.into_entry()?.record;

            let job = match self.registry.rebuild(&record) {
                Ok(job) => job,
                Err(err) => {
                    fail_record(&mut record, err);
                    sqlx::query(
                        "UPDATE jobs SET status = 'completed', job_status = $2, completed_at = NOW() WHERE id = $1",
                    )
                    .bind(record.id.as_str())
                    .bind(Json(&record.status))
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    continue;
                }
            };

            sqlx::query(
                "UPDATE jobs SET status = 'claimed', claimed_by = $2, claimed_at = NOW() WHERE id = $1",
            )
            .bind(record.id.as_str())
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;

            let cancel = CancellationToken::new();
            self.track(record.id.clone(), cancel.clone());
            debug!(job_id = %record.id, worker_id, "Dispatched job");
            return Ok(Some(Dispatch { job, cancel }));
        }

        // Commit so failed records stay failed.
        tx.commit().await.map_err(db_err)?;
        Ok(None)
    }

    async fn complete(&self, worker_id: &str, job: &dyn Job) -> Result<()> {
        let record = job.to_record()?;
        self.untrack(&record.id);

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', job_status = $2, body = $3, completed_at = NOW()
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $4
            "#,
        )
        .bind(record.id.as_str())
        .bind(Json(&record.status))
        .bind(&record.body)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            // Distinguish a missing job from a claim taken over by another worker.
            self.get(&record.id).await?;
            return Err(lost_claim(&record.id, worker_id));
        }
        Ok(())
    }

    async fn heartbeat(&self, id: &JobId, worker_id: &str) -> Result<()> {
        let renewed = sqlx::query(
            "UPDATE jobs SET claimed_at = NOW() WHERE id = $1 AND status = 'claimed' AND claimed_by = $2",
        )
        .bind(id.as_str())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if renewed.rows_affected() == 0 {
            return Err(lost_claim(id, worker_id));
        }
        Ok(())
    }

    async fn cancel(&self, id: &JobId) -> Result<()> {
        let entry = self.get(id).await?;
        match entry.state {
            QueueState::Pending => {
                sqlx::query("UPDATE jobs SET status = 'cancelled' WHERE id = $1 AND status = 'pending'")
                    .bind(id.as_str())
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
                info!(job_id = %id, "Cancelled pending job");
            }
            QueueState::Claimed => {
                let token = self.running.lock().ok().and_then(|r| r.get(id).cloned());
                match token {
                    Some(token) => {
                        token.cancel();
                        info!(job_id = %id, "Cancelled running job");
                    }
                    None => {
                        warn!(job_id = %id, claimed_by = ?entry.claimed_by, "Job is running in another process");
                    }
                }
            }
            QueueState::Cancelled => {}
            QueueState::Completed => {
                return Err(Error::Conflict(format!("job {id} has already completed")));
            }
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<QueueEntry> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .into_entry()
    }

    async fn release_stale(&self, lease: Duration) -> Result<usize> {
        let released = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE jobs
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at < NOW() - make_interval(secs => $1)
            RETURNING id
            "#,
        )
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for id in &released {
            let id = JobId::new(id.clone());
            if let Some(token) = self.untrack(&id) {
                token.cancel();
            }
            info!(job_id = %id, "Released stale job");
        }
        Ok(released.len())
    }
}
