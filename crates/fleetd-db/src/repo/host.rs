//! Host repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetd_core::HostId;
use fleetd_core::host::{Host, HostStatus, HostStore};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A host row in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HostRecord {
    pub id: String,
    pub distro: String,
    pub provider: String,
    pub status: String,
    pub parent_id: Option<String>,
    pub dns_name: Option<String>,
    pub container_build_attempt: i32,
    pub container_images: Vec<String>,
    pub terminated_by: Option<String>,
    pub termination_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<HostRecord> for Host {
    type Error = DbError;

    fn try_from(row: HostRecord) -> DbResult<Host> {
        let status: HostStatus = row
            .status
            .parse()
            .map_err(|e: fleetd_core::Error| DbError::InvalidRow(e.to_string()))?;
        let container_build_attempt = u32::try_from(row.container_build_attempt).map_err(|_| {
            DbError::InvalidRow(format!(
                "host {} has negative build attempt {}",
                row.id, row.container_build_attempt
            ))
        })?;
        Ok(Host {
            id: HostId::new(row.id),
            distro: row.distro,
            provider: row.provider,
            status,
            parent_id: row.parent_id.map(HostId::new),
            dns_name: row.dns_name,
            container_build_attempt,
            container_images: row.container_images.into_iter().collect(),
            terminated_by: row.terminated_by,
            termination_time: row.termination_time,
            created_at: row.created_at,
        })
    }
}

fn to_db_attempt(attempt: u32) -> DbResult<i32> {
    i32::try_from(attempt)
        .map_err(|_| DbError::InvalidRow(format!("build attempt {attempt} does not fit a column")))
}

/// PostgreSQL implementation of HostStore.
///
/// Every write is a single statement so concurrent writers from other
/// subsystems only ever contend on the fields they touch.
pub struct PgHostStore {
    pool: PgPool,
}

impl PgHostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn get(&self, id: &HostId) -> DbResult<Host> {
        let row = sqlx::query_as::<_, HostRecord>("SELECT * FROM hosts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("host {}", id)))?;
        row.try_into()
    }

    async fn merge(&self, host: &Host) -> DbResult<()> {
        let images: Vec<String> = host.container_images.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO hosts (
                id, distro, provider, status, parent_id, dns_name,
                container_build_attempt, container_images,
                terminated_by, termination_time, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (id) DO UPDATE SET
                distro = EXCLUDED.distro,
                provider = EXCLUDED.provider,
                status = CASE
                    WHEN (hosts.status, EXCLUDED.status) IN (
                        ('uninitialized', 'provisioning'),
                        ('provisioning', 'running'),
                        ('uninitialized', 'terminated'),
                        ('provisioning', 'terminated'),
                        ('running', 'terminated')
                    ) THEN EXCLUDED.status
                    ELSE hosts.status
                END,
                parent_id = COALESCE(EXCLUDED.parent_id, hosts.parent_id),
                dns_name = COALESCE(EXCLUDED.dns_name, hosts.dns_name),
                container_build_attempt =
                    GREATEST(hosts.container_build_attempt, EXCLUDED.container_build_attempt),
                container_images = ARRAY(
                    SELECT DISTINCT unnest(hosts.container_images || EXCLUDED.container_images)
                ),
                terminated_by = COALESCE(hosts.terminated_by, EXCLUDED.terminated_by),
                termination_time = COALESCE(hosts.termination_time, EXCLUDED.termination_time),
                updated_at = NOW()
            "#,
        )
        .bind(host.id.as_str())
        .bind(&host.distro)
        .bind(&host.provider)
        .bind(host.status.as_str())
        .bind(host.parent_id.as_ref().map(HostId::as_str))
        .bind(host.dns_name.as_deref())
        .bind(to_db_attempt(host.container_build_attempt)?)
        .bind(&images)
        .bind(host.terminated_by.as_deref())
        .bind(host.termination_time)
        .bind(host.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment(&self, id: &HostId, from_attempt: u32) -> DbResult<u32> {
        let updated = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE hosts
            SET container_build_attempt = container_build_attempt + 1, updated_at = NOW()
            WHERE id = $1 AND container_build_attempt = $2
            RETURNING container_build_attempt
            "#,
        )
        .bind(id.as_str())
        .bind(to_db_attempt(from_attempt)?)
        .fetch_optional(&self.pool)
        .await?;

        let count = match updated {
            Some(count) => count,
            // Someone already consumed this attempt; report where the counter is.
            None => {
                sqlx::query_scalar::<_, i32>(
                    "SELECT container_build_attempt FROM hosts WHERE id = $1",
                )
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("host {}", id)))?
            }
        };

        u32::try_from(count)
            .map_err(|_| DbError::InvalidRow(format!("host {id} has negative build attempt")))
    }

    async fn terminate(&self, id: &HostId, actor: &str) -> DbResult<Host> {
        let row = sqlx::query_as::<_, HostRecord>(
            r#"
            UPDATE hosts
            SET status = 'terminated', terminated_by = $2, termination_time = NOW(), updated_at = NOW()
            WHERE id = $1 AND status <> 'terminated'
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(actor)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => self.get(id).await,
        }
    }
}

#[async_trait]
impl HostStore for PgHostStore {
    async fn find_by_id(&self, id: &HostId) -> fleetd_core::Result<Host> {
        Ok(self.get(id).await?)
    }

    async fn upsert(&self, host: &Host) -> fleetd_core::Result<()> {
        Ok(self.merge(host).await?)
    }

    async fn increment_container_build_attempt(
        &self,
        id: &HostId,
        from_attempt: u32,
    ) -> fleetd_core::Result<u32> {
        Ok(self.increment(id, from_attempt).await?)
    }

    async fn set_terminated(&self, id: &HostId, actor: &str) -> fleetd_core::Result<Host> {
        Ok(self.terminate(id, actor).await?)
    }
}
