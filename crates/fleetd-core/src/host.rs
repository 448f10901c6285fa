//! Host records and the store that persists them.
//!
//! A host is a provisioned machine capable of running containers. Several
//! subsystems write to the same record concurrently (provisioning jobs,
//! termination, operators), so every store operation is field-scoped: nothing
//! here replaces a whole record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::{Error, HostId, Result};

/// Actor recorded when the system itself terminates a host.
pub const SYSTEM_USER: &str = "fleetd";

/// Lifecycle status of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Uninitialized,
    Provisioning,
    Running,
    Terminated,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Uninitialized => "uninitialized",
            HostStatus::Provisioning => "provisioning",
            HostStatus::Running => "running",
            HostStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HostStatus::Terminated)
    }

    /// Whether a host in this status may move to `next`.
    ///
    /// Transitions only go forward, and any live host may be terminated.
    pub fn can_transition_to(&self, next: HostStatus) -> bool {
        use HostStatus::*;
        matches!(
            (self, next),
            (Uninitialized, Provisioning)
                | (Provisioning, Running)
                | (Uninitialized | Provisioning | Running, Terminated)
        ) || *self == next
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uninitialized" => Ok(HostStatus::Uninitialized),
            "provisioning" => Ok(HostStatus::Provisioning),
            "running" => Ok(HostStatus::Running),
            "terminated" => Ok(HostStatus::Terminated),
            other => Err(Error::InvalidInput(format!("unknown host status '{other}'"))),
        }
    }
}

/// A provisioned machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    /// Distro the host was provisioned from.
    pub distro: String,
    /// Name of the provider that owns the host.
    pub provider: String,
    pub status: HostStatus,
    /// Host this one runs on, for containers.
    pub parent_id: Option<HostId>,
    /// Address of the host's container daemon.
    pub dns_name: Option<String>,
    /// Number of container image builds attempted on this host. Never decreases.
    pub container_build_attempt: u32,
    /// Images confirmed built on this host.
    pub container_images: BTreeSet<String>,
    pub terminated_by: Option<String>,
    pub termination_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Host {
    pub fn new(id: impl Into<HostId>, distro: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            distro: distro.into(),
            provider: provider.into(),
            status: HostStatus::Uninitialized,
            parent_id: None,
            dns_name: None,
            container_build_attempt: 0,
            container_images: BTreeSet::new(),
            terminated_by: None,
            termination_time: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_dns_name(mut self, dns_name: impl Into<String>) -> Self {
        self.dns_name = Some(dns_name.into());
        self
    }

    pub fn with_container_build_attempt(mut self, attempt: u32) -> Self {
        self.container_build_attempt = attempt;
        self
    }

    pub fn has_container_image(&self, image_url: &str) -> bool {
        self.container_images.contains(image_url)
    }

    /// Record an image as built. Returns false if it was already recorded.
    pub fn add_container_image(&mut self, image_url: impl Into<String>) -> bool {
        self.container_images.insert(image_url.into())
    }

    /// Consume the build attempt this copy of the record was read at.
    ///
    /// The store applies the increment atomically and only if no one else has
    /// consumed the same attempt, so repeating the call for one attempt has no
    /// further effect. The local counter is refreshed from the store's answer.
    pub async fn inc_container_build_attempt(&mut self, store: &dyn HostStore) -> Result<()> {
        self.consume_container_build_attempt(store, self.container_build_attempt)
            .await
    }

    /// Consume build attempt `attempt`, which may be older than this copy of
    /// the record. Only the first consumer of an attempt moves the counter.
    pub async fn consume_container_build_attempt(
        &mut self,
        store: &dyn HostStore,
        attempt: u32,
    ) -> Result<()> {
        let count = store
            .increment_container_build_attempt(&self.id, attempt)
            .await?;
        self.container_build_attempt = self.container_build_attempt.max(count);
        Ok(())
    }

    /// Terminate the host on behalf of `actor`. Terminating twice is a no-op.
    pub async fn set_terminated(&mut self, store: &dyn HostStore, actor: &str) -> Result<()> {
        let stored = store.set_terminated(&self.id, actor).await?;
        self.status = stored.status;
        self.terminated_by = stored.terminated_by;
        self.termination_time = stored.termination_time;
        Ok(())
    }

    /// Persist this record with merge semantics (see [`HostStore::upsert`]).
    pub async fn upsert(&self, store: &dyn HostStore) -> Result<()> {
        store.upsert(self).await
    }
}

/// Persistence boundary for host records.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Load a host, failing with [`Error::NotFound`] for unknown ids.
    async fn find_by_id(&self, id: &HostId) -> Result<Host>;

    /// Insert the host or merge it into the stored record.
    ///
    /// Merging unions the built-image sets and keeps the larger build-attempt
    /// counter. The stored status only changes along
    /// [`HostStatus::can_transition_to`], so a stale copy never moves a host
    /// backwards or out of `terminated`.
    async fn upsert(&self, host: &Host) -> Result<()>;

    /// Atomically move the build-attempt counter from `from_attempt` to
    /// `from_attempt + 1`, returning the counter afterwards.
    ///
    /// When the stored counter no longer equals `from_attempt` the attempt has
    /// already been consumed and the stored value is returned unchanged.
    async fn increment_container_build_attempt(&self, id: &HostId, from_attempt: u32)
    -> Result<u32>;

    /// Terminate the host, recording `actor`. Idempotent: an already
    /// terminated host keeps its original actor and time.
    async fn set_terminated(&self, id: &HostId, actor: &str) -> Result<Host>;
}
