//! In-memory host store for tests and single-process deployments.

use async_trait::async_trait;
use chrono::Utc;
use fleetd_core::host::{Host, HostStatus, HostStore};
use fleetd_core::{Error, HostId, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Host store backed by a map. Each operation holds the lock for its whole
/// read-modify-write, which gives the same atomicity as the single-statement
/// PostgreSQL implementation.
#[derive(Debug, Default)]
pub struct MemoryHostStore {
    hosts: RwLock<HashMap<HostId, Host>>,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `hosts`.
    pub fn with_hosts(hosts: impl IntoIterator<Item = Host>) -> Self {
        Self {
            hosts: RwLock::new(hosts.into_iter().map(|h| (h.id.clone(), h)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.hosts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hosts.read().await.is_empty()
    }
}

fn not_found(id: &HostId) -> Error {
    Error::NotFound(format!("host {id}"))
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn find_by_id(&self, id: &HostId) -> Result<Host> {
        self.hosts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn upsert(&self, host: &Host) -> Result<()> {
        let mut hosts = self.hosts.write().await;
        match hosts.get_mut(&host.id) {
            None => {
                hosts.insert(host.id.clone(), host.clone());
            }
            Some(stored) => {
                stored.distro = host.distro.clone();
                stored.provider = host.provider.clone();
                if stored.status.can_transition_to(host.status) {
                    stored.status = host.status;
                }
                if host.parent_id.is_some() {
                    stored.parent_id = host.parent_id.clone();
                }
                if host.dns_name.is_some() {
                    stored.dns_name = host.dns_name.clone();
                }
                stored.container_build_attempt = stored
                    .container_build_attempt
                    .max(host.container_build_attempt);
                stored
                    .container_images
                    .extend(host.container_images.iter().cloned());
                if stored.terminated_by.is_none() {
                    stored.terminated_by = host.terminated_by.clone();
                }
                if stored.termination_time.is_none() {
                    stored.termination_time = host.termination_time;
                }
            }
        }
        Ok(())
    }

    async fn increment_container_build_attempt(&self, id: &HostId, from_attempt: u32) -> Result<u32> {
        let mut hosts = self.hosts.write().await;
        let host = hosts.get_mut(id).ok_or_else(|| not_found(id))?;
        if host.container_build_attempt == from_attempt {
            host.container_build_attempt += 1;
        }
        Ok(host.container_build_attempt)
    }

    async fn set_terminated(&self, id: &HostId, actor: &str) -> Result<Host> {
        let mut hosts = self.hosts.write().await;
        let host = hosts.get_mut(id).ok_or_else(|| not_found(id))?;
        if host.status != HostStatus::Terminated {
            host.status = HostStatus::Terminated;
            host.terminated_by = Some(actor.to_string());
            host.termination_time = Some(Utc::now());
        }
        Ok(host.clone())
    }
}
