//! Dynamic-member persistence
//!
//! Members added at runtime survive restarts by being serialized into the
//! external key/value store, one compact string per queue:
//!
//! ```text
//! interface;penalty;paused;displayname;statekey;ringinuse[|...]
//! ```
//!
//! Static and realtime members are never persisted here; their sources of
//! truth are the configuration and the realtime backend.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::device::DeviceRegistry;
use crate::error::{AcdError, Result};
use crate::member::{MemberSpec, Provenance};
use crate::queue::Queue;
use crate::transport::KvStore;

/// Store family dynamic members are filed under
pub const MEMBER_FAMILY: &str = "acd/dynamic-members";

/// One serialized dynamic member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMember {
    /// Dialable interface
    pub interface: String,
    /// Selection penalty
    pub penalty: i32,
    /// Paused at dump time
    pub paused: bool,
    /// Display name
    pub display_name: String,
    /// Device state key
    pub state_key: String,
    /// Ring-in-use permission
    pub ring_in_use: bool,
}

impl PersistedMember {
    fn serialize(&self) -> String {
        format!(
            "{};{};{};{};{};{}",
            self.interface,
            self.penalty,
            if self.paused { 1 } else { 0 },
            self.display_name,
            self.state_key,
            if self.ring_in_use { 1 } else { 0 },
        )
    }

    fn parse(record: &str) -> Result<Self> {
        let mut fields = record.split(';');
        let interface = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AcdError::persistence("member record missing interface"))?
            .to_string();
        let penalty = fields
            .next()
            .unwrap_or("0")
            .parse::<i32>()
            .map_err(|_| AcdError::persistence(format!("bad penalty in record: {}", record)))?;
        let paused = fields.next().unwrap_or("0") == "1";
        let display_name = fields.next().unwrap_or(&interface).to_string();
        let state_key = match fields.next() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => interface.clone(),
        };
        let ring_in_use = fields.next().map_or(true, |s| s != "0");
        Ok(PersistedMember {
            interface,
            penalty,
            paused,
            display_name,
            state_key,
            ring_in_use,
        })
    }

    fn to_spec(&self) -> MemberSpec {
        MemberSpec {
            interface: self.interface.clone(),
            display_name: self.display_name.clone(),
            state_key: self.state_key.clone(),
            penalty: self.penalty,
            paused: self.paused,
            ring_in_use: self.ring_in_use,
            provenance: Provenance::Dynamic,
            realtime_uid: None,
        }
    }
}

/// Persistence adapter over the external key/value store
pub struct MemberStore {
    kv: Arc<dyn KvStore>,
}

impl MemberStore {
    /// Adapter writing through the given store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        MemberStore { kv }
    }

    /// Serialize the queue's dynamic members under its key. An empty set
    /// deletes the key.
    pub async fn dump(&self, queue: &Queue) -> Result<()> {
        let records: Vec<String> = {
            let roster = queue.data().members().read().await;
            roster
                .iter()
                .filter(|m| m.provenance() == Provenance::Dynamic)
                .map(|m| {
                    PersistedMember {
                        interface: m.interface().to_string(),
                        penalty: m.penalty(),
                        paused: m.paused(),
                        display_name: m.display_name(),
                        state_key: m.state_key().to_string(),
                        ring_in_use: m.ring_in_use(),
                    }
                    .serialize()
                })
                .collect()
        };

        if records.is_empty() {
            self.kv.delete(MEMBER_FAMILY, queue.name()).await
        } else {
            self.kv.put(MEMBER_FAMILY, queue.name(), &records.join("|")).await
        }
    }

    /// Re-add the queue's persisted members with dynamic provenance.
    /// Returns how many were added; records that fail to parse or collide
    /// are skipped with a warning.
    pub async fn load_into(&self, queue: &Queue, devices: &DeviceRegistry) -> Result<usize> {
        let Some(value) = self.kv.get(MEMBER_FAMILY, queue.name()).await else {
            return Ok(0);
        };

        let mut added = 0;
        let mut roster = queue.data().members().write().await;
        for record in value.split('|').filter(|r| !r.is_empty()) {
            let persisted = match PersistedMember::parse(record) {
                Ok(p) => p,
                Err(e) => {
                    warn!("skipping bad persisted member record: {}", e);
                    continue;
                }
            };
            let device = devices.acquire(&persisted.state_key);
            match roster.insert(persisted.to_spec(), device.clone()) {
                Ok(_) => added += 1,
                Err(e) => {
                    warn!("skipping persisted member {}: {}", persisted.interface, e);
                    devices.release(device);
                }
            }
        }
        info!("💾 Restored {} dynamic members into queue {}", added, queue.name());
        Ok(added)
    }
}

/// In-memory key/value store
///
/// The default store for tests and single-node deployments without an
/// external backend.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<(String, String), String>,
}

impl MemoryKv {
    /// Empty store.
    pub fn new() -> Self {
        MemoryKv::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, family: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .insert((family.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn get(&self, family: &str, key: &str) -> Option<String> {
        self.entries
            .get(&(family.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
    }

    async fn delete(&self, family: &str, key: &str) -> Result<()> {
        self.entries.remove(&(family.to_string(), key.to_string()));
        Ok(())
    }
}
