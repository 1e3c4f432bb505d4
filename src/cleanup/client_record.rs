//! Lost-cleanup client record
//!
//! Every location swept for lost transactions holds one client record
//! document listing the live sweepers:
//!
//! ```json
//! { "records": { "clients": { "<client id>": { "heartbeat_ms": 0, "expires_ms": 0, "num_atrs": 1024 } } } }
//! ```
//!
//! Each sweeper refreshes its own heartbeat once per window and prunes
//! clients that have been silent longer than their expiry. The ATR shards
//! are split between live clients by ordinal: the client at index `i` of
//! the sorted id list owns every shard `s` with `s % live == i`.

use crate::error::{Result, StoreError};
use crate::hooks::ClientRecordHooks;
use crate::storage::{
    DocumentId, DocumentLocation, DocumentStore, KvOp, LookupInSpec, MutateInSpec, MutateOptions,
    StoreSemantics,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Key of the client record document
pub const CLIENT_RECORD_KEY: &str = "_txn:client-record";

const CLIENTS_PATH: &str = "records.clients";

/// Stale clients removed per heartbeat
const MAX_REMOVALS_PER_UPDATE: usize = 12;

const MAX_CAS_RETRIES: usize = 8;

/// One sweeper's heartbeat entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHeartbeat {
    pub heartbeat_ms: u64,
    pub expires_ms: u64,
    pub num_atrs: u32,
}

impl ClientHeartbeat {
    fn is_stale(&self, now_ms: u64) -> bool {
        now_ms > self.heartbeat_ms.saturating_add(self.expires_ms)
    }
}

/// This client's share of the shard space after a heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAssignment {
    pub index: usize,
    pub active_clients: usize,
    pub removed_clients: Vec<String>,
}

impl ClientAssignment {
    /// Shards of `0..num_atrs` this client sweeps
    pub fn owned_shards(&self, num_atrs: u32) -> Vec<u32> {
        let active = self.active_clients.max(1) as u32;
        let index = self.index as u32;
        (0..num_atrs).filter(|s| s % active == index).collect()
    }
}

/// Maintains this client's entry in one location's client record
pub struct ClientRecord {
    store: Arc<dyn DocumentStore>,
    id: DocumentId,
    client_id: String,
    kv_timeout: Duration,
    hooks: Arc<dyn ClientRecordHooks>,
}

impl ClientRecord {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        location: &DocumentLocation,
        client_id: impl Into<String>,
        kv_timeout: Duration,
        hooks: Arc<dyn ClientRecordHooks>,
    ) -> Self {
        Self {
            store,
            id: location.doc(CLIENT_RECORD_KEY),
            client_id: client_id.into(),
            kv_timeout,
            hooks,
        }
    }

    fn op(&self, operation: &'static str) -> KvOp {
        KvOp::new(operation, &self.id, self.kv_timeout)
    }

    /// Read every client entry and the document CAS; `None` if absent
    async fn read(&self) -> Result<Option<(BTreeMap<String, ClientHeartbeat>, u64)>> {
        let specs = [LookupInSpec::get_xattr(CLIENTS_PATH)];
        let result = self
            .op("client_record_lookup")
            .run(self.store.lookup_in(&self.id, &specs, false))
            .await;
        let res = match result {
            Ok(res) => res,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut clients = BTreeMap::new();
        if let Some(map) = res.value(0).and_then(|v| v.as_object()) {
            for (id, raw) in map {
                if let Ok(heartbeat) = serde_json::from_value::<ClientHeartbeat>(raw.clone()) {
                    clients.insert(id.clone(), heartbeat);
                }
            }
        }
        Ok(Some((clients, res.cas)))
    }

    async fn create(&self) -> Result<()> {
        self.hooks.before_create_record(&self.id.location.bucket).await?;
        let specs = [MutateInSpec::upsert_xattr(CLIENTS_PATH, Value::Object(Map::new()))];
        let options = MutateOptions {
            semantics: StoreSemantics::Insert,
            ..Default::default()
        };
        match self
            .op("client_record_create")
            .run(self.store.mutate_in(&self.id, &specs, &options))
            .await
        {
            Ok(_) | Err(StoreError::Exists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh this client's heartbeat, prune stale clients and compute
    /// the shard assignment
    pub async fn heartbeat(&self, expires_after: Duration, num_atrs: u32) -> Result<ClientAssignment> {
        for _ in 0..MAX_CAS_RETRIES {
            let Some((clients, cas)) = self.read().await? else {
                self.create().await?;
                continue;
            };
            let now = self.store.now_ms();

            let stale: Vec<String> = clients
                .iter()
                .filter(|(id, hb)| **id != self.client_id && hb.is_stale(now))
                .map(|(id, _)| id.clone())
                .take(MAX_REMOVALS_PER_UPDATE)
                .collect();

            let mine = ClientHeartbeat {
                heartbeat_ms: now,
                expires_ms: expires_after.as_millis() as u64,
                num_atrs,
            };
            let mut specs = vec![MutateInSpec::upsert_xattr(
                format!("{}.{}", CLIENTS_PATH, self.client_id),
                json!(mine),
            )];
            specs.extend(
                stale
                    .iter()
                    .map(|id| MutateInSpec::remove_xattr(format!("{}.{}", CLIENTS_PATH, id))),
            );

            self.hooks.before_update_record(&self.id.location.bucket).await?;
            let result = self
                .op("client_record_update")
                .run(self.store.mutate_in(&self.id, &specs, &MutateOptions::with_cas(cas)))
                .await;
            match result {
                Ok(_) => {}
                Err(StoreError::CasMismatch(_)) | Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }

            let mut active: Vec<&String> = clients
                .iter()
                .filter(|(id, hb)| **id != self.client_id && !hb.is_stale(now))
                .map(|(id, _)| id)
                .collect();
            active.push(&self.client_id);
            active.sort();
            let index = active
                .iter()
                .position(|id| **id == self.client_id)
                .unwrap_or_default();

            if !stale.is_empty() {
                info!(
                    location = %self.id.location,
                    removed = stale.len(),
                    "Removed stale lost-cleanup clients"
                );
            }
            debug!(
                location = %self.id.location,
                client_id = %self.client_id,
                index,
                active = active.len(),
                "Lost-cleanup client heartbeat"
            );
            return Ok(ClientAssignment {
                index,
                active_clients: active.len(),
                removed_clients: stale,
            });
        }
        Err(StoreError::CasMismatch(self.id.key.clone()).into())
    }

    /// Remove this client from the record
    pub async fn remove(&self) -> Result<()> {
        self.hooks.before_remove_client(&self.id.location.bucket).await?;
        let specs = [MutateInSpec::remove_xattr(format!(
            "{}.{}",
            CLIENTS_PATH, self.client_id
        ))];
        match self
            .op("client_record_remove")
            .run(self.store.mutate_in(&self.id, &specs, &MutateOptions::default()))
            .await
        {
            Ok(_) | Err(StoreError::NotFound(_)) | Err(StoreError::PathNotFound(_)) => {
                debug!(location = %self.id.location, client_id = %self.client_id, "Removed client from record");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
