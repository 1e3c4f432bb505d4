//! Lost-transaction sweeper
//!
//! The safety net for attempts whose client vanished before its own cleanup
//! queue could finish them. One loop runs per watched location:
//!
//! 1. heartbeat the location's client record and compute the owned shards
//! 2. for each owned shard, list the ATR entries and finalize the expired ones
//! 3. pace the shards so one pass over them takes roughly one cleanup window
//!
//! Locations are added when the sweeper starts (configured cleanup
//! locations) and whenever an attempt creates an ATR somewhere new.

use crate::atr::{atr_key, AtrLocation, AtrStore};
use crate::cleanup::client_record::ClientRecord;
use crate::cleanup::{Cleaner, CleanupOutcome, CleanupRequest};
use crate::config::DurabilityLevel;
use crate::error::Result;
use crate::hooks::ClientRecordHooks;
use crate::storage::{DocumentLocation, StoreRegistry};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shortest pause between two shard scans
const MIN_SHARD_PACE: Duration = Duration::from_millis(1);

/// Counts from a single pass over a location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub shards_checked: usize,
    pub attempts_found: usize,
    pub attempts_cleaned: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.shards_checked += other.shards_checked;
        self.attempts_found += other.attempts_found;
        self.attempts_cleaned += other.attempts_cleaned;
    }
}

/// Settings for [`LostCleanup`]
#[derive(Debug, Clone)]
pub struct LostCleanupSettings {
    pub window: Duration,
    pub client_staleness: Duration,
    pub num_atrs: u32,
    pub kv_timeout: Duration,
}

/// Periodic sweeper of expired ATR entries
pub struct LostCleanup {
    client_id: String,
    registry: Arc<StoreRegistry>,
    cleaner: Arc<Cleaner>,
    settings: LostCleanupSettings,
    hooks: Arc<dyn ClientRecordHooks>,
    locations: DashMap<DocumentLocation, ()>,
    tx: mpsc::UnboundedSender<DocumentLocation>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DocumentLocation>>>,
}

impl LostCleanup {
    pub fn new(
        registry: Arc<StoreRegistry>,
        cleaner: Arc<Cleaner>,
        settings: LostCleanupSettings,
        hooks: Arc<dyn ClientRecordHooks>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            registry,
            cleaner,
            settings,
            hooks,
            locations: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Identity of this sweeper in client records
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Start watching `location`; false if it was already watched
    pub fn add_location(&self, location: DocumentLocation) -> bool {
        if self.locations.insert(location.clone(), ()).is_some() {
            return false;
        }
        debug!(%location, "Watching location for lost transactions");
        // Only fails once the supervisor is gone, i.e. after shutdown.
        let _ = self.tx.send(location);
        true
    }

    /// Every watched location
    pub fn locations(&self) -> Vec<DocumentLocation> {
        let mut locations: Vec<_> = self.locations.iter().map(|e| e.key().clone()).collect();
        locations.sort();
        locations
    }

    fn client_record(&self, location: &DocumentLocation) -> Result<ClientRecord> {
        let store = self.registry.resolve(&location.bucket)?;
        Ok(ClientRecord::new(
            store,
            location,
            self.client_id.clone(),
            self.settings.kv_timeout,
            Arc::clone(&self.hooks),
        ))
    }

    /// Heartbeat `location` and return the shards this client owns there
    async fn owned_shards(&self, location: &DocumentLocation) -> Result<Vec<u32>> {
        let assignment = self
            .client_record(location)?
            .heartbeat(self.settings.client_staleness, self.settings.num_atrs)
            .await?;
        Ok(assignment.owned_shards(self.settings.num_atrs))
    }

    /// Finalize every expired attempt in one shard
    async fn sweep_shard(&self, location: &DocumentLocation, shard: u32) -> Result<SweepReport> {
        let store = self.registry.resolve(&location.bucket)?;
        let atr_location = AtrLocation::new(location, atr_key(shard));
        let atr = AtrStore::new(
            Arc::clone(&store),
            atr_location.clone(),
            self.settings.kv_timeout,
            DurabilityLevel::None,
        );

        let mut report = SweepReport {
            shards_checked: 1,
            ..Default::default()
        };
        let now = store.now_ms();
        for (attempt_id, entry) in atr.list_entries().await? {
            if !entry.has_expired(now) {
                continue;
            }
            report.attempts_found += 1;
            let request =
                CleanupRequest::from_entry(attempt_id, atr_location.clone(), &entry, Instant::now());
            match self.cleaner.cleanup_attempt(&request, true).await {
                Ok(CleanupOutcome::NotExpired) | Ok(CleanupOutcome::NothingToDo) => {}
                Ok(outcome) => {
                    report.attempts_cleaned += 1;
                    info!(
                        attempt_id = %request.attempt_id,
                        atr = %atr_location,
                        ?outcome,
                        "Cleaned up lost attempt"
                    );
                    #[cfg(feature = "metrics")]
                    metrics::counter!("kvtxn_cleanup_lost_total").increment(1);
                }
                Err(e) => warn!(
                    attempt_id = %request.attempt_id,
                    atr = %atr_location,
                    error = %e,
                    "Lost attempt cleanup failed, will retry next pass"
                ),
            }
        }
        Ok(report)
    }

    /// Run one full pass over the shards this client owns in `location`
    pub async fn sweep_location_once(&self, location: &DocumentLocation) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for shard in self.owned_shards(location).await? {
            report.merge(self.sweep_shard(location, shard).await?);
        }
        Ok(report)
    }

    /// Spawn the supervisor; it stops once `shutdown` flips to true
    ///
    /// On shutdown every location loop is joined and this client is removed
    /// from each watched client record.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);
        let rx = sweeper.rx.lock().take();
        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                warn!("Lost-transaction sweeper already started");
                return;
            };
            info!(client_id = %sweeper.client_id, "Lost-transaction sweeper started");
            let mut loops = JoinSet::new();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    location = rx.recv() => {
                        let Some(location) = location else { break };
                        loops.spawn(Arc::clone(&sweeper).location_loop(location, shutdown.clone()));
                    }
                }
            }

            while loops.join_next().await.is_some() {}
            for location in sweeper.locations() {
                let removed = match sweeper.client_record(&location) {
                    Ok(record) => record.remove().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = removed {
                    warn!(%location, error = %e, "Failed to remove client from record");
                }
            }
            info!(client_id = %sweeper.client_id, "Lost-transaction sweeper stopped");
        })
    }

    async fn location_loop(self: Arc<Self>, location: DocumentLocation, mut shutdown: watch::Receiver<bool>) {
        info!(%location, "Sweeping location for lost transactions");
        'sweep: loop {
            let shards = match self.owned_shards(&location).await {
                Ok(shards) => shards,
                Err(e) => {
                    warn!(%location, error = %e, "Client record heartbeat failed");
                    if pause(&mut shutdown, self.settings.window).await {
                        break;
                    }
                    continue;
                }
            };
            if shards.is_empty() {
                if pause(&mut shutdown, self.settings.window).await {
                    break;
                }
                continue;
            }

            let pace = (self.settings.window / shards.len() as u32).max(MIN_SHARD_PACE);
            for shard in shards {
                match self.sweep_shard(&location, shard).await {
                    Ok(report) if report.attempts_found > 0 => {
                        debug!(%location, shard, found = report.attempts_found, "Swept shard");
                    }
                    Ok(_) => {}
                    Err(e) => debug!(%location, shard, error = %e, "Shard sweep failed"),
                }
                if pause(&mut shutdown, pace).await {
                    break 'sweep;
                }
            }
        }
        debug!(%location, "Location sweep stopped");
    }
}

/// Sleep for `duration`; true if shutdown was signalled meanwhile
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}

impl std::fmt::Debug for LostCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LostCleanup")
            .field("client_id", &self.client_id)
            .field("settings", &self.settings)
            .field("locations", &self.locations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::{AtrEntry, AttemptState, DocRef, StagedKind};
    use crate::hooks::DefaultHooks;
    use crate::storage::{DocumentStore, MemoryStore, NoStoreResolver};

    struct Fixture {
        store: Arc<MemoryStore>,
        sweeper: Arc<LostCleanup>,
        loc: DocumentLocation,
    }

    fn fixture(num_atrs: u32) -> Fixture {
        let store = Arc::new(MemoryStore::new("b"));
        let registry = Arc::new(StoreRegistry::new(Arc::new(NoStoreResolver)));
        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        registry.register(&dyn_store);
        let cleaner = Arc::new(Cleaner::new(
            Arc::clone(&registry),
            Duration::from_secs(1),
            Arc::new(DefaultHooks),
        ));
        let sweeper = Arc::new(LostCleanup::new(
            registry,
            cleaner,
            LostCleanupSettings {
                window: Duration::from_millis(50),
                client_staleness: Duration::from_secs(80),
                num_atrs,
                kv_timeout: Duration::from_secs(1),
            },
            Arc::new(DefaultHooks),
        ));
        Fixture {
            store,
            sweeper,
            loc: DocumentLocation::default_collection("b"),
        }
    }

    async fn seed_entry(f: &Fixture, shard: u32, attempt_id: &str, state: AttemptState) {
        let atr = AtrStore::new(
            f.store.clone(),
            AtrLocation::new(&f.loc, atr_key(shard)),
            Duration::from_secs(1),
            DurabilityLevel::None,
        );
        let template = AtrEntry::new("t", f.store.now_ms(), 1_000, DurabilityLevel::None);
        atr.stage_entry(
            attempt_id,
            &template,
            StagedKind::Insert,
            DocRef::from(&f.loc.doc("missing")),
            true,
        )
        .await
        .unwrap();
        if state == AttemptState::Committing {
            atr.transition(attempt_id, AttemptState::Staged, AttemptState::Committing)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_skips_unexpired_attempts() {
        let f = fixture(4);
        seed_entry(&f, 1, "a1", AttemptState::Staged).await;

        let report = f.sweeper.sweep_location_once(&f.loc).await.unwrap();
        assert_eq!(report.shards_checked, 4);
        assert_eq!(report.attempts_found, 0);
        assert!(f
            .store
            .raw_document(&f.loc.doc(atr_key(1)))
            .is_some());
    }

    #[tokio::test]
    async fn test_sweep_finishes_expired_attempts() {
        let f = fixture(4);
        seed_entry(&f, 1, "staged", AttemptState::Staged).await;
        seed_entry(&f, 3, "committing", AttemptState::Committing).await;
        f.store.advance_clock(Duration::from_secs(2));

        let report = f.sweeper.sweep_location_once(&f.loc).await.unwrap();
        assert_eq!(report.attempts_found, 2);
        assert_eq!(report.attempts_cleaned, 2);
        assert!(f.store.raw_document(&f.loc.doc(atr_key(1))).is_none());
        assert!(f.store.raw_document(&f.loc.doc(atr_key(3))).is_none());
    }

    #[tokio::test]
    async fn test_add_location_deduplicates() {
        let f = fixture(4);
        assert!(f.sweeper.add_location(f.loc.clone()));
        assert!(!f.sweeper.add_location(f.loc.clone()));
        assert_eq!(f.sweeper.locations(), vec![f.loc.clone()]);
    }

    #[tokio::test]
    async fn test_background_sweep_and_shutdown() {
        let f = fixture(2);
        seed_entry(&f, 0, "a1", AttemptState::Staged).await;
        f.store.advance_clock(Duration::from_secs(2));

        let (tx, rx) = watch::channel(false);
        let handle = f.sweeper.start(rx);
        f.sweeper.add_location(f.loc.clone());

        for _ in 0..100 {
            if f.store.raw_document(&f.loc.doc(atr_key(0))).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.store.raw_document(&f.loc.doc(atr_key(0))).is_none());

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let record = f
            .store
            .raw_document(&f.loc.doc(crate::cleanup::client_record::CLIENT_RECORD_KEY))
            .unwrap();
        assert_eq!(record.xattrs["records"]["clients"], serde_json::json!({}));
    }
}
