//! Work items for the cleanup subsystems

use crate::atr::{AtrEntry, AtrLocation, AttemptState, StagedKind};
use crate::config::DurabilityLevel;
use crate::storage::DocumentId;
use std::time::Duration;
use tokio::time::Instant;

/// An attempt that still needs to be finalized
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupRequest {
    pub attempt_id: String,
    pub transaction_id: String,
    pub atr: AtrLocation,
    /// State last known to the enqueuer; cleanup always re-reads the ATR
    pub state: AttemptState,
    pub docs: Vec<(DocumentId, StagedKind)>,
    pub durability: DurabilityLevel,
    /// Earliest time the queue may act on this request
    pub ready_at: Instant,
    pub retries: u32,
}

impl CleanupRequest {
    /// Build a request from an ATR entry discovered by a scan
    pub fn from_entry(
        attempt_id: impl Into<String>,
        atr: AtrLocation,
        entry: &AtrEntry,
        ready_at: Instant,
    ) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            transaction_id: entry.transaction_id.clone(),
            atr,
            state: entry.state,
            docs: entry
                .docs()
                .map(|(kind, doc)| (doc.document_id(), kind))
                .collect(),
            durability: entry.durability_level(),
            ready_at,
            retries: 0,
        }
    }

    /// Requeue after a transient failure
    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.retries += 1;
        self.ready_at = Instant::now() + delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::DocRef;
    use crate::storage::DocumentLocation;

    #[test]
    fn test_from_entry_lists_every_doc() {
        let loc = DocumentLocation::default_collection("b");
        let mut entry = AtrEntry::new("t1", 0, 1_000, DurabilityLevel::PersistToMajority);
        entry.add_doc(StagedKind::Insert, DocRef::from(&loc.doc("a")));
        entry.add_doc(StagedKind::Remove, DocRef::from(&loc.doc("b")));

        let req = CleanupRequest::from_entry("a1", AtrLocation::new(&loc, "_txn:atr-1"), &entry, Instant::now());
        assert_eq!(req.transaction_id, "t1");
        assert_eq!(req.durability, DurabilityLevel::PersistToMajority);
        assert_eq!(
            req.docs,
            vec![(loc.doc("a"), StagedKind::Insert), (loc.doc("b"), StagedKind::Remove)]
        );

        let retried = req.retry_after(Duration::from_millis(10));
        assert_eq!(retried.retries, 1);
    }
}
