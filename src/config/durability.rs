//! Durability levels for transactional writes

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Durability level required for every write an attempt makes
///
/// Level-based durability is acknowledged by the store as part of the
/// mutation itself, bounded by the durability timeout of the request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurabilityLevel {
    /// Acknowledged once the active node has the write in memory
    None,
    /// Replicated to a majority of nodes
    #[default]
    Majority,
    /// Replicated to a majority and persisted on the active node
    MajorityAndPersistToActive,
    /// Persisted on a majority of nodes
    PersistToMajority,
}

impl DurabilityLevel {
    /// Whether the store must acknowledge durability before completing
    pub fn is_durable(&self) -> bool {
        !matches!(self, DurabilityLevel::None)
    }

    /// Short form stored in ATR entries
    pub fn as_short(&self) -> &'static str {
        match self {
            DurabilityLevel::None => "n",
            DurabilityLevel::Majority => "m",
            DurabilityLevel::MajorityAndPersistToActive => "pa",
            DurabilityLevel::PersistToMajority => "pm",
        }
    }

    /// Parse the short form stored in ATR entries
    pub fn from_short(s: &str) -> Option<Self> {
        match s {
            "n" => Some(DurabilityLevel::None),
            "m" => Some(DurabilityLevel::Majority),
            "pa" => Some(DurabilityLevel::MajorityAndPersistToActive),
            "pm" => Some(DurabilityLevel::PersistToMajority),
            _ => None,
        }
    }
}

impl FromStr for DurabilityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(DurabilityLevel::None),
            "MAJORITY" => Ok(DurabilityLevel::Majority),
            "MAJORITY_AND_PERSIST_TO_ACTIVE" => Ok(DurabilityLevel::MajorityAndPersistToActive),
            "PERSIST_TO_MAJORITY" => Ok(DurabilityLevel::PersistToMajority),
            _ => Err(format!(
                "Invalid durability level '{}'. Valid options: NONE, MAJORITY, \
                 MAJORITY_AND_PERSIST_TO_ACTIVE, PERSIST_TO_MAJORITY",
                s
            )),
        }
    }
}

impl std::fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurabilityLevel::None => write!(f, "NONE"),
            DurabilityLevel::Majority => write!(f, "MAJORITY"),
            DurabilityLevel::MajorityAndPersistToActive => {
                write!(f, "MAJORITY_AND_PERSIST_TO_ACTIVE")
            }
            DurabilityLevel::PersistToMajority => write!(f, "PERSIST_TO_MAJORITY"),
        }
    }
}
