//! Attempt state machine states
//!
//! An attempt moves through these states strictly forward:
//!
//! ```text
//! Pending ──▶ Staged ──▶ Committing ──▶ Committed
//!                │
//!                └─────▶ RollingBack ──▶ RolledBack
//! ```
//!
//! `Pending` only exists in memory; the ATR entry is created directly in
//! `Staged` by the first staging write. `Committing` is the commit point.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// State of one transaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    /// Attempt has begun but staged nothing
    Pending,
    /// At least one mutation is staged
    Staged,
    /// Commit point reached; documents are being unstaged
    Committing,
    /// Every staged mutation is applied
    Committed,
    /// Staged mutations are being discarded
    RollingBack,
    /// Every staged mutation is discarded
    RolledBack,
}

impl AttemptState {
    /// Check whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (Pending, Staged)
                | (Pending, Committed)
                | (Pending, RolledBack)
                | (Staged, Committing)
                | (Staged, RollingBack)
                | (Committing, Committed)
                | (RollingBack, RolledBack)
        )
    }

    /// Check if this state allows staging more mutations
    pub fn can_stage(&self) -> bool {
        matches!(self, AttemptState::Pending | AttemptState::Staged)
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Committed | AttemptState::RolledBack)
    }

    /// Check if the commit point has been passed
    pub fn is_committed(&self) -> bool {
        matches!(self, AttemptState::Committing | AttemptState::Committed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "PENDING",
            AttemptState::Staged => "STAGED",
            AttemptState::Committing => "COMMITTING",
            AttemptState::Committed => "COMMITTED",
            AttemptState::RollingBack => "ROLLING_BACK",
            AttemptState::RolledBack => "ROLLED_BACK",
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AttemptState::Pending),
            "STAGED" => Ok(AttemptState::Staged),
            "COMMITTING" => Ok(AttemptState::Committing),
            "COMMITTED" => Ok(AttemptState::Committed),
            "ROLLING_BACK" => Ok(AttemptState::RollingBack),
            "ROLLED_BACK" => Ok(AttemptState::RolledBack),
            other => Err(format!("unknown attempt state '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [AttemptState; 6] = [
        AttemptState::Pending,
        AttemptState::Staged,
        AttemptState::Committing,
        AttemptState::Committed,
        AttemptState::RollingBack,
        AttemptState::RolledBack,
    ];

    #[test]
    fn test_forward_edges() {
        assert!(AttemptState::Pending.can_transition_to(AttemptState::Staged));
        assert!(AttemptState::Staged.can_transition_to(AttemptState::Committing));
        assert!(AttemptState::Committing.can_transition_to(AttemptState::Committed));
        assert!(AttemptState::Staged.can_transition_to(AttemptState::RollingBack));
        assert!(AttemptState::RollingBack.can_transition_to(AttemptState::RolledBack));
    }

    #[test]
    fn test_no_edge_after_commit_point_leads_to_rollback() {
        assert!(!AttemptState::Committing.can_transition_to(AttemptState::RollingBack));
        assert!(!AttemptState::Committed.can_transition_to(AttemptState::RollingBack));
        assert!(!AttemptState::RollingBack.can_transition_to(AttemptState::Committing));
    }

    #[test]
    fn test_terminal_states_have_no_successor() {
        for state in ALL.iter().filter(|s| s.is_terminal()) {
            assert!(ALL.iter().all(|next| !state.can_transition_to(*next)));
        }
    }

    #[test]
    fn test_display_and_parse_agree() {
        for state in ALL {
            assert_eq!(state.to_string().parse::<AttemptState>(), Ok(state));
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, serde_json::Value::String(state.to_string()));
        }
        assert!("ABORTED".parse::<AttemptState>().is_err());
    }
}
