//! Item states and the legal transition table.
//!
//! Every state is a folder directly under the vault root. An item's state is
//! its physical location, so the only way to change state is to move the file.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The folder-backed states an item can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Raw drops, not yet turned into actionable items
    Inbox,

    /// Waiting for the orchestrator
    NeedsAction,

    /// Sensitive action waiting for a human decision
    PendingApproval,

    /// Authorized by a human, ready to execute
    Approved,

    /// Terminal, retained for audit
    Done,

    /// Malformed, never processed
    Quarantine,
}

impl ItemState {
    /// All states, in lifecycle order
    pub const ALL: [ItemState; 6] = [
        ItemState::Inbox,
        ItemState::NeedsAction,
        ItemState::PendingApproval,
        ItemState::Approved,
        ItemState::Done,
        ItemState::Quarantine,
    ];

    /// Folder name under the vault root
    pub fn folder(&self) -> &'static str {
        match self {
            Self::Inbox => "Inbox",
            Self::NeedsAction => "Needs_Action",
            Self::PendingApproval => "Pending_Approval",
            Self::Approved => "Approved",
            Self::Done => "Done",
            Self::Quarantine => "Quarantine",
        }
    }

    /// Parse a folder name back into a state
    pub fn from_folder(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.folder() == name)
    }

    /// Whether `self -> to` is a legal move.
    ///
    /// `Pending_Approval -> Approved` is the human's move; everything else is
    /// made by the watcher, orchestrator or agent.
    pub fn can_transition_to(&self, to: ItemState) -> bool {
        use ItemState::*;

        matches!(
            (self, to),
            (Inbox, NeedsAction)
                | (Inbox, Quarantine)
                | (NeedsAction, PendingApproval)
                | (NeedsAction, Done)
                | (NeedsAction, Quarantine)
                | (PendingApproval, Approved)
                | (PendingApproval, Quarantine)
                | (Approved, Done)
                | (Approved, Quarantine)
        )
    }

    /// Position in the lifecycle order `Inbox → Needs_Action → Pending_Approval → Approved → Done`.
    /// Quarantine sits outside the order.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Inbox => Some(0),
            Self::NeedsAction => Some(1),
            Self::PendingApproval => Some(2),
            Self::Approved => Some(3),
            Self::Done => Some(4),
            Self::Quarantine => None,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(state) = Self::from_folder(s) {
            return Ok(state);
        }

        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "inbox" => Ok(Self::Inbox),
            "needs_action" => Ok(Self::NeedsAction),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "done" => Ok(Self::Done),
            "quarantine" => Ok(Self::Quarantine),
            other => Err(format!("Unknown item state: {}", other)),
        }
    }
}

/// Check that a sequence of observed states follows the lifecycle order.
///
/// Returns false when a state appears out of order, when `Approved` does not
/// directly follow `Pending_Approval`, or when `Done` is reached without passing
/// through `Needs_Action` (approval requests created straight in
/// `Pending_Approval` count as spawned by a `Needs_Action` item and are exempt).
pub fn is_legal_history(states: &[ItemState]) -> bool {
    let mut last_rank: Option<u8> = None;
    let mut seen_actionable = false;

    for state in states {
        let Some(rank) = state.rank() else {
            // Quarantine may follow anything, but nothing may follow it
            return states.last() == Some(state);
        };

        if let Some(prev) = last_rank {
            if rank <= prev {
                return false;
            }
        }
        if *state == ItemState::Approved && last_rank != ItemState::PendingApproval.rank() {
            return false;
        }

        if matches!(state, ItemState::NeedsAction | ItemState::PendingApproval) {
            seen_actionable = true;
        }

        if *state == ItemState::Done && !seen_actionable {
            return false;
        }

        last_rank = Some(rank);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_names_roundtrip() {
        for state in ItemState::ALL {
            assert_eq!(ItemState::from_folder(state.folder()), Some(state));
        }
        assert_eq!(ItemState::from_folder("Logs"), None);
    }

    #[test]
    fn test_transition_table() {
        use ItemState::*;

        assert!(NeedsAction.can_transition_to(Done));
        assert!(NeedsAction.can_transition_to(PendingApproval));
        assert!(PendingApproval.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Done));

        assert!(!PendingApproval.can_transition_to(Done));
        assert!(!Done.can_transition_to(NeedsAction));
        assert!(!Approved.can_transition_to(PendingApproval));
        assert!(!Quarantine.can_transition_to(NeedsAction));
    }

    #[test]
    fn test_parse_state() {
        assert_eq!("needs_action".parse::<ItemState>().unwrap(), ItemState::NeedsAction);
        assert_eq!("Pending_Approval".parse::<ItemState>().unwrap(), ItemState::PendingApproval);
        assert!("archive".parse::<ItemState>().is_err());
    }

    #[test]
    fn test_legal_history() {
        use ItemState::*;

        assert!(is_legal_history(&[NeedsAction, Done]));
        assert!(is_legal_history(&[Inbox, NeedsAction, PendingApproval, Approved, Done]));
        assert!(is_legal_history(&[PendingApproval, Approved, Done]));
        assert!(is_legal_history(&[NeedsAction, Quarantine]));

        assert!(!is_legal_history(&[Done]));
        assert!(!is_legal_history(&[Approved, Done]));
        assert!(!is_legal_history(&[NeedsAction, Approved, Done]));
        assert!(!is_legal_history(&[NeedsAction, Done, Approved]));
        assert!(!is_legal_history(&[Quarantine, NeedsAction]));
    }
}
