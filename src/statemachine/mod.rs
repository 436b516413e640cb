//! Pure state machine governing `Task` and `SubTask` status transitions.
//!
//! Holds no per-entity state itself: callers persist the current status on
//! the entity and call [`transition`] or [`transition_or_throw`] to validate
//! a move. Both `Task` and `SubTask` share this status set; a `SubTask`
//! simply never enters `MERGING` in practice.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the eight statuses a `Task` or `SubTask` can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Extracting,
    Downloading,
    Merging,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

impl Status {
    /// True for the four statuses from which no further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Cancelled | Status::NotFound
        )
    }

    /// The exact directed edges allowed out of this status. Same-state
    /// transitions are always allowed regardless of this table (idempotent).
    fn allowed_targets(self) -> &'static [Status] {
        match self {
            Status::Queued => &[Status::Extracting, Status::Cancelled, Status::Failed],
            Status::Extracting => &[
                Status::Downloading,
                Status::Failed,
                Status::Cancelled,
                Status::NotFound,
            ],
            Status::Downloading => &[
                Status::Merging,
                Status::Completed,
                Status::Failed,
                Status::Cancelled,
            ],
            Status::Merging => &[Status::Completed, Status::Failed, Status::Cancelled],
            Status::Completed | Status::Failed | Status::Cancelled | Status::NotFound => &[],
        }
    }

    pub fn can_transition_to(self, target: Status) -> bool {
        if target == self {
            return true;
        }
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Queued => "QUEUED",
            Status::Extracting => "EXTRACTING",
            Status::Downloading => "DOWNLOADING",
            Status::Merging => "MERGING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Cancelled => "CANCELLED",
            Status::NotFound => "NOT_FOUND",
        };
        write!(f, "{s}")
    }
}

/// Raised by [`transition_or_throw`] when the caller attempts an illegal
/// move. This is a programmer error, not a domain `DownloadResult` — callers
/// that hit it have already violated an invariant elsewhere.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal transition for {entity_id}: {from} -> {to}")]
pub struct IllegalTransition {
    pub entity_id: String,
    pub from: Status,
    pub to: Status,
}

/// Returns the resulting status: `target` if the move is legal, otherwise
/// `current` unchanged (rejection is silent — use [`transition_or_throw`]
/// when an illegal move should be treated as a bug).
pub fn transition(current: Status, target: Status) -> Status {
    if current.can_transition_to(target) {
        target
    } else {
        current
    }
}

/// Like [`transition`] but fails loudly on an illegal move, carrying the
/// entity id for diagnostics.
pub fn transition_or_throw(
    entity_id: &str,
    current: Status,
    target: Status,
) -> Result<Status, IllegalTransition> {
    if current.can_transition_to(target) {
        Ok(target)
    } else {
        Err(IllegalTransition {
            entity_id: entity_id.to_string(),
            from: current,
            to: target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_state_transitions_are_always_allowed() {
        for s in [
            Status::Queued,
            Status::Extracting,
            Status::Downloading,
            Status::Merging,
            Status::Completed,
            Status::Failed,
            Status::Cancelled,
            Status::NotFound,
        ] {
            assert!(s.can_transition_to(s), "{s} -> {s} must be idempotent");
            assert_eq!(transition(s, s), s);
        }
    }

    #[test]
    fn terminal_states_accept_nothing_else() {
        for s in [
            Status::Completed,
            Status::Failed,
            Status::Cancelled,
            Status::NotFound,
        ] {
            assert!(s.is_terminal());
            for target in [Status::Queued, Status::Extracting, Status::Downloading] {
                assert!(!s.can_transition_to(target));
            }
        }
    }

    #[test]
    fn queued_transition_table() {
        assert!(Status::Queued.can_transition_to(Status::Extracting));
        assert!(Status::Queued.can_transition_to(Status::Cancelled));
        assert!(Status::Queued.can_transition_to(Status::Failed));
        assert!(!Status::Queued.can_transition_to(Status::Completed));
        assert!(!Status::Queued.can_transition_to(Status::Downloading));
        assert!(!Status::Queued.can_transition_to(Status::Merging));
    }

    #[test]
    fn extracting_transition_table() {
        assert!(Status::Extracting.can_transition_to(Status::Downloading));
        assert!(Status::Extracting.can_transition_to(Status::Failed));
        assert!(Status::Extracting.can_transition_to(Status::Cancelled));
        assert!(Status::Extracting.can_transition_to(Status::NotFound));
        assert!(!Status::Extracting.can_transition_to(Status::Merging));
        assert!(!Status::Extracting.can_transition_to(Status::Completed));
    }

    #[test]
    fn downloading_transition_table() {
        assert!(Status::Downloading.can_transition_to(Status::Merging));
        assert!(Status::Downloading.can_transition_to(Status::Completed));
        assert!(Status::Downloading.can_transition_to(Status::Failed));
        assert!(Status::Downloading.can_transition_to(Status::Cancelled));
        assert!(!Status::Downloading.can_transition_to(Status::NotFound));
        assert!(!Status::Downloading.can_transition_to(Status::Extracting));
    }

    #[test]
    fn merging_transition_table() {
        assert!(Status::Merging.can_transition_to(Status::Completed));
        assert!(Status::Merging.can_transition_to(Status::Failed));
        assert!(Status::Merging.can_transition_to(Status::Cancelled));
        assert!(!Status::Merging.can_transition_to(Status::NotFound));
        assert!(!Status::Merging.can_transition_to(Status::Downloading));
    }

    #[test]
    fn illegal_transition_is_rejected_and_state_unchanged() {
        let result = transition(Status::Queued, Status::Completed);
        assert_eq!(result, Status::Queued);

        let err = transition_or_throw("task-1", Status::Queued, Status::Completed)
            .expect_err("QUEUED -> COMPLETED must be illegal");
        assert_eq!(err.entity_id, "task-1");
        assert_eq!(err.from, Status::Queued);
        assert_eq!(err.to, Status::Completed);
    }

    #[test]
    fn transition_or_throw_accepts_legal_moves() {
        let result = transition_or_throw("task-1", Status::Queued, Status::Extracting);
        assert_eq!(result.unwrap(), Status::Extracting);
    }
}
