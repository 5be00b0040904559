//! Job state machine (spec section 4.7).
//!
//! Grounded line-for-line on `examples/original_source/src/job_state_machine.cpp`:
//! the same five states, the same transition table, and the same
//! "self-transition is always allowed" rule.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Mirrors `JobStateMachine::IsTransitionAllowed`: a self-transition is
    /// always legal, PENDING may go to RUNNING/CANCELLED/FAILED, RUNNING may
    /// go to COMPLETED/FAILED/CANCELLED, and terminal states accept nothing
    /// else (including each other).
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if *self == next {
            return true;
        }
        match self {
            JobState::Pending => matches!(next, JobState::Running | JobState::Cancelled | JobState::Failed),
            JobState::Running => matches!(next, JobState::Completed | JobState::Failed | JobState::Cancelled),
            JobState::Completed | JobState::Failed | JobState::Cancelled => false,
        }
    }

    pub fn valid_next_states(&self) -> BTreeSet<JobState> {
        [
            JobState::Pending,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ]
        .into_iter()
        .filter(|s| self.can_transition_to(*s))
        .collect()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(format!("invalid job state string: {other}")),
        }
    }
}

/// Attempts a transition, rejecting illegal ones. This is the single choke
/// point every job-owning component must route state writes through (spec:
/// "All job-owning components route writes through this machine").
pub fn transition(current: JobState, next: JobState) -> Result<JobState, IllegalTransition> {
    if current.can_transition_to(next) {
        Ok(next)
    } else {
        Err(IllegalTransition { from: current, to: next })
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("illegal job state transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: JobState,
    pub to: JobState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_allows_running_cancelled_failed() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Pending.can_transition_to(JobState::Cancelled));
        assert!(JobState::Pending.can_transition_to(JobState::Failed));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
    }

    #[test]
    fn running_allows_terminal_states_only() {
        assert!(JobState::Running.can_transition_to(JobState::Completed));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
    }

    #[test]
    fn terminal_states_reject_everything_but_self() {
        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            assert!(terminal.can_transition_to(terminal));
            for other in [JobState::Pending, JobState::Running] {
                assert!(!terminal.can_transition_to(other));
            }
            for other in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
                if other != terminal {
                    assert!(!terminal.can_transition_to(other));
                }
            }
        }
    }

    #[test]
    fn completed_cannot_become_cancelled() {
        // Once the writer claims COMPLETED, a late cancellation is lost.
        assert!(!JobState::Completed.can_transition_to(JobState::Cancelled));
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        assert!(transition(JobState::Completed, JobState::Running).is_err());
        assert!(transition(JobState::Pending, JobState::Running).is_ok());
    }

    #[test]
    fn is_terminal_matches_transition_table() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }
}
