// src/job/state.rs

//! The finite-state model of one job instance.
//!
//! States and the transition table:
//!
//! ```text
//! NONE ──► CREATED ──► PENDING ──► RUNNING ──► COMPLETED
//!             │           │          │    └──► FAILED
//!             │           │          ├────────► STOPPED
//!             │           │          └────────► INTERRUPTED
//!             ├──────────►┘ (latched creation only)
//!             └──► DISABLED
//! any non-terminal ──► UNKNOWN
//! ```
//!
//! `COMPLETED, FAILED, STOPPED, INTERRUPTED, DISABLED, UNKNOWN` are
//! terminal: no transition ever leaves them. `PENDING` additionally allows
//! STOPPED / INTERRUPTED / FAILED so a latched instance can be terminated
//! (or fail to launch) before its process ever starts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State of a job instance at a point in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    None,
    Created,
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Interrupted,
    Disabled,
    Unknown,
}

impl RunState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::Failed
                | RunState::Stopped
                | RunState::Interrupted
                | RunState::Disabled
                | RunState::Unknown
        )
    }

    /// Failure-classified terminal states.
    ///
    /// INTERRUPTED counts as a failure regardless of the underlying
    /// process's own exit code; STOPPED and DISABLED do not.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RunState::Failed | RunState::Interrupted | RunState::Unknown
        )
    }

    /// Whether the instance has (or had) a running process in this state.
    pub fn is_executing(self) -> bool {
        self == RunState::Running
    }

    /// Whether the transition `self -> next` is allowed by the table.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;

        if self.is_terminal() || next == self || next == None {
            return false;
        }
        // UNKNOWN is the fallback for any non-terminal state whose next
        // consistent transition cannot be determined.
        if next == Unknown {
            return true;
        }
        matches!(
            (self, next),
            (None, Created)
                | (Created, Pending)
                | (Created, Disabled)
                | (Created, Running)
                | (Created, Failed)
                | (Pending, Running)
                | (Pending, Stopped)
                | (Pending, Interrupted)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
                | (Running, Interrupted)
        )
    }

    /// Canonical uppercase name, as used on the wire and in history rows.
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::None => "NONE",
            RunState::Created => "CREATED",
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Stopped => "STOPPED",
            RunState::Interrupted => "INTERRUPTED",
            RunState::Disabled => "DISABLED",
            RunState::Unknown => "UNKNOWN",
        }
    }

    /// All states, in declaration order.
    pub fn all() -> [RunState; 10] {
        use RunState::*;
        [
            None,
            Created,
            Pending,
            Running,
            Completed,
            Failed,
            Stopped,
            Interrupted,
            Disabled,
            Unknown,
        ]
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = std::convert::Infallible;

    /// Unrecognised names parse to UNKNOWN, so reading rows written by a
    /// newer schema never fails.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_uppercase().as_str() {
            "NONE" => RunState::None,
            "CREATED" => RunState::Created,
            "PENDING" => RunState::Pending,
            "RUNNING" => RunState::Running,
            "COMPLETED" => RunState::Completed,
            "FAILED" => RunState::Failed,
            "STOPPED" => RunState::Stopped,
            "INTERRUPTED" => RunState::Interrupted,
            "DISABLED" => RunState::Disabled,
            _ => RunState::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::RunState;
    use super::RunState::*;

    #[test]
    fn terminal_states_allow_no_transitions() {
        for from in RunState::all() {
            if !from.is_terminal() {
                continue;
            }
            for to in RunState::all() {
                assert!(
                    !from.can_transition_to(to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn table_matches_expected_edges() {
        assert!(None.can_transition_to(Created));
        assert!(Created.can_transition_to(Pending));
        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Disabled));
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Stopped));
        assert!(Pending.can_transition_to(Interrupted));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Interrupted));

        assert!(!None.can_transition_to(Running));
        assert!(!Created.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Disabled));
    }

    #[test]
    fn unknown_reachable_from_any_non_terminal() {
        for from in RunState::all() {
            assert_eq!(from.can_transition_to(Unknown), !from.is_terminal());
        }
    }

    #[test]
    fn none_is_never_revisited() {
        for from in RunState::all() {
            assert!(!from.can_transition_to(None));
        }
    }

    #[test]
    fn names_round_trip() {
        for state in RunState::all() {
            let parsed: RunState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        let unknown: RunState = "SOME_FUTURE_STATE".parse().unwrap();
        assert_eq!(unknown, Unknown);
    }

    fn any_state() -> impl Strategy<Value = RunState> {
        proptest::sample::select(RunState::all().to_vec())
    }

    proptest! {
        /// Walking arbitrary transition sequences through the table never
        /// leaves a terminal state and never re-enters NONE.
        #[test]
        fn random_walks_respect_terminality(steps in proptest::collection::vec(any_state(), 1..32)) {
            let mut current = None;
            let mut terminal_seen = false;
            for next in steps {
                if current.can_transition_to(next) {
                    prop_assert!(!terminal_seen, "left a terminal state");
                    prop_assert!(next != None, "re-entered NONE");
                    current = next;
                    terminal_seen = current.is_terminal();
                }
            }
        }
    }
}
