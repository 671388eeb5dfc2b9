use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Idle,
    Working,
    Approval,
    Error,
    Shutdown,
}

impl SessionStatus {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `error` and `shutdown` are reachable from every state. Staying in the
    /// same state is not a transition and returns false.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self == next {
            return false;
        }

        matches!(
            (self, next),
            (_, Error)
                | (_, Shutdown)
                | (Starting, Idle)
                | (Idle, Working)
                | (Working, Idle)
                | (Working, Approval)
                | (Approval, Working)
        )
    }

    /// Counted against pool capacity
    pub fn is_live(self) -> bool {
        self != SessionStatus::Shutdown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Idle => "idle",
            SessionStatus::Working => "working",
            SessionStatus::Approval => "approval",
            SessionStatus::Error => "error",
            SessionStatus::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::SessionStatus::*;
    use super::*;

    const ALL: [SessionStatus; 6] = [Starting, Idle, Working, Approval, Error, Shutdown];

    #[test]
    fn test_error_and_shutdown_reachable_from_everywhere() {
        for from in ALL {
            if from != Error {
                assert!(from.can_transition_to(Error), "{from} -> error");
            }
            if from != Shutdown {
                assert!(from.can_transition_to(Shutdown), "{from} -> shutdown");
            }
        }
    }

    #[test]
    fn test_out_of_graph_transitions_rejected() {
        assert!(!Starting.can_transition_to(Working));
        assert!(!Idle.can_transition_to(Approval));
        assert!(!Approval.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Idle));
        assert!(!Shutdown.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn test_work_cycle() {
        assert!(Starting.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Working));
        assert!(Working.can_transition_to(Approval));
        assert!(Approval.can_transition_to(Working));
        assert!(Working.can_transition_to(Idle));
    }

    #[test]
    fn test_wire_name_matches_display() {
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }
}
