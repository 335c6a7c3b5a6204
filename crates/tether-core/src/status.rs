//! Core and request lifecycles

use std::fmt;

/// Status of a helper core as tracked by the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoreStatus {
    /// Configured, no trust established yet
    Initialized,
    /// Handshake in progress
    Handshaking,
    /// Trusted and idle
    Trusted,
    /// Trusted with work in flight
    Busy,
    /// Failed consecutive health probes
    Unresponsive,
    /// Load above the configured ceiling
    Overloaded,
    /// Shut down
    Closed,
}

impl CoreStatus {
    /// Whether the dispatcher may pick this core for new work
    pub fn is_selectable(self) -> bool {
        matches!(self, CoreStatus::Trusted | CoreStatus::Busy)
    }

    /// Whether this core can no longer be reached
    pub fn is_unavailable(self) -> bool {
        matches!(self, CoreStatus::Unresponsive | CoreStatus::Closed)
    }
}

impl fmt::Display for CoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoreStatus::Initialized => "initialized",
            CoreStatus::Handshaking => "handshaking",
            CoreStatus::Trusted => "trusted",
            CoreStatus::Busy => "busy",
            CoreStatus::Unresponsive => "unresponsive",
            CoreStatus::Overloaded => "overloaded",
            CoreStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Status of a dispatched request
///
/// Transitions are monotonic: `Pending → InFlight → {Completed, Failed, TimedOut}`.
/// A request that never left `Pending` may fail directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
    TimedOut,
}

impl RequestStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::TimedOut
        )
    }

    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::InFlight => 1,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::TimedOut => 2,
        }
    }

    /// Check whether moving to `next` respects the lifecycle
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InFlight => "in-flight",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use RequestStatus::*;

    const ALL: [RequestStatus; 5] = [Pending, InFlight, Completed, Failed, TimedOut];

    #[test]
    fn test_request_lifecycle_is_monotonic() {
        assert!(Pending.can_transition_to(InFlight));
        assert!(Pending.can_transition_to(Failed));
        assert!(InFlight.can_transition_to(Completed));
        assert!(InFlight.can_transition_to(TimedOut));

        assert!(!InFlight.can_transition_to(Pending));
        assert!(!InFlight.can_transition_to(InFlight));
        for terminal in [Completed, Failed, TimedOut] {
            for next in [Pending, InFlight, Completed, Failed, TimedOut] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_selectable_statuses() {
        assert!(CoreStatus::Trusted.is_selectable());
        assert!(CoreStatus::Busy.is_selectable());
        assert!(!CoreStatus::Initialized.is_selectable());
        assert!(!CoreStatus::Overloaded.is_selectable());
        assert!(!CoreStatus::Unresponsive.is_selectable());
        assert!(CoreStatus::Closed.is_unavailable());
    }

    proptest! {
        #[test]
        fn prop_settles_at_most_once(attempts in proptest::collection::vec(proptest::sample::select(ALL.to_vec()), 0..32)) {
            let mut status = Pending;
            let mut applied = 0;
            let mut settled = None;
            for next in attempts {
                if status.can_transition_to(next) {
                    prop_assert!(next.rank() > status.rank());
                    status = next;
                    applied += 1;
                }
                if status.is_terminal() {
                    // The first terminal status sticks
                    prop_assert_eq!(*settled.get_or_insert(status), status);
                }
            }
            prop_assert!(applied <= 2);
        }
    }
}
