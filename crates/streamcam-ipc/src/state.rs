//! Transport state machine types.

use serde::{Deserialize, Serialize};

/// The lifecycle state of the outbound RTMP transport.
///
/// ```text
/// Idle → Connecting → Handshaking → Publishing → Closing → Idle
///            │             │             │
///            └─────────────┴─────────────┴──→ Failed → Closing → Idle
/// ```
///
/// `Failed` is terminal for the session; only an explicit restart returns
/// it to `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportState {
    /// No socket, nothing in flight.
    #[default]
    Idle,

    /// TCP connect in progress.
    Connecting,

    /// RTMP handshake and publish negotiation in progress.
    Handshaking,

    /// Publish accepted; media may be sent.
    Publishing,

    /// Teardown in progress.
    Closing,

    /// A fatal socket or protocol error ended the session.
    Failed,
}

impl TransportState {
    /// Returns true if media may be sent.
    pub fn is_publishing(self) -> bool {
        matches!(self, Self::Publishing)
    }

    /// Returns true if a connection attempt is underway.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Connecting | Self::Handshaking)
    }

    /// Returns true if the transport has failed.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns true if a state change from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransportState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Handshaking)
                | (Handshaking, Publishing)
                | (Connecting | Handshaking | Publishing, Failed)
                | (Connecting | Handshaking | Publishing | Failed, Closing)
                | (Closing, Idle)
                | (Failed, Idle)
        )
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Handshaking => "Handshaking",
            Self::Publishing => "Publishing",
            Self::Closing => "Closing",
            Self::Failed => "Failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use TransportState::*;

        let path = [Idle, Connecting, Handshaking, Publishing, Closing, Idle];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_teardown_never_skips_closing() {
        use TransportState::*;

        assert!(!Publishing.can_transition_to(Idle));
        assert!(!Handshaking.can_transition_to(Idle));
        assert!(!Connecting.can_transition_to(Idle));
    }

    #[test]
    fn test_failed_only_restarts_through_idle() {
        use TransportState::*;

        assert!(Failed.can_transition_to(Closing));
        assert!(Failed.can_transition_to(Idle));
        assert!(!Failed.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Publishing));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_idle_cannot_fail() {
        assert!(!TransportState::Idle.can_transition_to(TransportState::Failed));
        assert!(!TransportState::Closing.can_transition_to(TransportState::Failed));
    }
}
