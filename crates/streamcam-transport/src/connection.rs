//! Connection state tracking.

use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use streamcam_ipc::{EngineEvent, TransportState};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::TransportResult;

/// Shared view of a transport's [`TransportState`].
///
/// Clones observe the same state. Every accepted transition is published as
/// an [`EngineEvent::StateChanged`] when an event sender is attached.
#[derive(Debug, Clone, Default)]
pub struct StateHandle {
    state: Arc<RwLock<TransportState>>,
    events: Option<Sender<EngineEvent>>,
}

impl StateHandle {
    /// Create a handle in the `Idle` state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish transitions on `events`.
    pub fn with_events(mut self, events: Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Current state.
    pub fn current(&self) -> TransportState {
        *self.state.read()
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub(crate) fn transition(&self, next: TransportState) -> TransportResult<()> {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            if !previous.can_transition_to(next) {
                return Err(TransportError::InvalidTransition {
                    from: previous,
                    to: next,
                });
            }
            *state = next;
            previous
        };

        debug!(
            previous = %previous.name(),
            current = %next.name(),
            "Transport state transition"
        );

        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(EngineEvent::StateChanged {
                previous,
                current: next,
            }) {
                warn!("Failed to send state event: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_published() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let state = StateHandle::new().with_events(tx);

        state.transition(TransportState::Connecting).unwrap();
        state.transition(TransportState::Failed).unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            EngineEvent::StateChanged {
                previous: TransportState::Connecting,
                current: TransportState::Failed,
            }
        ));
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let state = StateHandle::new();

        let err = state.transition(TransportState::Publishing).unwrap_err();
        assert!(matches!(err, TransportError::InvalidTransition { .. }));
        assert_eq!(state.current(), TransportState::Idle);
    }

    #[test]
    fn test_clones_share_state() {
        let state = StateHandle::new();
        let observer = state.clone();

        state.transition(TransportState::Connecting).unwrap();
        assert_eq!(observer.current(), TransportState::Connecting);
    }
}
