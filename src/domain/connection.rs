//! Connection State Machine
//!
//! `Disconnected ⇄ Connected(peer)`, driven only by platform callbacks in
//! arrival order. Single-central: a disconnect from any peer drops the link,
//! and a connect from a new peer replaces the current one.

use crate::domain::models::{ConnectionState, LinkState, PeerId};
use crate::domain::session_log::SessionLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeRecord {
    pub peer: PeerId,
    pub event: LinkState,
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

impl StateChangeRecord {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn current_peer(&self) -> Option<&PeerId> {
        self.state.peer()
    }

    pub fn on_platform_event(
        &mut self,
        peer: PeerId,
        event: LinkState,
        log: &mut SessionLog,
    ) -> StateChangeRecord {
        let previous = self.state.clone();

        let next = match (event, &previous) {
            (LinkState::Connected, ConnectionState::Connected(current)) if *current == peer => {
                log.warn(format!("Device connected: {} (already connected)", peer));
                previous.clone()
            }
            (LinkState::Connected, ConnectionState::Connected(current)) => {
                log.warn(format!("Device connected: {} (replacing {})", peer, current));
                ConnectionState::Connected(peer.clone())
            }
            (LinkState::Connected, ConnectionState::Disconnected) => {
                log.success(format!("Device connected: {}", peer));
                ConnectionState::Connected(peer.clone())
            }
            (LinkState::Disconnected, ConnectionState::Disconnected) => {
                log.warn(format!("Device disconnected: {} (no active connection)", peer));
                ConnectionState::Disconnected
            }
            (LinkState::Disconnected, ConnectionState::Connected(current)) if *current != peer => {
                log.warn(format!(
                    "Device disconnected: {} (dropping link to {})",
                    peer, current
                ));
                ConnectionState::Disconnected
            }
            (LinkState::Disconnected, ConnectionState::Connected(_)) => {
                log.info(format!("Device disconnected: {}", peer));
                ConnectionState::Disconnected
            }
        };

        self.state = next.clone();
        StateChangeRecord {
            peer,
            event,
            previous,
            current: next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    #[test]
    fn test_connect_then_disconnect() {
        let mut log = SessionLog::new(16);
        let mut machine = ConnectionStateMachine::new();

        let record = machine.on_platform_event(peer("A"), LinkState::Connected, &mut log);
        assert!(record.changed());
        assert_eq!(machine.current_peer(), Some(&peer("A")));

        let record = machine.on_platform_event(peer("A"), LinkState::Disconnected, &mut log);
        assert!(record.changed());
        assert_eq!(machine.state(), &ConnectionState::Disconnected);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_repeated_event_is_logged_noop() {
        let mut log = SessionLog::new(16);
        let mut machine = ConnectionStateMachine::new();

        let record = machine.on_platform_event(peer("A"), LinkState::Disconnected, &mut log);
        assert!(!record.changed());
        assert_eq!(log.len(), 1);

        machine.on_platform_event(peer("A"), LinkState::Connected, &mut log);
        let record = machine.on_platform_event(peer("A"), LinkState::Connected, &mut log);
        assert!(!record.changed());
        assert_eq!(log.len(), 3);
        assert!(log
            .entries()
            .last()
            .is_some_and(|e| e.message.contains("already connected")));
    }

    #[test]
    fn test_disconnect_from_other_peer_drops_link() {
        let mut log = SessionLog::new(16);
        let mut machine = ConnectionStateMachine::new();
        machine.on_platform_event(peer("A"), LinkState::Connected, &mut log);

        machine.on_platform_event(peer("B"), LinkState::Disconnected, &mut log);
        assert_eq!(machine.current_peer(), None);
    }

    #[test]
    fn test_new_peer_replaces_current() {
        let mut log = SessionLog::new(16);
        let mut machine = ConnectionStateMachine::new();
        machine.on_platform_event(peer("A"), LinkState::Connected, &mut log);

        let record = machine.on_platform_event(peer("B"), LinkState::Connected, &mut log);
        assert!(record.changed());
        assert_eq!(machine.current_peer(), Some(&peer("B")));
    }

    fn link_event() -> impl Strategy<Value = (String, LinkState)> {
        (
            prop::sample::select(vec!["A", "B", "C"]).prop_map(str::to_string),
            prop_oneof![Just(LinkState::Connected), Just(LinkState::Disconnected)],
        )
    }

    proptest! {
        #[test]
        fn prop_state_follows_last_event(events in prop::collection::vec(link_event(), 1..64)) {
            let mut log = SessionLog::new(8);
            let mut machine = ConnectionStateMachine::new();

            for (id, event) in &events {
                machine.on_platform_event(PeerId::new(id.clone()), *event, &mut log);
            }

            let (last_id, last_event) = events.last().cloned().unwrap();
            let expected = match last_event {
                LinkState::Connected => ConnectionState::Connected(PeerId::new(last_id)),
                LinkState::Disconnected => ConnectionState::Disconnected,
            };
            prop_assert_eq!(machine.state(), &expected);
        }
    }
}
