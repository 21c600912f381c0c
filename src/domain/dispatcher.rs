//! Notification Dispatcher
//!
//! Encodes a signal into the characteristic and pushes it to the connected
//! central. Nothing is queued: without a peer the dispatch is skipped and the
//! stored value stays as it was.

use crate::domain::connection::ConnectionStateMachine;
use crate::domain::gatt::GattServiceModel;
use crate::domain::models::{PeerId, SignalCode};
use crate::domain::platform::BlePlatform;
use crate::domain::session_log::SessionLog;
use crate::domain::protocol::CONFIRM_DELIVERY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { peer: PeerId },
    /// No central connected; not an error
    Skipped,
}

pub struct NotificationDispatcher<'a> {
    pub connection: &'a ConnectionStateMachine,
    pub gatt: &'a mut GattServiceModel,
    pub platform: &'a mut dyn BlePlatform,
    pub log: &'a mut SessionLog,
}

impl NotificationDispatcher<'_> {
    pub async fn dispatch(self, signal: SignalCode) -> DispatchOutcome {
        let Some(peer) = self.connection.current_peer().cloned() else {
            self.log.info(format!("No device connected; {} not sent", signal));
            return DispatchOutcome::Skipped;
        };

        self.log
            .info(format!("updating char. value to {}", signal.token()));
        let value = self.gatt.store(signal);
        let characteristic = self.gatt.descriptor().characteristic_id();

        self.platform.set_characteristic_value(value.as_bytes()).await;
        self.platform
            .notify_characteristic_changed(&peer, characteristic, value.as_bytes(), CONFIRM_DELIVERY)
            .await;

        tracing::debug!("Notified {} of {}", peer, signal);
        DispatchOutcome::Sent { peer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gatt::ServiceDescriptor;
    use crate::domain::models::{InboundWritePolicy, LinkState};
    use crate::domain::platform::PlatformEventSink;
    use crate::infrastructure::bluetooth::simulated::SimulatedPlatform;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_dispatch_overwrites_value_each_time() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut platform = SimulatedPlatform::new(PlatformEventSink::new(tx));
        let sim = platform.handle();
        let mut log = SessionLog::default();
        let mut gatt = GattServiceModel::register(
            ServiceDescriptor::door_alarm(),
            InboundWritePolicy::Log,
            &mut platform,
            &mut log,
        )
        .await
        .unwrap();
        let mut connection = ConnectionStateMachine::new();
        connection.on_platform_event(PeerId::new("peerX"), LinkState::Connected, &mut log);

        for signal in [SignalCode::Open, SignalCode::Closed] {
            let outcome = NotificationDispatcher {
                connection: &connection,
                gatt: &mut gatt,
                platform: &mut platform,
                log: &mut log,
            }
            .dispatch(signal)
            .await;
            assert_eq!(
                outcome,
                DispatchOutcome::Sent {
                    peer: PeerId::new("peerX")
                }
            );
        }

        assert_eq!(gatt.read_current_value().signal(), Some(SignalCode::Closed));
        assert_eq!(sim.value(), b"1".to_vec());
        let sent = sim.notifications();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|n| !n.confirm));
    }
}
