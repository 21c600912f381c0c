//! Simulated BLE Platform
//!
//! An in-process stand-in for the Bluetooth stack. It records every outbound
//! call and lets a [`SimulatorHandle`] play the role of the radio: connect and
//! disconnect centrals, serve reads, deliver writes and acknowledge
//! advertising. A [`SimulatedCentral`] can be attached to decode notifications
//! the way the companion firmware does.

use crate::domain::advertising::AdvertiseRequest;
use crate::domain::error::PlatformError;
use crate::domain::gatt::ServiceDescriptor;
use crate::domain::models::{
    AdvertiseFailureCode, InboundWritePolicy, LinkState, PeerId, PermissionStatus, PlatformEvent,
    SignalCode,
};
use crate::domain::platform::{BlePlatform, PlatformEventSink};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// How the simulated advertiser answers start requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    Succeed,
    Fail(AdvertiseFailureCode),
    /// Wait for [`SimulatorHandle::confirm_advertise`] or [`SimulatorHandle::fail_advertise`]
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub peer: PeerId,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub confirm: bool,
}

/// Companion central: maps each notified token onto two output lines and
/// flips a sequence line so the downstream controller sees every command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedCentral {
    address: PeerId,
    out1: bool,
    out0: bool,
    seq: bool,
    received: Vec<Vec<u8>>,
}

impl SimulatedCentral {
    pub fn new(address: PeerId) -> Self {
        Self {
            address,
            out1: false,
            out0: false,
            seq: false,
            received: Vec::new(),
        }
    }

    pub fn address(&self) -> &PeerId {
        &self.address
    }

    pub fn on_notify(&mut self, data: &[u8]) {
        (self.out1, self.out0) = match SignalCode::from_token(data) {
            Some(SignalCode::Closed) => (false, true),
            Some(SignalCode::Open) => (true, false),
            Some(SignalCode::Reset) => (true, true),
            None => {
                debug!("Central received unknown command {:?}", data);
                (false, false)
            }
        };
        self.seq = !self.seq;
        self.received.push(data.to_vec());
    }

    /// (out1, out0)
    pub fn outputs(&self) -> (bool, bool) {
        (self.out1, self.out0)
    }

    pub fn sequence(&self) -> bool {
        self.seq
    }

    pub fn received(&self) -> &[Vec<u8>] {
        &self.received
    }
}

#[derive(Debug, Default)]
struct SimulatorState {
    registered: Option<ServiceDescriptor>,
    write_policy: InboundWritePolicy,
    advertising: bool,
    advertise_requests: Vec<AdvertiseRequest>,
    stop_count: usize,
    value: Vec<u8>,
    notifications: Vec<SentNotification>,
    connected: Option<PeerId>,
    central: Option<SimulatedCentral>,
}

fn lock(shared: &Mutex<SimulatorState>) -> MutexGuard<'_, SimulatorState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedPlatform {
    sink: PlatformEventSink,
    shared: Arc<Mutex<SimulatorState>>,
    available: bool,
    permissions: PermissionStatus,
    ack: AckPolicy,
    timeout_task: Option<JoinHandle<()>>,
}

impl SimulatedPlatform {
    pub fn new(sink: PlatformEventSink) -> Self {
        Self {
            sink,
            shared: Arc::new(Mutex::new(SimulatorState::default())),
            available: true,
            permissions: PermissionStatus::AlreadyGranted,
            ack: AckPolicy::Succeed,
            timeout_task: None,
        }
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn with_permissions(mut self, permissions: PermissionStatus) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_ack_policy(mut self, ack: AckPolicy) -> Self {
        self.ack = ack;
        self
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            sink: self.sink.clone(),
            shared: self.shared.clone(),
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

impl Drop for SimulatedPlatform {
    fn drop(&mut self) {
        self.cancel_timeout();
    }
}

#[async_trait]
impl BlePlatform for SimulatedPlatform {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn request_permissions(&mut self) -> PermissionStatus {
        self.permissions
    }

    async fn register_gatt_server(
        &mut self,
        descriptor: &ServiceDescriptor,
        write_policy: InboundWritePolicy,
    ) -> Result<(), PlatformError> {
        let mut state = lock(&self.shared);
        if state.registered.is_some() {
            return Err(PlatformError::new("service already registered"));
        }
        state.registered = Some(descriptor.clone());
        state.write_policy = write_policy;
        info!("Simulated GATT server registered {}", descriptor.service_id());
        Ok(())
    }

    async fn start_advertise(&mut self, request: &AdvertiseRequest) {
        self.cancel_timeout();
        let already = {
            let mut state = lock(&self.shared);
            state.advertise_requests.push(request.clone());
            state.advertising
        };

        if already {
            self.sink
                .send(PlatformEvent::AdvertiseFailed(AdvertiseFailureCode::AlreadyStarted));
            return;
        }

        match self.ack {
            AckPolicy::Succeed => {
                self.handle().confirm_advertise();
                if let Some(timeout) = request.config.timeout() {
                    let handle = self.handle();
                    self.timeout_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        handle.time_out_advertising();
                    }));
                }
            }
            AckPolicy::Fail(code) => {
                self.sink.send(PlatformEvent::AdvertiseFailed(code));
            }
            AckPolicy::Manual => {}
        }
    }

    async fn stop_advertise(&mut self) {
        self.cancel_timeout();
        let mut state = lock(&self.shared);
        state.advertising = false;
        state.stop_count += 1;
    }

    async fn set_characteristic_value(&mut self, value: &[u8]) {
        lock(&self.shared).value = value.to_vec();
    }

    async fn notify_characteristic_changed(
        &mut self,
        peer: &PeerId,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    ) {
        let mut state = lock(&self.shared);
        state.notifications.push(SentNotification {
            peer: peer.clone(),
            characteristic,
            value: value.to_vec(),
            confirm,
        });

        let delivered = state.connected.as_ref() == Some(peer);
        if let Some(central) = state.central.as_mut() {
            if delivered && central.address() == peer {
                central.on_notify(value);
            }
        }
    }
}

/// Radio side of the simulator
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    sink: PlatformEventSink,
    shared: Arc<Mutex<SimulatorState>>,
}

impl SimulatorHandle {
    pub fn connect(&self, peer: PeerId) {
        lock(&self.shared).connected = Some(peer.clone());
        self.sink.send(PlatformEvent::ConnectionStateChanged {
            peer,
            state: LinkState::Connected,
        });
    }

    pub fn disconnect(&self, peer: PeerId) {
        {
            let mut state = lock(&self.shared);
            if state.connected.as_ref() == Some(&peer) {
                state.connected = None;
            }
        }
        self.sink.send(PlatformEvent::ConnectionStateChanged {
            peer,
            state: LinkState::Disconnected,
        });
    }

    /// Served from the platform copy of the value, like a real GATT server
    pub fn read(&self, peer: PeerId) -> Vec<u8> {
        let value = lock(&self.shared).value.clone();
        self.sink.send(PlatformEvent::CharacteristicRead { peer });
        value
    }

    /// Returns whether the write was acknowledged
    pub fn write(&self, peer: PeerId, value: Vec<u8>) -> bool {
        let accepted = lock(&self.shared).write_policy != InboundWritePolicy::Reject;
        self.sink
            .send(PlatformEvent::CharacteristicWrite { peer, value });
        accepted
    }

    pub fn confirm_advertise(&self) {
        lock(&self.shared).advertising = true;
        self.sink.send(PlatformEvent::AdvertiseStarted);
    }

    pub fn fail_advertise(&self, code: AdvertiseFailureCode) {
        self.sink.send(PlatformEvent::AdvertiseFailed(code));
    }

    pub fn time_out_advertising(&self) {
        let was_advertising = std::mem::take(&mut lock(&self.shared).advertising);
        if was_advertising {
            self.sink.send(PlatformEvent::AdvertisingTimedOut);
        }
    }

    pub fn attach_central(&self, central: SimulatedCentral) {
        lock(&self.shared).central = Some(central);
    }

    pub fn central(&self) -> Option<SimulatedCentral> {
        lock(&self.shared).central.clone()
    }

    pub fn registered(&self) -> Option<ServiceDescriptor> {
        lock(&self.shared).registered.clone()
    }

    pub fn is_advertising(&self) -> bool {
        lock(&self.shared).advertising
    }

    pub fn advertise_requests(&self) -> Vec<AdvertiseRequest> {
        lock(&self.shared).advertise_requests.clone()
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.shared).stop_count
    }

    pub fn value(&self) -> Vec<u8> {
        lock(&self.shared).value.clone()
    }

    pub fn notifications(&self) -> Vec<SentNotification> {
        lock(&self.shared).notifications.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::advertising::AdvertiseConfig;
    use crate::domain::models::SessionInput;
    use crate::domain::protocol;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn request(timeout_ms: u64) -> AdvertiseRequest {
        AdvertiseRequest {
            config: AdvertiseConfig {
                timeout_ms,
                ..AdvertiseConfig::default()
            },
            service_uuid: protocol::SERVICE_UUID,
            device_name: Some(protocol::DEFAULT_DEVICE_NAME.to_string()),
        }
    }

    #[test]
    fn test_central_mapping() {
        let mut central = SimulatedCentral::new(PeerId::new("pico"));
        central.on_notify(b"1");
        assert_eq!(central.outputs(), (false, true));
        central.on_notify(b"x");
        assert_eq!(central.outputs(), (false, false));
        assert!(!central.sequence());
        assert_eq!(central.received().len(), 2);
    }

    #[tokio::test]
    async fn test_second_registration_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut platform = SimulatedPlatform::new(PlatformEventSink::new(tx));
        let descriptor = ServiceDescriptor::door_alarm();
        assert!(platform
            .register_gatt_server(&descriptor, InboundWritePolicy::Log)
            .await
            .is_ok());
        assert!(platform
            .register_gatt_server(&descriptor, InboundWritePolicy::Log)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_start_reports_already_started() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut platform = SimulatedPlatform::new(PlatformEventSink::new(tx));
        platform.start_advertise(&request(0)).await;
        platform.start_advertise(&request(0)).await;

        assert_eq!(
            rx.try_recv().ok(),
            Some(SessionInput::Platform(PlatformEvent::AdvertiseStarted))
        );
        assert_eq!(
            rx.try_recv().ok(),
            Some(SessionInput::Platform(PlatformEvent::AdvertiseFailed(
                AdvertiseFailureCode::AlreadyStarted
            )))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ends_advertising() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut platform = SimulatedPlatform::new(PlatformEventSink::new(tx));
        let handle = platform.handle();
        platform.start_advertise(&request(3000)).await;
        assert!(handle.is_advertising());

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(!handle.is_advertising());

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events.last(),
            Some(&SessionInput::Platform(PlatformEvent::AdvertisingTimedOut))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut platform = SimulatedPlatform::new(PlatformEventSink::new(tx));
        let handle = platform.handle();

        platform.start_advertise(&request(3000)).await;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        platform.stop_advertise().await;
        platform.start_advertise(&request(3000)).await;

        // Past the first deadline, before the second
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(handle.is_advertising());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!handle.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reports_single_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut platform = SimulatedPlatform::new(PlatformEventSink::new(tx));

        platform.start_advertise(&request(3000)).await;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        platform.stop_advertise().await;
        platform.start_advertise(&request(3000)).await;
        tokio::time::sleep(Duration::from_millis(5000)).await;

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![
                SessionInput::Platform(PlatformEvent::AdvertiseStarted),
                SessionInput::Platform(PlatformEvent::AdvertiseStarted),
                SessionInput::Platform(PlatformEvent::AdvertisingTimedOut),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_write_is_not_acknowledged() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut platform = SimulatedPlatform::new(PlatformEventSink::new(tx));
        platform
            .register_gatt_server(&ServiceDescriptor::door_alarm(), InboundWritePolicy::Reject)
            .await
            .unwrap();
        assert!(!platform.handle().write(PeerId::new("A"), b"1".to_vec()));
    }
}
