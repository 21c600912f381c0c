//! Peripheral Session
//!
//! Owns every piece of session state and is the only place inputs are
//! applied. One task runs [`PeripheralSession::run`], so platform callbacks and
//! user actions are handled strictly one at a time, in arrival order.

use crate::domain::advertising::{
    AckOutcome, AdvertiseConfig, AdvertiseRequest, AdvertisingController, StartDecision,
};
use crate::domain::connection::{ConnectionStateMachine, StateChangeRecord};
use crate::domain::dispatcher::{DispatchOutcome, NotificationDispatcher};
use crate::domain::error::SessionError;
use crate::domain::gatt::{CharacteristicSnapshot, CharacteristicValue, GattServiceModel, ServiceDescriptor};
use crate::domain::models::{
    AdvertisingState, AppEvent, ConnectionState, InboundWritePolicy, LinkState, PeerId,
    PermissionStatus, PlatformEvent, SessionInput, SignalCode, UserCommand,
};
use crate::domain::platform::BlePlatform;
use crate::domain::session_log::SessionLog;
use crate::domain::settings::Settings;
use std::ops::ControlFlow;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub device_name: String,
    pub include_device_name: bool,
    pub log_capacity: usize,
    pub write_policy: InboundWritePolicy,
}

impl From<&Settings> for SessionOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            device_name: settings.device_name.clone(),
            include_device_name: settings.include_device_name,
            log_capacity: settings.log_capacity,
            write_policy: settings.inbound_write_policy,
        }
    }
}

pub struct PeripheralSession {
    platform: Box<dyn BlePlatform>,
    options: SessionOptions,
    gatt: GattServiceModel,
    connection: ConnectionStateMachine,
    advertising: AdvertisingController,
    log: SessionLog,
    feed: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl PeripheralSession {
    /// Request permissions, check the radio and register the GATT server.
    ///
    /// Fails only when the platform cannot host the session at all.
    pub async fn start(
        mut platform: Box<dyn BlePlatform>,
        options: SessionOptions,
        feed: Option<mpsc::UnboundedSender<AppEvent>>,
    ) -> Result<Self, SessionError> {
        let mut log = SessionLog::new(options.log_capacity);
        if let Some(feed) = &feed {
            log = log.with_feed(feed.clone());
        }
        info!("Starting peripheral session on {} platform", platform.name());

        if let Err(e) = request_permissions(platform.as_mut(), &mut log).await {
            log.warn(format!("{}; use the permissions action to retry", e));
        }

        if !platform.is_available().await {
            let reason = format!("{} platform reports no usable adapter", platform.name());
            log.error(format!("BLE not supported on this device: {}", reason));
            return Err(SessionError::PlatformUnavailable(reason));
        }

        let gatt = GattServiceModel::register(
            ServiceDescriptor::door_alarm(),
            options.write_policy,
            platform.as_mut(),
            &mut log,
        )
        .await?;

        let session = Self {
            platform,
            options,
            gatt,
            connection: ConnectionStateMachine::new(),
            advertising: AdvertisingController::new(),
            log,
            feed,
        };
        session.publish(AppEvent::ConnectionStatus(session.connection_state().clone()));
        session.publish(AppEvent::AdvertisingStatus(session.advertising_state()));
        Ok(session)
    }

    /// Consume inputs until shutdown or until every sender is gone
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>) {
        while let Some(input) = inputs.recv().await {
            if self.handle_input(input).await.is_break() {
                break;
            }
        }
        self.shutdown().await;
        info!("Peripheral session ended");
    }

    pub async fn handle_input(&mut self, input: SessionInput) -> ControlFlow<()> {
        match input {
            SessionInput::Command(command) => self.handle_command(command).await,
            SessionInput::Platform(event) => {
                self.handle_platform_event(event).await;
                ControlFlow::Continue(())
            }
        }
    }

    pub async fn handle_command(&mut self, command: UserCommand) -> ControlFlow<()> {
        debug!("Command: {:?}", command);
        match command {
            UserCommand::StartAdvertising(config) => self.start_advertising(config).await,
            UserCommand::StopAdvertising => self.stop_advertising().await,
            UserCommand::Dispatch(signal) => {
                self.dispatch(signal).await;
            }
            UserCommand::ReadCurrentValue => {
                let value = self.read_current_value();
                self.log.info(format!("char. value is {}", value));
            }
            UserCommand::InspectCharacteristic => {
                let snapshot = self.inspect_characteristic();
                self.publish(AppEvent::Characteristic(snapshot));
            }
            UserCommand::ClearLog => self.clear_log(),
            UserCommand::ShowLog => self.publish(AppEvent::LogSnapshot {
                text: self.log.render(),
                entries: self.log.len(),
                dropped: self.log.dropped(),
            }),
            UserCommand::RequestPermissions => {
                let _ = self.request_permissions().await;
            }
            UserCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    pub async fn handle_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::ConnectionStateChanged { peer, state } => {
                self.on_connection_event(peer, state);
            }
            PlatformEvent::AdvertiseStarted => {
                let before = self.advertising.state();
                if self.advertising.on_start_succeeded(&mut self.log) == AckOutcome::Stale {
                    self.platform.stop_advertise().await;
                }
                self.publish_advertising_if_changed(before);
            }
            PlatformEvent::AdvertiseFailed(code) => {
                let before = self.advertising.state();
                self.advertising.on_start_failed(code, &mut self.log);
                self.publish_advertising_if_changed(before);
            }
            PlatformEvent::AdvertisingTimedOut => {
                let before = self.advertising.state();
                self.advertising.on_timed_out(&mut self.log);
                self.publish_advertising_if_changed(before);
            }
            PlatformEvent::CharacteristicRead { peer } => {
                debug!(
                    "Read request from {} served with {}",
                    peer,
                    self.gatt.read_current_value()
                );
            }
            PlatformEvent::CharacteristicWrite { peer, value } => {
                self.gatt.on_inbound_write(&peer, &value, &mut self.log);
            }
            PlatformEvent::NotificationFailed { peer, reason } => {
                // Surfaced only; notifications are never retried
                self.log
                    .warn(format!("Notification to {} failed: {}", peer, reason));
            }
        }
    }

    fn on_connection_event(&mut self, peer: PeerId, state: LinkState) -> StateChangeRecord {
        let record = self.connection.on_platform_event(peer, state, &mut self.log);
        if record.changed() {
            self.publish(AppEvent::ConnectionStatus(record.current.clone()));
        }
        record
    }

    pub async fn start_advertising(&mut self, config: AdvertiseConfig) {
        let before = self.advertising.state();
        let decision = self.advertising.request_start(&config, &mut self.log);
        let request = AdvertiseRequest {
            config,
            service_uuid: self.gatt.descriptor().service_id(),
            device_name: self
                .options
                .include_device_name
                .then(|| self.options.device_name.clone()),
        };
        if decision == StartDecision::Reissue {
            debug!("Re-issuing advertisement request");
        }
        self.platform.start_advertise(&request).await;
        self.publish_advertising_if_changed(before);
    }

    pub async fn stop_advertising(&mut self) {
        let before = self.advertising.state();
        if self.advertising.request_stop(&mut self.log) {
            self.platform.stop_advertise().await;
        }
        self.publish_advertising_if_changed(before);
    }

    pub async fn dispatch(&mut self, signal: SignalCode) -> DispatchOutcome {
        let outcome = NotificationDispatcher {
            connection: &self.connection,
            gatt: &mut self.gatt,
            platform: self.platform.as_mut(),
            log: &mut self.log,
        }
        .dispatch(signal)
        .await;

        if let DispatchOutcome::Sent { .. } = outcome {
            self.publish(AppEvent::Characteristic(self.gatt.snapshot()));
        }
        outcome
    }

    pub fn read_current_value(&self) -> CharacteristicValue {
        self.gatt.read_current_value()
    }

    pub fn inspect_characteristic(&mut self) -> CharacteristicSnapshot {
        let snapshot = self.gatt.snapshot();
        self.log.info(format!(
            "char. properties: {}, char. value is {}",
            snapshot.properties.bits(),
            snapshot.value
        ));
        snapshot
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub async fn request_permissions(&mut self) -> Result<PermissionStatus, SessionError> {
        request_permissions(self.platform.as_mut(), &mut self.log).await
    }

    pub async fn shutdown(&mut self) {
        if self.advertising.state() == AdvertisingState::Advertising || self.advertising.is_pending() {
            self.stop_advertising().await;
        }
    }

    pub fn connection_state(&self) -> &ConnectionState {
        self.connection.state()
    }

    pub fn advertising_state(&self) -> AdvertisingState {
        self.advertising.state()
    }

    fn publish_advertising_if_changed(&self, before: AdvertisingState) {
        let after = self.advertising.state();
        if before != after {
            self.publish(AppEvent::AdvertisingStatus(after));
        }
    }

    fn publish(&self, event: AppEvent) {
        if let Some(feed) = &self.feed {
            let _ = feed.send(event);
        }
    }
}

async fn request_permissions(
    platform: &mut dyn BlePlatform,
    log: &mut SessionLog,
) -> Result<PermissionStatus, SessionError> {
    log.info("requesting permissions...");
    let status = platform.request_permissions().await;
    match status {
        PermissionStatus::AlreadyGranted => {
            log.info("Permissions already granted");
        }
        PermissionStatus::Granted => {
            log.success("Permissions all granted");
        }
        PermissionStatus::Denied => {
            log.error("Permissions still not granted");
            return Err(SessionError::PermissionDenied);
        }
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AdvertiseFailureCode;
    use crate::domain::platform::PlatformEventSink;
    use crate::domain::protocol;
    use crate::infrastructure::bluetooth::simulated::{
        AckPolicy, SimulatedCentral, SimulatedPlatform, SimulatorHandle,
    };

    struct Harness {
        session: PeripheralSession,
        inputs: mpsc::UnboundedReceiver<SessionInput>,
        sim: SimulatorHandle,
    }

    impl Harness {
        async fn new(ack: AckPolicy) -> Self {
            let (tx, inputs) = mpsc::unbounded_channel();
            let platform = SimulatedPlatform::new(PlatformEventSink::new(tx)).with_ack_policy(ack);
            let sim = platform.handle();
            let session = PeripheralSession::start(
                Box::new(platform),
                SessionOptions::from(&Settings::default()),
                None,
            )
            .await
            .expect("session starts on the simulator");
            Self {
                session,
                inputs,
                sim,
            }
        }

        /// Deliver every queued platform callback, as the run loop would
        async fn pump(&mut self) {
            while let Ok(input) = self.inputs.try_recv() {
                let _ = self.session.handle_input(input).await;
            }
        }

        async fn connect(&mut self, peer: &str) {
            self.sim.connect(PeerId::new(peer));
            self.pump().await;
        }

        async fn disconnect(&mut self, peer: &str) {
            self.sim.disconnect(PeerId::new(peer));
            self.pump().await;
        }
    }

    #[tokio::test]
    async fn test_startup_registers_service() {
        let harness = Harness::new(AckPolicy::Succeed).await;
        let registered = harness.sim.registered().expect("registered");
        assert_eq!(registered.service_id(), protocol::SERVICE_UUID);
        assert_eq!(harness.session.connection_state(), &ConnectionState::Disconnected);
        assert_eq!(harness.session.advertising_state(), AdvertisingState::Idle);
        assert!(harness
            .session
            .log
            .entries()
            .any(|e| e.message == "setup complete."));
    }

    #[tokio::test]
    async fn test_startup_fails_without_adapter() {
        let (tx, _inputs) = mpsc::unbounded_channel();
        let platform = SimulatedPlatform::new(PlatformEventSink::new(tx)).with_available(false);
        let result = PeripheralSession::start(
            Box::new(platform),
            SessionOptions::from(&Settings::default()),
            None,
        )
        .await;
        assert!(matches!(result, Err(SessionError::PlatformUnavailable(_))));
    }

    #[tokio::test]
    async fn test_denied_permissions_are_recoverable() {
        let (tx, _inputs) = mpsc::unbounded_channel();
        let platform = SimulatedPlatform::new(PlatformEventSink::new(tx))
            .with_permissions(PermissionStatus::Denied);
        let mut session = PeripheralSession::start(
            Box::new(platform),
            SessionOptions::from(&Settings::default()),
            None,
        )
        .await
        .expect("denied permissions do not abort startup");
        assert_eq!(
            session.request_permissions().await,
            Err(SessionError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_scenario_a_advertising_confirmed() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        let config = AdvertiseConfig::default();

        harness.session.start_advertising(config).await;
        assert_eq!(harness.session.advertising_state(), AdvertisingState::Idle);

        harness.pump().await;
        assert_eq!(harness.session.advertising_state(), AdvertisingState::Advertising);

        let requests = harness.sim.advertise_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].service_uuid, protocol::SERVICE_UUID);
        assert_eq!(requests[0].device_name.as_deref(), Some(protocol::DEFAULT_DEVICE_NAME));
        assert!(requests[0].config.connectable);
    }

    #[tokio::test]
    async fn test_advertise_failure_is_captured_in_state() {
        let mut harness =
            Harness::new(AckPolicy::Fail(AdvertiseFailureCode::FeatureUnsupported)).await;
        harness.session.start_advertising(AdvertiseConfig::default()).await;
        harness.pump().await;

        assert_eq!(
            harness.session.advertising_state(),
            AdvertisingState::Failed(AdvertiseFailureCode::FeatureUnsupported)
        );
        assert!(harness
            .session
            .log
            .entries()
            .last()
            .is_some_and(|e| e.message.contains("Advertisement failed: 5")));
    }

    #[tokio::test]
    async fn test_scenario_b_dispatch_to_connected_peer() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        harness.connect("peerX").await;

        let outcome = harness.session.dispatch(SignalCode::Closed).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Sent {
                peer: PeerId::new("peerX")
            }
        );
        assert_eq!(harness.session.read_current_value().as_bytes(), b"1");

        let sent = harness.sim.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, PeerId::new("peerX"));
        assert_eq!(sent[0].characteristic, protocol::ALERT_CHAR_UUID);
        assert_eq!(sent[0].value, b"1".to_vec());
        assert!(!sent[0].confirm);
        assert_eq!(harness.sim.value(), b"1".to_vec());
    }

    #[tokio::test]
    async fn test_scenario_c_dispatch_after_disconnect_is_skipped() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        harness.connect("peerX").await;
        assert_eq!(
            harness.session.dispatch(SignalCode::Open).await,
            DispatchOutcome::Sent {
                peer: PeerId::new("peerX")
            }
        );
        harness.disconnect("peerX").await;

        let outcome = harness.session.dispatch(SignalCode::Reset).await;
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert_eq!(
            harness.session.read_current_value().signal(),
            Some(SignalCode::Open)
        );
        assert_eq!(harness.sim.value(), b"2".to_vec());
        assert_eq!(harness.sim.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_late_rejection_recovers() {
        let mut harness = Harness::new(AckPolicy::Manual).await;
        harness.session.start_advertising(AdvertiseConfig::default()).await;

        harness.sim.fail_advertise(AdvertiseFailureCode::DataTooLarge);
        harness.pump().await;
        assert_eq!(
            harness.session.advertising_state(),
            AdvertisingState::Failed(AdvertiseFailureCode::DataTooLarge)
        );

        harness.session.start_advertising(AdvertiseConfig::default()).await;
        harness.sim.confirm_advertise();
        harness.pump().await;
        assert_eq!(harness.session.advertising_state(), AdvertisingState::Advertising);
        assert_eq!(harness.sim.advertise_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_show_log_publishes_snapshot() {
        let (tx, mut inputs) = mpsc::unbounded_channel();
        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
        let platform = SimulatedPlatform::new(PlatformEventSink::new(tx));
        let mut session = PeripheralSession::start(
            Box::new(platform),
            SessionOptions::from(&Settings::default()),
            Some(feed_tx),
        )
        .await
        .expect("session starts");
        while inputs.try_recv().is_ok() {}

        let _ = session.handle_command(UserCommand::ShowLog).await;

        let snapshot = std::iter::from_fn(|| feed_rx.try_recv().ok()).find_map(|event| match event {
            AppEvent::LogSnapshot {
                text,
                entries,
                dropped,
            } => Some((text, entries, dropped)),
            _ => None,
        });
        let (text, entries, dropped) = snapshot.expect("log snapshot published");
        assert_eq!(entries, session.log.len());
        assert_eq!(dropped, 0);
        assert!(text.contains("setup complete."));
    }

    #[tokio::test]
    async fn test_scenario_d_start_while_advertising() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        harness.session.start_advertising(AdvertiseConfig::default()).await;
        harness.pump().await;

        harness.session.start_advertising(AdvertiseConfig::default()).await;
        harness.pump().await;
        assert_eq!(harness.session.advertising_state(), AdvertisingState::Advertising);
        assert_eq!(harness.sim.advertise_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_value_survives_reconnect() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        harness.connect("peerX").await;
        harness.session.dispatch(SignalCode::Open).await;
        harness.disconnect("peerX").await;
        harness.connect("peerY").await;

        assert_eq!(harness.session.read_current_value().as_bytes(), b"2");
        assert_eq!(harness.sim.read(PeerId::new("peerY")), b"2".to_vec());
    }

    #[tokio::test]
    async fn test_stop_twice_equals_once() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        harness.session.start_advertising(AdvertiseConfig::default()).await;
        harness.pump().await;

        harness.session.stop_advertising().await;
        let after_one = harness.session.advertising_state();
        harness.session.stop_advertising().await;
        assert_eq!(harness.session.advertising_state(), after_one);
        assert_eq!(after_one, AdvertisingState::Idle);
        assert_eq!(harness.sim.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_late_ack_after_stop_stops_platform_again() {
        let mut harness = Harness::new(AckPolicy::Manual).await;
        harness.session.start_advertising(AdvertiseConfig::default()).await;
        harness.session.stop_advertising().await;

        harness.sim.confirm_advertise();
        harness.pump().await;
        assert_eq!(harness.session.advertising_state(), AdvertisingState::Idle);
        assert_eq!(harness.sim.stop_count(), 2);
        assert!(!harness.sim.is_advertising());
    }

    #[tokio::test]
    async fn test_inbound_write_does_not_change_value() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        harness.connect("peerX").await;
        harness.session.dispatch(SignalCode::Closed).await;

        harness.sim.write(PeerId::new("peerX"), b"9".to_vec());
        harness.pump().await;
        assert_eq!(harness.session.read_current_value().as_bytes(), b"1");
        assert!(harness
            .session
            .log
            .entries()
            .last()
            .is_some_and(|e| e.message.contains("not applied")));
    }

    #[tokio::test]
    async fn test_central_decodes_signals() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        harness.sim.attach_central(SimulatedCentral::new(PeerId::new("pico")));
        harness.connect("pico").await;

        harness.session.dispatch(SignalCode::Open).await;
        let central = harness.sim.central().expect("central attached");
        assert_eq!(central.outputs(), (true, false));
        assert!(central.sequence());

        harness.session.dispatch(SignalCode::Reset).await;
        let central = harness.sim.central().expect("central attached");
        assert_eq!(central.outputs(), (true, true));
        assert!(!central.sequence());
    }

    #[tokio::test]
    async fn test_inspect_logs_properties_and_value() {
        let mut harness = Harness::new(AckPolicy::Succeed).await;
        let snapshot = harness.session.inspect_characteristic();
        assert_eq!(snapshot.properties.bits(), 26);
        assert!(snapshot.value.is_empty());
        assert!(harness
            .session
            .log
            .entries()
            .last()
            .is_some_and(|e| e.message == "char. properties: 26, char. value is <empty>"));
    }

    #[tokio::test]
    async fn test_run_loop_processes_in_order_and_shuts_down() {
        let (tx, inputs) = mpsc::unbounded_channel();
        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
        let platform = SimulatedPlatform::new(PlatformEventSink::new(tx.clone()));
        let sim = platform.handle();
        let session = PeripheralSession::start(
            Box::new(platform),
            SessionOptions::from(&Settings::default()),
            Some(feed_tx),
        )
        .await
        .expect("session starts");

        tx.send(SessionInput::Command(UserCommand::StartAdvertising(
            AdvertiseConfig::default(),
        )))
        .unwrap();
        sim.connect(PeerId::new("peerX"));
        tx.send(SessionInput::Command(UserCommand::Dispatch(SignalCode::Open)))
            .unwrap();
        sim.disconnect(PeerId::new("peerX"));
        tx.send(SessionInput::Command(UserCommand::Shutdown)).unwrap();

        session.run(inputs).await;

        assert_eq!(sim.notifications().len(), 1);
        assert!(!sim.is_advertising());

        let mut statuses = Vec::new();
        while let Ok(event) = feed_rx.try_recv() {
            if let AppEvent::ConnectionStatus(state) = event {
                statuses.push(state);
            }
        }
        assert_eq!(
            statuses,
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connected(PeerId::new("peerX")),
                ConnectionState::Disconnected,
            ]
        );
    }
}
