//! BlueZ GATT Server Backend
//!
//! Serves the door alarm service and advertisement over D-Bus using `bluer`.
//! BlueZ does not report centrals to a GATT application directly, so a poll
//! over the adapter's known devices turns connect and disconnect into events.

use crate::domain::advertising::AdvertiseRequest;
use crate::domain::error::PlatformError;
use crate::domain::gatt::ServiceDescriptor;
use crate::domain::models::{
    AdvertiseFailureCode, InboundWritePolicy, LinkState, PeerId, PermissionStatus, PlatformEvent,
};
use crate::domain::platform::{BlePlatform, PlatformEventSink};
use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::{Adapter, ErrorKind, Session};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONNECTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn failure_code(error: &bluer::Error) -> AdvertiseFailureCode {
    match error.kind {
        ErrorKind::InvalidLength => AdvertiseFailureCode::DataTooLarge,
        ErrorKind::AlreadyExists => AdvertiseFailureCode::AlreadyStarted,
        ErrorKind::NotSupported => AdvertiseFailureCode::FeatureUnsupported,
        _ => AdvertiseFailureCode::InternalError,
    }
}

pub struct BluezPlatform {
    sink: PlatformEventSink,
    adapter: Adapter,
    value: Arc<Mutex<Vec<u8>>>,
    notifier: Arc<tokio::sync::Mutex<Option<CharacteristicNotifier>>>,
    app_handle: Option<ApplicationHandle>,
    adv_handle: Option<AdvertisementHandle>,
    poll_task: Option<JoinHandle<()>>,
    timeout_task: Option<JoinHandle<()>>,
}

impl BluezPlatform {
    pub async fn new(sink: PlatformEventSink) -> anyhow::Result<Self> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(Self {
            sink,
            adapter,
            value: Arc::new(Mutex::new(Vec::new())),
            notifier: Arc::new(tokio::sync::Mutex::new(None)),
            app_handle: None,
            adv_handle: None,
            poll_task: None,
            timeout_task: None,
        })
    }

    fn characteristic(&self, uuid: Uuid, write_policy: InboundWritePolicy) -> Characteristic {
        let value = self.value.clone();
        let read_sink = self.sink.clone();
        let write_sink = self.sink.clone();
        let notifier = self.notifier.clone();

        Characteristic {
            uuid,
            read: Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |req: CharacteristicReadRequest| {
                    let value = value.clone();
                    let sink = read_sink.clone();
                    Box::pin(async move {
                        sink.send(PlatformEvent::CharacteristicRead {
                            peer: PeerId::new(req.device_address.to_string()),
                        });
                        Ok(value.lock().unwrap_or_else(PoisonError::into_inner).clone())
                    })
                }),
                ..Default::default()
            }),
            write: Some(CharacteristicWrite {
                write: true,
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |data: Vec<u8>, req: CharacteristicWriteRequest| {
                        let sink = write_sink.clone();
                        Box::pin(async move {
                            sink.send(PlatformEvent::CharacteristicWrite {
                                peer: PeerId::new(req.device_address.to_string()),
                                value: data,
                            });
                            match write_policy {
                                InboundWritePolicy::Reject => Err(ReqError::NotPermitted),
                                _ => Ok(()),
                            }
                        })
                    },
                )),
                ..Default::default()
            }),
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |subscriber| {
                    let notifier = notifier.clone();
                    Box::pin(async move {
                        debug!("Central subscribed to notifications");
                        *notifier.lock().await = Some(subscriber);
                    })
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn spawn_connection_poll(&mut self) {
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        self.poll_task = Some(tokio::spawn(async move {
            let mut known: HashSet<PeerId> = HashSet::new();
            loop {
                tokio::time::sleep(CONNECTION_POLL_INTERVAL).await;

                let addresses = match adapter.device_addresses().await {
                    Ok(addresses) => addresses,
                    Err(e) => {
                        debug!("BlueZ poll: failed to list devices: {}", e);
                        continue;
                    }
                };

                let mut current = HashSet::new();
                for addr in addresses {
                    let Ok(device) = adapter.device(addr) else {
                        continue;
                    };
                    if device.is_connected().await.unwrap_or(false) {
                        current.insert(PeerId::new(addr.to_string()));
                    }
                }

                for peer in known.difference(&current) {
                    sink.send(PlatformEvent::ConnectionStateChanged {
                        peer: peer.clone(),
                        state: LinkState::Disconnected,
                    });
                }
                for peer in current.difference(&known) {
                    sink.send(PlatformEvent::ConnectionStateChanged {
                        peer: peer.clone(),
                        state: LinkState::Connected,
                    });
                }
                known = current;
            }
        }));
    }

    fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

impl Drop for BluezPlatform {
    fn drop(&mut self) {
        self.cancel_timeout();
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl BlePlatform for BluezPlatform {
    fn name(&self) -> &'static str {
        "bluez"
    }

    async fn is_available(&self) -> bool {
        if self.adapter.is_powered().await.unwrap_or(false) {
            return true;
        }
        match self.adapter.set_powered(true).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not power on {}: {}", self.adapter.name(), e);
                false
            }
        }
    }

    async fn request_permissions(&mut self) -> PermissionStatus {
        // Access is governed by the D-Bus policy, not a runtime prompt
        PermissionStatus::AlreadyGranted
    }

    async fn register_gatt_server(
        &mut self,
        descriptor: &ServiceDescriptor,
        write_policy: InboundWritePolicy,
    ) -> Result<(), PlatformError> {
        if self.app_handle.is_some() {
            return Err(PlatformError::new("service already registered"));
        }

        let app = Application {
            services: vec![Service {
                uuid: descriptor.service_id(),
                primary: true,
                characteristics: vec![
                    self.characteristic(descriptor.characteristic_id(), write_policy)
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| PlatformError::new(e.to_string()))?;
        self.app_handle = Some(handle);
        self.spawn_connection_poll();
        info!("GATT application registered for {}", descriptor.service_id());
        Ok(())
    }

    async fn start_advertise(&mut self, request: &AdvertiseRequest) {
        self.cancel_timeout();
        let interval = request.config.mode.interval();
        let advertisement = Advertisement {
            advertisement_type: if request.config.connectable {
                Type::Peripheral
            } else {
                Type::Broadcast
            },
            service_uuids: vec![request.service_uuid].into_iter().collect(),
            local_name: request.device_name.clone(),
            discoverable: Some(true),
            min_interval: Some(interval),
            max_interval: Some(interval),
            tx_power: Some(request.config.tx_power.dbm()),
            timeout: request.config.timeout(),
            ..Default::default()
        };

        match self.adapter.advertise(advertisement).await {
            Ok(handle) => {
                self.adv_handle = Some(handle);
                self.sink.send(PlatformEvent::AdvertiseStarted);
                if let Some(timeout) = request.config.timeout() {
                    let sink = self.sink.clone();
                    self.timeout_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        sink.send(PlatformEvent::AdvertisingTimedOut);
                    }));
                }
            }
            Err(e) => {
                warn!("BlueZ refused advertisement: {}", e);
                self.sink.send(PlatformEvent::AdvertiseFailed(failure_code(&e)));
            }
        }
    }

    async fn stop_advertise(&mut self) {
        self.cancel_timeout();
        // Dropping the handle unregisters the advertisement
        self.adv_handle = None;
    }

    async fn set_characteristic_value(&mut self, value: &[u8]) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value.to_vec();
    }

    async fn notify_characteristic_changed(
        &mut self,
        peer: &PeerId,
        characteristic: Uuid,
        value: &[u8],
        _confirm: bool,
    ) {
        let mut slot = self.notifier.lock().await;
        let Some(notifier) = slot.as_mut() else {
            self.sink.send(PlatformEvent::NotificationFailed {
                peer: peer.clone(),
                reason: "no subscriber".to_string(),
            });
            return;
        };

        if let Err(e) = notifier.notify(value.to_vec()).await {
            *slot = None;
            self.sink.send(PlatformEvent::NotificationFailed {
                peer: peer.clone(),
                reason: e.to_string(),
            });
        } else {
            debug!("Notified {} on {}", peer, characteristic);
        }
    }
}
