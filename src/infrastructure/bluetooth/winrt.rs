//! Windows GATT Server Backend
//!
//! Hosts the door alarm service through `GattServiceProvider`. Windows has no
//! connection callback for peripherals, so a central counts as connected while
//! it is subscribed to the alert characteristic.

use crate::domain::advertising::AdvertiseRequest;
use crate::domain::error::PlatformError;
use crate::domain::gatt::ServiceDescriptor;
use crate::domain::models::{
    AdvertiseFailureCode, InboundWritePolicy, LinkState, PeerId, PermissionStatus, PlatformEvent,
};
use crate::domain::platform::{BlePlatform, PlatformEventSink};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use windows::core::{Ref, GUID};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristicProperties, GattLocalCharacteristic, GattLocalCharacteristicParameters,
    GattProtectionLevel, GattProtocolError, GattReadRequestedEventArgs, GattServiceProvider,
    GattServiceProviderAdvertisementStatus, GattServiceProviderAdvertisementStatusChangedEventArgs,
    GattServiceProviderAdvertisingParameters, GattSubscribedClient, GattWriteRequestedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothAdapter, BluetoothError};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_buffer(bytes: &[u8]) -> windows::core::Result<IBuffer> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(bytes)?;
    writer.DetachBuffer()
}

fn from_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn client_id(client: &GattSubscribedClient) -> windows::core::Result<PeerId> {
    Ok(PeerId::new(client.Session()?.DeviceId()?.Id()?.to_string()))
}

fn failure_code(error: BluetoothError) -> AdvertiseFailureCode {
    match error {
        BluetoothError::NotSupported => AdvertiseFailureCode::FeatureUnsupported,
        BluetoothError::ResourceInUse => AdvertiseFailureCode::TooManyAdvertisers,
        BluetoothError::RadioNotAvailable | BluetoothError::OtherError => {
            AdvertiseFailureCode::InternalError
        }
        other => AdvertiseFailureCode::Other(other.0),
    }
}

struct Hosted {
    provider: GattServiceProvider,
    characteristic: GattLocalCharacteristic,
}

pub struct WindowsPlatform {
    sink: PlatformEventSink,
    hosted: Option<Hosted>,
    value: Arc<Mutex<Vec<u8>>>,
    timeout_task: Option<JoinHandle<()>>,
}

impl WindowsPlatform {
    pub fn new(sink: PlatformEventSink) -> Self {
        Self {
            sink,
            hosted: None,
            value: Arc::new(Mutex::new(Vec::new())),
            timeout_task: None,
        }
    }

    async fn host(
        &self,
        descriptor: &ServiceDescriptor,
        write_policy: InboundWritePolicy,
    ) -> windows::core::Result<Result<Hosted, PlatformError>> {
        let result = GattServiceProvider::CreateAsync(to_guid(descriptor.service_id()))?.await?;
        if result.Error()? != BluetoothError::Success {
            return Ok(Err(PlatformError::new(format!(
                "GattServiceProvider::CreateAsync returned {:?}",
                result.Error()?
            ))));
        }
        let provider = result.ServiceProvider()?;

        let parameters = GattLocalCharacteristicParameters::new()?;
        parameters.SetCharacteristicProperties(
            GattCharacteristicProperties::Read
                | GattCharacteristicProperties::Write
                | GattCharacteristicProperties::Notify,
        )?;
        parameters.SetReadProtectionLevel(GattProtectionLevel::Plain)?;
        parameters.SetWriteProtectionLevel(GattProtectionLevel::Plain)?;

        let created = provider
            .Service()?
            .CreateCharacteristicAsync(to_guid(descriptor.characteristic_id()), &parameters)?
            .await?;
        if created.Error()? != BluetoothError::Success {
            return Ok(Err(PlatformError::new(format!(
                "CreateCharacteristicAsync returned {:?}",
                created.Error()?
            ))));
        }
        let characteristic = created.Characteristic()?;

        self.attach_read_handler(&characteristic)?;
        self.attach_write_handler(&characteristic, write_policy)?;
        self.attach_subscription_handler(&characteristic)?;
        self.attach_status_handler(&provider)?;

        Ok(Ok(Hosted {
            provider,
            characteristic,
        }))
    }

    fn attach_read_handler(&self, characteristic: &GattLocalCharacteristic) -> windows::core::Result<()> {
        let sink = self.sink.clone();
        let value = self.value.clone();
        let handler = TypedEventHandler::new(
            move |_: Ref<GattLocalCharacteristic>, args: Ref<GattReadRequestedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let deferral = args.GetDeferral()?;
                    let peer = PeerId::new(args.Session()?.DeviceId()?.Id()?.to_string());
                    let request = args.GetRequestAsync()?.get()?;
                    let bytes = value.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    request.RespondWithValue(&to_buffer(&bytes)?)?;
                    deferral.Complete()?;
                    sink.send(PlatformEvent::CharacteristicRead { peer });
                }
                Ok(())
            },
        );
        characteristic.ReadRequested(&handler)?;
        Ok(())
    }

    fn attach_write_handler(
        &self,
        characteristic: &GattLocalCharacteristic,
        write_policy: InboundWritePolicy,
    ) -> windows::core::Result<()> {
        let sink = self.sink.clone();
        let handler = TypedEventHandler::new(
            move |_: Ref<GattLocalCharacteristic>, args: Ref<GattWriteRequestedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let deferral = args.GetDeferral()?;
                    let peer = PeerId::new(args.Session()?.DeviceId()?.Id()?.to_string());
                    let request = args.GetRequestAsync()?.get()?;
                    let value = from_buffer(&request.Value()?)?;
                    if write_policy == InboundWritePolicy::Reject {
                        request.RespondWithProtocolError(GattProtocolError::WriteNotPermitted()?)?;
                    } else {
                        request.Respond()?;
                    }
                    deferral.Complete()?;
                    sink.send(PlatformEvent::CharacteristicWrite { peer, value });
                }
                Ok(())
            },
        );
        characteristic.WriteRequested(&handler)?;
        Ok(())
    }

    fn attach_subscription_handler(
        &self,
        characteristic: &GattLocalCharacteristic,
    ) -> windows::core::Result<()> {
        let sink = self.sink.clone();
        let known: Arc<Mutex<HashSet<PeerId>>> = Arc::new(Mutex::new(HashSet::new()));
        let handler = TypedEventHandler::new(
            move |sender: Ref<GattLocalCharacteristic>, _: Ref<windows::core::IInspectable>| {
                let Some(characteristic) = sender.as_ref() else {
                    return Ok(());
                };
                let clients = characteristic.SubscribedClients()?;
                let mut current = HashSet::new();
                for i in 0..clients.Size()? {
                    current.insert(client_id(&clients.GetAt(i)?)?);
                }

                let mut known = known.lock().unwrap_or_else(PoisonError::into_inner);
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
                *known = current;
                Ok(())
            },
        );
        characteristic.SubscribedClientsChanged(&handler)?;
        Ok(())
    }

    fn attach_status_handler(&self, provider: &GattServiceProvider) -> windows::core::Result<()> {
        let sink = self.sink.clone();
        let handler = TypedEventHandler::new(
            move |_: Ref<GattServiceProvider>,
                  args: Ref<GattServiceProviderAdvertisementStatusChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let status = args.Status()?;
                    debug!("Advertisement status changed: {:?}", status);
                    match status {
                        GattServiceProviderAdvertisementStatus::Started => {
                            sink.send(PlatformEvent::AdvertiseStarted);
                        }
                        GattServiceProviderAdvertisementStatus::Aborted => {
                            sink.send(PlatformEvent::AdvertiseFailed(failure_code(args.Error()?)));
                        }
                        _ => {}
                    }
                }
                Ok(())
            },
        );
        provider.AdvertisementStatusChanged(&handler)?;
        Ok(())
    }

    fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl BlePlatform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    async fn is_available(&self) -> bool {
        let adapter = match BluetoothAdapter::GetDefaultAsync() {
            Ok(op) => op.await,
            Err(e) => Err(e),
        };
        match adapter {
            Ok(adapter) => adapter.IsPeripheralRoleSupported().unwrap_or(false),
            Err(e) => {
                warn!("No default Bluetooth adapter: {:?}", e);
                false
            }
        }
    }

    async fn request_permissions(&mut self) -> PermissionStatus {
        // Desktop apps hold the Bluetooth capability without a prompt
        PermissionStatus::AlreadyGranted
    }

    async fn register_gatt_server(
        &mut self,
        descriptor: &ServiceDescriptor,
        write_policy: InboundWritePolicy,
    ) -> Result<(), PlatformError> {
        if self.hosted.is_some() {
            return Err(PlatformError::new("service already registered"));
        }
        let hosted = self
            .host(descriptor, write_policy)
            .await
            .map_err(|e| PlatformError::new(format!("{:?}", e)))??;
        info!("GATT service {} hosted", descriptor.service_id());
        self.hosted = Some(hosted);
        Ok(())
    }

    async fn start_advertise(&mut self, request: &AdvertiseRequest) {
        self.cancel_timeout();
        let Some(hosted) = &self.hosted else {
            self.sink
                .send(PlatformEvent::AdvertiseFailed(AdvertiseFailureCode::InternalError));
            return;
        };

        debug!(
            "Windows picks interval and TX power itself; requested {:?} / {} dBm",
            request.config.mode.interval(),
            request.config.tx_power.dbm()
        );
        if request.device_name.is_some() {
            debug!("Local name comes from the system device name");
        }

        let started = GattServiceProviderAdvertisingParameters::new().and_then(|parameters| {
            parameters.SetIsConnectable(request.config.connectable)?;
            parameters.SetIsDiscoverable(true)?;
            hosted.provider.StartAdvertisingWithParameters(&parameters)
        });
        if let Err(e) = started {
            error!("StartAdvertising failed: {:?}", e);
            self.sink
                .send(PlatformEvent::AdvertiseFailed(AdvertiseFailureCode::InternalError));
            return;
        }

        if let Some(timeout) = request.config.timeout() {
            let provider = hosted.provider.clone();
            let sink = self.sink.clone();
            self.timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Err(e) = provider.StopAdvertising() {
                    warn!("StopAdvertising after timeout failed: {:?}", e);
                }
                sink.send(PlatformEvent::AdvertisingTimedOut);
            }));
        }
    }

    async fn stop_advertise(&mut self) {
        self.cancel_timeout();
        if let Some(hosted) = &self.hosted {
            if let Err(e) = hosted.provider.StopAdvertising() {
                warn!("StopAdvertising failed: {:?}", e);
            }
        }
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
        let Some(hosted) = &self.hosted else {
            return;
        };

        let result: windows::core::Result<bool> = async {
            let buffer = to_buffer(value)?;
            let clients = hosted.characteristic.SubscribedClients()?;
            for i in 0..clients.Size()? {
                let client = clients.GetAt(i)?;
                if &client_id(&client)? == peer {
                    hosted
                        .characteristic
                        .NotifyValueForSubscribedClientAsync(&buffer, &client)?
                        .await?;
                    return Ok(true);
                }
            }
            Ok(false)
        }
        .await;

        match result {
            Ok(true) => debug!("Notified {} on {}", peer, characteristic),
            Ok(false) => {
                self.sink.send(PlatformEvent::NotificationFailed {
                    peer: peer.clone(),
                    reason: "peer is not subscribed".to_string(),
                });
            }
            Err(e) => {
                self.sink.send(PlatformEvent::NotificationFailed {
                    peer: peer.clone(),
                    reason: format!("{:?}", e),
                });
            }
        }
    }
}
