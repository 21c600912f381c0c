//! Platform port
//!
//! The radio, advertiser and GATT server belong to the operating system. The
//! session reaches them through [`BlePlatform`]; their callbacks come back as
//! [`PlatformEvent`]s through a [`PlatformEventSink`].

use crate::domain::advertising::AdvertiseRequest;
use crate::domain::error::PlatformError;
use crate::domain::gatt::ServiceDescriptor;
use crate::domain::models::{
    InboundWritePolicy, PeerId, PermissionStatus, PlatformEvent, SessionInput,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound calls into the Bluetooth stack.
///
/// Advertising and notification calls only submit the request; outcomes are
/// delivered later as platform events.
#[async_trait]
pub trait BlePlatform: Send {
    fn name(&self) -> &'static str;

    async fn is_available(&self) -> bool;

    async fn request_permissions(&mut self) -> PermissionStatus;

    async fn register_gatt_server(
        &mut self,
        descriptor: &ServiceDescriptor,
        write_policy: InboundWritePolicy,
    ) -> Result<(), PlatformError>;

    async fn start_advertise(&mut self, request: &AdvertiseRequest);

    async fn stop_advertise(&mut self);

    /// Value served to read requests from now on
    async fn set_characteristic_value(&mut self, value: &[u8]);

    async fn notify_characteristic_changed(
        &mut self,
        peer: &PeerId,
        characteristic: Uuid,
        value: &[u8],
        confirm: bool,
    );
}

/// Callback side of the platform: posts events into the session input queue
#[derive(Debug, Clone)]
pub struct PlatformEventSink {
    tx: mpsc::UnboundedSender<SessionInput>,
}

impl PlatformEventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { tx }
    }

    /// Returns false once the session loop is gone
    pub fn send(&self, event: PlatformEvent) -> bool {
        self.tx.send(SessionInput::Platform(event)).is_ok()
    }
}
