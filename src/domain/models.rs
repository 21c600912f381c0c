use crate::domain::advertising::AdvertiseConfig;
use crate::domain::gatt::CharacteristicSnapshot;
use crate::domain::session_log::LogEntry;
use crate::domain::protocol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a connected central (a device address on most platforms)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected(PeerId),
}

impl ConnectionState {
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Self::Connected(peer) => Some(peer),
            Self::Disconnected => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Connected(peer) => write!(f, "Connected to {}", peer),
        }
    }
}

/// Link state carried by a platform connection callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Reason codes reported by the platform advertiser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseFailureCode {
    DataTooLarge,
    TooManyAdvertisers,
    AlreadyStarted,
    InternalError,
    FeatureUnsupported,
    Other(i32),
}

impl AdvertiseFailureCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::DataTooLarge,
            2 => Self::TooManyAdvertisers,
            3 => Self::AlreadyStarted,
            4 => Self::InternalError,
            5 => Self::FeatureUnsupported,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::DataTooLarge => 1,
            Self::TooManyAdvertisers => 2,
            Self::AlreadyStarted => 3,
            Self::InternalError => 4,
            Self::FeatureUnsupported => 5,
            Self::Other(code) => *code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::DataTooLarge => "advertisement data too large",
            Self::TooManyAdvertisers => "too many advertisers",
            Self::AlreadyStarted => "already started",
            Self::InternalError => "internal error",
            Self::FeatureUnsupported => "feature unsupported",
            Self::Other(_) => "platform error",
        }
    }
}

impl fmt::Display for AdvertiseFailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvertisingState {
    #[default]
    Idle,
    Advertising,
    Failed(AdvertiseFailureCode),
}

impl fmt::Display for AdvertisingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Advertising => f.write_str("Advertising"),
            Self::Failed(code) => write!(f, "Failed: {}", code),
        }
    }
}

/// Application signal pushed to the central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalCode {
    Closed,
    Open,
    Reset,
}

impl SignalCode {
    pub const ALL: [SignalCode; 3] = [Self::Closed, Self::Open, Self::Reset];

    pub fn token(&self) -> &'static str {
        match self {
            Self::Closed => protocol::SIGNAL_CLOSED_TOKEN,
            Self::Open => protocol::SIGNAL_OPEN_TOKEN,
            Self::Reset => protocol::SIGNAL_RESET_TOKEN,
        }
    }

    pub fn from_token(bytes: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|signal| signal.token().as_bytes() == bytes)
    }
}

impl fmt::Display for SignalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::Reset => "RESET",
        };
        write!(f, "{} (\"{}\")", name, self.token())
    }
}

/// What the session does with characteristic writes coming from the central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundWritePolicy {
    /// Acknowledge silently
    Ignore,
    /// Acknowledge and record in the session log
    #[default]
    Log,
    /// Refuse at the platform with a write-not-permitted error
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    AlreadyGranted,
    Granted,
    Denied,
}

/// Inbound notifications from the Bluetooth stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    ConnectionStateChanged { peer: PeerId, state: LinkState },
    AdvertiseStarted,
    AdvertiseFailed(AdvertiseFailureCode),
    AdvertisingTimedOut,
    CharacteristicRead { peer: PeerId },
    CharacteristicWrite { peer: PeerId, value: Vec<u8> },
    NotificationFailed { peer: PeerId, reason: String },
}

/// User actions coming from the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    StartAdvertising(AdvertiseConfig),
    StopAdvertising,
    Dispatch(SignalCode),
    ReadCurrentValue,
    InspectCharacteristic,
    ClearLog,
    ShowLog,
    RequestPermissions,
    Shutdown,
}

/// Everything the session loop consumes, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Command(UserCommand),
    Platform(PlatformEvent),
}

/// Outbound feed for the presentation layer
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionState),
    AdvertisingStatus(AdvertisingState),
    LogMessage(LogEntry),
    LogCleared,
    /// Full retained log, on request
    LogSnapshot {
        text: String,
        entries: usize,
        dropped: u64,
    },
    Characteristic(CharacteristicSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}
