//! Error types for the peripheral session

use crate::domain::models::AdvertiseFailureCode;
use thiserror::Error;

/// Errors surfaced by the session core.
///
/// Only `PlatformUnavailable` and `Registration` abort startup; the others are
/// reported to the user, who may retry the same action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Bluetooth LE is not available: {0}")]
    PlatformUnavailable(String),

    #[error("Bluetooth permissions were denied")]
    PermissionDenied,

    #[error("Advertisement failed: {0}")]
    AdvertiseFailure(AdvertiseFailureCode),

    #[error("Failed to register GATT server: {0}")]
    Registration(String),
}

/// Failure reported synchronously by a platform backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PlatformError(pub String);

impl PlatformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
