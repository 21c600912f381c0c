//! Peripheral session core: state machines, GATT model and the platform port.

pub mod advertising;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod gatt;
pub mod models;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod session_log;
pub mod settings;
