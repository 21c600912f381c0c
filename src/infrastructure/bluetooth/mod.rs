//! Bluetooth Module
//!
//! Platform backends for the door alarm peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   PeripheralSession                      │
//! │      (owns state, talks to the radio via BlePlatform)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │ Simulated │  │  Windows   │  │   BlueZ   │
//! │           │  │            │  │           │
//! │ - tests   │  │ - GATT     │  │ - bluer   │
//! │ - demo    │  │   provider │  │ - D-Bus   │
//! └───────────┘  └────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`simulated`] - In-process radio used by tests and the demo backend
//! - `winrt` - `GattServiceProvider` backend (Windows only)
//! - `bluez` - BlueZ backend (Linux, `bluez` feature)

pub mod simulated;

#[cfg(windows)]
pub mod winrt;

#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod bluez;
