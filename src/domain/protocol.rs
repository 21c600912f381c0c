//! Door Alarm Protocol
//!
//! Identifiers and wire tokens shared with the companion central
//! (a Pico W that scans for the device name, subscribes to the alert
//! characteristic and drives two output lines from the received token).

use uuid::Uuid;

/// Bluetooth Base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Expand a 16-bit assigned number into its full 128-bit form
pub const fn from_short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Generic Networking service
pub const SERVICE_UUID: Uuid = from_short_uuid(0x1201);

/// New Alert characteristic
pub const ALERT_CHAR_UUID: Uuid = from_short_uuid(0x2A46);

/// Name the companion central scans for
pub const DEFAULT_DEVICE_NAME: &str = "N9DEV";

/// Signal tokens, one ASCII byte each
pub const SIGNAL_CLOSED_TOKEN: &str = "1";
pub const SIGNAL_OPEN_TOKEN: &str = "2";
pub const SIGNAL_RESET_TOKEN: &str = "3";

/// Characteristic property bits (Bluetooth Core Vol 3, Part G, 3.3.1.1)
pub mod property {
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
}

/// Attribute permission bits
pub mod permission {
    pub const READ: u8 = 0x01;
}

/// Advertising intervals per advertise mode, in milliseconds
pub mod advertise_interval {
    pub const LOW_POWER_MS: u64 = 1000;
    pub const BALANCED_MS: u64 = 250;
    pub const LOW_LATENCY_MS: u64 = 100;
}

/// Advertising TX power per level, in dBm
pub mod tx_power {
    pub const LOW_DBM: i16 = -15;
    pub const MEDIUM_DBM: i16 = -7;
    pub const HIGH_DBM: i16 = 1;
}

/// Notifications are fire-and-forget; indications are never requested
pub const CONFIRM_DELIVERY: bool = false;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            SERVICE_UUID.to_string().to_uppercase(),
            "00001201-0000-1000-8000-00805F9B34FB"
        );
        assert_eq!(
            ALERT_CHAR_UUID.to_string().to_uppercase(),
            "00002A46-0000-1000-8000-00805F9B34FB"
        );
    }

    #[test]
    fn test_combined_property_mask() {
        assert_eq!(property::READ | property::WRITE | property::NOTIFY, 26);
    }
}
