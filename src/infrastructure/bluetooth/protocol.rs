//! Counter Peripheral Protocol
//!
//! Identity of the target peripheral and the notification payload format.

use crate::domain::models::{CounterValue, DeviceIdentity};

/// Hardware address of the counter peripheral
pub const DEVICE_ADDRESS: &str = "C8:78:44:7D:FE:EF";

/// Nordic UART Service
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// UART TX characteristic, notifies the counter
pub const CHARACTERISTIC_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CCD_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

/// CCD value that turns notifications on
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

pub const TARGET: DeviceIdentity = DeviceIdentity {
    address: DEVICE_ADDRESS,
    service_uuid: SERVICE_UUID,
    characteristic_uuid: CHARACTERISTIC_UUID,
    ccd_uuid: CCD_UUID,
};

/// Decode a notification payload into a counter.
///
/// ```text
/// [0]  : counter (u8)
/// [1..]: ignored
/// ```
///
/// A missing or empty payload reads as zero instead of failing.
pub fn decode_counter(payload: Option<&[u8]>) -> CounterValue {
    let value = payload
        .and_then(|bytes| bytes.first())
        .copied()
        .map(u32::from)
        .unwrap_or(0);

    #[cfg(debug_assertions)]
    tracing::trace!("Raw payload: {:02X?} -> {}", payload, value);

    CounterValue(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_byte() {
        assert_eq!(decode_counter(Some(&[5])), CounterValue(5));
    }

    #[test]
    fn test_decode_empty_payload_is_zero() {
        assert_eq!(decode_counter(Some(&[])), CounterValue(0));
        assert_eq!(decode_counter(None), CounterValue(0));
    }

    #[test]
    fn test_decode_reads_first_byte_only() {
        assert_eq!(decode_counter(Some(&[255, 1])), CounterValue(255));
    }

    #[test]
    fn test_target_identity() {
        assert_eq!(TARGET.address, "C8:78:44:7D:FE:EF");
        assert_eq!(TARGET.ccd_uuid, CCD_UUID);
    }
}
