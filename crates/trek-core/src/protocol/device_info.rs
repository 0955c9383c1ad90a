//! Device info response (bRequest 16).
//!
//! Layout, all little-endian:
//!
//! | Offset | Size | Field                         |
//! |--------|------|-------------------------------|
//! | 0x00   | 2    | response length (0x001F)      |
//! | 0x02   | 2    | vendor ID                     |
//! | 0x04   | 2    | product ID                    |
//! | 0x06   | 4    | reserved                      |
//! | 0x0A   | 1    | unknown                       |
//! | 0x0B   | 4    | size parameter 1              |
//! | 0x0F   | 4    | size parameter 2              |
//! | 0x13   | 12   | padding                       |
//!
//! The product of the two size parameters is the sector count.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{INFO_RESPONSE_LEN, SECTOR_SIZE};
use crate::error::BridgeError;

const OFFSET_LENGTH: usize = 0x00;
const OFFSET_VID: usize = 0x02;
const OFFSET_PID: usize = 0x04;
const OFFSET_SIZE1: usize = 0x0B;
const OFFSET_SIZE2: usize = 0x0F;

/// Parsed device info. Immutable once the session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub size_param1: u32,
    pub size_param2: u32,
    pub total_sectors: u64,
    pub raw: Vec<u8>,
}

impl DeviceInfo {
    pub const SIZE: usize = INFO_RESPONSE_LEN;

    pub fn from_bytes(data: &[u8]) -> Result<Self, BridgeError> {
        if data.len() != Self::SIZE {
            return Err(BridgeError::MalformedResponse(format!(
                "info response is {} bytes, expected {}",
                data.len(),
                Self::SIZE
            )));
        }

        let length = LittleEndian::read_u16(&data[OFFSET_LENGTH..]);
        if length as usize != Self::SIZE {
            return Err(BridgeError::MalformedResponse(format!(
                "info length field is 0x{:04X}, expected 0x{:04X}",
                length,
                Self::SIZE
            )));
        }

        let size_param1 = LittleEndian::read_u32(&data[OFFSET_SIZE1..]);
        let size_param2 = LittleEndian::read_u32(&data[OFFSET_SIZE2..]);
        let total_sectors = size_param1 as u64 * size_param2 as u64;
        if total_sectors.checked_mul(SECTOR_SIZE as u64).is_none() {
            return Err(BridgeError::MalformedResponse(format!(
                "{} x {} sectors overflows a 64-bit byte count",
                size_param1, size_param2
            )));
        }

        Ok(Self {
            vendor_id: LittleEndian::read_u16(&data[OFFSET_VID..]),
            product_id: LittleEndian::read_u16(&data[OFFSET_PID..]),
            size_param1,
            size_param2,
            total_sectors,
            raw: data.to_vec(),
        })
    }

    pub fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Capacity in bytes. Saturates for hand-built values; decoded
    /// responses are checked to fit.
    pub fn total_bytes(&self) -> u64 {
        self.total_sectors.saturating_mul(SECTOR_SIZE as u64)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VID={:04X} PID={:04X} capacity={} bytes ({} MB, {} sectors)",
            self.vendor_id,
            self.product_id,
            self.total_bytes(),
            self.total_bytes() / (1024 * 1024),
            self.total_sectors
        )
    }
}

/// Build an info response for the given IDs and size parameters.
///
/// Used by the simulated device; mirrors the layout documented above.
pub fn encode_device_info(vid: u16, pid: u16, size1: u32, size2: u32) -> [u8; INFO_RESPONSE_LEN] {
    let mut buf = [0u8; INFO_RESPONSE_LEN];
    LittleEndian::write_u16(&mut buf[OFFSET_LENGTH..], INFO_RESPONSE_LEN as u16);
    LittleEndian::write_u16(&mut buf[OFFSET_VID..], vid);
    LittleEndian::write_u16(&mut buf[OFFSET_PID..], pid);
    LittleEndian::write_u32(&mut buf[OFFSET_SIZE1..], size1);
    LittleEndian::write_u32(&mut buf[OFFSET_SIZE2..], size2);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Info response captured from a 32 MB ThumbDrive.
    const SAMPLE: [u8; 31] = [
        0x1F, 0x00, 0x16, 0x0A, 0x11, 0x11, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0x00, 0x00,
        0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];

    #[test]
    fn test_sample_capacity() {
        let info = DeviceInfo::from_bytes(&SAMPLE).unwrap();
        assert_eq!(info.vendor_id, 0x0A16);
        assert_eq!(info.product_id, 0x1111);
        assert_eq!(info.size_param1, 0x0800);
        assert_eq!(info.size_param2, 0x20);
        assert_eq!(info.total_sectors, 65_536);
        assert_eq!(info.total_bytes(), 33_554_432);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = DeviceInfo::from_bytes(&SAMPLE[..30]).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedResponse(_)));

        let mut long = SAMPLE.to_vec();
        long.push(0);
        assert!(DeviceInfo::from_bytes(&long).is_err());
    }

    #[test]
    fn test_length_field_mismatch_rejected() {
        let mut bad = SAMPLE;
        bad[0] = 0x16;
        let err = DeviceInfo::from_bytes(&bad).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedResponse(_)));
    }

    #[test]
    fn test_encode_matches_sample() {
        let encoded = encode_device_info(0x0A16, 0x1111, 0x0800, 0x20);
        let info = DeviceInfo::from_bytes(&encoded).unwrap();
        assert_eq!(info.total_sectors, 65_536);
        assert_eq!(&encoded[..6], &SAMPLE[..6]);
        assert_eq!(&encoded[0x0B..0x13], &SAMPLE[0x0B..0x13]);
    }

    #[test]
    fn test_byte_count_overflow_rejected() {
        let encoded = encode_device_info(0x0A16, 0x1111, u32::MAX, u32::MAX);
        let err = DeviceInfo::from_bytes(&encoded).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedResponse(_)));

        // 2^33 sectors still has a representable byte count.
        let encoded = encode_device_info(0x0A16, 0x1111, 1 << 20, 1 << 13);
        let info = DeviceInfo::from_bytes(&encoded).unwrap();
        assert_eq!(info.total_bytes(), 1 << 42);
    }

    #[test]
    fn test_display() {
        let info = DeviceInfo::from_bytes(&SAMPLE).unwrap();
        assert_eq!(
            info.to_string(),
            "VID=0A16 PID=1111 capacity=33554432 bytes (32 MB, 65536 sectors)"
        );
    }
}
