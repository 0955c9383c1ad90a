//! Vendor command frames.
//!
//! The device has a single I/O command: an 8-byte `LBA(u32 LE) · Count(u32 LE)`
//! payload sent over the control pipe with bRequest 17. Whether it starts a
//! read or a write depends only on bmRequestType, and the info query reuses the
//! same bmRequestType as the write command. Callers therefore pick a
//! [`VendorRequest`] explicitly instead of describing raw setup fields.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{
    INFO_RESPONSE_LEN, IO_COMMAND_LEN, REQ_DEVICE_INFO, REQ_IO, RT_DIR_IN, RT_INFO, RT_READ_CMD,
    RT_WRITE_CMD,
};

/// LBA/count pair carried by a read or write command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCommand {
    pub lba: u32,
    pub block_count: u32,
}

impl IoCommand {
    pub const SIZE: usize = IO_COMMAND_LEN;

    pub fn new(lba: u32, block_count: u32) -> Self {
        Self { lba, block_count }
    }

    /// Encode as `LBA(4 LE) · Count(4 LE)`.
    pub fn to_bytes(&self) -> [u8; IO_COMMAND_LEN] {
        encode_io_command(self.lba, self.block_count)
    }

    /// Decode an 8-byte command frame.
    pub fn from_bytes(data: &[u8; IO_COMMAND_LEN]) -> Self {
        Self {
            lba: LittleEndian::read_u32(&data[0..4]),
            block_count: LittleEndian::read_u32(&data[4..8]),
        }
    }
}

/// Encode the 8-byte I/O command. Total over all inputs; range validity is
/// the caller's concern.
pub fn encode_io_command(lba: u32, count: u32) -> [u8; IO_COMMAND_LEN] {
    let mut buf = [0u8; IO_COMMAND_LEN];
    LittleEndian::write_u32(&mut buf[0..4], lba);
    LittleEndian::write_u32(&mut buf[4..8], count);
    buf
}

/// Raw USB setup fields for a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// Whether bmRequestType selects the device-to-host direction.
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & RT_DIR_IN != 0
    }
}

impl fmt::Display for ControlSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bmRequestType=0x{:02X} bRequest={} wValue={} wIndex={} wLength={}",
            self.request_type, self.request, self.value, self.index, self.length
        )
    }
}

/// Every control request the bridge issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorRequest {
    /// Mandatory init handshake returning the 31-byte device info.
    InfoQuery,
    /// Command phase of a read; followed by bulk IN.
    ReadCmd,
    /// Command phase of a write; followed by bulk OUT.
    WriteCmd,
}

impl VendorRequest {
    pub fn setup(self) -> ControlSetup {
        let (request_type, request, length) = match self {
            VendorRequest::InfoQuery => (RT_INFO, REQ_DEVICE_INFO, INFO_RESPONSE_LEN),
            VendorRequest::ReadCmd => (RT_READ_CMD, REQ_IO, IO_COMMAND_LEN),
            VendorRequest::WriteCmd => (RT_WRITE_CMD, REQ_IO, IO_COMMAND_LEN),
        };
        ControlSetup {
            request_type,
            request,
            value: 0,
            index: 0,
            length: length as u16,
        }
    }
}

impl fmt::Display for VendorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VendorRequest::InfoQuery => write!(f, "INFO"),
            VendorRequest::ReadCmd => write!(f, "READ"),
            VendorRequest::WriteCmd => write!(f, "WRITE"),
        }
    }
}
