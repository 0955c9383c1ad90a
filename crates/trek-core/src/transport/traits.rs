//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for USB communication,
//! allowing different implementations (nusb, mock, etc.).

use crate::protocol::ControlSetup;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("No interface with class 0x{class:02X}")]
    InterfaceNotFound { class: u8 },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Interface not claimed")]
    NotClaimed,

    #[error("Control transfer failed: {0}")]
    ControlFailed(String),

    #[error("Endpoint stalled")]
    Stall,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract USB transport interface.
///
/// The transport owns the device handle and knows nothing about the Trek
/// command format. Every transfer is bounded by the transport's timeout.
pub trait UsbTransport: Send + Sync {
    /// Select a configuration if needed and claim the first interface of
    /// `interface_class`. Returns the claimed interface number.
    fn configure(&mut self, interface_class: u8) -> Result<u8, TransportError>;

    /// Control transfer device -> host of `setup.length` bytes.
    fn control_in(&self, setup: &ControlSetup) -> Result<Vec<u8>, TransportError>;

    /// Control transfer carrying `data` as its payload.
    fn control_out(&self, setup: &ControlSetup, data: &[u8]) -> Result<usize, TransportError>;

    /// Bulk IN transfer of up to `len` bytes.
    ///
    /// A transfer that stops early returns the bytes received so far.
    fn bulk_in(&self, endpoint: u8, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Bulk OUT transfer. Returns the number of bytes accepted by the device.
    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
