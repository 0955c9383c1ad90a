//! Protocol constants for the Trek ThumbDrive vendor command set.
//!
//! Derived from USB captures of the vendor's Windows driver.

// ============================================================================
// Device Identification
// ============================================================================

/// Trek Technology (S) PTE, Ltd
pub const TREK_VENDOR_ID: u16 = 0x0A16;

/// ThumbDrive (pre mass-storage class firmware)
pub const THUMBDRIVE_PRODUCT_ID: u16 = 0x1111;

/// Interface class carrying the vendor command set
pub const VENDOR_INTERFACE_CLASS: u8 = 0xFF;

// ============================================================================
// Control Requests
// ============================================================================

/// Device info / init query
pub const REQ_DEVICE_INFO: u8 = 16;

/// Read / write I/O command
pub const REQ_IO: u8 = 17;

/// bmRequestType for the info query (vendor, IN, endpoint recipient)
pub const RT_INFO: u8 = 0xC2;

/// bmRequestType for the read command
pub const RT_READ_CMD: u8 = 0x42;

/// bmRequestType for the write command
///
/// Shares the byte with [`RT_INFO`]; the two are told apart by bRequest and
/// wLength only.
pub const RT_WRITE_CMD: u8 = 0xC2;

/// Direction bit in bmRequestType (set = device to host)
pub const RT_DIR_IN: u8 = 0x80;

// ============================================================================
// Bulk Endpoints
// ============================================================================

/// Host -> device (write data)
pub const EP_BULK_OUT: u8 = 0x02;

/// Device -> host (read data)
pub const EP_BULK_IN: u8 = 0x82;

// ============================================================================
// Size Constants
// ============================================================================

pub const SECTOR_SIZE: usize = 512;

/// Sectors reachable through the 32-bit LBA field of the I/O command
pub const MAX_ADDRESSABLE_SECTORS: u64 = 1 << 32;

/// Length of the device info response (and its own leading length field)
pub const INFO_RESPONSE_LEN: usize = 31;

/// Length of the encoded LBA/count command
pub const IO_COMMAND_LEN: usize = 8;

/// Largest chunk the device handles reliably (32 sectors / 16 KiB)
pub const DEFAULT_MAX_CHUNK_BLOCKS: u32 = 32;

// ============================================================================
// Timing
// ============================================================================

/// Deadline for every control and bulk transfer
pub const DEFAULT_USB_TIMEOUT_MS: u64 = 5000;

/// Consecutive device errors after which the session is torn down
pub const DEFAULT_MAX_DEVICE_ERRORS: u32 = 3;
