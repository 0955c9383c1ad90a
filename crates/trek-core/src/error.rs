//! Bridge error taxonomy.
//!
//! Every layer above the USB transport reports failures as a [`BridgeError`].
//! The NBD server maps them onto wire error codes and decides, via
//! [`BridgeError::is_session_fatal`], whether the connection can stay open.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Device initialization failed: {0}")]
    InitFailed(String),

    #[error("Malformed device response: {0}")]
    MalformedResponse(String),

    #[error("Out of range: lba={lba} count={count} exceeds {total_sectors} sectors")]
    OutOfRange {
        lba: u64,
        count: u64,
        total_sectors: u64,
    },

    #[error("Misaligned request: offset={offset} length={length} (sector size {sector_size})")]
    Misaligned {
        offset: u64,
        length: u64,
        sector_size: usize,
    },

    #[error("Unaligned write: {len} bytes is not a multiple of {sector_size}")]
    UnalignedWrite { len: usize, sector_size: usize },

    #[error("USB transfer timed out after {timeout_ms}ms")]
    IoTimeout { timeout_ms: u64 },

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Device session is closed")]
    SessionClosed,

    #[error("Export is read-only")]
    ReadOnly,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Failures that originate from the device or the USB link.
    ///
    /// These are recoverable per request but count towards session teardown.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            BridgeError::IoTimeout { .. } | BridgeError::ShortTransfer { .. } | BridgeError::Transport(_)
        )
    }

    /// Failures after which the device session can no longer serve requests.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::SessionClosed
                | BridgeError::InitFailed(_)
                | BridgeError::MalformedResponse(_)
                | BridgeError::Transport(TransportError::Disconnected)
        )
    }

    /// Convert a transport failure observed during a data transaction.
    ///
    /// Timeouts surface as [`BridgeError::IoTimeout`]; everything else keeps its
    /// transport detail.
    pub(crate) fn from_transfer(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { timeout_ms } => BridgeError::IoTimeout { timeout_ms },
            other => BridgeError::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
