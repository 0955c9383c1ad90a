//! Event system for UI decoupling.
//!
//! The NBD server reports connection lifecycle and request outcomes through a
//! [`BridgeObserver`] instead of logging directly, so a front end can present
//! them however it likes.

use std::fmt;

/// NBD transmission commands as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
    Flush,
    Disconnect,
    Other(u16),
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Read => write!(f, "READ"),
            RequestKind::Write => write!(f, "WRITE"),
            RequestKind::Flush => write!(f, "FLUSH"),
            RequestKind::Disconnect => write!(f, "DISC"),
            RequestKind::Other(code) => write!(f, "CMD({})", code),
        }
    }
}

/// Events emitted by the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Server is accepting connections.
    Listening { address: String, export: String },
    /// TCP connection accepted.
    ClientConnected { peer: String },
    /// Option haggling finished; transmission phase starts.
    HandshakeComplete {
        peer: String,
        size: u64,
        structured_replies: bool,
    },
    /// A request completed successfully.
    Request {
        kind: RequestKind,
        offset: u64,
        length: u32,
    },
    /// A request failed and was answered with an error code.
    RequestFailed {
        kind: RequestKind,
        offset: u64,
        length: u32,
        code: u32,
        message: String,
    },
    /// Connection ended.
    ClientDisconnected { peer: String },
    /// The device session stopped serving; the bridge shuts down.
    SessionTornDown { reason: String },
}

/// Observer trait for receiving bridge events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait BridgeObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &BridgeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BridgeObserver for NullObserver {
    fn on_event(&self, _event: &BridgeEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::Listening { address, export } => {
                tracing::info!(address = %address, export = %export, "NBD server listening");
            }
            BridgeEvent::ClientConnected { peer } => {
                tracing::info!(peer = %peer, "Client connected");
            }
            BridgeEvent::HandshakeComplete {
                peer,
                size,
                structured_replies,
            } => {
                tracing::info!(
                    peer = %peer,
                    size,
                    structured_replies,
                    "Handshake complete"
                );
            }
            BridgeEvent::Request {
                kind,
                offset,
                length,
            } => {
                tracing::trace!(kind = %kind, offset, length, "Request");
            }
            BridgeEvent::RequestFailed {
                kind,
                offset,
                length,
                code,
                message,
            } => {
                tracing::warn!(kind = %kind, offset, length, code, "Request failed: {}", message);
            }
            BridgeEvent::ClientDisconnected { peer } => {
                tracing::info!(peer = %peer, "Client session ended");
            }
            BridgeEvent::SessionTornDown { reason } => {
                tracing::error!(reason = %reason, "Device session torn down");
            }
        }
    }
}
