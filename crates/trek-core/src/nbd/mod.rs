//! NBD server (fixed newstyle negotiation).
//!
//! Exposes a [`BlockDevice`](crate::blockdev::BlockDevice) to the Linux
//! `nbd-client` and other NBD clients:
//!
//! - `handshake` - greeting and option haggling (`EXPORT_NAME`, `LIST`,
//!   `INFO`, `GO`, `STRUCTURED_REPLY`, `ABORT`)
//! - `transmission` - request headers, simple and structured replies
//! - `server` - accept loop and per-connection request dispatch

pub mod constants;
pub mod export;
pub mod handshake;
pub mod server;
pub mod transmission;

pub use export::ExportDescriptor;
pub use handshake::{HandshakeOutcome, Negotiated, negotiate};
pub use server::{ConnectionEnd, NbdServer};
pub use transmission::{Request, wire_error};
