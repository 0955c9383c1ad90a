//! Trek-Core: Trek ThumbDrive vendor protocol and NBD bridge in Rust.
//!
//! This crate drives the proprietary USB command set of the Trek ThumbDrive
//! (VID 0x0A16, PID 0x1111) and exposes the drive as a Network Block Device,
//! so a Linux host can attach it with `nbd-client` and treat it as an
//! ordinary disk.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Vendor constants, command frames, device info decoding
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Session**: Serialized command+data transactions, teardown policy
//! - **Blockdev**: Sector device trait, disk image backend
//! - **Translator**: Byte offsets to chunked sector I/O
//! - **NBD**: Fixed-newstyle handshake and transmission server
//! - **Events**: Observer pattern for UI decoupling
//! - **Config**: TOML bridge configuration
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpListener;
//! use std::time::Duration;
//!
//! use trek_core::nbd::{ExportDescriptor, NbdServer};
//! use trek_core::session::DeviceSession;
//! use trek_core::translator::BlockIo;
//! use trek_core::transport::NusbTransport;
//!
//! let transport = NusbTransport::open(Duration::from_millis(5000))?;
//! let io = BlockIo::new(DeviceSession::open(transport)?);
//! let export = ExportDescriptor::new("trek", io.capacity(), false);
//! let server = NbdServer::new(io, export);
//! server.serve(TcpListener::bind("0.0.0.0:10809")?)?;
//! # Ok::<(), trek_core::BridgeError>(())
//! ```

pub mod blockdev;
pub mod config;
pub mod error;
pub mod events;
pub mod nbd;
pub mod protocol;
pub mod session;
pub mod translator;
pub mod transport;

// Re-exports for convenience
pub use blockdev::{BlockDevice, FileBlockDevice};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use events::{BridgeEvent, BridgeObserver, NullObserver, RequestKind, TracingObserver};
pub use nbd::{ExportDescriptor, NbdServer};
pub use protocol::{DeviceInfo, IoCommand, VendorRequest};
pub use session::{DeviceSession, SessionOptions};
pub use translator::{BlockIo, ChunkPlan};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
