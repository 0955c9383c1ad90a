//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockFault, MockTransport, TransferRecord};
pub use nusb::NusbTransport;
pub use traits::{TransportError, UsbTransport};
