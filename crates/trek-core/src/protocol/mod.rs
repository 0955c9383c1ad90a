//! Protocol module - Trek vendor command set.

pub mod command;
pub mod constants;
pub mod device_info;

pub use command::{ControlSetup, IoCommand, VendorRequest, encode_io_command};
pub use constants::*;
pub use device_info::{DeviceInfo, encode_device_info};
