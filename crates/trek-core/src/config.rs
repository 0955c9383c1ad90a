//! Bridge configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::nbd::constants::NBD_DEFAULT_PORT;
use crate::protocol::constants::{
    DEFAULT_MAX_CHUNK_BLOCKS, DEFAULT_MAX_DEVICE_ERRORS, DEFAULT_USB_TIMEOUT_MS,
    THUMBDRIVE_PRODUCT_ID, TREK_VENDOR_ID,
};
use crate::session::SessionOptions;

/// Largest chunk whose byte length still fits a u32.
const MAX_CHUNK_BLOCKS_LIMIT: u32 = 32_768;

/// Configuration for the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address to listen on.
    pub bind_address: String,
    /// TCP port.
    pub port: u16,
    /// Name of the single export.
    pub export_name: String,
    /// Export the device read-only.
    pub read_only: bool,
    /// Largest number of sectors per USB transaction.
    pub max_chunk_blocks: u32,
    /// Deadline for each USB transfer.
    pub usb_timeout_ms: u64,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Consecutive device errors before the session is torn down.
    pub max_device_errors: u32,
    /// Serve this disk image instead of the USB device.
    pub image_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: NBD_DEFAULT_PORT,
            export_name: "trek".to_string(),
            read_only: false,
            max_chunk_blocks: DEFAULT_MAX_CHUNK_BLOCKS,
            usb_timeout_ms: DEFAULT_USB_TIMEOUT_MS,
            vendor_id: TREK_VENDOR_ID,
            product_id: THUMBDRIVE_PRODUCT_ID,
            max_device_errors: DEFAULT_MAX_DEVICE_ERRORS,
            image_path: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_CHUNK_BLOCKS_LIMIT).contains(&self.max_chunk_blocks),
            "max_chunk_blocks must be between 1 and {}, got {}",
            MAX_CHUNK_BLOCKS_LIMIT,
            self.max_chunk_blocks
        );
        ensure!(self.usb_timeout_ms > 0, "usb_timeout_ms must be positive");
        ensure!(
            self.max_device_errors >= 1,
            "max_device_errors must be at least 1"
        );
        ensure!(!self.export_name.is_empty(), "export_name must not be empty");
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn usb_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_timeout_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_device_errors: self.max_device_errors,
        }
    }
}
