//! The single export advertised to clients.

use super::constants::{
    MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NBD_FLAG_HAS_FLAGS, NBD_FLAG_READ_ONLY, NBD_FLAG_SEND_FLUSH,
    PREFERRED_BLOCK_SIZE,
};

/// Export metadata, fixed for the lifetime of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDescriptor {
    pub name: String,
    pub description: String,
    pub size_bytes: u64,
    pub read_only: bool,
}

impl ExportDescriptor {
    pub fn new(name: impl Into<String>, size_bytes: u64, read_only: bool) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            size_bytes,
            read_only,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Transmission flags. Resize, trim and fragmentation control are never
    /// offered; the device supports none of them.
    pub fn transmission_flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags
    }

    /// `(minimum, preferred, maximum)` block sizes.
    pub fn block_sizes(&self) -> (u32, u32, u32) {
        (MIN_BLOCK_SIZE, PREFERRED_BLOCK_SIZE, MAX_BLOCK_SIZE)
    }

    /// Whether a client-supplied name selects this export.
    ///
    /// The empty name selects the default export.
    pub fn matches(&self, requested: &str) -> bool {
        requested.is_empty() || requested == self.name
    }
}
