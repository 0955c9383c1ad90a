//! nusb-based USB transport implementation.

use std::io::{self, Read, Write};
use std::time::Duration;

use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace, warn};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::ControlSetup;
use crate::protocol::constants::{THUMBDRIVE_PRODUCT_ID, TREK_VENDOR_ID};

/// nusb-based USB transport.
pub struct NusbTransport {
    device: Device,
    interface: Option<Interface>,
    timeout: Duration,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first Trek ThumbDrive on the bus.
    pub fn open(timeout: Duration) -> Result<Self, TransportError> {
        Self::open_with_ids(TREK_VENDOR_ID, THUMBDRIVE_PRODUCT_ID, timeout)
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", skip(timeout), fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16, timeout: Duration) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        Ok(Self {
            device,
            interface: None,
            timeout,
            vid,
            pid,
        })
    }

    fn claimed(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotClaimed)
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    fn map_transfer_error(&self, err: TransferError) -> TransportError {
        match err {
            // nusb cancels a control transfer once its timeout expires
            TransferError::Cancelled => TransportError::Timeout {
                timeout_ms: self.timeout_ms(),
            },
            TransferError::Stall => TransportError::Stall,
            TransferError::Disconnected => TransportError::Disconnected,
            other => TransportError::ControlFailed(other.to_string()),
        }
    }

    fn map_io_error(&self, err: io::Error, write: bool) -> TransportError {
        match err.kind() {
            io::ErrorKind::TimedOut => TransportError::Timeout {
                timeout_ms: self.timeout_ms(),
            },
            io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => {
                TransportError::Disconnected
            }
            _ if write => TransportError::WriteFailed(err.to_string()),
            _ => TransportError::ReadFailed(err.to_string()),
        }
    }
}

/// Split a raw bmRequestType into nusb's control type and recipient.
fn split_request_type(request_type: u8) -> Result<(ControlType, Recipient), TransportError> {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        2 => ControlType::Vendor,
        _ => {
            return Err(TransportError::ControlFailed(format!(
                "reserved request type in 0x{:02X}",
                request_type
            )));
        }
    };
    let recipient = match request_type & 0x1F {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => {
            return Err(TransportError::ControlFailed(format!(
                "reserved recipient in 0x{:02X}",
                request_type
            )));
        }
    };
    Ok((control_type, recipient))
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self), fields(class = %format!("0x{:02X}", interface_class)))]
    fn configure(&mut self, interface_class: u8) -> Result<u8, TransportError> {
        if self.device.active_configuration().is_err() {
            let value = self
                .device
                .configurations()
                .next()
                .map(|c| c.configuration_value())
                .ok_or_else(|| TransportError::OpenFailed("device has no configurations".into()))?;
            self.device
                .set_configuration(value)
                .wait()
                .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
            info!(configuration = value, "Configuration selected");
        }

        let config = self
            .device
            .active_configuration()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let mut number = None;
        'search: for iface in config.interfaces() {
            for alt in iface.alt_settings() {
                if alt.class() == interface_class {
                    number = Some(alt.interface_number());
                    break 'search;
                }
            }
        }
        let number = number.ok_or(TransportError::InterfaceNotFound {
            class: interface_class,
        })?;

        let interface = self.device.claim_interface(number).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: number,
                message: e.to_string(),
            }
        })?;

        info!(interface = number, "Interface claimed");
        self.interface = Some(interface);
        Ok(number)
    }

    #[instrument(skip(self), fields(setup = %setup))]
    fn control_in(&self, setup: &ControlSetup) -> Result<Vec<u8>, TransportError> {
        let (control_type, recipient) = split_request_type(setup.request_type)?;
        let data = self
            .claimed()?
            .control_in(
                ControlIn {
                    control_type,
                    recipient,
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    length: setup.length,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| self.map_transfer_error(e))?;

        debug!(bytes_read = data.len(), "Control IN complete");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(setup = %setup, len = data.len()))]
    fn control_out(&self, setup: &ControlSetup, data: &[u8]) -> Result<usize, TransportError> {
        let (control_type, recipient) = split_request_type(setup.request_type)?;
        let interface = self.claimed()?;

        if setup.is_device_to_host() {
            // The write command's setup packet has the IN bit set. nusb cannot
            // attach an OUT data stage to it, so it goes out exactly as the
            // vendor driver sends it: an IN setup with wLength = payload size.
            trace!("Issuing command with device-to-host setup packet");
            interface
                .control_in(
                    ControlIn {
                        control_type,
                        recipient,
                        request: setup.request,
                        value: setup.value,
                        index: setup.index,
                        length: data.len() as u16,
                    },
                    self.timeout,
                )
                .wait()
                .map_err(|e| self.map_transfer_error(e))?;
            return Ok(data.len());
        }

        interface
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    data,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| self.map_transfer_error(e))?;

        debug!(bytes_written = data.len(), "Control OUT complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(ep = %format!("0x{:02X}", endpoint), len))]
    fn bulk_in(&self, endpoint: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .claimed()?
            .endpoint::<Bulk, In>(endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        // One transfer sized to the request so nothing past it is prefetched.
        let mut reader = ep
            .reader(len.max(1))
            .with_num_transfers(1)
            .with_read_timeout(self.timeout);
        let mut buf = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut && filled > 0 => {
                    warn!(expected = len, actual = filled, "Bulk IN stopped early");
                    break;
                }
                Err(e) => return Err(self.map_io_error(e, false)),
            }
        }

        buf.truncate(filled);
        debug!(bytes_read = filled, "Bulk IN complete");
        Ok(buf)
    }

    #[instrument(skip(self, data), fields(ep = %format!("0x{:02X}", endpoint), len = data.len()))]
    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let ep = self
            .claimed()?
            .endpoint::<Bulk, Out>(endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep
            .writer(data.len().max(1))
            .with_num_transfers(1)
            .with_write_timeout(self.timeout);
        writer
            .write_all(data)
            .map_err(|e| self.map_io_error(e, true))?;
        writer.flush().map_err(|e| self.map_io_error(e, true))?;

        debug!(bytes_written = data.len(), "Bulk OUT complete");
        Ok(data.len())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_vendor_endpoint() {
        for request_type in [0xC2, 0x42] {
            let split = split_request_type(request_type).unwrap();
            assert!(matches!(split, (ControlType::Vendor, Recipient::Endpoint)));
        }
    }

    #[test]
    fn test_split_rejects_reserved() {
        assert!(split_request_type(0x60).is_err());
        assert!(split_request_type(0x47).is_err());
    }
}
