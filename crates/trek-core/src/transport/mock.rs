//! Mock USB transport for testing.
//!
//! Simulates a Trek ThumbDrive: answers the info query, remembers the last
//! I/O command and serves the following bulk phase from an in-memory backing
//! store. Clones share state, so a test can keep one handle while the session
//! owns the other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{
    EP_BULK_IN, EP_BULK_OUT, IO_COMMAND_LEN, REQ_DEVICE_INFO, REQ_IO, RT_INFO, RT_READ_CMD,
    RT_WRITE_CMD, SECTOR_SIZE, THUMBDRIVE_PRODUCT_ID, TREK_VENDOR_ID,
};
use crate::protocol::{ControlSetup, IoCommand, encode_device_info};

/// One observed USB transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferRecord {
    Configure { class: u8 },
    InfoQuery,
    ReadCommand(IoCommand),
    WriteCommand(IoCommand),
    BulkIn { endpoint: u8, len: usize },
    BulkOut { endpoint: u8, len: usize },
}

impl TransferRecord {
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            TransferRecord::ReadCommand(_) | TransferRecord::WriteCommand(_)
        )
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            TransferRecord::BulkIn { .. } | TransferRecord::BulkOut { .. }
        )
    }
}

/// Failure injected into the next data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    Timeout,
    /// Deliver only this many bytes.
    Short(usize),
    Stall,
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Read(IoCommand),
    Write(IoCommand),
}

struct MockState {
    info_response: Option<Vec<u8>>,
    storage: Vec<u8>,
    pending: Option<Pending>,
    log: Vec<TransferRecord>,
    faults: VecDeque<MockFault>,
    connected: bool,
    claimed: bool,
}

/// Mock transport simulating the vendor command set.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    /// Sleep inserted into every transfer, before it is recorded.
    phase_delay: Duration,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    /// Simulated device with `total_sectors` zeroed sectors.
    ///
    /// The sector count is encoded as `total_sectors / 32` x `32`, the way
    /// real units report it; it must therefore be a multiple of 32.
    pub fn new(total_sectors: u32) -> Self {
        Self::with_size_params(total_sectors / 32, 32)
    }

    /// Simulated device reporting the given size parameters.
    pub fn with_size_params(size1: u32, size2: u32) -> Self {
        let sectors = size1 as usize * size2 as usize;
        Self {
            state: Arc::new(Mutex::new(MockState {
                info_response: Some(
                    encode_device_info(TREK_VENDOR_ID, THUMBDRIVE_PRODUCT_ID, size1, size2)
                        .to_vec(),
                ),
                storage: vec![0u8; sectors * SECTOR_SIZE],
                pending: None,
                log: Vec::new(),
                faults: VecDeque::new(),
                connected: true,
                claimed: false,
            })),
            phase_delay: Duration::ZERO,
            vid: TREK_VENDOR_ID,
            pid: THUMBDRIVE_PRODUCT_ID,
        }
    }

    /// Sleep for `delay` inside every transfer.
    pub fn with_phase_delay(mut self, delay: Duration) -> Self {
        self.phase_delay = delay;
        self
    }

    /// Replace the info response (`None` makes the query stall).
    pub fn set_info_response(&self, response: Option<Vec<u8>>) {
        self.lock().info_response = response;
    }

    /// Queue a failure for the next bulk transfer.
    pub fn inject(&self, fault: MockFault) {
        self.lock().faults.push_back(fault);
    }

    /// Copy of the backing store.
    pub fn storage(&self) -> Vec<u8> {
        self.lock().storage.clone()
    }

    /// Overwrite part of the backing store.
    pub fn fill(&self, offset: usize, data: &[u8]) {
        self.lock().storage[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Get all recorded transfers.
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.lock().log.clone()
    }

    /// Number of control and bulk transfers issued so far.
    pub fn transfer_count(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|r| !matches!(r, TransferRecord::Configure { .. }))
            .count()
    }

    /// Clear recorded transfers.
    pub fn clear_transfers(&self) {
        self.lock().log.clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn pause(&self) {
        if !self.phase_delay.is_zero() {
            thread::sleep(self.phase_delay);
        }
    }

    fn ready(&self) -> Result<MutexGuard<'_, MockState>, TransportError> {
        let state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if !state.claimed {
            return Err(TransportError::NotClaimed);
        }
        Ok(state)
    }

    fn take_fault(state: &mut MockState) -> Result<Option<usize>, TransportError> {
        match state.faults.pop_front() {
            None => Ok(None),
            Some(MockFault::Timeout) => Err(TransportError::Timeout { timeout_ms: 5000 }),
            Some(MockFault::Stall) => Err(TransportError::Stall),
            Some(MockFault::Disconnect) => {
                state.connected = false;
                Err(TransportError::Disconnected)
            }
            Some(MockFault::Short(n)) => Ok(Some(n)),
        }
    }

    fn byte_range(cmd: &IoCommand) -> std::ops::Range<usize> {
        let start = cmd.lba as usize * SECTOR_SIZE;
        start..start + cmd.block_count as usize * SECTOR_SIZE
    }
}

impl UsbTransport for MockTransport {
    fn configure(&mut self, interface_class: u8) -> Result<u8, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.claimed = true;
        state.log.push(TransferRecord::Configure {
            class: interface_class,
        });
        Ok(0)
    }

    fn control_in(&self, setup: &ControlSetup) -> Result<Vec<u8>, TransportError> {
        self.pause();
        let mut state = self.ready()?;
        if (setup.request_type, setup.request) != (RT_INFO, REQ_DEVICE_INFO) {
            return Err(TransportError::Stall);
        }
        state.log.push(TransferRecord::InfoQuery);
        let response = state.info_response.clone().ok_or(TransportError::Stall)?;
        Ok(response.into_iter().take(setup.length as usize).collect())
    }

    fn control_out(&self, setup: &ControlSetup, data: &[u8]) -> Result<usize, TransportError> {
        self.pause();
        let mut state = self.ready()?;
        let frame: &[u8; IO_COMMAND_LEN] =
            data.try_into().map_err(|_| TransportError::Stall)?;
        let cmd = IoCommand::from_bytes(frame);

        let (pending, record) = match (setup.request_type, setup.request) {
            (RT_READ_CMD, REQ_IO) => (Pending::Read(cmd), TransferRecord::ReadCommand(cmd)),
            (RT_WRITE_CMD, REQ_IO) => (Pending::Write(cmd), TransferRecord::WriteCommand(cmd)),
            _ => return Err(TransportError::Stall),
        };
        if Self::byte_range(&cmd).end > state.storage.len() {
            return Err(TransportError::Stall);
        }
        state.pending = Some(pending);
        state.log.push(record);
        Ok(data.len())
    }

    fn bulk_in(&self, endpoint: u8, len: usize) -> Result<Vec<u8>, TransportError> {
        self.pause();
        let mut state = self.ready()?;
        state.log.push(TransferRecord::BulkIn { endpoint, len });
        let cmd = match state.pending.take() {
            Some(Pending::Read(cmd)) if endpoint == EP_BULK_IN => cmd,
            _ => return Err(TransportError::Stall),
        };
        let limit = Self::take_fault(&mut state)?;

        let range = Self::byte_range(&cmd);
        let available = range.len().min(len).min(limit.unwrap_or(usize::MAX));
        Ok(state.storage[range.start..range.start + available].to_vec())
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        self.pause();
        let mut state = self.ready()?;
        state.log.push(TransferRecord::BulkOut {
            endpoint,
            len: data.len(),
        });
        let cmd = match state.pending.take() {
            Some(Pending::Write(cmd)) if endpoint == EP_BULK_OUT => cmd,
            _ => return Err(TransportError::Stall),
        };
        let limit = Self::take_fault(&mut state)?;

        let range = Self::byte_range(&cmd);
        let accepted = range.len().min(data.len()).min(limit.unwrap_or(usize::MAX));
        state.storage[range.start..range.start + accepted].copy_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
