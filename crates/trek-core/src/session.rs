//! Device session - owns the USB transport and serializes every transaction.
//!
//! The device has no transaction identifiers. A command phase followed by the
//! wrong data phase silently corrupts data, so each command+data pair runs
//! under one lock, and nothing is ever retried: a failed transaction leaves
//! the device in an unknown state that only the caller can reason about.

use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, info, instrument, warn};

use crate::blockdev::BlockDevice;
use crate::error::{BridgeError, Result};
use crate::protocol::constants::{
    DEFAULT_MAX_DEVICE_ERRORS, EP_BULK_IN, EP_BULK_OUT, MAX_ADDRESSABLE_SECTORS, SECTOR_SIZE,
    VENDOR_INTERFACE_CLASS,
};
use crate::protocol::{DeviceInfo, IoCommand, VendorRequest};
use crate::transport::{TransportError, UsbTransport};

/// Tunables for a device session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Consecutive device errors tolerated before teardown.
    pub max_device_errors: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_device_errors: DEFAULT_MAX_DEVICE_ERRORS,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    closed: bool,
    consecutive_device_errors: u32,
    transactions: u64,
}

/// An initialized device, ready for block I/O.
pub struct DeviceSession<T: UsbTransport> {
    transport: T,
    info: DeviceInfo,
    options: SessionOptions,
    /// Transaction lock. Held across the command and data phase.
    state: Mutex<SessionState>,
}

impl<T: UsbTransport> DeviceSession<T> {
    /// Claim the vendor interface and run the init handshake.
    pub fn open(transport: T) -> Result<Self> {
        Self::open_with(transport, SessionOptions::default())
    }

    #[instrument(skip(transport, options), fields(
        vid = %format!("{:04X}", transport.vendor_id()),
        pid = %format!("{:04X}", transport.product_id())
    ))]
    pub fn open_with(mut transport: T, options: SessionOptions) -> Result<Self> {
        let interface = transport
            .configure(VENDOR_INTERFACE_CLASS)
            .map_err(|e| BridgeError::InitFailed(format!("claiming vendor interface: {e}")))?;
        debug!(interface, "Vendor interface claimed");

        let raw = transport
            .control_in(&VendorRequest::InfoQuery.setup())
            .map_err(|e| BridgeError::InitFailed(format!("info query: {e}")))?;
        let info = DeviceInfo::from_bytes(&raw)?;

        if info.total_sectors == 0 {
            return Err(BridgeError::InitFailed(
                "device reports zero sectors".into(),
            ));
        }
        if info.total_sectors > MAX_ADDRESSABLE_SECTORS {
            return Err(BridgeError::InitFailed(format!(
                "device reports {} sectors, the LBA field addresses {}",
                info.total_sectors, MAX_ADDRESSABLE_SECTORS
            )));
        }

        info!(device = %info, "Device initialised");

        Ok(Self {
            transport,
            info,
            options,
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Whether the session still accepts transactions.
    pub fn is_open(&self) -> bool {
        self.state.lock().map(|s| !s.closed).unwrap_or(false)
    }

    /// Tear the session down; later requests fail with `SessionClosed`.
    ///
    /// Waits for an in-flight transaction to finish first.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock()
            && !state.closed
        {
            state.closed = true;
            info!(transactions = state.transactions, "Device session closed");
        }
    }

    /// Read `count` sectors starting at `lba`.
    #[instrument(level = "debug", skip(self))]
    pub fn read_blocks(&self, lba: u32, count: u32) -> Result<Vec<u8>> {
        let cmd = IoCommand::new(lba, count);
        if count == 0 {
            self.admit(&cmd)?;
            return Ok(Vec::new());
        }
        self.transaction(cmd, |transport| {
            let expected = count as usize * SECTOR_SIZE;
            transport
                .control_out(&VendorRequest::ReadCmd.setup(), &cmd.to_bytes())
                .map_err(BridgeError::from_transfer)?;
            let data = transport
                .bulk_in(EP_BULK_IN, expected)
                .map_err(BridgeError::from_transfer)?;
            if data.len() != expected {
                return Err(BridgeError::ShortTransfer {
                    expected,
                    actual: data.len(),
                });
            }
            Ok(data)
        })
    }

    /// Write whole sectors starting at `lba`.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn write_blocks(&self, lba: u32, data: &[u8]) -> Result<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(BridgeError::UnalignedWrite {
                len: data.len(),
                sector_size: SECTOR_SIZE,
            });
        }
        let count = u32::try_from(data.len() / SECTOR_SIZE).map_err(|_| {
            BridgeError::OutOfRange {
                lba: lba as u64,
                count: (data.len() / SECTOR_SIZE) as u64,
                total_sectors: self.info.total_sectors,
            }
        })?;
        let cmd = IoCommand::new(lba, count);
        if count == 0 {
            self.admit(&cmd)?;
            return Ok(());
        }

        self.transaction(cmd, |transport| {
            transport
                .control_out(&VendorRequest::WriteCmd.setup(), &cmd.to_bytes())
                .map_err(BridgeError::from_transfer)?;
            let written = transport
                .bulk_out(EP_BULK_OUT, data)
                .map_err(BridgeError::from_transfer)?;
            if written != data.len() {
                return Err(BridgeError::ShortTransfer {
                    expected: data.len(),
                    actual: written,
                });
            }
            Ok(())
        })
    }

    fn check_range(&self, cmd: &IoCommand) -> Result<()> {
        let end = cmd.lba as u64 + cmd.block_count as u64;
        if end > self.info.total_sectors {
            return Err(BridgeError::OutOfRange {
                lba: cmd.lba as u64,
                count: cmd.block_count as u64,
                total_sectors: self.info.total_sectors,
            });
        }
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, SessionState>> {
        // A panic mid-transaction leaves the device state unknown.
        self.state.lock().map_err(|_| BridgeError::SessionClosed)
    }

    /// Take the session lock for `cmd` once the session is open and the
    /// range is valid.
    fn admit(&self, cmd: &IoCommand) -> Result<MutexGuard<'_, SessionState>> {
        let state = self.lock_state()?;
        if state.closed {
            return Err(BridgeError::SessionClosed);
        }
        self.check_range(cmd)?;
        Ok(state)
    }

    /// Run one command+data transaction under the session lock.
    fn transaction<R>(&self, cmd: IoCommand, run: impl FnOnce(&T) -> Result<R>) -> Result<R> {
        let mut state = self.admit(&cmd)?;
        state.transactions += 1;
        match run(&self.transport) {
            Ok(value) => {
                state.consecutive_device_errors = 0;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&mut state, &cmd, &err);
                Err(err)
            }
        }
    }

    fn record_failure(&self, state: &mut SessionState, cmd: &IoCommand, err: &BridgeError) {
        if !err.is_device_error() {
            return;
        }
        state.consecutive_device_errors += 1;
        warn!(
            lba = cmd.lba,
            count = cmd.block_count,
            consecutive = state.consecutive_device_errors,
            error = %err,
            "Device transaction failed"
        );

        let disconnected = matches!(err, BridgeError::Transport(TransportError::Disconnected));
        if disconnected || state.consecutive_device_errors >= self.options.max_device_errors {
            state.closed = true;
            error!(
                consecutive = state.consecutive_device_errors,
                "Device desynchronized, tearing down session"
            );
        }
    }
}

impl<T: UsbTransport> BlockDevice for DeviceSession<T> {
    fn total_sectors(&self) -> u64 {
        self.info.total_sectors
    }

    fn read_blocks(&self, lba: u32, count: u32) -> Result<Vec<u8>> {
        DeviceSession::read_blocks(self, lba, count)
    }

    fn write_blocks(&self, lba: u32, data: &[u8]) -> Result<()> {
        DeviceSession::write_blocks(self, lba, data)
    }

    fn is_usable(&self) -> bool {
        self.is_open()
    }

    fn describe(&self) -> String {
        format!("Trek ThumbDrive {}", self.info)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::protocol::constants::{THUMBDRIVE_PRODUCT_ID, TREK_VENDOR_ID};
    use crate::protocol::encode_device_info;
    use crate::transport::{MockFault, MockTransport, TransferRecord};

    fn open(sectors: u32) -> (MockTransport, DeviceSession<MockTransport>) {
        let mock = MockTransport::new(sectors);
        let session = DeviceSession::open(mock.clone()).unwrap();
        mock.clear_transfers();
        (mock, session)
    }

    #[test]
    fn test_open_runs_handshake() {
        let mock = MockTransport::with_size_params(0x0800, 0x20);
        let session = DeviceSession::open(mock.clone()).unwrap();
        assert_eq!(session.info().total_bytes(), 33_554_432);
        assert_eq!(
            mock.transfers(),
            [
                TransferRecord::Configure { class: 0xFF },
                TransferRecord::InfoQuery
            ]
        );
    }

    #[test]
    fn test_open_stalled_info_fails() {
        let mock = MockTransport::new(64);
        mock.set_info_response(None);
        let err = DeviceSession::open(mock).err().unwrap();
        assert!(matches!(err, BridgeError::InitFailed(_)));
    }

    #[test]
    fn test_open_zero_sectors_fails() {
        let mock = MockTransport::with_size_params(0, 32);
        let err = DeviceSession::open(mock).err().unwrap();
        assert!(matches!(err, BridgeError::InitFailed(_)));
    }

    #[test]
    fn test_open_rejects_unaddressable_capacity() {
        let mock = MockTransport::new(64);
        mock.set_info_response(Some(
            encode_device_info(TREK_VENDOR_ID, THUMBDRIVE_PRODUCT_ID, u32::MAX, u32::MAX).to_vec(),
        ));
        let err = DeviceSession::open(mock.clone()).err().unwrap();
        assert!(matches!(err, BridgeError::MalformedResponse(_)));

        mock.set_info_response(Some(
            encode_device_info(TREK_VENDOR_ID, THUMBDRIVE_PRODUCT_ID, 1 << 20, 1 << 13).to_vec(),
        ));
        let err = DeviceSession::open(mock).err().unwrap();
        assert!(matches!(err, BridgeError::InitFailed(_)));
    }

    #[test]
    fn test_open_accepts_full_lba_range() {
        let mock = MockTransport::new(64);
        mock.set_info_response(Some(
            encode_device_info(TREK_VENDOR_ID, THUMBDRIVE_PRODUCT_ID, 1 << 16, 1 << 16).to_vec(),
        ));
        let session = DeviceSession::open(mock).unwrap();
        assert_eq!(session.total_sectors(), MAX_ADDRESSABLE_SECTORS);
        assert_eq!(session.capacity(), 1 << 41);
    }

    #[test]
    fn test_zero_count_skips_device() {
        let (mock, session) = open(64);
        assert!(session.read_blocks(64, 0).unwrap().is_empty());
        session.write_blocks(10, &[]).unwrap();
        assert_eq!(mock.transfer_count(), 0);

        assert!(matches!(
            session.read_blocks(65, 0),
            Err(BridgeError::OutOfRange { .. })
        ));
        session.close();
        assert!(matches!(
            session.read_blocks(0, 0),
            Err(BridgeError::SessionClosed)
        ));
    }

    #[test]
    fn test_open_malformed_info_fails() {
        let mock = MockTransport::new(64);
        mock.set_info_response(Some(vec![0x1F, 0x00, 0x16]));
        let err = DeviceSession::open(mock).err().unwrap();
        assert!(matches!(err, BridgeError::MalformedResponse(_)));
    }

    #[test]
    fn test_read_issues_command_then_bulk() {
        let (mock, session) = open(64);
        mock.fill(512, &[7u8; 1024]);

        let data = session.read_blocks(1, 2).unwrap();
        assert_eq!(data, vec![7u8; 1024]);
        assert_eq!(
            mock.transfers(),
            [
                TransferRecord::ReadCommand(IoCommand::new(1, 2)),
                TransferRecord::BulkIn {
                    endpoint: EP_BULK_IN,
                    len: 1024
                }
            ]
        );
    }

    #[test]
    fn test_out_of_range_issues_no_transfer() {
        let (mock, session) = open(64);
        let err = session.read_blocks(63, 2).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfRange { .. }));
        let err = session.write_blocks(64, &[0u8; 512]).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfRange { .. }));
        assert_eq!(mock.transfer_count(), 0);
    }

    #[test]
    fn test_unaligned_write_rejected() {
        let (mock, session) = open(64);
        let err = session.write_blocks(0, &[0u8; 100]).unwrap_err();
        assert!(matches!(err, BridgeError::UnalignedWrite { len: 100, .. }));
        assert_eq!(mock.transfer_count(), 0);
    }

    #[test]
    fn test_short_read_reported() {
        let (mock, session) = open(64);
        mock.inject(MockFault::Short(200));
        let err = session.read_blocks(0, 1).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ShortTransfer {
                expected: 512,
                actual: 200
            }
        ));
        assert!(session.is_open());
    }

    #[test]
    fn test_timeout_is_not_retried() {
        let (mock, session) = open(64);
        mock.inject(MockFault::Timeout);
        let err = session.write_blocks(0, &[1u8; 512]).unwrap_err();
        assert!(matches!(err, BridgeError::IoTimeout { .. }));
        assert_eq!(mock.transfer_count(), 2);
    }

    #[test]
    fn test_repeated_device_errors_tear_down() {
        let (mock, session) = open(64);
        for _ in 0..DEFAULT_MAX_DEVICE_ERRORS {
            mock.inject(MockFault::Timeout);
            assert!(session.read_blocks(0, 1).is_err());
        }
        assert!(!session.is_open());
        assert!(matches!(
            session.read_blocks(0, 1),
            Err(BridgeError::SessionClosed)
        ));
    }

    #[test]
    fn test_success_resets_error_count() {
        let (mock, session) = open(64);
        for _ in 0..5 {
            mock.inject(MockFault::Stall);
            assert!(session.read_blocks(0, 1).is_err());
            assert!(session.read_blocks(0, 1).is_ok());
        }
        assert!(session.is_open());
    }

    #[test]
    fn test_disconnect_tears_down_immediately() {
        let (mock, session) = open(64);
        mock.inject(MockFault::Disconnect);
        assert!(session.read_blocks(0, 1).is_err());
        assert!(!session.is_open());
    }

    #[test]
    fn test_close_rejects_requests() {
        let (mock, session) = open(64);
        session.close();
        assert!(matches!(
            session.write_blocks(0, &[0u8; 512]),
            Err(BridgeError::SessionClosed)
        ));
        assert_eq!(mock.transfer_count(), 0);
    }

    #[test]
    fn test_transactions_never_interleave() {
        let mock = MockTransport::new(256).with_phase_delay(Duration::from_millis(2));
        let session = Arc::new(DeviceSession::open(mock.clone()).unwrap());
        mock.clear_transfers();

        let writer = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                for lba in 0..10 {
                    session.write_blocks(lba, &[0x5Au8; 512]).unwrap();
                }
            })
        };
        let reader = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                for lba in 100..110 {
                    session.read_blocks(lba, 1).unwrap();
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();

        let log = mock.transfers();
        assert_eq!(log.len(), 40);
        for pair in log.chunks(2) {
            assert!(pair[0].is_command(), "expected command, got {:?}", pair[0]);
            assert!(pair[1].is_data(), "expected data phase, got {:?}", pair[1]);
        }
    }
}
