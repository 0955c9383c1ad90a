//! Block I/O translator.
//!
//! Turns byte-addressed requests into sector chunks no larger than the
//! device's reliable transfer size, issued strictly in ascending LBA order.
//! A failed chunk aborts the whole request; a write interrupted this way
//! leaves a well-defined prefix on the device.

use tracing::{debug, instrument};

use crate::blockdev::BlockDevice;
use crate::error::{BridgeError, Result};
use crate::protocol::constants::DEFAULT_MAX_CHUNK_BLOCKS;

/// Sequence of `(lba, count)` chunks covering a block range.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    next_lba: u64,
    end_lba: u64,
    max_blocks: u32,
}

impl ChunkPlan {
    pub fn new(start_lba: u64, block_count: u64, max_blocks: u32) -> Self {
        Self {
            next_lba: start_lba,
            end_lba: start_lba + block_count,
            max_blocks: max_blocks.max(1),
        }
    }
}

impl Iterator for ChunkPlan {
    type Item = (u64, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_lba >= self.end_lba {
            return None;
        }
        let count = (self.end_lba - self.next_lba).min(self.max_blocks as u64) as u32;
        let lba = self.next_lba;
        self.next_lba += count as u64;
        Some((lba, count))
    }
}

/// Byte-addressed, chunked access to a [`BlockDevice`].
pub struct BlockIo<D: BlockDevice> {
    device: D,
    max_chunk_blocks: u32,
}

impl<D: BlockDevice> BlockIo<D> {
    pub fn new(device: D) -> Self {
        Self::with_chunk_blocks(device, DEFAULT_MAX_CHUNK_BLOCKS)
    }

    pub fn with_chunk_blocks(device: D, max_chunk_blocks: u32) -> Self {
        Self {
            device,
            max_chunk_blocks: max_chunk_blocks.max(1),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn max_chunk_blocks(&self) -> u32 {
        self.max_chunk_blocks
    }

    /// Exported size in bytes. No device transaction.
    pub fn capacity(&self) -> u64 {
        self.device.capacity()
    }

    /// Read `length` bytes at `offset`. Both must be sector aligned.
    #[instrument(level = "debug", skip(self))]
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let plan = self.plan(offset, length as u64)?;
        let mut out = Vec::with_capacity(length);
        for (lba, count) in plan {
            let chunk = self.device.read_blocks(self.lba(lba)?, count)?;
            out.extend_from_slice(&chunk);
        }
        debug!(bytes = out.len(), "Read complete");
        Ok(out)
    }

    /// Write `data` at `offset`. Both must be sector aligned.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let plan = self.plan(offset, data.len() as u64)?;
        let sector_size = self.device.sector_size();
        let mut cursor = 0usize;
        for (lba, count) in plan {
            let len = count as usize * sector_size;
            self.device
                .write_blocks(self.lba(lba)?, &data[cursor..cursor + len])?;
            cursor += len;
        }
        debug!(bytes = cursor, "Write complete");
        Ok(())
    }

    /// Validate alignment and range, then split into chunks.
    fn plan(&self, offset: u64, length: u64) -> Result<ChunkPlan> {
        let sector_size = self.device.sector_size() as u64;
        if offset % sector_size != 0 || length % sector_size != 0 {
            return Err(BridgeError::Misaligned {
                offset,
                length,
                sector_size: sector_size as usize,
            });
        }

        let start_lba = offset / sector_size;
        let block_count = length / sector_size;
        let total_sectors = self.device.total_sectors();
        if start_lba.saturating_add(block_count) > total_sectors {
            return Err(BridgeError::OutOfRange {
                lba: start_lba,
                count: block_count,
                total_sectors,
            });
        }

        Ok(ChunkPlan::new(start_lba, block_count, self.max_chunk_blocks))
    }

    fn lba(&self, lba: u64) -> Result<u32> {
        u32::try_from(lba).map_err(|_| BridgeError::OutOfRange {
            lba,
            count: 0,
            total_sectors: self.device.total_sectors(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::constants::SECTOR_SIZE;
    use crate::session::DeviceSession;
    use crate::transport::{MockFault, MockTransport, TransferRecord};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Read(u32, u32),
        Write(u32, u32),
    }

    /// In-memory device that records every chunk it is asked for.
    struct RecordingDevice {
        sectors: u64,
        calls: Mutex<Vec<Call>>,
        fail_at_lba: Option<u32>,
    }

    impl RecordingDevice {
        fn new(sectors: u64) -> Self {
            Self {
                sectors,
                calls: Mutex::new(Vec::new()),
                fail_at_lba: None,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl BlockDevice for RecordingDevice {
        fn total_sectors(&self) -> u64 {
            self.sectors
        }

        fn read_blocks(&self, lba: u32, count: u32) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(Call::Read(lba, count));
            if self.fail_at_lba == Some(lba) {
                return Err(BridgeError::IoTimeout { timeout_ms: 5000 });
            }
            Ok(vec![(lba % 256) as u8; count as usize * SECTOR_SIZE])
        }

        fn write_blocks(&self, lba: u32, data: &[u8]) -> Result<()> {
            let count = (data.len() / SECTOR_SIZE) as u32;
            self.calls.lock().unwrap().push(Call::Write(lba, count));
            if self.fail_at_lba == Some(lba) {
                return Err(BridgeError::ShortTransfer {
                    expected: data.len(),
                    actual: 0,
                });
            }
            Ok(())
        }

        fn describe(&self) -> String {
            "recording".into()
        }
    }

    #[test]
    fn test_chunk_plan_splits() {
        let chunks: Vec<_> = ChunkPlan::new(0, 100, 32).collect();
        assert_eq!(chunks, vec![(0, 32), (32, 32), (64, 32), (96, 4)]);
        assert_eq!(ChunkPlan::new(10, 0, 32).count(), 0);
    }

    #[test]
    fn test_read_100_blocks_in_four_ordered_chunks() {
        let io = BlockIo::with_chunk_blocks(RecordingDevice::new(1024), 32);
        let data = io.read(0, 100 * SECTOR_SIZE).unwrap();
        assert_eq!(data.len(), 100 * SECTOR_SIZE);
        assert_eq!(
            io.device().calls(),
            vec![
                Call::Read(0, 32),
                Call::Read(32, 32),
                Call::Read(64, 32),
                Call::Read(96, 4)
            ]
        );
        // Results concatenate in LBA order.
        assert_eq!(data[32 * SECTOR_SIZE], 32);
        assert_eq!(data[96 * SECTOR_SIZE], 96);
    }

    #[test]
    fn test_write_chunks_ascending() {
        let io = BlockIo::with_chunk_blocks(RecordingDevice::new(1024), 16);
        io.write(8 * SECTOR_SIZE as u64, &vec![0u8; 40 * SECTOR_SIZE])
            .unwrap();
        assert_eq!(
            io.device().calls(),
            vec![Call::Write(8, 16), Call::Write(24, 16), Call::Write(40, 8)]
        );
    }

    #[test]
    fn test_misaligned_rejected() {
        let io = BlockIo::new(RecordingDevice::new(64));
        assert!(matches!(
            io.read(100, 512),
            Err(BridgeError::Misaligned { .. })
        ));
        assert!(matches!(
            io.read(512, 100),
            Err(BridgeError::Misaligned { .. })
        ));
        assert!(matches!(
            io.write(0, &[0u8; 513]),
            Err(BridgeError::Misaligned { .. })
        ));
        assert!(io.device().calls().is_empty());
    }

    #[test]
    fn test_aligned_in_range_succeeds() {
        let io = BlockIo::new(RecordingDevice::new(64));
        assert!(io.read(63 * SECTOR_SIZE as u64, SECTOR_SIZE).is_ok());
        assert!(io.read(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_read_at_capacity_out_of_range_without_transfer() {
        let mock = MockTransport::new(65_536);
        let io = BlockIo::new(DeviceSession::open(mock.clone()).unwrap());
        let before = mock.transfer_count();

        let err = io.read(io.capacity(), SECTOR_SIZE).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfRange { .. }));
        assert_eq!(mock.transfer_count(), before);
    }

    #[test]
    fn test_chunk_failure_aborts_request() {
        let mut dev = RecordingDevice::new(1024);
        dev.fail_at_lba = Some(32);
        let io = BlockIo::with_chunk_blocks(dev, 32);

        let err = io.read(0, 100 * SECTOR_SIZE).unwrap_err();
        assert!(matches!(err, BridgeError::IoTimeout { .. }));
        assert_eq!(
            io.device().calls(),
            vec![Call::Read(0, 32), Call::Read(32, 32)]
        );
    }

    #[test]
    fn test_failed_write_stops_at_failing_chunk() {
        let mut dev = RecordingDevice::new(1024);
        dev.fail_at_lba = Some(24);
        let io = BlockIo::with_chunk_blocks(dev, 16);

        let err = io
            .write(8 * SECTOR_SIZE as u64, &vec![0u8; 40 * SECTOR_SIZE])
            .unwrap_err();
        assert!(matches!(err, BridgeError::ShortTransfer { .. }));
        assert_eq!(
            io.device().calls(),
            vec![Call::Write(8, 16), Call::Write(24, 16)]
        );
    }

    #[test]
    fn test_failed_write_leaves_written_prefix() {
        let mock = MockTransport::new(1024);
        let io = BlockIo::with_chunk_blocks(DeviceSession::open(mock.clone()).unwrap(), 16);
        mock.clear_transfers();
        let data = vec![0xC3u8; 48 * SECTOR_SIZE];

        // The first chunk goes through whole, the second times out.
        mock.inject(MockFault::Short(16 * SECTOR_SIZE));
        mock.inject(MockFault::Timeout);
        let err = io.write(0, &data).unwrap_err();
        assert!(matches!(err, BridgeError::IoTimeout { .. }));

        let storage = mock.storage();
        assert!(storage[..16 * SECTOR_SIZE].iter().all(|b| *b == 0xC3));
        assert!(storage[16 * SECTOR_SIZE..].iter().all(|b| *b == 0));

        let commands: Vec<_> = mock
            .transfers()
            .into_iter()
            .filter(TransferRecord::is_command)
            .collect();
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn test_write_then_read_returns_pattern() {
        let mock = MockTransport::new(1024);
        let io = BlockIo::new(DeviceSession::open(mock.clone()).unwrap());
        let pattern: Vec<u8> = (0..70 * SECTOR_SIZE).map(|i| (i * 7 % 256) as u8).collect();

        io.write(5 * SECTOR_SIZE as u64, &pattern).unwrap();
        assert_eq!(io.read(5 * SECTOR_SIZE as u64, pattern.len()).unwrap(), pattern);
        assert_eq!(
            &mock.storage()[5 * SECTOR_SIZE..75 * SECTOR_SIZE],
            pattern.as_slice()
        );
    }

    #[test]
    fn test_capacity_matches_sample_device() {
        let mock = MockTransport::with_size_params(0x0800, 0x20);
        let io = BlockIo::new(DeviceSession::open(mock).unwrap());
        assert_eq!(io.capacity(), 33_554_432);
    }
}
