//! MBR partitions as block devices.

use alloc::sync::Arc;
use spin::Mutex;

use crate::arch::{Clock, PortIo};
use crate::block::{BlockDevice, BlockError, DeviceId};

use super::{Drive, IdeChannel, SECTOR_SIZE};

/// One partition of an ATA disk, addressed in partition-relative sectors.
///
/// All partitions of both drives on a channel share the channel through a
/// mutex, serializing PIO access. The partition's device id is distinct
/// from every other partition's — including others on the same disk — so
/// cached blocks are never shared between partitions.
pub struct AtaPartition<P: PortIo, C: Clock> {
    channel: Arc<Mutex<IdeChannel<P, C>>>,
    drive: Drive,
    device_id: DeviceId,
    first_sector: u64,
    sector_count: u64,
}

impl<P: PortIo, C: Clock> AtaPartition<P, C> {
    pub fn new(
        channel: Arc<Mutex<IdeChannel<P, C>>>,
        drive: Drive,
        device_id: DeviceId,
        first_sector: u64,
        sector_count: u64,
    ) -> AtaPartition<P, C> {
        AtaPartition {
            channel,
            drive,
            device_id,
            first_sector,
            sector_count,
        }
    }

    /// Absolute LBA of the partition's first sector.
    pub fn first_sector(&self) -> u64 {
        self.first_sector
    }
}

impl<P: PortIo, C: Clock> BlockDevice for AtaPartition<P, C> {
    fn id(&self) -> DeviceId {
        self.device_id
    }

    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn block_count(&self) -> u64 {
        self.sector_count
    }

    fn max_blocks_per_read(&self) -> usize {
        256
    }

    fn read_blocks(&self, first_block: u64, count: usize, buf: &mut [u8])
        -> Result<(), BlockError> {
        if first_block + count as u64 > self.sector_count {
            return Err(BlockError::OutOfBounds);
        }
        let mut channel = self.channel.lock();
        channel.read_sectors(self.drive, self.first_sector + first_block, count, buf);
        Ok(())
    }

    fn write_blocks(&self, first_block: u64, count: usize, buf: &[u8])
        -> Result<(), BlockError> {
        if first_block + count as u64 > self.sector_count {
            return Err(BlockError::OutOfBounds);
        }
        let mut channel = self.channel.lock();
        channel.write_sectors(self.drive, self.first_sector + first_block, count, buf);
        Ok(())
    }
}
