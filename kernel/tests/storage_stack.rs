//! End-to-end tests of the storage stack: a mock IDE bus underneath the
//! ATA driver, partitions on top of it, and the block cache on top of the
//! partitions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kernel::arch::{Clock, PortIo};
use kernel::block::cache::BlockCache;
use kernel::block::BlockDevice;
use kernel::drivers::ata::{
    self, initialize_channel, AtaDeviceType, IdePorts, ProbedChannel, PRIMARY_IDE, SECTOR_SIZE,
};
use kernel::memory::FrameAllocator;

// ---------------------------------------------------------------------------
// Mock IDE bus
// ---------------------------------------------------------------------------

struct MockDisk {
    sectors: Vec<u8>,
    identify: [u8; 512],
}

impl MockDisk {
    fn sector_count(&self) -> u64 {
        (self.sectors.len() / SECTOR_SIZE) as u64
    }
}

#[derive(Default)]
struct BusState {
    disks: [Option<MockDisk>; 2],
    selected_drive: usize,
    lba_bits: u8,
    sector_count_reg: u8,
    lba: [u8; 3],
    /// Device-to-host bytes pending on the data port.
    data_in: VecDeque<u8>,
    /// Active write command: (drive, lba, bytes expected).
    write_target: Option<(usize, u64, usize)>,
    write_buffer: Vec<u8>,
    reads: Vec<(usize, u64, usize)>,
    writes: Vec<(usize, u64, usize)>,
    /// When set, the status register reports BSY forever.
    hang: bool,
}

impl BusState {
    fn transfer_lba(&self) -> u64 {
        u64::from(self.lba[0])
            | u64::from(self.lba[1]) << 8
            | u64::from(self.lba[2]) << 16
            | u64::from(self.lba_bits) << 24
    }

    fn transfer_count(&self) -> usize {
        if self.sector_count_reg == 0 {
            256
        } else {
            self.sector_count_reg as usize
        }
    }

    fn status(&self) -> u8 {
        if self.hang {
            return ata::STATUS_BSY;
        }
        match &self.disks[self.selected_drive] {
            None => 0,
            Some(_) => {
                let mut status = ata::STATUS_DRDY;
                if !self.data_in.is_empty() || self.write_target.is_some() {
                    status |= ata::STATUS_DRQ;
                }
                status
            }
        }
    }
}

#[derive(Clone)]
struct MockBus {
    ports: IdePorts,
    state: Arc<Mutex<BusState>>,
    time: Arc<AtomicU64>,
}

impl MockBus {
    fn new(master: Option<MockDisk>, slave: Option<MockDisk>) -> MockBus {
        let mut state = BusState::default();
        state.disks = [master, slave];
        MockBus {
            ports: PRIMARY_IDE,
            state: Arc::new(Mutex::new(state)),
            time: Arc::new(AtomicU64::new(0)),
        }
    }

    fn clock(&self) -> MockClock {
        MockClock(self.time.clone())
    }

    fn clear_logs(&self) {
        let mut state = self.state.lock().unwrap();
        state.reads.clear();
        state.writes.clear();
    }

    fn read_log(&self) -> Vec<(usize, u64, usize)> {
        self.state.lock().unwrap().reads.clone()
    }

    fn write_log(&self) -> Vec<(usize, u64, usize)> {
        self.state.lock().unwrap().writes.clone()
    }

    fn hang(&self) {
        self.state.lock().unwrap().hang = true;
    }

    fn disk_bytes(&self, drive: usize, offset: usize, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let disk = state.disks[drive].as_ref().unwrap();
        disk.sectors[offset..offset + len].to_vec()
    }
}

#[derive(Clone)]
struct MockClock(Arc<AtomicU64>);

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl PortIo for MockBus {
    fn read_u8(&mut self, port: u16) -> u8 {
        let state = self.state.lock().unwrap();
        if port == self.ports.control_base {
            // Alternate status: no side effects.
            return state.status();
        }
        // Polling a hung device burns time; one millisecond per peek keeps
        // the timeout path fast.
        self.time.fetch_add(1, Ordering::Relaxed);
        match port - self.ports.command_base {
            // Post-reset PATA signature of the selected drive.
            ata::SECTOR_COUNT_REGISTER | ata::LBA_LOW_REGISTER => {
                if state.disks[state.selected_drive].is_some() {
                    0x01
                } else {
                    0x00
                }
            }
            ata::LBA_MID_REGISTER | ata::LBA_HIGH_REGISTER | ata::DEVICE_REGISTER => 0x00,
            ata::STATUS_REGISTER => state.status(),
            _ => 0,
        }
    }

    fn write_u8(&mut self, port: u16, value: u8) {
        let mut state = self.state.lock().unwrap();
        if port == self.ports.control_base {
            // Device control: SRST / nIEN. Nothing to emulate.
            return;
        }
        match port - self.ports.command_base {
            ata::SECTOR_COUNT_REGISTER => state.sector_count_reg = value,
            ata::LBA_LOW_REGISTER => state.lba[0] = value,
            ata::LBA_MID_REGISTER => state.lba[1] = value,
            ata::LBA_HIGH_REGISTER => state.lba[2] = value,
            ata::DEVICE_REGISTER => {
                state.selected_drive = usize::from(value >> 4 & 1);
                state.lba_bits = value & 0x0F;
            }
            ata::COMMAND_REGISTER => match value {
                ata::IDENTIFY_DEVICE_COMMAND => {
                    if let Some(disk) = &state.disks[state.selected_drive] {
                        let identify = disk.identify;
                        state.data_in.extend(identify.iter());
                    }
                }
                ata::READ_SECTORS_COMMAND => {
                    let drive = state.selected_drive;
                    let lba = state.transfer_lba();
                    let count = state.transfer_count();
                    state.reads.push((drive, lba, count));
                    let disk = state.disks[drive].as_ref().expect("read from absent drive");
                    assert!(lba + count as u64 <= disk.sector_count());
                    let start = lba as usize * SECTOR_SIZE;
                    let bytes: Vec<u8> =
                        disk.sectors[start..start + count * SECTOR_SIZE].to_vec();
                    state.data_in.extend(bytes);
                }
                ata::WRITE_SECTORS_COMMAND => {
                    let drive = state.selected_drive;
                    let lba = state.transfer_lba();
                    let count = state.transfer_count();
                    state.write_target = Some((drive, lba, count * SECTOR_SIZE));
                    state.write_buffer.clear();
                }
                other => panic!("mock bus: unsupported command {:#x}", other),
            },
            _ => {}
        }
    }

    fn read_u16(&mut self, port: u16) -> u16 {
        let mut state = self.state.lock().unwrap();
        assert_eq!(port, self.ports.command_base + ata::DATA_REGISTER);
        let low = state.data_in.pop_front().expect("data port underrun");
        let high = state.data_in.pop_front().expect("data port underrun");
        u16::from_le_bytes([low, high])
    }

    fn write_u16(&mut self, port: u16, value: u16) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(port, self.ports.command_base + ata::DATA_REGISTER);
        state.write_buffer.extend_from_slice(&value.to_le_bytes());

        let (drive, lba, expected) = state.write_target.expect("data port write without command");
        if state.write_buffer.len() == expected {
            let bytes = std::mem::take(&mut state.write_buffer);
            let disk = state.disks[drive].as_mut().expect("write to absent drive");
            let start = lba as usize * SECTOR_SIZE;
            disk.sectors[start..start + bytes.len()].copy_from_slice(&bytes);
            state.writes.push((drive, lba, expected / SECTOR_SIZE));
            state.write_target = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Disk image builders
// ---------------------------------------------------------------------------

fn put_word(sector: &mut [u8; 512], word: usize, value: u16) {
    sector[word * 2..word * 2 + 2].copy_from_slice(&value.to_le_bytes());
}

fn identify_sector(model: &str, max_lba28: u32, removable: bool, lba48_max: Option<u64>) -> [u8; 512] {
    let mut sector = [0u8; 512];
    if removable {
        put_word(&mut sector, 0, 1 << 7);
    }
    // Model field: swapped characters, space padded.
    let mut model_bytes = [b' '; 40];
    model_bytes[..model.len()].copy_from_slice(model.as_bytes());
    for (i, pair) in model_bytes.chunks(2).enumerate() {
        put_word(&mut sector, 27 + i, u16::from_le_bytes([pair[1], pair[0]]));
    }
    put_word(&mut sector, 60, (max_lba28 & 0xFFFF) as u16);
    put_word(&mut sector, 61, (max_lba28 >> 16) as u16);
    if let Some(max48) = lba48_max {
        put_word(&mut sector, 83, 1 << 10);
        put_word(&mut sector, 86, 1 << 10);
        for word in 0..4 {
            put_word(&mut sector, 100 + word, (max48 >> (16 * word)) as u16);
        }
    }
    sector
}

struct PartitionSpec {
    kind: u8,
    attributes: u8,
    first_lba: u32,
    sector_count: u32,
}

fn disk_with_partitions(total_sectors: usize, partitions: &[PartitionSpec]) -> MockDisk {
    let mut sectors = vec![0u8; total_sectors * SECTOR_SIZE];
    // Position-dependent filler so reads can be checked byte for byte.
    for (i, byte) in sectors.iter_mut().enumerate().skip(SECTOR_SIZE) {
        *byte = ((i / SECTOR_SIZE) as u8).wrapping_mul(31) ^ (i as u8);
    }

    for (index, partition) in partitions.iter().enumerate() {
        let entry = &mut sectors[446 + index * 16..446 + (index + 1) * 16];
        entry[0] = partition.attributes;
        entry[4] = partition.kind;
        entry[8..12].copy_from_slice(&partition.first_lba.to_le_bytes());
        entry[12..16].copy_from_slice(&partition.sector_count.to_le_bytes());
    }
    sectors[510] = 0x55;
    sectors[511] = 0xAA;

    MockDisk {
        identify: identify_sector("MOCK HARDDISK", total_sectors as u32, false, None),
        sectors,
    }
}

fn standard_disk() -> MockDisk {
    disk_with_partitions(
        8192,
        &[PartitionSpec {
            kind: 0x83,
            attributes: 0x00,
            first_lba: 2048,
            sector_count: 2048,
        }],
    )
}

fn bring_up(bus: &MockBus) -> ProbedChannel<MockBus, MockClock> {
    initialize_channel(bus.clone(), bus.clock(), PRIMARY_IDE, 0)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[test]
fn discovery_finds_the_disk_and_its_partition() {
    let bus = MockBus::new(Some(standard_disk()), None);
    let probed = bring_up(&bus);

    assert_eq!(probed.devices.len(), 1);
    let device = &probed.devices[0];
    assert_eq!(device.device_type, AtaDeviceType::Pata);
    assert_eq!(device.model, "MOCK HARDDISK");
    assert_eq!(device.max_lba28, 8192);
    assert_eq!(device.partitions.len(), 1);

    assert_eq!(probed.partitions.len(), 1);
    let partition = &probed.partitions[0];
    assert_eq!(partition.block_size(), SECTOR_SIZE);
    assert_eq!(partition.block_count(), 2048);
    assert_eq!(partition.first_sector(), 2048);
}

#[test]
fn discovery_ignores_removable_media() {
    let mut disk = standard_disk();
    disk.identify = identify_sector("USB THING", 8192, true, None);
    let bus = MockBus::new(Some(disk), None);
    let probed = bring_up(&bus);
    assert!(probed.devices.is_empty());
    assert!(probed.partitions.is_empty());
}

#[test]
fn discovery_rejects_devices_requiring_lba48() {
    let mut disk = standard_disk();
    disk.identify = identify_sector("BIG DISK", 8192, false, Some(1 << 30));
    let bus = MockBus::new(Some(disk), None);
    let probed = bring_up(&bus);
    assert!(probed.devices.is_empty());
}

#[test]
fn discovery_filters_partition_table_entries() {
    let disk = disk_with_partitions(
        8192,
        &[
            PartitionSpec {
                kind: 0x83,
                attributes: 0x00,
                first_lba: 64,
                sector_count: 64,
            },
            // Foreign type.
            PartitionSpec {
                kind: 0x07,
                attributes: 0x00,
                first_lba: 128,
                sector_count: 64,
            },
            // Nonzero low attribute bits.
            PartitionSpec {
                kind: 0x83,
                attributes: 0x01,
                first_lba: 256,
                sector_count: 64,
            },
            // Ends beyond the 28-bit limit.
            PartitionSpec {
                kind: 0x83,
                attributes: 0x00,
                first_lba: 0x0FFF_FFF0,
                sector_count: 0x100,
            },
        ],
    );
    let bus = MockBus::new(Some(disk), None);
    let probed = bring_up(&bus);

    assert_eq!(probed.devices.len(), 1);
    let partitions = &probed.devices[0].partitions;
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].first_lba, 64);
}

#[test]
fn discovery_handles_a_disk_without_mbr() {
    let mut disk = standard_disk();
    disk.sectors[510] = 0;
    let bus = MockBus::new(Some(disk), None);
    let probed = bring_up(&bus);
    assert_eq!(probed.devices.len(), 1);
    assert!(probed.partitions.is_empty());
}

#[test]
fn both_drives_of_a_channel_are_probed() {
    let bus = MockBus::new(Some(standard_disk()), Some(standard_disk()));
    let probed = bring_up(&bus);
    assert_eq!(probed.devices.len(), 2);
    assert_eq!(probed.devices[0].id, 0);
    assert_eq!(probed.devices[1].id, 1);
    assert_eq!(probed.partitions.len(), 2);
    // Same disk geometry, distinct cache identities.
    assert_ne!(probed.partitions[0].id(), probed.partitions[1].id());
}

// ---------------------------------------------------------------------------
// Sector transfer paths
// ---------------------------------------------------------------------------

#[test]
fn partition_reads_are_translated_to_absolute_sectors() {
    let bus = MockBus::new(Some(standard_disk()), None);
    let probed = bring_up(&bus);
    let partition = probed.partitions[0].clone();
    bus.clear_logs();

    let mut buffer = vec![0u8; 2 * SECTOR_SIZE];
    partition.read_blocks(4, 2, &mut buffer).unwrap();
    assert_eq!(bus.read_log(), vec![(0, 2052, 2)]);
    assert_eq!(buffer, bus.disk_bytes(0, 2052 * SECTOR_SIZE, 2 * SECTOR_SIZE));

    // Out-of-range requests never reach the bus.
    assert!(partition.read_blocks(2047, 2, &mut buffer).is_err());
    assert_eq!(bus.read_log().len(), 1);
}

#[test]
fn a_zero_sector_count_transfers_256_sectors() {
    let bus = MockBus::new(Some(standard_disk()), None);
    let probed = bring_up(&bus);
    bus.clear_logs();

    let mut buffer = vec![0u8; 256 * SECTOR_SIZE];
    {
        let mut channel = probed.channel.lock();
        channel.read_sectors(ata::Drive::Master, 1024, 256, &mut buffer);
    }
    assert_eq!(bus.read_log(), vec![(0, 1024, 256)]);
    assert_eq!(buffer, bus.disk_bytes(0, 1024 * SECTOR_SIZE, 256 * SECTOR_SIZE));

    // And the write path agrees.
    {
        let mut channel = probed.channel.lock();
        channel.write_sectors(ata::Drive::Master, 4096, 256, &buffer);
    }
    assert_eq!(bus.write_log(), vec![(0, 4096, 256)]);
    assert_eq!(
        bus.disk_bytes(0, 4096 * SECTOR_SIZE, 256 * SECTOR_SIZE),
        buffer
    );
}

#[test]
#[should_panic(expected = "fatal error while reading from an ATA device")]
fn a_transfer_timeout_is_fatal() {
    let bus = MockBus::new(Some(standard_disk()), None);
    let probed = bring_up(&bus);
    let partition = probed.partitions[0].clone();

    bus.hang();
    let mut buffer = vec![0u8; SECTOR_SIZE];
    let _ = partition.read_blocks(0, 1, &mut buffer);
}

// ---------------------------------------------------------------------------
// Cache on top of partitions
// ---------------------------------------------------------------------------

#[test]
fn partition_read_through_fills_one_cache_frame() {
    let bus = MockBus::new(Some(standard_disk()), None);
    let probed = bring_up(&bus);
    let partition: std::sync::Arc<dyn BlockDevice> = probed.partitions[0].clone();
    bus.clear_logs();

    let allocator = Arc::new(FrameAllocator::new(32, 0));
    let mut cache = BlockCache::new(allocator, 16).unwrap();

    // 512 bytes at partition offset 0: one full-frame read of the eight
    // enclosing sectors, issued against the disk at the partition base.
    let block = cache.read_and_reserve(&partition, 0, 1).unwrap();
    assert_eq!(bus.read_log(), vec![(0, 2048, 8)]);

    let mut bytes = vec![0u8; 512];
    block.copy_out(&mut bytes);
    assert_eq!(bytes, bus.disk_bytes(0, 2048 * SECTOR_SIZE, 512));

    assert_eq!(cache.stats().cached_blocks, 1);
    cache.release(partition.as_ref(), 0, false);

    // The frame stays cached: no further bus traffic on a re-read.
    let _ = cache.read_and_reserve(&partition, 2, 1).unwrap();
    assert_eq!(bus.read_log().len(), 1);
    cache.release(partition.as_ref(), 2, false);
}

#[test]
fn eviction_writes_the_victim_through_the_partition() {
    let bus = MockBus::new(Some(standard_disk()), None);
    let probed = bring_up(&bus);
    let partition: std::sync::Arc<dyn BlockDevice> = probed.partitions[0].clone();
    bus.clear_logs();

    let allocator = Arc::new(FrameAllocator::new(16, 0));
    let mut cache = BlockCache::new(allocator, 4).unwrap();

    for i in 0..4 {
        let _ = cache.read_and_reserve(&partition, i * 8, 8).unwrap();
        cache.release(partition.as_ref(), i * 8, true);
    }
    assert_eq!(cache.stats().dirty_blocks, 4);

    let _ = cache.read_and_reserve(&partition, 32, 8).unwrap();
    cache.release(partition.as_ref(), 32, false);

    // The oldest frame went back to disk sectors 2048..2056, and the dirty
    // list shrank by one.
    assert_eq!(bus.write_log(), vec![(0, 2048, 8)]);
    assert_eq!(cache.stats().dirty_blocks, 3);
}

#[test]
fn modified_bytes_reach_the_disk_on_flush() {
    let bus = MockBus::new(Some(standard_disk()), None);
    let probed = bring_up(&bus);
    let partition: std::sync::Arc<dyn BlockDevice> = probed.partitions[0].clone();
    bus.clear_logs();

    let allocator = Arc::new(FrameAllocator::new(16, 0));
    let mut cache = BlockCache::new(allocator, 4).unwrap();

    let mut block = cache.read_and_reserve(&partition, 8, 1).unwrap();
    block.copy_in(b"cold storage");
    cache.release(partition.as_ref(), 8, true);
    cache.flush();

    // Partition block 8 is disk sector 2056.
    assert_eq!(bus.write_log(), vec![(0, 2056, 8)]);
    assert_eq!(
        bus.disk_bytes(0, 2056 * SECTOR_SIZE, 12),
        b"cold storage".to_vec()
    );
}
