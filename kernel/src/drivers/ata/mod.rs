//! ATA/IDE driver (PIO mode).
//!
//! Each IDE channel carries a master and a slave device behind one set of
//! command and control registers. The driver software-resets the channel,
//! classifies whatever answers by its reset signature, runs IDENTIFY, and
//! keeps PATA/SATA disks that are neither removable nor in need of 48-bit
//! addressing. Disks are then carved into the partitions their MBR
//! advertises; each partition is exposed as a [`crate::block::BlockDevice`]
//! through [`partition::AtaPartition`].
//!
//! All transfers are polled PIO: the CPU moves 256 words per sector through
//! the data port, waiting out the busy bit with a per-sector timeout.
//! There is no DMA path and no interrupt path; a timeout or device fault
//! during a transfer is fatal.

pub mod identify;
pub mod mbr;
pub mod partition;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::{Clock, PortIo};
use crate::block::DeviceId;

use identify::IdentifyData;
use mbr::Mbr;
use partition::AtaPartition;

/// A sector is a uniquely addressable set of 256 words.
pub const SECTOR_SIZE: usize = 512;

// Command-block register offsets from the command base.
pub const DATA_REGISTER: u16 = 0x00;
pub const ERROR_REGISTER: u16 = 0x01;
pub const SECTOR_COUNT_REGISTER: u16 = 0x02;
pub const LBA_LOW_REGISTER: u16 = 0x03;
pub const LBA_MID_REGISTER: u16 = 0x04;
pub const LBA_HIGH_REGISTER: u16 = 0x05;
pub const DEVICE_REGISTER: u16 = 0x06;
pub const STATUS_REGISTER: u16 = 0x07;
pub const COMMAND_REGISTER: u16 = 0x07;

// Control-block register offsets from the control base.
pub const ALTERNATE_STATUS_REGISTER: u16 = 0x00;
pub const DEVICE_CONTROL_REGISTER: u16 = 0x00;

// Status register bits.
pub const STATUS_BSY: u8 = 0x80;
pub const STATUS_DRDY: u8 = 0x40;
pub const STATUS_DF: u8 = 0x20;
pub const STATUS_DRQ: u8 = 0x08;
pub const STATUS_ERR: u8 = 0x01;

// Command codes.
pub const IDENTIFY_DEVICE_COMMAND: u8 = 0xEC;
pub const READ_SECTORS_COMMAND: u8 = 0x20;
pub const WRITE_SECTORS_COMMAND: u8 = 0x30;

/// Per-sector transfer poll budget.
const SECTOR_TIMEOUT_MS: u32 = 750;
/// Poll budget after a software reset.
const RESET_TIMEOUT_MS: u32 = 1500;
/// Poll budget for the IDENTIFY response.
const IDENTIFY_TIMEOUT_MS: u32 = 500;

/// Highest sector addressable with 28-bit LBA.
pub const MAX_LBA28: u64 = 0x0FFF_FFFF;

/// I/O port bases of one IDE channel.
#[derive(Clone, Copy)]
pub struct IdePorts {
    pub command_base: u16,
    pub control_base: u16,
}

/// Legacy primary channel ports.
pub const PRIMARY_IDE: IdePorts = IdePorts {
    command_base: 0x1F0,
    control_base: 0x3F6,
};

/// Legacy secondary channel ports.
pub const SECONDARY_IDE: IdePorts = IdePorts {
    command_base: 0x170,
    control_base: 0x376,
};

/// Master/slave position on a channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Drive {
    Master,
    Slave,
}

impl Drive {
    fn select_bit(self) -> u8 {
        match self {
            Drive::Master => 0,
            Drive::Slave => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Drive::Master => "master",
            Drive::Slave => "slave",
        }
    }
}

/// Device class derived from the post-reset signature bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AtaDeviceType {
    Pata,
    Patapi,
    Sata,
    Satapi,
    Unknown,
}

impl AtaDeviceType {
    pub fn name(self) -> &'static str {
        match self {
            AtaDeviceType::Pata => "PATA",
            AtaDeviceType::Patapi => "PATAPI",
            AtaDeviceType::Sata => "SATA",
            AtaDeviceType::Satapi => "SATAPI",
            AtaDeviceType::Unknown => "UNKNOWN",
        }
    }
}

/// Signature and persistence rules from ATA/ATAPI-6, 9.12.
fn classify_signature(
    sector_count: u8,
    lba_low: u8,
    lba_mid: u8,
    lba_high: u8,
    device: u8,
) -> AtaDeviceType {
    if sector_count != 0x01 || lba_low != 0x01 || device & !0xB0 != 0x00 {
        return AtaDeviceType::Unknown;
    }
    match (lba_mid, lba_high) {
        (0x00, 0x00) => AtaDeviceType::Pata,
        (0x14, 0xEB) => AtaDeviceType::Patapi,
        (0x3C, 0xC3) => AtaDeviceType::Sata,
        (0x69, 0x96) => AtaDeviceType::Satapi,
        _ => AtaDeviceType::Unknown,
    }
}

enum WaitResult {
    Done,
    Timeout,
    Fault,
}

/// A partition found in a disk's MBR during discovery.
pub struct DiscoveredPartition {
    /// Position in the partition table (0..4).
    pub index: u8,
    pub first_lba: u32,
    pub sector_count: u32,
}

/// One usable disk discovered on a channel.
pub struct AtaDevice {
    /// Channel-wide device number (`channel id * 2 + drive`).
    pub id: u8,
    pub drive: Drive,
    pub device_type: AtaDeviceType,
    pub model: String,
    pub serial: String,
    pub firmware_revision: String,
    pub max_lba28: u32,
    pub partitions: Vec<DiscoveredPartition>,
}

/// One IDE channel: two drives behind a pair of register banks.
///
/// The channel owns its port-I/O and clock implementations; the register
/// bases are constructor arguments, so a channel can sit anywhere the
/// platform put it.
pub struct IdeChannel<P: PortIo, C: Clock> {
    ports: IdePorts,
    id: u8,
    io: P,
    clock: C,
    last_status: u8,
}

impl<P: PortIo, C: Clock> IdeChannel<P, C> {
    pub fn new(io: P, clock: C, ports: IdePorts, id: u8) -> IdeChannel<P, C> {
        IdeChannel {
            ports,
            id,
            io,
            clock,
            last_status: 0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Wait roughly 400 ns by reading the alternate status register four
    /// times.
    fn pause_400ns(&mut self) {
        for _ in 0..4 {
            self.io
                .read_u8(self.ports.control_base + ALTERNATE_STATUS_REGISTER);
        }
    }

    /// Poll the status register until the device is no longer busy or
    /// reports a fault. A `timeout_ms` of zero polls forever.
    fn wait_while_busy(&mut self, timeout_ms: u32) -> WaitResult {
        let start = if timeout_ms > 0 {
            Some(self.clock.now_ms())
        } else {
            None
        };

        loop {
            let status = self.io.read_u8(self.ports.command_base + STATUS_REGISTER);
            self.last_status = status;

            if status & (STATUS_ERR | STATUS_DF) != 0 {
                return WaitResult::Fault;
            }
            if status & STATUS_BSY == 0 {
                return WaitResult::Done;
            }
            if let Some(start) = start {
                if self.clock.now_ms().wrapping_sub(start) >= timeout_ms as u64 {
                    return WaitResult::Timeout;
                }
            }
        }
    }

    /// Software-reset the channel. Interrupts stay masked (nIEN) — this
    /// driver polls.
    fn software_reset(&mut self) -> bool {
        log::debug!("  trying to reset IDE channel {}", self.id);

        let control = self.ports.control_base + DEVICE_CONTROL_REGISTER;
        self.io.write_u8(control, 0x06); // SRST + nIEN
        self.pause_400ns();
        self.io.write_u8(control, 0x02); // nIEN only
        matches!(self.wait_while_busy(RESET_TIMEOUT_MS), WaitResult::Done)
    }

    /// Select a drive and program a 28-bit LBA transfer.
    fn setup_transfer(&mut self, drive: Drive, sector_id: u64, sector_count: usize, command: u8) {
        let base = self.ports.command_base;
        let sector_id = sector_id & MAX_LBA28;

        let bits_27_to_24 = ((sector_id >> 24) & 0x0F) as u8;
        self.io.write_u8(
            base + DEVICE_REGISTER,
            0xE0 | (drive.select_bit() << 4) | bits_27_to_24,
        );
        self.pause_400ns();

        // A register value of zero requests 256 sectors.
        self.io
            .write_u8(base + SECTOR_COUNT_REGISTER, sector_count as u8);
        self.io.write_u8(base + LBA_LOW_REGISTER, sector_id as u8);
        self.io
            .write_u8(base + LBA_MID_REGISTER, (sector_id >> 8) as u8);
        self.io
            .write_u8(base + LBA_HIGH_REGISTER, (sector_id >> 16) as u8);
        self.io.write_u8(base + COMMAND_REGISTER, command);
        self.pause_400ns();
    }

    /// Read `sector_count` sectors (0 means 256) starting at `sector_id`
    /// into `buffer`. Faults and timeouts abort the kernel.
    pub fn read_sectors(
        &mut self,
        drive: Drive,
        sector_id: u64,
        sector_count: usize,
        buffer: &mut [u8],
    ) {
        assert!(sector_count <= 256);
        self.setup_transfer(drive, sector_id, sector_count, READ_SECTORS_COMMAND);

        let sector_count = if sector_count == 0 { 256 } else { sector_count };
        assert!(buffer.len() >= sector_count * SECTOR_SIZE);

        for sector in 0..sector_count {
            if !matches!(self.wait_while_busy(SECTOR_TIMEOUT_MS), WaitResult::Done) {
                log::error!(
                    "ATA read failed: channel={} sector_id={:#x} status={:#x}",
                    self.id,
                    sector_id,
                    self.last_status
                );
                panic!("fatal error while reading from an ATA device");
            }
            for word in 0..SECTOR_SIZE / 2 {
                let value = self.io.read_u16(self.ports.command_base + DATA_REGISTER);
                let offset = sector * SECTOR_SIZE + word * 2;
                buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    /// Write `sector_count` sectors (0 means 256) starting at `sector_id`
    /// from `buffer`. Faults and timeouts abort the kernel.
    pub fn write_sectors(
        &mut self,
        drive: Drive,
        sector_id: u64,
        sector_count: usize,
        buffer: &[u8],
    ) {
        assert!(sector_count <= 256);
        self.setup_transfer(drive, sector_id, sector_count, WRITE_SECTORS_COMMAND);

        let sector_count = if sector_count == 0 { 256 } else { sector_count };
        assert!(buffer.len() >= sector_count * SECTOR_SIZE);

        for sector in 0..sector_count {
            // The device raises DRQ before the first sector and between
            // sectors; wait it out in both places.
            if sector == 0
                && !matches!(self.wait_while_busy(SECTOR_TIMEOUT_MS), WaitResult::Done)
            {
                self.abort_write(sector_id, sector_count);
            }
            for word in 0..SECTOR_SIZE / 2 {
                let offset = sector * SECTOR_SIZE + word * 2;
                let value = u16::from_le_bytes([buffer[offset], buffer[offset + 1]]);
                self.io
                    .write_u16(self.ports.command_base + DATA_REGISTER, value);
            }
            if !matches!(self.wait_while_busy(SECTOR_TIMEOUT_MS), WaitResult::Done) {
                self.abort_write(sector_id, sector_count);
            }
        }
    }

    fn abort_write(&self, sector_id: u64, sector_count: usize) -> ! {
        log::error!(
            "ATA write failed: channel={} sector_id={:#x} sector_count={} status={:#x}",
            self.id,
            sector_id,
            sector_count,
            self.last_status
        );
        panic!("fatal error while writing to an ATA device");
    }

    /// Reset the channel and probe both drives.
    pub fn probe_devices(&mut self) -> Vec<AtaDevice> {
        if !self.software_reset() {
            log::debug!("  timeout while trying to reset IDE channel {}", self.id);
            return Vec::new();
        }

        let mut devices = Vec::new();
        for drive in [Drive::Master, Drive::Slave] {
            if let Some(device) = self.probe_device(drive) {
                devices.push(device);
            }
        }
        devices
    }

    fn probe_device(&mut self, drive: Drive) -> Option<AtaDevice> {
        let base = self.ports.command_base;
        log::debug!(
            "  trying to initialize ATA device ({} at IDE channel {}):",
            drive.name(),
            self.id
        );

        self.io
            .write_u8(base + DEVICE_REGISTER, 0xA0 | (drive.select_bit() << 4));
        self.pause_400ns();

        // A device places its signature in the command-block registers on
        // power-on, hardware and software reset.
        let sector_count = self.io.read_u8(base + SECTOR_COUNT_REGISTER);
        let lba_low = self.io.read_u8(base + LBA_LOW_REGISTER);
        let lba_mid = self.io.read_u8(base + LBA_MID_REGISTER);
        let lba_high = self.io.read_u8(base + LBA_HIGH_REGISTER);
        let device_register = self.io.read_u8(base + DEVICE_REGISTER);

        self.io
            .write_u8(base + COMMAND_REGISTER, IDENTIFY_DEVICE_COMMAND);
        self.pause_400ns();

        if self.io.read_u8(base + STATUS_REGISTER) == 0
            || !matches!(
                self.wait_while_busy(IDENTIFY_TIMEOUT_MS),
                WaitResult::Done
            )
        {
            log::debug!("    nothing found");
            return None;
        }

        let device_type =
            classify_signature(sector_count, lba_low, lba_mid, lba_high, device_register);
        log::debug!("    \"{}\" device found", device_type.name());
        if !matches!(device_type, AtaDeviceType::Pata | AtaDeviceType::Sata) {
            return None;
        }

        let mut raw = [0u8; SECTOR_SIZE];
        for word in 0..SECTOR_SIZE / 2 {
            let value = self.io.read_u16(base + DATA_REGISTER);
            raw[word * 2..word * 2 + 2].copy_from_slice(&value.to_le_bytes());
        }
        let identify = IdentifyData::from_bytes(&raw);

        if identify.is_removable_media() {
            log::debug!("    removable media device ignored");
            return None;
        }
        if identify.requires_lba48() {
            log::debug!("    device requires 48-bit LBA and cannot be used");
            return None;
        }

        let mut device = AtaDevice {
            id: self.id * 2 + drive.select_bit(),
            drive,
            device_type,
            model: identify.model(),
            serial: identify.serial(),
            firmware_revision: identify.firmware_revision(),
            max_lba28: identify.max_lba28(),
            partitions: Vec::new(),
        };
        self.discover_partitions(&mut device);

        log::debug!(
            "    model=\"{}\" firmware=\"{}\" serial=\"{}\" sectors={} partitions={}",
            device.model,
            device.firmware_revision,
            device.serial,
            device.max_lba28,
            device.partitions.len()
        );
        Some(device)
    }

    fn discover_partitions(&mut self, device: &mut AtaDevice) {
        log::debug!("    initializing device partitions:");

        let mut sector = [0u8; SECTOR_SIZE];
        self.read_sectors(device.drive, 0, 1, &mut sector);
        let mbr = Mbr::from_bytes(&sector);
        if !mbr.is_valid() {
            log::debug!("      no MBR found");
            return;
        }
        log::debug!("      found a valid MBR");

        for (index, entry) in mbr.partition_table().iter().enumerate() {
            if !entry.is_valid() || !entry.is_recognized() || entry.sector_count() == 0 {
                continue;
            }
            let last_sector = entry.first_lba() as u64 + entry.sector_count() as u64 - 1;
            if last_sector > MAX_LBA28 {
                log::debug!(
                    "      partition {} ends beyond the 28-bit limit and is ignored",
                    index
                );
                continue;
            }
            log::debug!(
                "      partition {}: type={:#04x} first_lba={} sectors={}",
                index,
                entry.partition_type(),
                entry.first_lba(),
                entry.sector_count()
            );
            device.partitions.push(DiscoveredPartition {
                index: index as u8,
                first_lba: entry.first_lba(),
                sector_count: entry.sector_count(),
            });
        }
    }
}

/// A probed channel with its discovered disks and partition devices.
pub struct ProbedChannel<P: PortIo, C: Clock> {
    pub channel: Arc<Mutex<IdeChannel<P, C>>>,
    pub devices: Vec<AtaDevice>,
    pub partitions: Vec<Arc<AtaPartition<P, C>>>,
}

/// Device-id namespace for ATA partitions.
const ATA_PARTITION_DEVICE_CLASS: u32 = 0x0300;

/// Bring up one IDE channel: reset, probe both drives, and wrap every
/// eligible MBR partition as a block device sharing the channel.
pub fn initialize_channel<P: PortIo, C: Clock>(
    io: P,
    clock: C,
    ports: IdePorts,
    id: u8,
) -> ProbedChannel<P, C> {
    let mut channel = IdeChannel::new(io, clock, ports, id);
    let devices = channel.probe_devices();
    let channel = Arc::new(Mutex::new(channel));

    let mut partitions = Vec::new();
    for device in &devices {
        for discovered in &device.partitions {
            let partition_number =
                device.id as u32 * mbr::PARTITION_TABLE_LENGTH as u32 + discovered.index as u32;
            let device_id = DeviceId(ATA_PARTITION_DEVICE_CLASS << 8 | partition_number);
            partitions.push(Arc::new(AtaPartition::new(
                channel.clone(),
                device.drive,
                device_id,
                discovered.first_lba as u64,
                discovered.sector_count as u64,
            )));
        }
    }

    log::info!(
        "IDE channel {}: {} device(s), {} partition(s)",
        id,
        devices.len(),
        partitions.len()
    );

    ProbedChannel {
        channel,
        devices,
        partitions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_classification_follows_the_ata6_table() {
        assert_eq!(
            classify_signature(0x01, 0x01, 0x00, 0x00, 0x00),
            AtaDeviceType::Pata
        );
        assert_eq!(
            classify_signature(0x01, 0x01, 0x14, 0xEB, 0x00),
            AtaDeviceType::Patapi
        );
        assert_eq!(
            classify_signature(0x01, 0x01, 0x3C, 0xC3, 0x00),
            AtaDeviceType::Sata
        );
        assert_eq!(
            classify_signature(0x01, 0x01, 0x69, 0x96, 0x00),
            AtaDeviceType::Satapi
        );
        // Bits outside the drive-select mask spoil the signature.
        assert_eq!(
            classify_signature(0x01, 0x01, 0x00, 0x00, 0x40),
            AtaDeviceType::Unknown
        );
        assert_eq!(
            classify_signature(0x02, 0x01, 0x00, 0x00, 0x00),
            AtaDeviceType::Unknown
        );
        // The drive-select and LBA bits are ignored.
        assert_eq!(
            classify_signature(0x01, 0x01, 0x00, 0x00, 0xB0),
            AtaDeviceType::Pata
        );
    }
}
