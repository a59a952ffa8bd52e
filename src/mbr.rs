//! This module implements the handling of the partition table stored at the
//! end of the master boot record, including the legacy CHS encoding that the
//! 16-byte entry format still carries.

use crate::{Region, SECTOR_SIZE};
use anyhow::{bail, Context, Result};
use std::{
    fmt,
    io::{Seek, SeekFrom, Write},
};

/// Conventional disk geometry assumed for LBA to CHS conversion. Modern
/// BIOSes read the LBA fields instead, but the CHS bytes must still be
/// well formed.
pub const HEADS_PER_CYLINDER: u32 = 16;
pub const SECTORS_PER_TRACK: u32 = 63;

/// Byte offset of the partition table inside the boot sector.
pub const PARTITION_TABLE_OFFSET: u64 = 0x1BE;
pub const PARTITION_TABLE_ENTRY_COUNT: usize = 0x4;
pub const PARTITION_TABLE_ENTRY_SIZE: usize = 0x10;

/// Boot indicator marking a partition as active.
pub const BOOT_ACTIVE: u8 = 0x80;
/// Partition type: FAT32 with LBA addressing.
pub const PARTITION_TYPE_FAT32_LBA: u8 = 0x0C;

/// A violated contract of [`write_partition_entry`]. These are usage errors,
/// never corrected silently, and nothing is written when one is raised.
#[derive(Debug, PartialEq, Eq)]
pub enum PreconditionViolation {
    /// Partition slot outside the four-entry table.
    InvalidSlot(u8),
    /// Region base is not a multiple of the sector size.
    UnalignedBase(u64),
    /// Region length is not a multiple of the sector size.
    UnalignedLength(u64),
    /// Region does not span a single sector.
    EmptyRegion,
}

impl fmt::Display for PreconditionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSlot(slot) => {
                write!(f, "partition slot {slot} is outside [1, 4]")
            }
            Self::UnalignedBase(base) => {
                write!(f, "region base {base} is not a multiple of {SECTOR_SIZE}")
            }
            Self::UnalignedLength(length) => {
                write!(f, "region length {length} is not a multiple of {SECTOR_SIZE}")
            }
            Self::EmptyRegion => write!(f, "region must span at least one sector"),
        }
    }
}

impl std::error::Error for PreconditionViolation {}

/// Cylinder-head-sector coordinates of a single sector.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Chs {
    pub cylinder: u32,
    pub head: u32,
    pub sector: u32,
}

impl Chs {
    /// Convert an LBA to CHS coordinates using the conventional geometry
    /// above. Sectors are 1-based, cylinders and heads 0-based.
    pub fn from_lba(lba: u32) -> Self {
        Self {
            cylinder: lba / (HEADS_PER_CYLINDER * SECTORS_PER_TRACK),
            head: (lba / SECTORS_PER_TRACK) % HEADS_PER_CYLINDER,
            sector: (lba % SECTORS_PER_TRACK) + 1,
        }
    }

    /// Pack into the 3-byte on-disk encoding: head, then sector with the
    /// cylinder's bits 8..10 in the top of the byte, then the low cylinder
    /// byte. Cylinders beyond 10 bits are truncated by the masks.
    pub fn pack(&self) -> [u8; 3] {
        [
            self.head as u8,
            (self.sector as u8 & 0x3F) | (((self.cylinder >> 2) & 0xC0) as u8),
            self.cylinder as u8,
        ]
    }
}

/// An entry in a partition table.
///
/// The CHS address fields are not stored; they are derived from the LBA
/// fields during serialization.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PartitionTableEntry {
    /// Whether this partition is a boot partition.
    pub bootable: bool,

    /// The type of partition in this entry.
    pub partition_type: u8,

    /// The index of the first block of this entry.
    pub logical_block_address: u32,

    /// The total number of blocks in this entry. Must be nonzero.
    pub sector_count: u32,
}

impl PartitionTableEntry {
    pub fn new(
        bootable: bool,
        partition_type: u8,
        logical_block_address: u32,
        sector_count: u32,
    ) -> PartitionTableEntry {
        PartitionTableEntry {
            bootable,
            partition_type,
            logical_block_address,
            sector_count,
        }
    }

    /// Serialize to the on-disk 16-byte layout: boot indicator, start CHS,
    /// type, end CHS, start LBA and sector count (both little endian).
    pub fn to_bytes(&self) -> [u8; PARTITION_TABLE_ENTRY_SIZE] {
        let start_chs = Chs::from_lba(self.logical_block_address);
        let end_chs = Chs::from_lba(self.logical_block_address + self.sector_count - 1);

        let mut bytes = [0u8; PARTITION_TABLE_ENTRY_SIZE];
        bytes[0] = if self.bootable { BOOT_ACTIVE } else { 0 };
        bytes[1..4].copy_from_slice(&start_chs.pack());
        bytes[4] = self.partition_type;
        bytes[5..8].copy_from_slice(&end_chs.pack());
        bytes[8..12].copy_from_slice(&self.logical_block_address.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.sector_count.to_le_bytes());
        bytes
    }

    /// Decode the entry at `index` (0-based) from a partition-table byte
    /// slice. Counterpart of [`Self::to_bytes`] for inspecting images.
    pub fn parse(partition_table: &[u8], index: usize) -> PartitionTableEntry {
        let offset = index * PARTITION_TABLE_ENTRY_SIZE;
        let entry = &partition_table[offset..offset + PARTITION_TABLE_ENTRY_SIZE];

        PartitionTableEntry {
            bootable: entry[0] == BOOT_ACTIVE,
            partition_type: entry[4],
            logical_block_address: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
            sector_count: u32::from_le_bytes(entry[12..16].try_into().unwrap()),
        }
    }
}

/// Write the 16-byte partition entry describing `region` into partition
/// slot `slot` (1-based) of the boot sector.
///
/// Only the targeted 16-byte window is touched; adjacent slots and the boot
/// signature keep whatever the bootloader put there. Re-invoking with the
/// same inputs produces byte-identical output.
pub fn write_partition_entry<D: Write + Seek>(disk: &mut D, slot: u8, region: Region) -> Result<()> {
    if !(1..=4).contains(&slot) {
        return Err(PreconditionViolation::InvalidSlot(slot).into());
    }
    if region.base % SECTOR_SIZE != 0 {
        return Err(PreconditionViolation::UnalignedBase(region.base).into());
    }
    if region.length % SECTOR_SIZE != 0 {
        return Err(PreconditionViolation::UnalignedLength(region.length).into());
    }
    if region.length == 0 {
        return Err(PreconditionViolation::EmptyRegion.into());
    }

    let start_sector = region.base / SECTOR_SIZE;
    let sector_count = region.length / SECTOR_SIZE;
    let end_sector = start_sector + sector_count - 1;
    if end_sector > u64::from(u32::MAX) || sector_count > u64::from(u32::MAX) {
        bail!(
            "partition region (sectors {start_sector}..={end_sector}) does not fit \
             the 32-bit sector fields of an MBR entry"
        );
    }

    let entry = PartitionTableEntry::new(
        true,
        PARTITION_TYPE_FAT32_LBA,
        start_sector as u32,
        sector_count as u32,
    );

    let offset = PARTITION_TABLE_OFFSET + PARTITION_TABLE_ENTRY_SIZE as u64 * u64::from(slot - 1);
    disk.seek(SeekFrom::Start(offset))
        .context("failed to seek to partition table entry")?;
    disk.write_all(&entry.to_bytes())
        .context("failed to write partition table entry")?;

    Ok(())
}
