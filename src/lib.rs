//! Combines a bootloader binary and a kernel binary into a bootable MBR disk
//! image. The kernel is written to its own partition past the bootloader so
//! that the bootloader can locate it through the partition table at run time.

use anyhow::{bail, Context, Result};
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

pub mod mbr;

/// Sector size assumed by the MBR format and by all offset math here.
pub const SECTOR_SIZE: u64 = 512;

/// Byte offset where the kernel image starts: 2048 sectors (1 MiB) in,
/// leaving room below for the bootloader and the partition table.
pub const KERNEL_BASE: u64 = 2048 * SECTOR_SIZE;

/// Partition slot describing the kernel region.
pub const BOOT_PARTITION_SLOT: u8 = 1;

/// A sector-aligned byte range of the disk image. Base and length are both
/// multiples of [`SECTOR_SIZE`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Region {
    pub base: u64,
    pub length: u64,
}

pub struct DiskImageBuilder {
    bootloader_path: PathBuf,
    kernel_path: PathBuf,
}

impl DiskImageBuilder {
    pub fn new(bootloader: &Path, kernel: &Path) -> Self {
        Self {
            bootloader_path: PathBuf::from(bootloader),
            kernel_path: PathBuf::from(kernel),
        }
    }

    /// Copy the bootloader to `out_path` and append the kernel at
    /// [`KERNEL_BASE`], zero padded to a full sector. Returns the kernel
    /// region for the partition table.
    pub fn assemble(&self, out_path: &Path) -> Result<Region> {
        self.copy_bootloader(out_path)?;
        let mut disk = open_rw(out_path)?;
        append_kernel(&mut disk, &self.kernel_path)
    }

    /// Build the complete image: assemble bootloader and kernel, then patch
    /// partition slot [`BOOT_PARTITION_SLOT`] so it describes the kernel
    /// region.
    pub fn create_mbr_disk(&self, out_path: &Path) -> Result<Region> {
        self.copy_bootloader(out_path)?;
        let mut disk = open_rw(out_path)?;
        let region = append_kernel(&mut disk, &self.kernel_path)?;
        mbr::write_partition_entry(&mut disk, BOOT_PARTITION_SLOT, region)?;
        Ok(region)
    }

    fn copy_bootloader(&self, out_path: &Path) -> Result<()> {
        let bootloader_len = fs::metadata(&self.bootloader_path)
            .with_context(|| {
                format!(
                    "failed to read bootloader {}",
                    self.bootloader_path.display()
                )
            })?
            .len();
        if bootloader_len > KERNEL_BASE {
            bail!(
                "bootloader {} is {} bytes and would overlap the kernel region at byte {}",
                self.bootloader_path.display(),
                bootloader_len,
                KERNEL_BASE
            );
        }

        fs::copy(&self.bootloader_path, out_path).with_context(|| {
            format!(
                "failed to copy {} to {}",
                self.bootloader_path.display(),
                out_path.display()
            )
        })?;
        Ok(())
    }
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open disk image {}", path.display()))
}

/// Write the whole kernel file starting at [`KERNEL_BASE`] and pad the tail
/// with zeroes up to the next sector boundary. The partition math downstream
/// assumes whole sectors.
fn append_kernel<D: Write + Seek>(disk: &mut D, kernel_path: &Path) -> Result<Region> {
    let mut kernel = File::open(kernel_path)
        .with_context(|| format!("failed to open kernel {}", kernel_path.display()))?;

    disk.seek(SeekFrom::Start(KERNEL_BASE))
        .context("failed to seek to kernel base")?;
    io::copy(&mut kernel, disk)
        .with_context(|| format!("failed to copy kernel {} into image", kernel_path.display()))?;

    let kernel_end = disk
        .stream_position()
        .context("failed to get disk image seek position")?;
    let partial = kernel_end % SECTOR_SIZE;
    if partial != 0 {
        let padding = vec![0u8; (SECTOR_SIZE - partial) as usize];
        disk.write_all(&padding)
            .context("failed to pad kernel to a sector boundary")?;
    }

    let padded_end = disk
        .stream_position()
        .context("failed to get disk image seek position")?;
    Ok(Region {
        base: KERNEL_BASE,
        length: padded_end - KERNEL_BASE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn assemble_image(bootloader: &[u8], kernel: &[u8]) -> (TempDir, PathBuf, Region) {
        let dir = tempfile::tempdir().unwrap();
        let bootloader_path = dir.path().join("bootloader.bin");
        let kernel_path = dir.path().join("kernel.bin");
        let out_path = dir.path().join("disk.img");
        fs::write(&bootloader_path, bootloader).unwrap();
        fs::write(&kernel_path, kernel).unwrap();

        let region = DiskImageBuilder::new(&bootloader_path, &kernel_path)
            .assemble(&out_path)
            .unwrap();
        (dir, out_path, region)
    }

    #[test]
    fn test_single_byte_kernel_padded_to_one_sector() {
        let (_dir, _out, region) = assemble_image(&[0u8; 512], b"K");
        assert_eq!(
            region,
            Region {
                base: KERNEL_BASE,
                length: SECTOR_SIZE
            }
        );
    }

    #[test]
    fn test_exact_sector_kernel_not_padded() {
        let (_dir, _out, region) = assemble_image(&[0u8; 512], &[0xAA; 512]);
        assert_eq!(region.length, SECTOR_SIZE);
    }

    #[test]
    fn test_partial_second_sector_rounds_up() {
        let (_dir, _out, region) = assemble_image(&[0u8; 512], &[0x55; 513]);
        assert_eq!(region.length, 2 * SECTOR_SIZE);
    }

    #[test]
    fn test_kernel_base_is_fixed() {
        for kernel_len in [1usize, 512, 4096] {
            let (_dir, _out, region) = assemble_image(&[0u8; 1024], &vec![1u8; kernel_len]);
            assert_eq!(region.base, 1_048_576);
        }
    }

    #[test]
    fn test_image_grows_to_padded_kernel_end() {
        let (_dir, out_path, region) = assemble_image(&[0u8; 1024], &[7u8; 700]);
        let image_len = fs::metadata(&out_path).unwrap().len();
        assert_eq!(image_len, KERNEL_BASE + region.length);
        assert_eq!(region.length, 2 * SECTOR_SIZE);
    }

    #[test]
    fn test_oversized_bootloader_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bootloader_path = dir.path().join("bootloader.bin");
        let kernel_path = dir.path().join("kernel.bin");
        let out_path = dir.path().join("disk.img");
        fs::write(&bootloader_path, vec![0u8; KERNEL_BASE as usize + 1]).unwrap();
        fs::write(&kernel_path, b"KERNEL").unwrap();

        let err = DiskImageBuilder::new(&bootloader_path, &kernel_path)
            .assemble(&out_path)
            .unwrap_err();
        assert!(err.to_string().contains("overlap"));
        assert!(!out_path.exists());
    }

    #[test]
    fn test_missing_kernel_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let bootloader_path = dir.path().join("bootloader.bin");
        let kernel_path = dir.path().join("nonexistent.bin");
        let out_path = dir.path().join("disk.img");
        fs::write(&bootloader_path, [0u8; 512]).unwrap();

        let err = DiskImageBuilder::new(&bootloader_path, &kernel_path)
            .assemble(&out_path)
            .unwrap_err();
        assert!(err.to_string().contains("nonexistent.bin"));
    }
}
