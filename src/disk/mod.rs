// Disk operations module with platform abstraction
//
// A `Disk` is an exclusively opened handle on either a real block device or,
// for offline use and tests, a disk image file. The provisioning steps
// (partition reset, format, image write) all work on top of it.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::models::Device;

#[cfg(target_os = "linux")]
mod linux;

pub mod common;
pub mod enumerate;
pub mod format;
pub mod partition;
pub mod write;

pub use common::{PartitionFileProxy, SECTOR_SIZE, bytes_to_mb};
pub use enumerate::{DeviceEvent, DeviceMonitor, DeviceSource, DriveListSource, wait_for_devices};
pub use format::{FilesystemFormatter, FormatStatus};
pub use partition::{PartitionInfo, PartitionTable, PartitionTableResetter, Problem, ResetOutcome};
pub use write::ImageWriteEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskKind {
    BlockDevice,
    ImageFile,
}

/// Exclusively opened disk
#[derive(Debug)]
pub struct Disk {
    file: File,
    path: PathBuf,
    size: u64,
    kind: DiskKind,
}

impl Disk {
    /// Open and lock the disk behind `device` for read-write access.
    ///
    /// A missing device node is reported as `io::ErrorKind::NotFound`, which
    /// the engine treats as "device gone".
    pub async fn lock(device: &Device) -> io::Result<Self> {
        Self::lock_path(device.path()).await
    }

    pub async fn lock_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            debug!("Device path {} is not accessible: {}", path.display(), e);
            e
        })?;

        if metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory, not a disk", path.display()),
            ));
        }

        if metadata.is_file() {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            return Self::from_file(file, path, DiskKind::ImageFile);
        }

        info!("Locking block device {}", path.display());
        let file = Self::open_block_device(path).await?;
        Self::from_file(file, path, DiskKind::BlockDevice)
    }

    #[cfg(target_os = "linux")]
    async fn open_block_device(path: &Path) -> io::Result<File> {
        match linux::LinuxDiskAccess::lock_path(path).await {
            Ok(file) => Ok(file),
            Err(e) => {
                // Without a reachable UDisks2 daemon fall back to a direct exclusive open
                warn!("UDisks2 could not open {}: {:#}", path.display(), e);
                if !path.exists() {
                    return Err(io::Error::new(io::ErrorKind::NotFound, e.to_string()));
                }
                open_exclusive(path)
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    async fn open_block_device(path: &Path) -> io::Result<File> {
        open_exclusive(path)
    }

    fn from_file(mut file: File, path: &Path, kind: DiskKind) -> io::Result<Self> {
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        debug!(
            "Opened {} ({:?}, {:.1} MB)",
            path.display(),
            kind,
            bytes_to_mb(size)
        );
        Ok(Disk {
            file,
            path: path.to_path_buf(),
            size,
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capacity in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Capacity in logical sectors
    pub fn sectors(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    pub fn is_block_device(&self) -> bool {
        self.kind == DiskKind::BlockDevice
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// A second handle on the same open file description
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Ask the kernel to re-read the partition table after we rewrote it
    pub fn reread_partition_table(&self) {
        if self.kind != DiskKind::BlockDevice {
            return;
        }

        #[cfg(target_os = "linux")]
        linux::reread_partition_table(&self.file);
    }
}

#[cfg(unix)]
fn open_exclusive(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_EXCL | libc::O_CLOEXEC)
        .open(path)
}

#[cfg(not(unix))]
fn open_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}
