// Common disk operation functionality shared across platforms

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::{debug, error, info, warn};

/// Logical sector size used for partitioning and write padding
pub const SECTOR_SIZE: u64 = 512;

const MB: f64 = 1f64 / 1024f64 / 1024f64;

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 * MB
}

/// Proxy for accessing a single partition of a disk.
///
/// All positions are relative to the partition start and bounded by its size,
/// so a filesystem driver handed this proxy can never touch bytes outside
/// the partition.
pub struct PartitionFileProxy<T: Read + Write + Seek> {
    /// The underlying handle for the entire disk
    file: T,
    /// The offset in bytes where the partition starts
    partition_offset: u64,
    /// The size of the partition in bytes
    partition_size: u64,
    /// The current position relative to the start of the partition
    current_position: u64,
}

impl<T: Read + Write + Seek> PartitionFileProxy<T> {
    pub fn new(file: T, partition_offset: u64, partition_size: u64) -> Self {
        Self {
            file,
            partition_offset,
            partition_size,
            current_position: 0,
        }
    }

    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    pub fn into_inner(self) -> T {
        self.file
    }

    fn absolute_position(&self) -> u64 {
        self.partition_offset + self.current_position
    }

    fn remaining(&self) -> u64 {
        self.partition_size.saturating_sub(self.current_position)
    }
}

impl<T: Read + Write + Seek> Read for PartitionFileProxy<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max_read = std::cmp::min(buf.len() as u64, self.remaining()) as usize;
        if max_read == 0 {
            return Ok(0);
        }

        self.file.seek(SeekFrom::Start(self.absolute_position()))?;
        let bytes_read = self.file.read(&mut buf[..max_read])?;
        self.current_position += bytes_read as u64;
        Ok(bytes_read)
    }
}

impl<T: Read + Write + Seek> Write for PartitionFileProxy<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let max_write = std::cmp::min(buf.len() as u64, self.remaining()) as usize;
        if max_write == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "write at {} is beyond partition size {}",
                    self.current_position, self.partition_size
                ),
            ));
        }

        self.file.seek(SeekFrom::Start(self.absolute_position()))?;
        let bytes_written = self.file.write(&buf[..max_write])?;
        self.current_position += bytes_written as u64;
        Ok(bytes_written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl<T: Read + Write + Seek> Seek for PartitionFileProxy<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_position = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.current_position.checked_add_signed(offset),
            SeekFrom::End(offset) => self.partition_size.checked_add_signed(offset),
        };

        let new_position = new_position.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid seek to a negative position")
        })?;

        if new_position > self.partition_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "position {} is beyond partition size {}",
                    new_position, self.partition_size
                ),
            ));
        }

        // The real seek happens on the next read or write
        self.current_position = new_position;
        Ok(new_position)
    }
}

/// Whether an I/O error means the device node went away underneath us
pub fn is_device_gone(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::NotFound {
        return true;
    }

    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        return matches!(code, libc::ENODEV | libc::ENXIO | libc::ENOENT);
    }

    false
}

/// Log an OS-level disk error with a hint about the likely cause
pub fn log_device_error(operation: &str, e: &io::Error) {
    let Some(code) = e.raw_os_error() else {
        error!("{} failed: {}", operation, e);
        return;
    };

    #[cfg(unix)]
    match code {
        libc::EACCES | libc::EPERM => {
            error!("{} failed with permission denied (code {}): {}", operation, code, e);
            error!("Make sure you're running with appropriate permissions and the disk is not write-protected");
        }
        libc::EIO => {
            error!("{} failed with I/O error (code {}): {}", operation, code, e);
            error!("The disk may be damaged; try a different USB port or disk");
        }
        libc::ENOSPC => {
            error!("{} failed, no space left (code {}): {}", operation, code, e);
        }
        libc::ENODEV | libc::ENXIO => {
            error!("{} failed, device not available (code {}): {}", operation, code, e);
            error!("The disk was disconnected during the operation");
        }
        libc::EBUSY => {
            error!("{} failed, device busy (code {}): {}", operation, code, e);
            error!("Another process holds the disk open");
        }
        _ => {
            error!("{} failed with OS error code {}: {}", operation, code, e);
        }
    }

    #[cfg(not(unix))]
    error!("{} failed with OS error code {}: {}", operation, code, e);
}

/// Make sure everything written so far has reached the medium
pub fn sync_file(file: &mut File) -> io::Result<()> {
    let sync_start = std::time::Instant::now();
    debug!("Calling fsync on disk handle");
    if let Err(e) = file.sync_all() {
        // Some block devices reject fsync but honour flush
        warn!("fsync failed: {}", e);
        if is_device_gone(&e) {
            return Err(e);
        }
    } else {
        info!("fsync completed in {:?}", sync_start.elapsed());
    }
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn proxy_over(bytes: usize, offset: u64, size: u64) -> PartitionFileProxy<Cursor<Vec<u8>>> {
        PartitionFileProxy::new(Cursor::new(vec![0u8; bytes]), offset, size)
    }

    #[test]
    fn test_proxy_writes_land_at_offset() {
        let mut proxy = proxy_over(4096, 1024, 1024);
        proxy.write_all(b"hello").unwrap();
        let disk = proxy.into_inner().into_inner();
        assert_eq!(&disk[1024..1029], b"hello");
        assert!(disk[..1024].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_proxy_bounds() {
        let mut proxy = proxy_over(4096, 1024, 16);
        assert_eq!(proxy.seek(SeekFrom::End(0)).unwrap(), 16);
        assert!(proxy.seek(SeekFrom::Start(17)).is_err());
        assert!(proxy.seek(SeekFrom::Current(-20)).is_err());

        proxy.seek(SeekFrom::Start(10)).unwrap();
        assert_eq!(proxy.write(&[1u8; 32]).unwrap(), 6);
        assert_eq!(proxy.write(&[1u8; 1]).unwrap_err().kind(), io::ErrorKind::WriteZero);

        proxy.seek(SeekFrom::Start(12)).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(proxy.read(&mut buf).unwrap(), 4);
        assert_eq!(proxy.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_device_gone_classification() {
        assert!(is_device_gone(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(is_device_gone(&io::Error::from_raw_os_error(libc::ENODEV)));
        assert!(!is_device_gone(&io::Error::from_raw_os_error(libc::EIO)));
        assert!(!is_device_gone(&io::Error::other("short write")));
    }

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(3 * 1024 * 1024), 3.0);
    }
}
