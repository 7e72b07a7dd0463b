// Quick FAT32 format of the partition created by the resetter

use fatfs::{FatType, FormatVolumeOptions, FsOptions};
use std::io;
use tracing::{debug, error, info, warn};

use super::Disk;
use super::common::{PartitionFileProxy, bytes_to_mb, is_device_gone, log_device_error, sync_file};
use super::partition::PartitionInfo;
use crate::error::FormatError;
use crate::models::Device;

const LABEL_LEN: usize = 11;

/// Status notifications emitted while formatting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatStatus {
    InProgress,
    /// The requested allocation unit did not fit the volume; the formatter
    /// falls back to its own choice
    ClusterSizeRejected { cluster_size: u32, reason: String },
    DeviceNotReady(String),
    Done,
}

/// Turn an arbitrary string into an 11-byte FAT volume label
pub fn volume_label(label: &str) -> [u8; LABEL_LEN] {
    let mut out = [b' '; LABEL_LEN];
    let cleaned = label
        .trim()
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .map(|c| match c {
            'A'..='Z' | '0'..='9' | ' ' | '_' | '-' => c,
            _ => '_',
        })
        .take(LABEL_LEN);

    let mut written = 0;
    for (slot, c) in out.iter_mut().zip(cleaned) {
        *slot = c as u8;
        written += 1;
    }

    if written == 0 {
        out.copy_from_slice(b"NO NAME    ");
    }
    out
}

#[derive(Debug, Clone)]
pub struct FilesystemFormatter {
    cluster_size: u32,
}

impl Default for FilesystemFormatter {
    fn default() -> Self {
        Self::new(4096)
    }
}

enum Attempt {
    Formatted,
    Rejected(String),
}

impl FilesystemFormatter {
    pub fn new(cluster_size: u32) -> Self {
        Self { cluster_size }
    }

    /// Lock `device` and quick-format `partition` as FAT32
    pub async fn format<F>(
        &self,
        device: &Device,
        partition: &PartitionInfo,
        label: &str,
        mut on_status: F,
    ) -> Result<(), FormatError>
    where
        F: FnMut(FormatStatus) + Send + 'static,
    {
        let mut disk = match Disk::lock(device).await {
            Ok(disk) => disk,
            Err(e) => return Err(self.fail(e, &mut on_status)),
        };

        let formatter = self.clone();
        let partition = partition.clone();
        let label = label.to_string();
        tokio::task::spawn_blocking(move || {
            formatter.format_disk(&mut disk, &partition, &label, &mut on_status)
        })
        .await
        .map_err(|e| FormatError::Unknown(io::Error::other(e)))?
    }

    /// Format a partition of an already locked disk
    pub fn format_disk(
        &self,
        disk: &mut Disk,
        partition: &PartitionInfo,
        label: &str,
        on_status: &mut dyn FnMut(FormatStatus),
    ) -> Result<(), FormatError> {
        on_status(FormatStatus::InProgress);

        let offset = partition.offset();
        let size = partition.size();
        if offset + size > disk.size() {
            return Err(FormatError::Unknown(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "partition ends at byte {} but {} has only {}",
                    offset + size,
                    disk.path().display(),
                    disk.size()
                ),
            )));
        }

        let label_bytes = volume_label(label);
        info!(
            "Formatting {:.1} MB partition {} on {} as FAT32, label {:?}",
            bytes_to_mb(size),
            partition.guid,
            disk.path().display(),
            String::from_utf8_lossy(&label_bytes).trim_end()
        );

        let rejected = match self.try_format(disk, offset, size, label_bytes, Some(self.cluster_size)) {
            Ok(Attempt::Formatted) => None,
            Ok(Attempt::Rejected(reason)) => Some(reason),
            Err(e) => return Err(self.fail(e, on_status)),
        };

        if let Some(reason) = rejected {
            warn!(
                "Cluster size of {} bytes rejected ({}), letting the formatter choose",
                self.cluster_size, reason
            );
            on_status(FormatStatus::ClusterSizeRejected {
                cluster_size: self.cluster_size,
                reason: reason.clone(),
            });

            match self.try_format(disk, offset, size, label_bytes, None) {
                Ok(Attempt::Formatted) => {}
                Ok(Attempt::Rejected(retry_reason)) => {
                    error!("FAT32 does not fit this partition: {}", retry_reason);
                    return Err(FormatError::ClusterSizeRejected {
                        cluster_size: self.cluster_size,
                        reason: format!("{}; automatic choice: {}", reason, retry_reason),
                    });
                }
                Err(e) => return Err(self.fail(e, on_status)),
            }
        }

        sync_file(disk.file_mut()).map_err(|e| self.fail(e, on_status))?;

        // Read the result back before claiming success
        let proxy = PartitionFileProxy::new(
            disk.try_clone_file().map_err(|e| self.fail(e, on_status))?,
            offset,
            size,
        );
        let fs = fatfs::FileSystem::new(proxy, FsOptions::new()).map_err(|e| self.fail(e, on_status))?;
        if fs.fat_type() != FatType::Fat32 {
            return Err(FormatError::Unknown(io::Error::other(format!(
                "formatted volume reports {:?} instead of FAT32",
                fs.fat_type()
            ))));
        }
        debug!("Formatted volume label: {:?}", fs.volume_label());

        on_status(FormatStatus::Done);
        info!("Format of {} completed", disk.path().display());
        Ok(())
    }

    fn try_format(
        &self,
        disk: &Disk,
        offset: u64,
        size: u64,
        label: [u8; LABEL_LEN],
        cluster_size: Option<u32>,
    ) -> io::Result<Attempt> {
        let mut options = FormatVolumeOptions::new()
            .fat_type(FatType::Fat32)
            .volume_label(label);

        if let Some(cluster_size) = cluster_size {
            if !cluster_size.is_power_of_two() || !(512..=65536).contains(&cluster_size) {
                return Ok(Attempt::Rejected(format!(
                    "{} is not a power of two between 512 and 65536",
                    cluster_size
                )));
            }
            options = options.bytes_per_cluster(cluster_size);
        }

        let proxy = PartitionFileProxy::new(disk.try_clone_file()?, offset, size);
        match fatfs::format_volume(proxy, options) {
            Ok(()) => Ok(Attempt::Formatted),
            // Parameter validation errors carry no OS error code
            Err(e) if e.raw_os_error().is_none() && !is_device_gone(&e) => {
                debug!("format_volume rejected parameters: {}", e);
                Ok(Attempt::Rejected(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn fail(&self, e: io::Error, on_status: &mut dyn FnMut(FormatStatus)) -> FormatError {
        log_device_error("Format", &e);
        let err = classify_io(e);
        if let FormatError::DeviceNotReady(source) = &err {
            on_status(FormatStatus::DeviceNotReady(source.to_string()));
        }
        err
    }
}

fn classify_io(e: io::Error) -> FormatError {
    if is_device_gone(&e) {
        FormatError::DeviceNotReady(e)
    } else {
        FormatError::Unknown(e)
    }
}
