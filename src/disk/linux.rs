// Linux-specific disk operations

use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::{debug, info, warn};

use libc::{O_CLOEXEC, O_EXCL, O_SYNC};
use udisks2::zbus::zvariant::{ObjectPath, OwnedObjectPath};
use udisks2::{Client, zbus};

/// BLKRRPART from <linux/fs.h>
const BLKRRPART: libc::c_ulong = 0x125f;

pub struct LinuxDiskAccess;

impl LinuxDiskAccess {
    /// Unmount everything on the disk and open it exclusively through UDisks2
    pub async fn lock_path(path: &Path) -> Result<File> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("device path is not valid UTF-8: {}", path.display()))?;

        let client = Client::new().await.context("Failed to connect to UDisks2")?;
        let drive_path = Self::resolve_device(&client, path_str).await?;

        Self::umount_all(&client, drive_path.as_ref())
            .await
            .context("Failed to unmount partitions")?;

        let block = client.object(drive_path)?.block().await?;

        // O_EXCL keeps every other opener out while we rewrite the disk
        let flags = O_EXCL | O_SYNC | O_CLOEXEC;
        let owned_fd = block
            .open_device(
                "rw",
                [("flags", zbus::zvariant::Value::from(flags))]
                    .into_iter()
                    .collect(),
            )
            .await?;

        if let zbus::zvariant::Fd::Owned(owned_fd) = owned_fd.into() {
            info!("Opened {} exclusively via UDisks2", path_str);
            Ok(File::from(owned_fd))
        } else {
            Err(anyhow!(
                "Failed to open device: UDisks2 did not provide an owned file descriptor"
            ))
        }
    }

    async fn resolve_device(client: &Client, path: &str) -> Result<OwnedObjectPath> {
        debug!("Resolving Linux device path: {}", path);

        let mut spec = HashMap::new();
        spec.insert("path", path.into());

        let mut obj = client
            .manager()
            .resolve_device(spec, HashMap::default())
            .await?;

        obj.pop()
            .ok_or_else(|| anyhow!("No device found for path: {}", path))
    }

    /// Unmount all mounted filesystems on or below the given object path
    async fn umount_all(client: &Client, path: ObjectPath<'_>) -> Result<()> {
        let block_devices = client
            .manager()
            .get_block_devices(HashMap::default())
            .await?;

        for dev_path in block_devices {
            if !dev_path.as_str().starts_with(path.as_str()) {
                continue;
            }

            let display_path = dev_path.to_string();
            if let Ok(fs) = client.object(dev_path)?.filesystem().await {
                if !fs.mount_points().await?.is_empty() {
                    info!("Unmounting filesystem on {}", display_path);
                    fs.unmount(HashMap::new()).await?;
                }
            }
        }

        Ok(())
    }
}

pub fn reread_partition_table(file: &File) {
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART as _) };
    if rc != 0 {
        warn!(
            "BLKRRPART failed, kernel keeps the old partition view until replug: {}",
            std::io::Error::last_os_error()
        );
    } else {
        debug!("Kernel re-read the partition table");
    }
}
