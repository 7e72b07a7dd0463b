// Shared value types passed between the enumerator, the disk engine and callers

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::Notify;

/// Opaque numeric handle of a physical device (the device node's `st_rdev` on Unix)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A removable device as seen by one enumeration call.
///
/// Identity is `(id, name)`; `path`, `size` and `removable` ride along so the
/// disk engine can open the device, but they do not take part in equality or
/// ordering.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Device node (e.g. "/dev/sdb") or, for offline use, a disk image file
    pub path: PathBuf,
    /// Capacity in bytes, 0 when unknown
    pub size: u64,
    pub removable: bool,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            size,
            removable: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.id == other.id
    }
}

impl Eq for Device {}

impl PartialOrd for Device {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Device {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.id)
    }
}

/// The result of one enumeration: sorted by name then id, without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    devices: Vec<Device>,
}

/// Difference between two successive snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    pub added: Vec<Device>,
    pub removed: Vec<Device>,
}

impl DeviceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl DeviceSnapshot {
    pub fn new(mut devices: Vec<Device>) -> Self {
        devices.sort();
        devices.dedup();
        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn find(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn contains(&self, device: &Device) -> bool {
        self.devices.binary_search(device).is_ok()
    }

    /// Devices present in `newer` but not here (added) and here but not in `newer` (removed)
    pub fn diff(&self, newer: &DeviceSnapshot) -> DeviceDiff {
        DeviceDiff {
            added: newer
                .devices
                .iter()
                .filter(|d| !self.contains(d))
                .cloned()
                .collect(),
            removed: self
                .devices
                .iter()
                .filter(|d| !newer.contains(d))
                .cloned()
                .collect(),
        }
    }
}

impl IntoIterator for DeviceSnapshot {
    type Item = Device;
    type IntoIter = std::vec::IntoIter<Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}

/// Progress of a long-running disk operation.
///
/// `total_bytes == None` means the total is not known yet and the caller
/// should render an indeterminate indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProgress {
    pub bytes_so_far: u64,
    pub total_bytes: Option<u64>,
}

impl WriteProgress {
    pub const INDETERMINATE: WriteProgress = WriteProgress {
        bytes_so_far: 0,
        total_bytes: None,
    };

    pub fn determinate(bytes_so_far: u64, total_bytes: u64) -> Self {
        Self {
            bytes_so_far,
            total_bytes: Some(total_bytes),
        }
    }

    /// Completed fraction in 0.0..=1.0, or None while indeterminate
    pub fn fraction(&self) -> Option<f32> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_so_far as f64 / total as f64).min(1.0) as f32),
            None => None,
        }
    }
}

/// Where an installer image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Local(PathBuf),
    /// Downloaded from `url` into `cache_path` before writing
    Remote {
        url: String,
        cache_path: PathBuf,
        sha256: Option<String>,
    },
}

impl ImageSource {
    /// The local file the writer reads from
    pub fn local_path(&self) -> &Path {
        match self {
            ImageSource::Local(path) => path,
            ImageSource::Remote { cache_path, .. } => cache_path,
        }
    }

    /// Resolve the byte length of the local file
    pub fn resolve(&self) -> std::io::Result<ResolvedImage> {
        let path = self.local_path();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(ResolvedImage {
            path: path.to_path_buf(),
            len: metadata.len(),
            compressed: path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("xz")),
        })
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Local(path) => write!(f, "{}", path.display()),
            ImageSource::Remote { url, .. } => write!(f, "{}", url),
        }
    }
}

/// An image whose length is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub path: PathBuf,
    /// Size of the file on disk (compressed size for `.xz` images)
    pub len: u64,
    /// xz-compressed; the decompressed size is unknown until written
    pub compressed: bool,
}

// A simple cancel token for aborting polling loops
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
