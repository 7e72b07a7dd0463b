// Raw image write to the whole device

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use tracing::{debug, error, info};
use xz4rust::XzReader;

use super::Disk;
use super::common::{SECTOR_SIZE, bytes_to_mb, log_device_error, sync_file};
use crate::error::WriteError;
use crate::models::{Device, ImageSource, ResolvedImage, WriteProgress};
use crate::utils::tracker::{ReadCounter, track_progress};

const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Copies an installer image onto a device in fixed-size chunks
#[derive(Debug, Clone)]
pub struct ImageWriteEngine {
    chunk_size: usize,
}

impl Default for ImageWriteEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ImageWriteEngine {
    /// `chunk_size` is rounded up to a whole number of sectors
    pub fn new(chunk_size: usize) -> Self {
        let sector = SECTOR_SIZE as usize;
        Self {
            chunk_size: chunk_size.max(sector).div_ceil(sector) * sector,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Determine the image length without touching any device
    pub fn resolve(&self, source: &ImageSource) -> Result<ResolvedImage, WriteError> {
        source.resolve().map_err(|e| {
            error!("Cannot determine size of image {}: {}", source, e);
            WriteError::SizeUnavailable {
                path: source.local_path().to_path_buf(),
                source: e,
            }
        })
    }

    /// Resolve `source`, then write it to `device`.
    ///
    /// Returns the number of image bytes written, excluding sector padding.
    pub async fn write<F>(
        &self,
        device: &Device,
        source: &ImageSource,
        on_progress: F,
    ) -> Result<u64, WriteError>
    where
        F: FnMut(WriteProgress) + Send + 'static,
    {
        let image = self.resolve(source)?;
        self.write_resolved(device, &image, on_progress).await
    }

    pub async fn write_resolved<F>(
        &self,
        device: &Device,
        image: &ResolvedImage,
        mut on_progress: F,
    ) -> Result<u64, WriteError>
    where
        F: FnMut(WriteProgress) + Send + 'static,
    {
        if !image.compressed && device.size > 0 && image.len > device.size {
            return Err(WriteError::TooLarge {
                image: image.len,
                capacity: device.size,
            });
        }

        let mut disk = Disk::lock(device).await.map_err(|e| {
            log_device_error("Opening device for write", &e);
            WriteError::from_device_io(e)
        })?;

        let engine = self.clone();
        let image = image.clone();
        tokio::task::spawn_blocking(move || engine.write_disk(&mut disk, &image, &mut on_progress))
            .await
            .map_err(|e| WriteError::IoError {
                code: None,
                source: io::Error::other(e),
            })?
    }

    /// Write to an already locked disk, starting at its first byte
    pub fn write_disk(
        &self,
        disk: &mut Disk,
        image: &ResolvedImage,
        on_progress: &mut dyn FnMut(WriteProgress),
    ) -> Result<u64, WriteError> {
        let capacity = disk.size();
        if !image.compressed && image.len > capacity {
            return Err(WriteError::TooLarge {
                image: image.len,
                capacity,
            });
        }

        debug!("Opening image file: {}", image.path.display());
        let image_file = File::open(&image.path).map_err(WriteError::SourceError)?;
        let image_file = BufReader::with_capacity(self.chunk_size, image_file);
        let (tracked, consumed) = track_progress(image_file, image.len);

        let mut source: Box<dyn Read> = if image.compressed {
            let buffer_size = NonZeroUsize::new(self.chunk_size).unwrap_or(NonZeroUsize::MIN);
            info!("Creating XZ reader with buffer size: {} bytes", buffer_size);
            Box::new(XzReader::new_with_buffer_size(tracked, buffer_size))
        } else {
            Box::new(tracked)
        };

        disk.file_mut()
            .seek(SeekFrom::Start(0))
            .map_err(WriteError::from_device_io)?;

        let total = image.len;
        let mut reporter = ProgressReporter::new(total, on_progress);
        reporter.report(0);

        info!(
            "Writing {} ({:.1} MB{}) to {}",
            image.path.display(),
            bytes_to_mb(total),
            if image.compressed { ", xz" } else { "" },
            disk.path().display()
        );

        let mut buffer = vec![0u8; self.chunk_size];
        let mut written: u64 = 0;
        loop {
            let bytes_read = read_full(&mut source, &mut buffer).map_err(|e| {
                error!("Error reading from source: {}", e);
                WriteError::SourceError(e)
            })?;
            if bytes_read == 0 {
                break;
            }

            // Pad the tail to the next sector boundary
            let sector = SECTOR_SIZE as usize;
            let aligned_size = bytes_read.div_ceil(sector) * sector;
            buffer[bytes_read..aligned_size].fill(0);

            if written + aligned_size as u64 > capacity {
                error!(
                    "Image exceeds device capacity after {:.1} MB",
                    bytes_to_mb(written)
                );
                return Err(WriteError::TooLarge {
                    image: written + bytes_read as u64,
                    capacity,
                });
            }

            disk.file_mut()
                .write_all(&buffer[..aligned_size])
                .map_err(|e| {
                    log_device_error("Image write", &e);
                    WriteError::from_device_io(e)
                })?;

            written += bytes_read as u64;
            reporter.report(progress_position(image, written, &consumed));
        }

        if !image.compressed && written != total {
            return Err(WriteError::SourceError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("image changed while writing: read {} of {} bytes", written, total),
            )));
        }

        sync_file(disk.file_mut()).map_err(|e| {
            log_device_error("Disk sync", &e);
            WriteError::from_device_io(e)
        })?;

        reporter.report(total);
        info!(
            "Successfully wrote {:.1} MB to {}",
            bytes_to_mb(written),
            disk.path().display()
        );
        Ok(written)
    }
}

/// Position to report: data bytes for raw images, compressed bytes consumed for xz
fn progress_position(image: &ResolvedImage, written: u64, consumed: &ReadCounter) -> u64 {
    if image.compressed {
        consumed.get()
    } else {
        written
    }
}

/// Forwards progress with non-decreasing positions clamped to the total
struct ProgressReporter<'a> {
    total: u64,
    last: Option<u64>,
    sink: &'a mut dyn FnMut(WriteProgress),
}

impl<'a> ProgressReporter<'a> {
    fn new(total: u64, sink: &'a mut dyn FnMut(WriteProgress)) -> Self {
        Self {
            total,
            last: None,
            sink,
        }
    }

    fn report(&mut self, position: u64) {
        let position = position.min(self.total).max(self.last.unwrap_or(0));
        if self.last == Some(position) {
            return;
        }
        self.last = Some(position);
        (self.sink)(WriteProgress::determinate(position, self.total));
    }
}

/// Read until `buf` is full or the reader is exhausted
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
