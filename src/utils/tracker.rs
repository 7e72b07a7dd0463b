use std::io;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::disk::bytes_to_mb;

/// Counts the bytes pulled through a reader, e.g. the compressed side of a decoder
pub struct ProgressTracker<R: Read> {
    inner: R,
    bytes_read: Arc<AtomicU64>,
    total_size: u64,
}

/// Shared view of a tracker's byte count
#[derive(Debug, Clone, Default)]
pub struct ReadCounter(Arc<AtomicU64>);

impl ReadCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl<R: Read> Read for ProgressTracker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes = self.inner.read(buf)?;
        if bytes > 0 {
            let so_far = self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
            trace!(
                "Read {:.1} MB / {:.1} MB",
                bytes_to_mb(so_far),
                bytes_to_mb(self.total_size)
            );
        }
        Ok(bytes)
    }
}

pub fn track_progress<R: Read>(inner: R, size: u64) -> (ProgressTracker<R>, ReadCounter) {
    let counter = Arc::new(AtomicU64::new(0));

    (
        ProgressTracker {
            inner,
            bytes_read: counter.clone(),
            total_size: size,
        },
        ReadCounter(counter),
    )
}
