// Removable device enumeration and hot-plug polling

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::EnumerationError;
use crate::models::{CancelToken, Device, DeviceDiff, DeviceId, DeviceSnapshot};

/// Something that can list the removable devices currently attached
pub trait DeviceSource: Send + Sync {
    /// A zero-device result is a valid empty snapshot, not an error
    fn list(&self) -> Result<DeviceSnapshot, EnumerationError>;
}

/// Lists devices through `rs_drivelist`, keeping removable physical disks only
#[derive(Debug, Default, Clone)]
pub struct DriveListSource;

impl DeviceSource for DriveListSource {
    fn list(&self) -> Result<DeviceSnapshot, EnumerationError> {
        let drives = rs_drivelist::drive_list().map_err(|e| {
            error!("Failed to get drive list: {}", e);
            EnumerationError {
                reason: e.to_string(),
            }
        })?;
        debug!("Found {} drives with rs-drivelist", drives.len());

        let devices = drives
            .into_iter()
            .filter(|d| d.isRemovable && !d.isVirtual && !d.isSystem)
            .filter_map(|d| {
                let path = d.devicePath.clone().unwrap_or_else(|| d.device.clone());
                // A node that vanished between listing and stat is simply not attached
                let id = device_id(Path::new(&path))?;
                let name = if d.description.trim().is_empty() {
                    path.clone()
                } else {
                    d.description.trim().to_string()
                };
                let mut device = Device::new(id, name, path, d.size);
                device.removable = d.isRemovable;
                Some(device)
            })
            .collect();

        Ok(DeviceSnapshot::new(devices))
    }
}

#[cfg(unix)]
fn device_id(path: &Path) -> Option<DeviceId> {
    use std::os::unix::fs::MetadataExt;

    match std::fs::metadata(path) {
        Ok(metadata) => Some(DeviceId(metadata.rdev())),
        Err(e) => {
            debug!("Skipping {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(not(unix))]
fn device_id(path: &Path) -> Option<DeviceId> {
    use std::hash::{DefaultHasher, Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    Some(DeviceId(hasher.finish()))
}

async fn list_blocking<S>(source: &Arc<S>) -> Result<DeviceSnapshot, EnumerationError>
where
    S: DeviceSource + ?Sized + 'static,
{
    let source = source.clone();
    tokio::task::spawn_blocking(move || source.list())
        .await
        .map_err(|e| EnumerationError {
            reason: format!("enumeration task failed: {}", e),
        })?
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Poll `source` every `period` until at least one device shows up.
///
/// Returns `Ok(None)` once `cancel` fires.
pub async fn wait_for_devices<S>(
    source: Arc<S>,
    period: Duration,
    cancel: &CancelToken,
) -> Result<Option<DeviceSnapshot>, EnumerationError>
where
    S: DeviceSource + ?Sized + 'static,
{
    let mut interval = ticker(period);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Device wait cancelled");
                return Ok(None);
            }
            _ = interval.tick() => {}
        }

        let snapshot = list_blocking(&source).await?;
        if !snapshot.is_empty() {
            info!("{} removable device(s) available", snapshot.len());
            return Ok(Some(snapshot));
        }
    }
}

#[derive(Debug)]
pub enum DeviceEvent {
    /// The set of attached devices changed
    Changed {
        snapshot: DeviceSnapshot,
        diff: DeviceDiff,
    },
    /// One poll failed; polling continues
    Failed(EnumerationError),
}

/// Background poller reporting device attach/detach.
///
/// Polling stops when the monitor is dropped or cancelled.
pub struct DeviceMonitor {
    cancel: CancelToken,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    handle: JoinHandle<()>,
}

impl DeviceMonitor {
    pub fn spawn<S>(source: Arc<S>, period: Duration) -> Self
    where
        S: DeviceSource + ?Sized + 'static,
    {
        let cancel = CancelToken::new();
        let (tx, events) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(source, period, cancel.clone(), tx));
        Self {
            cancel,
            events,
            handle,
        }
    }

    async fn run<S>(
        source: Arc<S>,
        period: Duration,
        cancel: CancelToken,
        tx: mpsc::UnboundedSender<DeviceEvent>,
    ) where
        S: DeviceSource + ?Sized + 'static,
    {
        let mut interval = ticker(period);
        let mut current = DeviceSnapshot::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                _ = interval.tick() => {}
            }

            let event = match list_blocking(&source).await {
                Ok(snapshot) => {
                    let diff = current.diff(&snapshot);
                    if diff.is_empty() {
                        continue;
                    }
                    for device in &diff.added {
                        info!("Device attached: {}", device);
                    }
                    for device in &diff.removed {
                        info!("Device detached: {}", device);
                    }
                    current = snapshot.clone();
                    DeviceEvent::Changed { snapshot, diff }
                }
                Err(e) => {
                    warn!("Device poll failed: {}", e);
                    DeviceEvent::Failed(e)
                }
            };

            if tx.send(event).is_err() {
                break;
            }
        }
        debug!("Device monitor stopped");
    }

    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back a fixed sequence of device lists, repeating the last one
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<Device>, String>>>,
        last: Mutex<Vec<Device>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<Device>, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl DeviceSource for ScriptedSource {
        fn list(&self) -> Result<DeviceSnapshot, EnumerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut last = self.last.lock().unwrap();
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(devices)) => *last = devices,
                Some(Err(reason)) => return Err(EnumerationError { reason }),
                None => {}
            }
            Ok(DeviceSnapshot::new(last.clone()))
        }
    }

    fn sandisk() -> Device {
        Device::new(DeviceId(7), "SanDisk 16GB", "/dev/sdz", 16_000_000_000)
    }

    fn empty_then_sandisk() -> Arc<ScriptedSource> {
        ScriptedSource::new(vec![Ok(vec![]), Ok(vec![]), Ok(vec![]), Ok(vec![sandisk()])])
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_devices_polls_until_present() {
        let source = empty_then_sandisk();
        let cancel = CancelToken::new();
        let snapshot = wait_for_devices(source.clone(), Duration::from_millis(1000), &cancel)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.devices(), &[sandisk()]);
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_devices_cancelled() {
        let source = ScriptedSource::new(vec![]);
        let cancel = CancelToken::new();
        let waiter = {
            let cancel = cancel.clone();
            let source = source.clone();
            tokio::spawn(async move {
                wait_for_devices(source, Duration::from_millis(1000), &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().unwrap().is_none());

        // Fixed interval: four polls in 3.5 s, not a busy loop
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn test_wait_for_devices_propagates_failure() {
        let source = ScriptedSource::new(vec![Err("udev unavailable".into())]);
        let err = wait_for_devices(source, Duration::from_millis(10), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason, "udev unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_attach_exactly_once() {
        let source = empty_then_sandisk();
        let mut monitor = DeviceMonitor::spawn(source.clone(), Duration::from_millis(1000));

        match monitor.recv().await.unwrap() {
            DeviceEvent::Changed { snapshot, diff } => {
                assert_eq!(snapshot.devices(), &[sandisk()]);
                assert_eq!(diff.added, vec![sandisk()]);
                assert!(diff.removed.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(source.calls() > 10);
        assert!(monitor.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_detach_and_stops_on_cancel() {
        let source = ScriptedSource::new(vec![Ok(vec![sandisk()]), Ok(vec![])]);
        let mut monitor = DeviceMonitor::spawn(source.clone(), Duration::from_millis(1000));

        assert!(matches!(monitor.recv().await, Some(DeviceEvent::Changed { .. })));
        match monitor.recv().await.unwrap() {
            DeviceEvent::Changed { snapshot, diff } => {
                assert!(snapshot.is_empty());
                assert_eq!(diff.removed, vec![sandisk()]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        monitor.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(monitor.is_finished());
        let calls = source.calls();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls(), calls);
    }

    #[tokio::test]
    async fn test_drive_list_is_idempotent() {
        let source = Arc::new(DriveListSource);
        // Hosts without a usable drive listing have nothing to compare
        let (Ok(first), Ok(second)) = (list_blocking(&source).await, list_blocking(&source).await)
        else {
            return;
        };
        assert_eq!(first, second);
    }
}
