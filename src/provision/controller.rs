// Runs reset -> format -> write for one device on a background task

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::messages::{JobEvent, JobStep};
use super::state::{JobState, StateMachine};
use crate::config::Settings;
use crate::disk::{FilesystemFormatter, ImageWriteEngine, PartitionTableResetter};
use crate::error::{ControllerError, ProvisionError};
use crate::models::{Device, DeviceId, ImageSource, ResolvedImage, WriteProgress};
use crate::utils::telemetry::{LogSink, Metric, TelemetrySink};

/// What to do with which device
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub device: Option<Device>,
    /// `None` means format only
    pub image: Option<ImageSource>,
    pub label: String,
}

impl ProvisionRequest {
    pub fn format_only(device: Device, label: impl Into<String>) -> Self {
        Self {
            device: Some(device),
            image: None,
            label: label.into(),
        }
    }

    pub fn write_image(device: Device, image: ImageSource, label: impl Into<String>) -> Self {
        Self {
            device: Some(device),
            image: Some(image),
            label: label.into(),
        }
    }

    pub fn is_format_only(&self) -> bool {
        self.image.is_none()
    }
}

/// Final result of a job, available from `JobHandle::wait`
#[derive(Debug)]
pub struct JobReport {
    pub state: JobState,
    pub error: Option<ProvisionError>,
    pub bytes_written: u64,
    pub duration: Duration,
    destroyed: bool,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.state == JobState::Success
    }

    /// The job never got to write anything: its task was torn down before
    /// finishing, or the device disappeared before the first byte landed.
    pub fn aborted_before_start(&self) -> bool {
        if self.destroyed {
            return !self.state.is_terminal();
        }
        self.bytes_written == 0 && self.error.as_ref().is_some_and(|e| e.is_device_gone())
    }

    fn destroyed(state: JobState, bytes_written: u64, reason: String) -> Self {
        Self {
            state,
            error: Some(ProvisionError::Task(reason)),
            bytes_written,
            duration: Duration::ZERO,
            destroyed: true,
        }
    }
}

struct Shared {
    state: Mutex<JobState>,
    bytes_written: AtomicU64,
}

/// Caller's side of a running job
pub struct JobHandle {
    device: Option<DeviceId>,
    events: mpsc::UnboundedReceiver<JobEvent>,
    shared: Arc<Shared>,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub fn state(&self) -> JobState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next event; `None` once the job has finished and all events are drained
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    pub async fn wait(self) -> JobReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                let state = *self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
                error!("Provisioning task ended abnormally in state {}: {}", state, e);
                JobReport::destroyed(
                    state,
                    self.shared.bytes_written.load(Ordering::SeqCst),
                    e.to_string(),
                )
            }
        }
    }
}

/// Releases the device when the job ends, however it ends
struct BusyGuard {
    busy: Arc<Mutex<HashSet<DeviceId>>>,
    id: DeviceId,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Starts provisioning jobs, at most one per device
#[derive(Clone)]
pub struct ProvisioningController {
    resetter: PartitionTableResetter,
    formatter: FilesystemFormatter,
    writer: ImageWriteEngine,
    telemetry: Arc<dyn TelemetrySink>,
    busy: Arc<Mutex<HashSet<DeviceId>>>,
}

impl Default for ProvisioningController {
    fn default() -> Self {
        Self::new(&Settings::default(), Arc::new(LogSink))
    }
}

impl ProvisioningController {
    pub fn new(settings: &Settings, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            resetter: PartitionTableResetter::new(settings.alignment_sectors, "bootstick"),
            formatter: FilesystemFormatter::new(settings.cluster_size),
            writer: ImageWriteEngine::new(settings.write_chunk_bytes),
            telemetry,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_busy(&self, id: DeviceId) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    /// Start a job and return immediately.
    ///
    /// Fails if `request.device` already has a job running.
    pub fn start(&self, request: ProvisionRequest) -> Result<JobHandle, ControllerError> {
        let device_id = request.device.as_ref().map(|d| d.id);
        let guard = match device_id {
            Some(id) => {
                let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
                if !busy.insert(id) {
                    warn!("Rejecting second job for device {}", id);
                    return Err(ControllerError::DeviceBusy(id));
                }
                Some(BusyGuard {
                    busy: self.busy.clone(),
                    id,
                })
            }
            None => None,
        };

        let (tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(JobState::Initial),
            bytes_written: AtomicU64::new(0),
        });

        let job = Job {
            machine: StateMachine::default(),
            tx,
            shared: shared.clone(),
            telemetry: self.telemetry.clone(),
        };
        let controller = self.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            controller.run(job, request).await
        });

        Ok(JobHandle {
            device: device_id,
            events,
            shared,
            task,
        })
    }

    async fn run(&self, mut job: Job, request: ProvisionRequest) -> JobReport {
        job.transition(JobState::Running);
        let started = Instant::now();
        let format_only = request.is_format_only();

        let result = self.provision(&mut job, request).await;
        let duration = started.elapsed();

        let state = match &result {
            Ok(()) => {
                if format_only {
                    job.telemetry.send(Metric::FormatSuccess);
                } else {
                    job.telemetry.send(Metric::UsbSuccess);
                    job.telemetry.send(Metric::SuccessDuration(duration.as_secs_f64()));
                }
                info!("Provisioning finished in {:.1}s", duration.as_secs_f64());
                JobState::Success
            }
            Err((state, e)) => {
                error!("Provisioning failed: {}", e);
                job.telemetry.send(Metric::AttemptFailed(e.reason().to_string()));
                *state
            }
        };
        job.transition(state);

        JobReport {
            state,
            error: result.err().map(|(_, e)| e),
            bytes_written: job.shared.bytes_written.load(Ordering::SeqCst),
            duration,
            destroyed: false,
        }
    }

    async fn provision(
        &self,
        job: &mut Job,
        request: ProvisionRequest,
    ) -> Result<(), (JobState, ProvisionError)> {
        let install_failed = |e: ProvisionError| (JobState::InstallFailed, e);

        let Some(device) = request.device else {
            return Err(install_failed(ProvisionError::NoDevice));
        };

        job.telemetry.send(if request.image.is_none() {
            Metric::FormatAttempt
        } else {
            Metric::UsbAttempt
        });

        // The image must be known before the device is touched
        let image: Option<ResolvedImage> = match &request.image {
            Some(source) => match self.writer.resolve(source) {
                Ok(image) => Some(image),
                Err(e) => return Err((JobState::GetFileSizeFailed, e.into())),
            },
            None => None,
        };

        info!("Provisioning {} ({})", device, device.path().display());
        job.send(JobEvent::Progress(WriteProgress::INDETERMINATE));

        job.send(JobEvent::Step(JobStep::ResettingPartitions));
        let outcome = self
            .resetter
            .reset(&device)
            .await
            .map_err(|e| install_failed(e.into()))?;

        job.send(JobEvent::Step(JobStep::Formatting));
        let tx = job.tx.clone();
        self.formatter
            .format(&device, &outcome.partition, &request.label, move |status| {
                let _ = tx.send(JobEvent::Format(status));
            })
            .await
            .map_err(|e| install_failed(e.into()))?;

        let Some(image) = image else {
            return Ok(());
        };

        job.send(JobEvent::Step(JobStep::WritingImage));
        let tx = job.tx.clone();
        let shared = job.shared.clone();
        self.writer
            .write_resolved(&device, &image, move |progress| {
                shared
                    .bytes_written
                    .store(progress.bytes_so_far, Ordering::SeqCst);
                let _ = tx.send(JobEvent::Progress(progress));
            })
            .await
            .map_err(|e| install_failed(e.into()))?;

        Ok(())
    }
}

/// Task-side job state
struct Job {
    machine: StateMachine,
    tx: mpsc::UnboundedSender<JobEvent>,
    shared: Arc<Shared>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Job {
    fn send(&self, event: JobEvent) {
        // The caller may have stopped listening; the job still runs to completion
        let _ = self.tx.send(event);
    }

    fn transition(&mut self, next: JobState) {
        if let Some(state) = self.machine.advance(next) {
            *self.shared.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
            info!("Job state: {}", state);
            self.send(JobEvent::StateChanged(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FormatStatus;
    use crate::disk::common::PartitionFileProxy;
    use crate::disk::test_support::*;
    use crate::error::{PartitionError, WriteError};
    use crate::utils::telemetry::test_support::RecordingSink;

    fn controller() -> (ProvisioningController, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (ProvisioningController::new(&Settings::default(), sink.clone()), sink)
    }

    async fn drain(handle: &mut JobHandle) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    fn states(events: &[JobEvent]) -> Vec<JobState> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_no_device_fails_without_hardware() {
        let (controller, sink) = controller();
        let mut handle = controller
            .start(ProvisionRequest {
                device: None,
                image: None,
                label: "x".into(),
            })
            .unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(states(&events), vec![JobState::Running, JobState::InstallFailed]);
        assert!(!events.iter().any(|e| matches!(e, JobEvent::Step(_))));

        let report = handle.wait().await;
        assert_eq!(report.state, JobState::InstallFailed);
        assert!(matches!(report.error, Some(ProvisionError::NoDevice)));
        assert!(!report.aborted_before_start());
        assert_eq!(sink.metrics(), vec![Metric::AttemptFailed("no-device".into())]);
    }

    #[tokio::test]
    async fn test_unresolvable_image_never_opens_device() {
        let stick = FakeStick::new(MB);
        std::fs::write(stick.path(), vec![0xA5u8; MB as usize]).unwrap();
        let image = ImageSource::Local(stick.dir.path().join("vanished.img"));

        let (controller, _) = controller();
        let mut handle = controller
            .start(ProvisionRequest::write_image(stick.device.clone(), image, "x"))
            .unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(
            states(&events),
            vec![JobState::Running, JobState::GetFileSizeFailed]
        );

        let report = handle.wait().await;
        assert!(matches!(
            report.error,
            Some(ProvisionError::Write(WriteError::SizeUnavailable { .. }))
        ));
        assert!(stick.contents().iter().all(|b| *b == 0xA5));
    }

    #[tokio::test]
    async fn test_format_only_success() {
        let stick = FakeStick::new(320 * MB);
        let (controller, sink) = controller();
        let mut handle = controller
            .start(ProvisionRequest::format_only(stick.device.clone(), "rescue"))
            .unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(states(&events), vec![JobState::Running, JobState::Success]);
        assert!(events.contains(&JobEvent::Progress(WriteProgress::INDETERMINATE)));
        assert!(events.contains(&JobEvent::Format(FormatStatus::Done)));
        assert!(!events.contains(&JobEvent::Step(JobStep::WritingImage)));

        let report = handle.wait().await;
        assert!(report.is_success());
        assert_eq!(report.bytes_written, 0);

        let metrics = sink.metrics();
        assert_eq!(metrics[0], Metric::FormatAttempt);
        assert_eq!(metrics[1], Metric::FormatSuccess);
        // Duration is only reported for image writes
        assert_eq!(metrics.len(), 2);

        let outcome = PartitionTableResetter::default()
            .locate(&stick.device)
            .await
            .unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(stick.path())
            .unwrap();
        let proxy = PartitionFileProxy::new(file, outcome.offset(), outcome.size());
        let fs = fatfs::FileSystem::new(proxy, fatfs::FsOptions::new()).unwrap();
        assert_eq!(fs.volume_label().trim_end(), "RESCUE");
    }

    #[tokio::test]
    async fn test_write_image_success() {
        let stick = FakeStick::new(320 * MB);
        let image_path = stick.dir.path().join("installer.img");
        let data: Vec<u8> = (0..MB as usize + 512).map(|i| (i % 253) as u8).collect();
        std::fs::write(&image_path, &data).unwrap();

        let (controller, sink) = controller();
        let mut handle = controller
            .start(ProvisionRequest::write_image(
                stick.device.clone(),
                ImageSource::Local(image_path),
                "x",
            ))
            .unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(states(&events), vec![JobState::Running, JobState::Success]);

        let steps: Vec<JobStep> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Step(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            steps,
            vec![JobStep::ResettingPartitions, JobStep::Formatting, JobStep::WritingImage]
        );

        let determinate: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Progress(p) if p.total_bytes.is_some() => Some(p.bytes_so_far),
                _ => None,
            })
            .collect();
        assert!(determinate.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*determinate.last().unwrap(), data.len() as u64);

        let report = handle.wait().await;
        assert!(report.is_success());
        assert_eq!(report.bytes_written, data.len() as u64);
        assert_eq!(&stick.contents()[..data.len()], data.as_slice());
        let metrics = sink.metrics();
        assert!(metrics.contains(&Metric::UsbSuccess));
        assert!(metrics.iter().any(|m| matches!(m, Metric::SuccessDuration(_))));
        assert!(!controller.is_busy(stick.device.id));
    }

    #[tokio::test]
    async fn test_second_job_on_busy_device_rejected() {
        let stick = FakeStick::new(320 * MB);
        let (controller, _) = controller();

        let first = controller
            .start(ProvisionRequest::format_only(stick.device.clone(), "one"))
            .unwrap();
        assert!(controller.is_busy(stick.device.id));

        let second = controller.start(ProvisionRequest::format_only(stick.device.clone(), "two"));
        assert_eq!(
            second.err(),
            Some(ControllerError::DeviceBusy(stick.device.id))
        );

        assert!(first.wait().await.is_success());
        assert!(!controller.is_busy(stick.device.id));

        let third = controller
            .start(ProvisionRequest::format_only(stick.device.clone(), "three"))
            .unwrap();
        assert!(third.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_vanished_device_aborts_before_start() {
        let stick = FakeStick::new(MB);
        std::fs::remove_file(stick.path()).unwrap();

        let (controller, sink) = controller();
        let mut handle = controller
            .start(ProvisionRequest::format_only(stick.device.clone(), "x"))
            .unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(states(&events), vec![JobState::Running, JobState::InstallFailed]);

        let report = handle.wait().await;
        assert_eq!(report.state, JobState::InstallFailed);
        assert!(matches!(
            report.error,
            Some(ProvisionError::Partition(PartitionError::LoadFailed { .. }))
        ));
        assert!(report.aborted_before_start());
        assert!(sink.metrics().contains(&Metric::AttemptFailed("partition-load-failed".into())));
    }

    #[test]
    fn test_destroyed_job_report() {
        let report = JobReport::destroyed(JobState::Running, 0, "runtime shut down".into());
        assert!(report.aborted_before_start());
        assert!(!report.is_success());

        let report = JobReport::destroyed(JobState::Success, 10, "late".into());
        assert!(!report.aborted_before_start());
    }
}
