use anyhow::{Context, Result, anyhow, bail};
use bootstick_imager::config::Settings;
use bootstick_imager::disk::{
    DeviceSource, DriveListSource, FilesystemFormatter, FormatStatus, ImageWriteEngine,
    PartitionTableResetter, bytes_to_mb, wait_for_devices,
};
use bootstick_imager::error::{DeviceNotFound, ExitStatus, InsufficientPrivilege};
use bootstick_imager::models::{CancelToken, Device, DeviceId, ImageSource, WriteProgress};
use bootstick_imager::provision::{JobEvent, JobStep, ProvisionRequest, ProvisioningController};
use bootstick_imager::utils::acquire::{self, DownloadProgress};
use bootstick_imager::utils::telemetry::{self, Metric};
use bootstick_imager::{logging, utils};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Prepare bootable installer USB sticks
#[derive(Parser, Debug)]
#[clap(name = "bootstick", version, about = "Partition, format and write installer images to USB sticks")]
struct Cli {
    /// Show debug output
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List removable devices
    ListDevices {
        /// Keep polling until a device is attached
        #[clap(short, long)]
        wait: bool,

        /// Print the list as JSON
        #[clap(long)]
        json: bool,
    },

    /// Replace the partition table with a single FAT32 partition
    Reset {
        /// Device id from list-devices, or a disk image file
        #[clap(short, long)]
        device: String,

        /// Skip confirmation (required, all data on the device is lost)
        #[clap(short = 'y', long)]
        yes: bool,
    },

    /// Quick-format the partition created by `reset`
    Format {
        #[clap(short, long)]
        device: String,

        #[clap(short, long)]
        label: Option<String>,

        #[clap(short = 'y', long)]
        yes: bool,
    },

    /// Write a raw (or .xz) image to the whole device
    Write {
        #[clap(short, long)]
        device: String,

        #[clap(short, long)]
        image: PathBuf,

        #[clap(short = 'y', long)]
        yes: bool,
    },

    /// Reset, format and write in one job
    Provision {
        #[clap(short, long)]
        device: String,

        /// Local image file
        #[clap(short, long, conflicts_with = "url")]
        image: Option<PathBuf>,

        /// Download the image from this URL into the cache first
        #[clap(short, long)]
        url: Option<String>,

        /// Expected SHA-256 of the downloaded image
        #[clap(long, requires = "url")]
        sha256: Option<String>,

        /// Only reset and format, write no image
        #[clap(long, conflicts_with_all = ["image", "url"])]
        format_only: bool,

        #[clap(short, long)]
        label: Option<String>,

        #[clap(short = 'y', long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("bootstick: {e:#}");
            return exit_code(ExitStatus::Other);
        }
    };
    logging::init(&settings, cli.verbose);

    match run(cli.command, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("bootstick: {e:#}");
            exit_code(ExitStatus::for_error(&e))
        }
    }
}

fn exit_code(status: ExitStatus) -> ExitCode {
    ExitCode::from(status.code() as u8)
}

async fn run(command: Command, settings: Settings) -> Result<()> {
    match command {
        Command::ListDevices { wait, json } => list_devices(&settings, wait, json).await,
        Command::Reset { device, yes } => {
            let device = resolve_device(&device).await?;
            confirm(&device, yes)?;
            let outcome = PartitionTableResetter::new(settings.alignment_sectors, "bootstick")
                .reset(&device)
                .await
                .with_context(|| format!("Failed to reset partition table of {}", device))?;
            println!(
                "{}: partition {} at sectors {}..={}",
                device, outcome.partition.guid, outcome.partition.first_lba, outcome.partition.last_lba
            );
            Ok(())
        }
        Command::Format { device, label, yes } => {
            let device = resolve_device(&device).await?;
            confirm(&device, yes)?;
            let label = label.unwrap_or_else(|| settings.volume_label.clone());
            let partition = PartitionTableResetter::new(settings.alignment_sectors, "bootstick")
                .locate(&device)
                .await
                .with_context(|| format!("No bootstick partition on {}, run reset first", device))?;
            FilesystemFormatter::new(settings.cluster_size)
                .format(&device, &partition, &label, log_format_status)
                .await
                .with_context(|| format!("Failed to format {}", device))?;
            println!("{}: formatted FAT32", device);
            Ok(())
        }
        Command::Write { device, image, yes } => {
            let device = resolve_device(&device).await?;
            confirm(&device, yes)?;
            let mut printer = ProgressPrinter::default();
            let written = ImageWriteEngine::new(settings.write_chunk_bytes)
                .write(&device, &ImageSource::Local(image), move |p| printer.update(p))
                .await
                .with_context(|| format!("Failed to write image to {}", device))?;
            eprintln!();
            println!("{}: wrote {:.1} MB", device, bytes_to_mb(written));
            Ok(())
        }
        Command::Provision {
            device,
            image,
            url,
            sha256,
            format_only,
            label,
            yes,
        } => {
            let device = resolve_device(&device).await?;
            confirm(&device, yes)?;
            let label = label.unwrap_or_else(|| settings.volume_label.clone());

            let source = match (image, url) {
                (Some(path), _) => Some(ImageSource::Local(path)),
                (None, Some(url)) => Some(acquire::remote_source(&url, &settings.cache_dir(), sha256)?),
                (None, None) if format_only => None,
                (None, None) => bail!("Either --image, --url or --format-only is required"),
            };

            provision(&settings, device, source, label).await
        }
    }
}

async fn list_devices(settings: &Settings, wait: bool, json: bool) -> Result<()> {
    require_elevation()?;
    let source = Arc::new(DriveListSource);

    let snapshot = if wait {
        let cancel = CancelToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
        }
        eprintln!("Waiting for a removable device...");
        match wait_for_devices(source, settings.poll_interval(), &cancel).await? {
            Some(snapshot) => snapshot,
            None => return Ok(()),
        }
    } else {
        tokio::task::spawn_blocking(move || source.list())
            .await
            .context("Device enumeration task failed")??
    };

    if json {
        println!("{}", serde_json::to_string_pretty(snapshot.devices())?);
        return Ok(());
    }

    if snapshot.is_empty() {
        eprintln!("No removable devices found");
    }
    for device in snapshot.devices() {
        println!(
            "{:>12}  {:<32}  {:<14}  {:>8.1} GB",
            device.id,
            device.name,
            device.path.display(),
            device.size as f64 / 1000.0 / 1000.0 / 1000.0
        );
    }
    Ok(())
}

fn require_elevation() -> Result<()> {
    if utils::is_elevated() {
        return Ok(());
    }
    Err(InsufficientPrivilege(utils::get_elevation_status()).into())
}

/// Accept a numeric device id from `list-devices`, a device node, or a disk image file
async fn resolve_device(arg: &str) -> Result<Device> {
    let path = Path::new(arg);
    if let Ok(metadata) = std::fs::metadata(path) {
        if metadata.is_file() {
            debug!("Using disk image file {} as device", path.display());
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| arg.to_string());
            return Ok(Device::new(image_file_id(&metadata), name, path, metadata.len()));
        }
    }

    require_elevation()?;
    let snapshot = tokio::task::spawn_blocking(|| DriveListSource.list())
        .await
        .context("Device enumeration task failed")??;

    let found = match arg.parse::<u64>() {
        Ok(id) => snapshot.find(DeviceId(id)).cloned(),
        Err(_) => snapshot.devices().iter().find(|d| d.path == path).cloned(),
    };
    found.ok_or_else(|| DeviceNotFound(arg.to_string()).into())
}

#[cfg(unix)]
fn image_file_id(metadata: &std::fs::Metadata) -> DeviceId {
    use std::os::unix::fs::MetadataExt;
    DeviceId(metadata.ino())
}

#[cfg(not(unix))]
fn image_file_id(metadata: &std::fs::Metadata) -> DeviceId {
    DeviceId(metadata.len())
}

fn confirm(device: &Device, yes: bool) -> Result<()> {
    if yes {
        return Ok(());
    }
    Err(anyhow!(
        "This destroys all data on {} ({}). Re-run with --yes to continue",
        device,
        device.path().display()
    ))
}

async fn provision(
    settings: &Settings,
    device: Device,
    source: Option<ImageSource>,
    label: String,
) -> Result<()> {
    let sink = telemetry::sink_from_settings(settings.telemetry.as_ref());
    sink.send(Metric::Use);

    if let Some(source @ ImageSource::Remote { .. }) = &source {
        let (tx, mut rx) = mpsc::channel::<DownloadProgress>(16);
        let reporter = tokio::spawn(async move {
            let mut printer = ProgressPrinter::default();
            while let Some(p) = rx.recv().await {
                printer.update(WriteProgress {
                    bytes_so_far: p.downloaded,
                    total_bytes: p.total,
                });
            }
        });
        let fetched = acquire::fetch(source, Some(tx)).await;
        let _ = reporter.await;
        eprintln!();
        let path = fetched.with_context(|| format!("Failed to acquire image {}", source))?;
        info!("Image available at {}", path.display());
    }

    let request = match source {
        Some(source) => ProvisionRequest::write_image(device, source, label),
        None => ProvisionRequest::format_only(device, label),
    };

    let controller = ProvisioningController::new(settings, sink);
    let mut handle = controller.start(request)?;

    let mut printer = ProgressPrinter::default();
    while let Some(event) = handle.next_event().await {
        match event {
            JobEvent::StateChanged(state) => debug!("Job state: {}", state),
            JobEvent::Step(step) => {
                printer.finish_line();
                eprintln!("{}", match step {
                    JobStep::ResettingPartitions => "Resetting partition table...",
                    JobStep::Formatting => "Formatting...",
                    JobStep::WritingImage => "Writing image...",
                });
            }
            JobEvent::Format(status) => log_format_status(status),
            JobEvent::Progress(progress) => printer.update(progress),
        }
    }
    printer.finish_line();

    let report = handle.wait().await;
    if report.is_success() {
        println!("Done in {:.1}s", report.duration.as_secs_f64());
        return Ok(());
    }

    if report.aborted_before_start() {
        eprintln!("The device was removed before writing started");
    }
    match report.error {
        Some(e) => Err(anyhow::Error::new(e).context(format!("Provisioning ended in state {}", report.state))),
        None => bail!("Provisioning ended in state {}", report.state),
    }
}

fn log_format_status(status: FormatStatus) {
    match status {
        FormatStatus::InProgress => info!("Format in progress"),
        FormatStatus::ClusterSizeRejected { cluster_size, reason } => {
            info!("Cluster size {} rejected: {}", cluster_size, reason)
        }
        FormatStatus::DeviceNotReady(reason) => error!("Device not ready: {}", reason),
        FormatStatus::Done => info!("Format done"),
    }
}

/// Single-line progress output on stderr, redrawn only when the percentage changes
#[derive(Default)]
struct ProgressPrinter {
    last_percent: Option<u32>,
    dirty: bool,
}

impl ProgressPrinter {
    fn update(&mut self, progress: WriteProgress) {
        let Some(fraction) = progress.fraction() else {
            if !self.dirty {
                eprint!("\r  working...");
                self.dirty = true;
            }
            return;
        };

        let percent = (fraction * 100.0) as u32;
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        self.dirty = true;
        eprint!(
            "\r  {:>3}%  {:.1} / {:.1} MB",
            percent,
            bytes_to_mb(progress.bytes_so_far),
            bytes_to_mb(progress.total_bytes.unwrap_or(0))
        );
    }

    fn finish_line(&mut self) {
        if self.dirty {
            eprintln!();
            self.dirty = false;
            self.last_percent = None;
        }
    }
}
