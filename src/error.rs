// Error taxonomy of the provisioning engine
//
// Every failure is classified into one of these kinds; the diagnostic that
// produced it (OS error code, verification problems) travels with it.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::disk::partition::Problem;
use crate::models::DeviceId;

#[derive(Error, Debug)]
#[error("device enumeration failed: {reason}")]
pub struct EnumerationError {
    pub reason: String,
}

#[derive(Error, Debug)]
#[error("no removable device matches {0}")]
pub struct DeviceNotFound(pub String);

#[derive(Error, Debug)]
#[error("insufficient privilege: {0}")]
pub struct InsufficientPrivilege(pub String);

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("failed to load partition table of {path}: {source}")]
    LoadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("partition table verification reported {} problem(s): {}", .problems.len(), describe(.problems))]
    VerifyFailed { problems: Vec<Problem> },
}

fn describe(problems: &[Problem]) -> String {
    problems
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("cluster size of {cluster_size} bytes rejected: {reason}")]
    ClusterSizeRejected { cluster_size: u32, reason: String },

    #[error("device not ready: {0}")]
    DeviceNotReady(#[source] io::Error),

    #[error("format failed: {0}")]
    Unknown(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("image size unavailable for {path}: {source}")]
    SizeUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read image: {0}")]
    SourceError(#[source] io::Error),

    #[error("I/O error writing to device (os error {code:?}): {source}")]
    IoError {
        code: Option<i32>,
        #[source]
        source: io::Error,
    },

    #[error("device disappeared: {0}")]
    DeviceGone(#[source] io::Error),

    #[error("image of {image} bytes does not fit device of {capacity} bytes")]
    TooLarge { image: u64, capacity: u64 },
}

impl WriteError {
    /// Classify an error raised while talking to the target device
    pub fn from_device_io(e: io::Error) -> Self {
        if crate::disk::common::is_device_gone(&e) {
            WriteError::DeviceGone(e)
        } else {
            WriteError::IoError {
                code: e.raw_os_error(),
                source: e,
            }
        }
    }
}

/// Failure of one provisioning job, carried to the caller with the terminal state
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("no device selected")]
    NoDevice,

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl ProvisionError {
    /// Short machine-readable reason, used for telemetry
    pub fn reason(&self) -> &'static str {
        match self {
            ProvisionError::NoDevice => "no-device",
            ProvisionError::Partition(PartitionError::LoadFailed { .. }) => "partition-load-failed",
            ProvisionError::Partition(PartitionError::VerifyFailed { .. }) => "partition-verify-failed",
            ProvisionError::Format(FormatError::ClusterSizeRejected { .. }) => "format-cluster-size",
            ProvisionError::Format(FormatError::DeviceNotReady(_)) => "format-device-not-ready",
            ProvisionError::Format(FormatError::Unknown(_)) => "format-unknown",
            ProvisionError::Write(WriteError::SizeUnavailable { .. }) => "size-unavailable",
            ProvisionError::Write(WriteError::SourceError(_)) => "source-error",
            ProvisionError::Write(WriteError::IoError { .. }) => "io-error",
            ProvisionError::Write(WriteError::DeviceGone(_)) => "device-gone",
            ProvisionError::Write(WriteError::TooLarge { .. }) => "too-large",
            ProvisionError::Task(_) => "task-failed",
        }
    }

    /// The target device vanished, at whichever step noticed it first
    pub fn is_device_gone(&self) -> bool {
        match self {
            ProvisionError::Partition(PartitionError::LoadFailed { source, .. }) => {
                crate::disk::common::is_device_gone(source)
            }
            ProvisionError::Format(FormatError::DeviceNotReady(_)) => true,
            ProvisionError::Write(WriteError::DeviceGone(_)) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControllerError {
    #[error("device {0} already has a running job")]
    DeviceBusy(DeviceId),
}

/// Process exit codes of the CLI, one per error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success = 0,
    Other = 1,
    DeviceNotFound = 3,
    InsufficientPrivilege = 4,
    Enumeration = 10,
    PartitionLoad = 20,
    PartitionVerify = 21,
    ClusterSizeRejected = 30,
    DeviceNotReady = 31,
    FormatUnknown = 32,
    SizeUnavailable = 40,
    SourceError = 41,
    WriteIo = 42,
    DeviceGone = 43,
    TooLarge = 44,
    Acquire = 50,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Find the most specific exit status for an error chain
    pub fn for_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if cause.downcast_ref::<DeviceNotFound>().is_some() {
                return ExitStatus::DeviceNotFound;
            }
            if cause.downcast_ref::<InsufficientPrivilege>().is_some() {
                return ExitStatus::InsufficientPrivilege;
            }
            if cause.downcast_ref::<EnumerationError>().is_some() {
                return ExitStatus::Enumeration;
            }
            if let Some(e) = cause.downcast_ref::<PartitionError>() {
                return e.into();
            }
            if let Some(e) = cause.downcast_ref::<FormatError>() {
                return e.into();
            }
            if let Some(e) = cause.downcast_ref::<WriteError>() {
                return e.into();
            }
            if let Some(e) = cause.downcast_ref::<ProvisionError>() {
                return e.into();
            }
            if cause
                .downcast_ref::<crate::utils::acquire::AcquireError>()
                .is_some()
            {
                return ExitStatus::Acquire;
            }
        }
        ExitStatus::Other
    }
}

impl From<&PartitionError> for ExitStatus {
    fn from(e: &PartitionError) -> Self {
        match e {
            PartitionError::LoadFailed { .. } => ExitStatus::PartitionLoad,
            PartitionError::VerifyFailed { .. } => ExitStatus::PartitionVerify,
        }
    }
}

impl From<&FormatError> for ExitStatus {
    fn from(e: &FormatError) -> Self {
        match e {
            FormatError::ClusterSizeRejected { .. } => ExitStatus::ClusterSizeRejected,
            FormatError::DeviceNotReady(_) => ExitStatus::DeviceNotReady,
            FormatError::Unknown(_) => ExitStatus::FormatUnknown,
        }
    }
}

impl From<&WriteError> for ExitStatus {
    fn from(e: &WriteError) -> Self {
        match e {
            WriteError::SizeUnavailable { .. } => ExitStatus::SizeUnavailable,
            WriteError::SourceError(_) => ExitStatus::SourceError,
            WriteError::IoError { .. } => ExitStatus::WriteIo,
            WriteError::DeviceGone(_) => ExitStatus::DeviceGone,
            WriteError::TooLarge { .. } => ExitStatus::TooLarge,
        }
    }
}

impl From<&ProvisionError> for ExitStatus {
    fn from(e: &ProvisionError) -> Self {
        match e {
            ProvisionError::NoDevice => ExitStatus::DeviceNotFound,
            ProvisionError::Partition(e) => e.into(),
            ProvisionError::Format(e) => e.into(),
            ProvisionError::Write(e) => e.into(),
            ProvisionError::Task(_) => ExitStatus::Other,
        }
    }
}
