use crate::disk::FormatStatus;
use crate::models::WriteProgress;

use super::state::JobState;

/// Steps of a job while it is `Running`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
    ResettingPartitions,
    Formatting,
    WritingImage,
}

/// Notifications delivered to the caller of a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Sent exactly once per state transition
    StateChanged(JobState),
    Step(JobStep),
    Format(FormatStatus),
    Progress(WriteProgress),
}
