use std::fmt;

/// Lifecycle of one provisioning job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Initial,
    Running,
    Success,
    GetFileSizeFailed,
    InstallFailed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::GetFileSizeFailed | JobState::InstallFailed
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            JobState::Initial => next == JobState::Running,
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Initial => "initial",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::GetFileSizeFailed => "get-file-size-failed",
            JobState::InstallFailed => "install-failed",
        };
        f.write_str(name)
    }
}

/// Enforces the transition rules; terminal states absorb everything
#[derive(Debug)]
pub struct StateMachine {
    state: JobState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: JobState::Initial,
        }
    }
}

impl StateMachine {
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move to `next`, returning it if the transition happened
    pub fn advance(&mut self, next: JobState) -> Option<JobState> {
        if !self.state.can_transition_to(next) {
            return None;
        }
        self.state = next;
        Some(next)
    }
}
