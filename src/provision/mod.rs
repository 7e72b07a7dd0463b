// Provisioning jobs: state machine, events and the controller that drives them

mod controller;
mod messages;
mod state;

pub use controller::{JobHandle, JobReport, ProvisionRequest, ProvisioningController};
pub use messages::{JobEvent, JobStep};
pub use state::{JobState, StateMachine};
