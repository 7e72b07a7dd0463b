pub mod acquire;
pub mod elevation;
pub mod telemetry;
pub mod tracker;

pub use elevation::*;
