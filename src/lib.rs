// Public library interface for bootstick-imager
//
// Turns a removable USB device into a bootable installer stick: partition
// table reset, FAT32 format and raw image write, driven by a per-device
// provisioning job. The `bootstick` binary is a thin CLI over this crate.

pub mod config;
pub mod disk;
pub mod error;
pub mod logging;
pub mod models;
pub mod provision;
pub mod utils;
