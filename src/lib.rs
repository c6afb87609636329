//! Lifecycle manager for disposable Android emulator fleets.
//!
//! The crate materializes writable device storage from pre-configured
//! "golden" raw disk images (base → golden → clone), supervises emulator
//! child processes on a validated console/adb port pair, detects boot
//! readiness through the debug bridge, and reconciles the set of running
//! emulators from the union of the adb device listing and a host
//! process-table scan.
//!
//! [`Manager`] is the high-level entry point; the per-concern modules are
//! public for callers that need finer control.

pub mod boot;
pub mod config;
pub mod discovery;
pub mod env;
pub mod error;
mod exec;
pub mod golden;
pub mod image;
pub mod manager;
pub mod ports;
pub mod stop;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testutil;

pub use boot::BootStage;
pub use discovery::{ProcessEnumerator, ProcessInfo, ProcessRecord, ProcfsEnumerator};
pub use env::{CancelHandle, Env};
pub use error::{Error, Result};
pub use image::{AvdInfo, GoldenImage};
pub use manager::{
    BakeApksOptions, CloneOptions, InitBaseOptions, Manager, PrewarmOptions, RunOptions,
    SaveGoldenOptions, StartedEmulator,
};
pub use ports::{CONSOLE_PORT_MAX, CONSOLE_PORT_MIN, DYNAMIC_PORT_START};
pub use stop::{CleanupReport, KillAllOptions, KillAllReport};
