//! Boot-readiness detection.
//!
//! "Process started", "device reachable", and "OS booted" are three
//! different states. The detector surfaces each: it first rides
//! `wait-for-device`, then polls the boot-completion property until it
//! reads exactly `"1"`, reporting progress at every stage transition.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::env::Env;
use crate::error::{Error, Result};
use crate::exec;

/// Stages reported through the progress callback, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootStage {
    /// Waiting for the debug bridge to see the device at all.
    WaitingAdb,
    /// Device reachable; polling the boot-completion property.
    CheckingBootanim,
    /// The property read `"1"`.
    BootComplete,
}

impl BootStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BootStage::WaitingAdb => "waiting_adb",
            BootStage::CheckingBootanim => "checking_bootanim",
            BootStage::BootComplete => "boot_complete",
        }
    }
}

const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(500);
// Services keep settling for a moment after the property flips.
const POST_BOOT_DRAIN: Duration = Duration::from_secs(2);

/// Waits for the OS behind `serial` to finish booting.
pub fn wait_for_boot(env: &Env, serial: &str, timeout: Duration) -> Result<()> {
    wait_for_boot_with_progress(env, serial, timeout, |_, _| {})
}

/// Like [`wait_for_boot`], reporting each stage with the elapsed time
/// since the call began.
pub fn wait_for_boot_with_progress<F>(
    env: &Env,
    serial: &str,
    timeout: Duration,
    mut progress: F,
) -> Result<()>
where
    F: FnMut(BootStage, Duration),
{
    let started = Instant::now();
    let deadline = started + timeout;

    progress(BootStage::WaitingAdb, started.elapsed());
    wait_for_device(env, deadline)?;

    let mut last_error: Option<String> = None;
    loop {
        env.cancel.checkpoint()?;
        progress(BootStage::CheckingBootanim, started.elapsed());
        match exec::run_tool(
            env,
            &env.adb,
            &["-s", serial, "shell", "getprop", "sys.boot_completed"],
        ) {
            Ok(output) => {
                if output.trim() == "1" {
                    progress(BootStage::BootComplete, started.elapsed());
                    thread::sleep(POST_BOOT_DRAIN);
                    return Ok(());
                }
            }
            Err(err) => {
                debug!(
                    target: "avdpool",
                    "wait_for_boot: transient adb failure for {}: {}",
                    serial,
                    err
                );
                last_error = Some(err.to_string());
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(BOOT_POLL_INTERVAL);
    }

    warn!(
        target: "avdpool",
        "wait_for_boot: {} did not report boot completion within {:?}",
        serial,
        timeout
    );
    Err(Error::Timeout {
        what: format!(
            "sys.boot_completed on {serial} (check `adb devices`; the device may have booted after the debug bridge lost it)"
        ),
        timeout,
        last_error,
    })
}

/// Runs `adb wait-for-device` bounded by the overall deadline. A slow or
/// failing bridge is not fatal here; the property poll carries the
/// deadline from this point on.
fn wait_for_device(env: &Env, deadline: Instant) -> Result<()> {
    let mut child = match Command::new(&env.adb)
        .arg("wait-for-device")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(_) => return Ok(()),
    };

    loop {
        if env.cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return Ok(()),
            Ok(None) => {}
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
}
