//! Launches and owns emulator child processes.
//!
//! A launch validates the console port pair, opens a per-launch log file,
//! and starts the emulator headless with snapshots disabled on both load
//! and save. The child is never awaited here; its lifetime is governed by
//! the stop and cleanup paths, which rediscover it through the process
//! table if the handle is gone.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Child;

use tracing::info;

use crate::env::Env;
use crate::error::{Error, IoContext, Result};
use crate::exec;
use crate::ports::{self, CONSOLE_PORT_MAX, DYNAMIC_PORT_START};

// Headless cold boot: no window, no audio, no boot animation, snapshots
// disabled on load and save, adb auth skipped, metrics and the location UI
// off, shared files read-only, software rendering, logcat silenced.
const CANONICAL_ARGS: [&str; 14] = [
    "-no-window",
    "-no-boot-anim",
    "-no-snapshot",
    "-no-snapshot-load",
    "-no-snapshot-save",
    "-skip-adb-auth",
    "-no-metrics",
    "-no-location-ui",
    "-no-audio",
    "-read-only",
    "-gpu",
    "swiftshader_indirect",
    "-logcat",
    "*:S",
];

/// A just-launched emulator. Dropping the handle does not stop the child.
#[derive(Debug)]
pub struct LaunchedEmulator {
    pub child: Child,
    pub serial: String,
    pub port: u16,
    pub log_path: PathBuf,
}

impl LaunchedEmulator {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// Guard that force-kills the child when dropped. Workflows that must not
/// leak an emulator on an error or cancellation path hold their launch in
/// one of these; killing an already-dead child is a no-op.
pub(crate) struct KillOnDrop {
    inner: LaunchedEmulator,
}

impl KillOnDrop {
    pub(crate) fn new(inner: LaunchedEmulator) -> Self {
        Self { inner }
    }

    pub(crate) fn serial(&self) -> &str {
        &self.inner.serial
    }

    pub(crate) fn log_path(&self) -> &Path {
        &self.inner.log_path
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.inner.child.kill();
        let _ = self.inner.child.wait();
    }
}

/// Conventional per-launch log location, keyed by AVD name and port.
pub fn log_path_for(name: &str, port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("emulator-{name}-{port}.log"))
}

/// Starts an emulator on a specific console port.
///
/// The port pair is probed (with retries for sockets still in TIME_WAIT)
/// before the launch; stdout and stderr are teed into the log file and the
/// structured log stream. QEMU file locking is disabled so clones may read
/// the shared symlinked base images concurrently, and any vendor adb key
/// configured on the host is neutralized.
pub fn start_on_port(
    env: &Env,
    name: &str,
    port: u16,
    extra_args: &[String],
) -> Result<LaunchedEmulator> {
    if name.is_empty() {
        return Err(Error::precondition("empty AVD name"));
    }
    ports::validate_console_port(port)?;
    ports::ensure_port_pair_free(env, port)?;

    let log_path = log_path_for(name, port);
    let log_file = File::create(&log_path)
        .io_context(|| format!("opening emulator log {}", log_path.display()))?;

    let mut args: Vec<String> = vec![
        "-avd".to_string(),
        name.to_string(),
        "-port".to_string(),
        port.to_string(),
    ];
    args.extend(CANONICAL_ARGS.iter().map(|a| a.to_string()));
    args.extend(extra_args.iter().cloned());

    info!(
        target: "avdpool",
        "start_on_port: launching {} on port {} (log: {})",
        name,
        port,
        log_path.display()
    );
    let child = exec::spawn_streamed(
        env,
        &env.emulator,
        &args,
        &[
            ("QEMU_FILE_LOCKING", "off"),
            ("ADB_VENDOR_KEYS", "/dev/null"),
        ],
        log_file,
    )?;

    let serial = format!("emulator-{port}");
    info!(
        target: "avdpool",
        "start_on_port: {} started as {} (pid {})",
        name,
        serial,
        child.id()
    );
    Ok(LaunchedEmulator {
        child,
        serial,
        port,
        log_path,
    })
}

/// Starts an emulator on the first free even port in the dynamic range.
pub fn start(env: &Env, name: &str, extra_args: &[String]) -> Result<LaunchedEmulator> {
    let port = ports::find_free_even_port(DYNAMIC_PORT_START, CONSOLE_PORT_MAX)?;
    start_on_port(env, name, port, extra_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::find_free_even_port;
    use crate::testutil::{test_env, write_stub};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn rejects_invalid_ports_before_touching_the_host() {
        let dir = TempDir::new().unwrap();
        let mut env = test_env(dir.path());
        env.emulator = PathBuf::from("/nonexistent/emulator");

        let err = start_on_port(&env, "w-acme", 5581, &[]).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.to_string().contains("5581"));

        let err = start_on_port(&env, "w-acme", 5553, &[]).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let err = start_on_port(&env, "w-acme", 5802, &[]).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn rejects_an_empty_name() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        assert!(matches!(
            start_on_port(&env, "", 5580, &[]),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn launches_with_the_deterministic_serial_and_log_file() {
        let dir = TempDir::new().unwrap();
        let mut env = test_env(dir.path());
        let emulator = dir.path().join("emulator");
        write_stub(&emulator, "#!/bin/sh\necho \"emulator: booting $2\"\nexit 0\n");
        env.emulator = emulator;

        let port = find_free_even_port(5584, 5600).unwrap();
        let mut launched = start_on_port(&env, "w-acme", port, &[]).unwrap();
        assert_eq!(launched.serial, format!("emulator-{port}"));
        assert_eq!(launched.port, port);
        launched.child.wait().unwrap();

        assert!(launched.log_path.exists());
        let _ = fs::remove_file(&launched.log_path);
    }
}
