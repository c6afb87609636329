//! Stopping emulators and sweeping up what flaky teardowns leave behind.
//!
//! Stop escalates across mechanisms: console kill through the debug
//! bridge, then an interrupt signal, then a force kill. Cleanup reconciles
//! the process table against the adb listing to find half-dead emulators,
//! and the AVD home against the running set to find abandoned clones.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::discovery::{
    self, adb_emulator_serials, avd_name_from_argv, find_emulator_pid, port_from_serial,
    ProcessEnumerator, ProcessInfo,
};
use crate::env::Env;
use crate::error::{Error, IoContext, Result};
use crate::exec;
use crate::image::{self, AvdInfo, CLONE_MARKER};
use crate::ports::{CONSOLE_PORT_MAX, CONSOLE_PORT_MIN};

const CONSOLE_KILL_GRACE: Duration = Duration::from_secs(1);
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// Sends a signal, treating an already-gone process as success.
fn signal_pid(pid: i32, signal: libc::c_int) -> io::Result<()> {
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

fn scan_pid(enumerator: &dyn ProcessEnumerator, port: u16) -> Option<i32> {
    let records = enumerator.processes().ok()?;
    find_emulator_pid(&records, port)
}

/// Asks the emulator console to shut down and gives it a moment.
pub(crate) fn kill_via_console(env: &Env, serial: &str) {
    let _ = exec::run_tool(env, &env.adb, &["-s", serial, "emu", "kill"]);
    thread::sleep(CONSOLE_KILL_GRACE);
}

/// Stops the emulator behind `serial`, escalating from the console kill to
/// signals. Console-kill errors are surfaced only when the process also
/// could not be signalled; stopping something that is not running
/// succeeds.
pub fn stop_by_serial(env: &Env, enumerator: &dyn ProcessEnumerator, serial: &str) -> Result<()> {
    let port = port_from_serial(serial).ok_or_else(|| {
        Error::precondition(format!(
            "invalid serial {serial:?} (expected emulator-<port>)"
        ))
    })?;

    info!(target: "avdpool", "stop_by_serial: stopping {} (port {})", serial, port);
    let console_kill = exec::run_tool(env, &env.adb, &["-s", serial, "emu", "kill"]);
    thread::sleep(CONSOLE_KILL_GRACE);
    env.cancel.checkpoint()?;

    let Some(pid) = scan_pid(enumerator, port) else {
        info!(target: "avdpool", "stop_by_serial: {} stopped", serial);
        return Ok(());
    };

    match signal_pid(pid, libc::SIGINT) {
        Ok(()) => {
            thread::sleep(INTERRUPT_GRACE);
            env.cancel.checkpoint()?;
            if scan_pid(enumerator, port).is_some() {
                warn!(
                    target: "avdpool",
                    "stop_by_serial: {} (pid {}) ignored the interrupt, force killing",
                    serial,
                    pid
                );
                let _ = signal_pid(pid, libc::SIGKILL);
            }
            info!(target: "avdpool", "stop_by_serial: {} stopped (pid {})", serial, pid);
            Ok(())
        }
        Err(signal_err) => {
            if let Err(console_err) = console_kill {
                warn!(
                    target: "avdpool",
                    "stop_by_serial: console kill and signal both failed for {} (pid {}): {}",
                    serial,
                    pid,
                    signal_err
                );
                return Err(console_err);
            }
            Ok(())
        }
    }
}

/// Stops the emulator running the named AVD. Not running is success.
pub fn stop_by_name(env: &Env, enumerator: &dyn ProcessEnumerator, name: &str) -> Result<()> {
    for process in discovery::list_running(env, enumerator)? {
        if process.name == name {
            return stop_by_serial(env, enumerator, &process.serial);
        }
    }
    Ok(())
}

/// Tuning for [`kill_all_emulators`].
#[derive(Clone, Copy, Debug)]
pub struct KillAllOptions {
    /// Maximum kill passes before giving up on survivors.
    pub max_passes: u32,
    /// Delay between passes.
    pub delay: Duration,
}

impl Default for KillAllOptions {
    fn default() -> Self {
        Self {
            max_passes: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// What a kill-all sweep did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct KillAllReport {
    pub passes: u32,
    pub killed_pids: Vec<i32>,
    /// Emulator processes still alive after the final pass.
    pub remaining: usize,
}

/// Force-stops every emulator process the table scan can find, in
/// repeated passes. The first pass interrupts; survivors are force
/// killed. Intended for CI teardown, where nothing on the host should
/// outlive the job.
pub fn kill_all_emulators(
    env: &Env,
    enumerator: &dyn ProcessEnumerator,
    opts: KillAllOptions,
) -> Result<KillAllReport> {
    let mut report = KillAllReport::default();
    let mut killed = HashSet::new();

    for pass in 0..opts.max_passes.max(1) {
        env.cancel.checkpoint()?;
        let pids = emulator_pids(enumerator)?;
        if pids.is_empty() {
            report.remaining = 0;
            return Ok(report);
        }
        report.passes = pass + 1;
        let signal = if pass == 0 { libc::SIGINT } else { libc::SIGKILL };
        for pid in &pids {
            info!(
                target: "avdpool",
                "kill_all_emulators: pass {} signalling pid {}",
                pass + 1,
                pid
            );
            let _ = signal_pid(*pid, signal);
            if killed.insert(*pid) {
                report.killed_pids.push(*pid);
            }
        }
        thread::sleep(opts.delay);
    }

    report.remaining = emulator_pids(enumerator)?.len();
    if report.remaining > 0 {
        warn!(
            target: "avdpool",
            "kill_all_emulators: {} emulator processes survived {} passes",
            report.remaining,
            report.passes
        );
    }
    Ok(report)
}

fn emulator_pids(enumerator: &dyn ProcessEnumerator) -> Result<Vec<i32>> {
    let records = enumerator
        .processes()
        .io_context(|| "enumerating host processes".to_string())?;
    let mut pids = Vec::new();
    let mut port = CONSOLE_PORT_MIN;
    while port <= CONSOLE_PORT_MAX {
        if let Some(pid) = find_emulator_pid(&records, port) {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
        port += 2;
    }
    Ok(pids)
}

/// What a cleanup pass found (and, in force mode, acted on).
#[derive(Clone, Debug, Default, Serialize)]
pub struct CleanupReport {
    pub orphaned_processes: Vec<ProcessInfo>,
    pub orphaned_avds: Vec<AvdInfo>,
}

/// Finds emulator processes the debug bridge has forgotten and clone
/// directories with no process behind them. With `force`, orphan
/// processes are stopped and orphan AVDs deleted; otherwise the report is
/// purely informational.
pub fn cleanup_orphans(
    env: &Env,
    enumerator: &dyn ProcessEnumerator,
    force: bool,
) -> Result<CleanupReport> {
    discovery::ensure_adb_server(env);
    let records = enumerator
        .processes()
        .io_context(|| "enumerating host processes".to_string())?;
    let adb_serials: HashSet<String> = adb_emulator_serials(env).into_iter().collect();

    let mut report = CleanupReport::default();
    let mut running_names = HashSet::new();

    let mut port = CONSOLE_PORT_MIN;
    while port <= CONSOLE_PORT_MAX {
        if let Some(pid) = find_emulator_pid(&records, port) {
            let serial = format!("emulator-{port}");
            let name = records
                .iter()
                .find(|record| record.pid == pid)
                .and_then(|record| avd_name_from_argv(&record.argv))
                .unwrap_or_default();
            if !name.is_empty() {
                running_names.insert(name.clone());
            }
            if !adb_serials.contains(&serial) {
                report.orphaned_processes.push(ProcessInfo {
                    serial,
                    name,
                    port,
                    pid,
                    booted: false,
                });
            }
        }
        port += 2;
    }

    if let Ok(entries) = fs::read_dir(&env.avd_home) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !path.join(CLONE_MARKER).exists() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|n| n.strip_suffix(".avd"))
                .map(str::to_string)
            else {
                continue;
            };
            if running_names.contains(&name) {
                continue;
            }
            report.orphaned_avds.push(image::info_of(env, &name));
        }
    }

    info!(
        target: "avdpool",
        "cleanup_orphans: {} orphan processes, {} orphan AVDs (force={})",
        report.orphaned_processes.len(),
        report.orphaned_avds.len(),
        force
    );

    if force {
        for process in &report.orphaned_processes {
            if let Err(err) = stop_by_serial(env, enumerator, &process.serial) {
                warn!(
                    target: "avdpool",
                    "cleanup_orphans: failed to stop {}: {}",
                    process.serial,
                    err
                );
            }
        }
        for avd in &report.orphaned_avds {
            if let Err(err) = image::delete(env, &avd.name) {
                warn!(
                    target: "avdpool",
                    "cleanup_orphans: failed to delete {}: {}",
                    avd.name,
                    err
                );
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ProcessRecord, ProcfsEnumerator};
    use crate::testutil::{test_env, write_stub};
    use std::process::{Command, Stdio};
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    struct FakeEnumerator(Vec<ProcessRecord>);

    impl ProcessEnumerator for FakeEnumerator {
        fn processes(&self) -> io::Result<Vec<ProcessRecord>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn malformed_serials_are_rejected() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let enumerator = FakeEnumerator(Vec::new());

        let err = stop_by_serial(&env, &enumerator, "device-5580").unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        let err = stop_by_serial(&env, &enumerator, "emulator-abc").unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn stop_is_idempotent_when_nothing_runs() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let enumerator = FakeEnumerator(Vec::new());

        assert!(stop_by_serial(&env, &enumerator, "emulator-5580").is_ok());
        assert!(stop_by_serial(&env, &enumerator, "emulator-5580").is_ok());
    }

    #[test]
    fn concurrent_stops_all_succeed() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let enumerator = Arc::new(FakeEnumerator(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let env = env.clone();
            let enumerator = Arc::clone(&enumerator);
            handles.push(thread::spawn(move || {
                stop_by_serial(&env, enumerator.as_ref(), "emulator-5582")
            }));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn stop_by_name_treats_absent_as_success() {
        let dir = TempDir::new().unwrap();
        let mut env = test_env(dir.path());
        let adb = dir.path().join("adb-empty");
        write_stub(
            &adb,
            "#!/bin/sh\n\
             if [ \"$1\" = devices ]; then echo \"List of devices attached\"; fi\n\
             exit 0\n",
        );
        env.adb = adb;

        let enumerator = FakeEnumerator(Vec::new());
        assert!(stop_by_name(&env, &enumerator, "w-acme").is_ok());
    }

    #[test]
    fn kill_all_reports_an_empty_host_without_passes() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let enumerator = FakeEnumerator(Vec::new());

        let report = kill_all_emulators(&env, &enumerator, KillAllOptions::default()).unwrap();
        assert_eq!(report.passes, 0);
        assert!(report.killed_pids.is_empty());
        assert_eq!(report.remaining, 0);
    }

    // Covers orphan cleanup and the kill-all sweep in one sequential test:
    // both scan the real process table, and running them in parallel would
    // have each sweeping the other's stray process.
    #[cfg(target_os = "linux")]
    #[test]
    fn cleanup_reports_then_sweeps_orphans() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());

        // A clone directory nobody is running.
        let orphan_dir = env.avd_dir("orphan");
        fs::create_dir_all(&orphan_dir).unwrap();
        fs::write(orphan_dir.join(CLONE_MARKER), "base=base-a35\n").unwrap();

        // An emulator-shaped process the stub adb knows nothing about.
        let stub = dir.path().join("emulator");
        write_stub(
            &stub,
            "#!/bin/sh\ntrap 'exit 0' INT TERM\nwhile true; do sleep 1; done\n",
        );
        let mut child = Command::new(&stub)
            .args(["-avd", "orphan-proc", "-port", "5590"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let enumerator = ProcfsEnumerator;
        let report = cleanup_orphans(&env, &enumerator, false).unwrap();
        assert!(
            report
                .orphaned_processes
                .iter()
                .any(|proc| proc.port == 5590 && proc.name == "orphan-proc"),
            "dry run must report the stray process: {report:?}"
        );
        assert!(
            report.orphaned_avds.iter().any(|avd| avd.name == "orphan"),
            "dry run must report the marked directory: {report:?}"
        );
        assert!(orphan_dir.exists(), "dry run must not delete anything");

        let report = cleanup_orphans(&env, &enumerator, true).unwrap();
        assert!(report.orphaned_avds.iter().any(|avd| avd.name == "orphan"));
        assert!(!orphan_dir.exists(), "force mode removes the orphan AVD");

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let records = enumerator.processes().unwrap();
            if find_emulator_pid(&records, 5590).is_none() {
                break;
            }
            if Instant::now() >= deadline {
                panic!("orphan process still alive after force cleanup");
            }
            thread::sleep(Duration::from_millis(100));
        }
        let _ = child.wait();

        // Kill-all sweeps a fresh stray the same way.
        let mut stray = Command::new(&stub)
            .args(["-avd", "stray", "-port", "5596"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let stray_pid = stray.id() as i32;
        let report = kill_all_emulators(
            &env,
            &enumerator,
            KillAllOptions {
                max_passes: 3,
                delay: Duration::from_millis(200),
            },
        )
        .unwrap();
        assert!(
            report.killed_pids.contains(&stray_pid),
            "kill-all must signal the stray: {report:?}"
        );
        let _ = stray.wait();
    }
}
