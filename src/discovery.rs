//! Discovery of running emulators.
//!
//! The debug bridge and the host process table disagree during startup
//! (the process exists before it registers with adb) and during teardown
//! (adb forgets a device while its qemu process lingers). Neither oracle
//! is authoritative, so listing always returns the union: every serial adb
//! reports, plus a synthesized entry for every even console port whose
//! process the table scan finds.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::env::Env;
use crate::error::{Error, IoContext, Result};
use crate::exec;
use crate::ports::{CONSOLE_PORT_MAX, CONSOLE_PORT_MIN};

/// One host process with its launch argument vector.
#[derive(Clone, Debug)]
pub struct ProcessRecord {
    pub pid: i32,
    pub argv: Vec<String>,
}

/// Source of `(pid, argv)` pairs. The default reads the Linux procfs;
/// other hosts (and tests) supply their own.
pub trait ProcessEnumerator: Send + Sync {
    fn processes(&self) -> io::Result<Vec<ProcessRecord>>;
}

/// Enumerates processes from `/proc/<pid>/cmdline`. Entries that vanish
/// mid-scan or cannot be read are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcfsEnumerator;

impl ProcessEnumerator for ProcfsEnumerator {
    fn processes(&self) -> io::Result<Vec<ProcessRecord>> {
        let mut out = Vec::new();
        for entry in fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
                continue;
            };
            let Ok(bytes) = fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            if bytes.is_empty() {
                continue;
            }
            let argv = bytes
                .split(|byte| *byte == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect();
            out.push(ProcessRecord { pid, argv });
        }
        Ok(out)
    }
}

/// A running emulator as the union view sees it. `pid` is zero when only
/// the debug bridge knows the device; `booted` is true iff the boot
/// property read exactly `"1"`.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessInfo {
    pub serial: String,
    pub name: String,
    pub port: u16,
    pub pid: i32,
    pub booted: bool,
}

pub(crate) fn port_from_serial(serial: &str) -> Option<u16> {
    serial.strip_prefix("emulator-")?.parse().ok()
}

/// Finds the emulator process bound to a console port. The command line
/// must carry the adjacent `-port <port>` pair and name the emulator or
/// qemu binary, which excludes unrelated port-forwarding proxies.
pub(crate) fn find_emulator_pid(records: &[ProcessRecord], port: u16) -> Option<i32> {
    let port_arg = port.to_string();
    records
        .iter()
        .find(|record| {
            record
                .argv
                .windows(2)
                .any(|pair| pair[0] == "-port" && pair[1] == port_arg)
                && record
                    .argv
                    .iter()
                    .any(|arg| arg.contains("qemu-system") || arg.contains("emulator"))
        })
        .map(|record| record.pid)
}

/// Extracts the AVD name from an emulator command line.
pub(crate) fn avd_name_from_argv(argv: &[String]) -> Option<String> {
    argv.windows(2)
        .find(|pair| pair[0] == "-avd")
        .map(|pair| pair[1].clone())
}

/// Starts the debug-bridge daemon. Idempotent; failures are ignored and
/// surface later through the per-device probes.
pub(crate) fn ensure_adb_server(env: &Env) {
    let _ = exec::run_tool(env, &env.adb, &["start-server"]);
}

/// Restarts the daemon to purge stale device identities.
pub(crate) fn restart_adb_server(env: &Env) {
    let _ = exec::run_tool(env, &env.adb, &["kill-server"]);
    thread::sleep(Duration::from_secs(1));
    ensure_adb_server(env);
}

/// Serials the debug bridge currently reports, regardless of state.
pub(crate) fn adb_emulator_serials(env: &Env) -> Vec<String> {
    let Ok(output) = exec::run_tool(env, &env.adb, &["devices"]) else {
        return Vec::new();
    };
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            fields.next()?;
            serial.starts_with("emulator-").then(|| serial.to_string())
        })
        .collect()
}

pub(crate) fn boot_completed(env: &Env, serial: &str) -> bool {
    match exec::run_tool(
        env,
        &env.adb,
        &["-s", serial, "shell", "getprop", "sys.boot_completed"],
    ) {
        Ok(output) => output.trim() == "1",
        Err(_) => false,
    }
}

/// Asks the emulator console for its AVD name. The console echoes the name
/// followed by an `OK` acknowledgement line.
pub(crate) fn avd_name_from_console(env: &Env, serial: &str) -> Option<String> {
    let output = exec::run_tool(env, &env.adb, &["-s", serial, "emu", "avd", "name"]).ok()?;
    let mut lines: Vec<&str> = output.trim().lines().collect();
    if lines.len() > 1 && lines.last().map(|line| line.trim()) == Some("OK") {
        lines.pop();
    }
    let name = lines.first().map(|line| line.trim()).unwrap_or_default();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn name_for(env: &Env, records: &[ProcessRecord], serial: &str, pid: i32) -> String {
    if let Some(name) = avd_name_from_console(env, serial) {
        return name;
    }
    if pid > 0 {
        if let Some(record) = records.iter().find(|record| record.pid == pid) {
            if let Some(name) = avd_name_from_argv(&record.argv) {
                return name;
            }
        }
    }
    String::new()
}

/// Returns every running emulator: the adb listing first, then a process
/// table sweep over the even console ports adb did not mention.
pub fn list_running(env: &Env, enumerator: &dyn ProcessEnumerator) -> Result<Vec<ProcessInfo>> {
    ensure_adb_server(env);
    let records = enumerator
        .processes()
        .io_context(|| "enumerating host processes".to_string())?;

    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for serial in adb_emulator_serials(env) {
        let Some(port) = port_from_serial(&serial) else {
            continue;
        };
        seen.insert(port);
        let pid = find_emulator_pid(&records, port).unwrap_or(0);
        let name = name_for(env, &records, &serial, pid);
        let booted = boot_completed(env, &serial);
        out.push(ProcessInfo {
            serial,
            name,
            port,
            pid,
            booted,
        });
    }

    let mut port = CONSOLE_PORT_MIN;
    while port <= CONSOLE_PORT_MAX {
        if !seen.contains(&port) {
            if let Some(pid) = find_emulator_pid(&records, port) {
                debug!(
                    target: "avdpool",
                    "list_running: port {} has pid {} but no adb entry",
                    port,
                    pid
                );
                let serial = format!("emulator-{port}");
                let name = name_for(env, &records, &serial, pid);
                let booted = boot_completed(env, &serial);
                out.push(ProcessInfo {
                    serial,
                    name,
                    port,
                    pid,
                    booted,
                });
            }
        }
        port += 2;
    }

    Ok(out)
}

const SERIAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Polls the adb listing until the exact serial appears. The device may
/// still be offline; boot readiness is a separate wait.
pub fn wait_for_serial(env: &Env, serial: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        env.cancel.checkpoint()?;
        if adb_emulator_serials(env).iter().any(|s| s == serial) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout {
                what: format!("device {serial} to appear in the adb listing"),
                timeout,
                last_error: None,
            });
        }
        thread::sleep(SERIAL_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_env, write_stub};
    use tempfile::TempDir;

    struct FakeEnumerator(Vec<ProcessRecord>);

    impl ProcessEnumerator for FakeEnumerator {
        fn processes(&self) -> io::Result<Vec<ProcessRecord>> {
            Ok(self.0.clone())
        }
    }

    fn emulator_record(pid: i32, name: &str, port: u16) -> ProcessRecord {
        ProcessRecord {
            pid,
            argv: vec![
                "/sdk/emulator/qemu-system-x86_64".to_string(),
                "-avd".to_string(),
                name.to_string(),
                "-port".to_string(),
                port.to_string(),
            ],
        }
    }

    #[test]
    fn pid_match_requires_the_port_pair_and_an_emulator_token() {
        let records = vec![
            emulator_record(101, "w-acme", 5580),
            ProcessRecord {
                pid: 202,
                argv: vec![
                    "/usr/bin/docker-proxy".to_string(),
                    "-port".to_string(),
                    "5582".to_string(),
                ],
            },
        ];
        assert_eq!(find_emulator_pid(&records, 5580), Some(101));
        assert_eq!(find_emulator_pid(&records, 5582), None);
        assert_eq!(find_emulator_pid(&records, 5584), None);
    }

    #[test]
    fn avd_name_comes_from_the_avd_flag() {
        let record = emulator_record(7, "w-acme", 5580);
        assert_eq!(avd_name_from_argv(&record.argv).as_deref(), Some("w-acme"));
        assert_eq!(avd_name_from_argv(&["emulator".to_string()]), None);
    }

    #[test]
    fn serial_port_parsing() {
        assert_eq!(port_from_serial("emulator-5580"), Some(5580));
        assert_eq!(port_from_serial("emulator-"), None);
        assert_eq!(port_from_serial("192.168.1.4:5555"), None);
    }

    #[test]
    fn listing_is_empty_without_devices_or_processes() {
        let dir = TempDir::new().unwrap();
        let mut env = test_env(dir.path());
        let adb = dir.path().join("adb-devices");
        write_stub(
            &adb,
            "#!/bin/sh\n\
             if [ \"$1\" = devices ]; then echo \"List of devices attached\"; fi\n\
             exit 0\n",
        );
        env.adb = adb;

        let running = list_running(&env, &FakeEnumerator(Vec::new())).unwrap();
        assert!(running.is_empty());
    }

    #[test]
    fn listing_unions_adb_devices_with_the_process_scan() {
        let dir = TempDir::new().unwrap();
        let mut env = test_env(dir.path());
        let adb = dir.path().join("adb-devices");
        write_stub(
            &adb,
            "#!/bin/sh\n\
             if [ \"$1\" = devices ]; then\n\
               echo \"List of devices attached\"\n\
               printf 'emulator-5580\\tdevice\\n'\n\
             fi\n\
             exit 0\n",
        );
        env.adb = adb;

        let enumerator = FakeEnumerator(vec![
            emulator_record(101, "w-acme", 5580),
            emulator_record(102, "w-beta", 5590),
        ]);
        let mut running = list_running(&env, &enumerator).unwrap();
        running.sort_by_key(|proc| proc.port);

        assert_eq!(running.len(), 2);
        assert_eq!(running[0].serial, "emulator-5580");
        assert_eq!(running[0].pid, 101);
        assert_eq!(running[0].name, "w-acme");
        assert!(!running[0].booted);

        // adb never saw 5590; the scan synthesizes it.
        assert_eq!(running[1].serial, "emulator-5590");
        assert_eq!(running[1].pid, 102);
        assert_eq!(running[1].name, "w-beta");
    }

    #[test]
    fn wait_for_serial_times_out_and_cancels() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let err = wait_for_serial(&env, "emulator-5580", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        env.cancel.cancel();
        assert!(matches!(
            wait_for_serial(&env, "emulator-5580", Duration::from_secs(5)),
            Err(Error::Cancelled)
        ));
    }
}
