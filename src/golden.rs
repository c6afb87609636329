//! Golden-image workflows built on top of the store and the supervisor:
//! prewarm a base once and freeze it, bake APKs into a fresh clone, and
//! the manual customize pair.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::boot;
use crate::config;
use crate::discovery::{self, ProcessEnumerator};
use crate::env::Env;
use crate::error::{Error, IoContext, Result};
use crate::exec;
use crate::image::{self, GoldenImage};
use crate::stop;
use crate::supervisor::{self, KillOnDrop};

/// How long adb gets to notice a freshly launched serial before the boot
/// wait proper begins.
const SERIAL_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

// A userdata image past this size means the boot progressed far enough to
// populate it, even when the bridge lost the device before confirming.
const USERDATA_POPULATED_THRESHOLD: u64 = 1024 * 1024;

// Post-boot provisioning: mark setup complete and keep the lockscreen out
// of the way, so clones wake straight into a usable device.
const PROVISIONING_COMMANDS: [&[&str]; 5] = [
    &["settings", "put", "global", "device_provisioned", "1"],
    &["settings", "put", "secure", "user_setup_complete", "1"],
    &["locksettings", "set-disabled", "true"],
    &["wm", "dismiss-keyguard"],
    &["input", "keyevent", "82"],
];

fn userdata_populated(env: &Env, name: &str) -> bool {
    let avd_dir = env.avd_dir(name);
    for candidate in [
        avd_dir.join("userdata-qemu.img.qcow2"),
        avd_dir.join("userdata-qemu.img"),
    ] {
        if let Ok(meta) = fs::metadata(&candidate) {
            if meta.len() > USERDATA_POPULATED_THRESHOLD {
                return true;
            }
        }
    }
    false
}

/// Chunked sleep that honors cancellation between chunks.
fn settle(env: &Env, duration: Duration) -> Result<()> {
    let mut remaining = duration;
    while !remaining.is_zero() {
        env.cancel.checkpoint()?;
        let step = remaining.min(Duration::from_millis(500));
        thread::sleep(step);
        remaining -= step;
    }
    Ok(())
}

/// Boots an AVD once, waits for the OS, settles, and freezes the result
/// as a golden directory.
///
/// The adb daemon is restarted first to purge stale device identities. If
/// boot detection times out but the userdata image is already populated,
/// the golden is saved anyway: the bridge routinely drops a device at the
/// exact moment Android finishes booting, and the caller only cares about
/// the populated image.
pub fn prewarm(
    env: &Env,
    name: &str,
    dest: &str,
    extra_settle: Duration,
    boot_timeout: Duration,
) -> Result<GoldenImage> {
    if name.is_empty() {
        return Err(Error::precondition("empty AVD name"));
    }
    discovery::restart_adb_server(env);

    let emulator = KillOnDrop::new(supervisor::start(env, name, &[])?);
    let serial = emulator.serial().to_string();

    if let Err(err) = discovery::wait_for_serial(env, &serial, SERIAL_WAIT_TIMEOUT) {
        return Err(err.with_log_hint(emulator.log_path()));
    }

    match boot::wait_for_boot(env, &serial, boot_timeout) {
        Ok(()) => {}
        Err(err @ Error::Timeout { .. }) => {
            if userdata_populated(env, name) {
                warn!(
                    target: "avdpool",
                    "prewarm: boot wait for {} expired but userdata is populated, saving golden anyway",
                    name
                );
                stop::kill_via_console(env, &serial);
                return image::save_golden(env, name, dest);
            }
            return Err(err.with_log_hint(emulator.log_path()));
        }
        Err(err) => return Err(err),
    }

    for command in PROVISIONING_COMMANDS {
        let mut args = vec!["-s", serial.as_str(), "shell"];
        args.extend(command);
        let _ = exec::run_tool(env, &env.adb, &args);
    }

    settle(env, extra_settle)?;
    stop::kill_via_console(env, &serial);
    image::save_golden(env, name, dest)
}

/// Clones from a golden, boots the clone, installs each APK with
/// `install -r`, stops it, and reports the clone's userdata identity.
pub fn bake_apks(
    env: &Env,
    base: &str,
    name: &str,
    golden: &str,
    apks: &[String],
    boot_timeout: Duration,
) -> Result<(PathBuf, u64)> {
    if apks.is_empty() {
        return Err(Error::precondition("no APKs to install"));
    }
    image::clone_from_golden(env, base, name, golden)?;

    discovery::ensure_adb_server(env);
    let emulator = KillOnDrop::new(supervisor::start(env, name, &[])?);
    let serial = emulator.serial().to_string();

    if let Err(err) = discovery::wait_for_serial(env, &serial, SERIAL_WAIT_TIMEOUT) {
        return Err(err.with_log_hint(emulator.log_path()));
    }
    if let Err(err) = boot::wait_for_boot(env, &serial, boot_timeout) {
        return Err(err.with_log_hint(emulator.log_path()));
    }

    for apk in apks {
        info!(target: "avdpool", "bake_apks: installing {} on {}", apk, serial);
        exec::run_tool(env, &env.adb, &["-s", &serial, "install", "-r", apk])?;
    }

    stop::kill_via_console(env, &serial);
    drop(emulator);

    let clone_dir = env.avd_dir(name);
    let userdata = clone_dir.join("userdata-qemu.img.qcow2");
    let (userdata, meta) = match fs::metadata(&userdata) {
        Ok(meta) => (userdata, meta),
        Err(_) => {
            let raw = clone_dir.join("userdata-qemu.img");
            let meta = fs::metadata(&raw)
                .io_context(|| format!("stat userdata for baked clone {name}"))?;
            (raw, meta)
        }
    };
    Ok((userdata, meta.len()))
}

/// Prepares an AVD for manual customization: sanitizes its configuration
/// in place, drops any snapshot tree, and starts a windowed emulator with
/// snapshots disabled. Returns the emulator log path; the session is
/// stopped later through the normal stop path.
pub fn customize_start(env: &Env, name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(Error::precondition("empty AVD name"));
    }
    let avd_dir = env.avd_dir(name);
    let config_path = avd_dir.join("config.ini");
    let text = fs::read_to_string(&config_path)
        .io_context(|| format!("reading {}", config_path.display()))?;
    fs::write(&config_path, format!("{}\n", config::sanitize_config(&text)))
        .io_context(|| format!("writing {}", config_path.display()))?;
    let _ = fs::remove_dir_all(avd_dir.join("snapshots"));

    let log_path = std::env::temp_dir().join(format!("emulator-{name}-customize.log"));
    let log_file = fs::File::create(&log_path)
        .io_context(|| format!("opening emulator log {}", log_path.display()))?;
    let args = vec![
        "-avd".to_string(),
        name.to_string(),
        "-no-snapshot-load".to_string(),
        "-no-snapshot-save".to_string(),
    ];
    // The session outlives this call by design; only the handle is dropped.
    let _child = exec::spawn_streamed(
        env,
        &env.emulator,
        &args,
        &[("QEMU_FILE_LOCKING", "off")],
        log_file,
    )?;
    info!(
        target: "avdpool",
        "customize_start: {} running windowed (log: {})",
        name,
        log_path.display()
    );
    Ok(log_path)
}

/// Ends a customization session: stops the AVD's emulator if one is still
/// running, then freezes the result. An empty destination defaults to a
/// per-AVD path under the golden root.
pub fn customize_finish(
    env: &Env,
    enumerator: &dyn ProcessEnumerator,
    name: &str,
    dest: Option<&str>,
) -> Result<GoldenImage> {
    if name.is_empty() {
        return Err(Error::precondition("empty AVD name"));
    }
    stop::stop_by_name(env, enumerator, name)?;

    let dest = match dest.filter(|d| !d.is_empty()) {
        Some(dest) => dest.to_string(),
        None => {
            fs::create_dir_all(&env.golden_dir)
                .io_context(|| format!("creating golden root {}", env.golden_dir.display()))?;
            env.golden_dir
                .join(format!("{name}-custom.qcow2"))
                .to_string_lossy()
                .into_owned()
        }
    };
    image::save_golden(env, name, &dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ProcessRecord, ProcessEnumerator};
    use crate::testutil::{make_base_avd, test_env, write_stub};
    use std::io;
    use tempfile::TempDir;

    struct FakeEnumerator(Vec<ProcessRecord>);

    impl ProcessEnumerator for FakeEnumerator {
        fn processes(&self) -> io::Result<Vec<ProcessRecord>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn populated_userdata_needs_more_than_the_threshold() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        make_base_avd(&env, "base-a35");
        assert!(!userdata_populated(&env, "base-a35"));

        let big = vec![0u8; (USERDATA_POPULATED_THRESHOLD + 1) as usize];
        fs::write(env.avd_dir("base-a35").join("userdata-qemu.img.qcow2"), big).unwrap();
        assert!(userdata_populated(&env, "base-a35"));
    }

    #[test]
    fn bake_requires_at_least_one_apk() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let err = bake_apks(&env, "base", "clone", "/g/base", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn customize_finish_defaults_the_destination() {
        let dir = TempDir::new().unwrap();
        let mut env = test_env(dir.path());
        let qemu = dir.path().join("qemu-img");
        write_stub(
            &qemu,
            "#!/bin/sh\nif [ \"$1\" = convert ]; then cp \"$4\" \"$5\"; fi\nexit 0\n",
        );
        env.qemu_img = qemu;
        let adb = dir.path().join("adb-empty");
        write_stub(
            &adb,
            "#!/bin/sh\n\
             if [ \"$1\" = devices ]; then echo \"List of devices attached\"; fi\n\
             exit 0\n",
        );
        env.adb = adb;
        make_base_avd(&env, "base-a35");

        let enumerator = FakeEnumerator(Vec::new());
        let golden = customize_finish(&env, &enumerator, "base-a35", None).unwrap();
        // Legacy suffix stripped: the default lands on a directory.
        assert_eq!(golden.path, env.golden_dir.join("base-a35-custom"));
        assert!(golden.path.join("userdata-qemu.img").exists());
    }

    #[test]
    fn settle_is_interruptible() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        env.cancel.cancel();
        assert!(matches!(
            settle(&env, Duration::from_secs(30)),
            Err(Error::Cancelled)
        ));
    }
}
