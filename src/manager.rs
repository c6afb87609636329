//! High-level facade over the image store, supervisor, discovery, and
//! boot detection.
//!
//! The manager binds one [`Env`] to typed operations, enforces the
//! not-already-running invariant before every Run variant, and wraps each
//! operation in a tracing span carrying the correlation id. Within one
//! process a per-name guard closes the window between the advisory
//! discovery check and the actual launch; across processes the
//! supervisor's port-pair probe rejects the loser.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info_span};

use crate::boot::{self, BootStage};
use crate::discovery::{self, ProcessEnumerator, ProcessInfo, ProcfsEnumerator};
use crate::env::{CancelHandle, Env};
use crate::error::{Error, Result};
use crate::golden;
use crate::image::{self, AvdInfo, GoldenImage};
use crate::ports;
use crate::stop::{self, CleanupReport, KillAllOptions, KillAllReport};
use crate::supervisor;

/// Options for creating a base AVD.
#[derive(Clone, Debug, Default)]
pub struct InitBaseOptions {
    pub name: String,
    /// System image package id, e.g.
    /// `system-images;android-35;google_apis_playstore;x86_64`.
    pub system_image: String,
    /// Device profile, e.g. `pixel_6`.
    pub device: String,
}

/// Options for cloning a base AVD from a golden directory.
#[derive(Clone, Debug, Default)]
pub struct CloneOptions {
    pub base_name: String,
    pub clone_name: String,
    pub golden_path: String,
}

/// Options for starting an emulator.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub name: String,
    /// Console port; `None` allocates from the dynamic range.
    pub port: Option<u16>,
    /// Extra flags appended after the canonical argument set.
    pub extra_args: Vec<String>,
}

/// Options for exporting an AVD to a golden directory.
#[derive(Clone, Debug, Default)]
pub struct SaveGoldenOptions {
    pub name: String,
    /// Destination directory; `None` defaults to `<golden_dir>/<name>`.
    pub destination: Option<String>,
}

/// Options for the prewarm workflow.
#[derive(Clone, Debug, Default)]
pub struct PrewarmOptions {
    pub name: String,
    pub destination: Option<String>,
    /// Extra settle time after boot; defaults to 30 s.
    pub extra_settle: Option<Duration>,
    /// Boot wait budget; defaults to 3 min.
    pub boot_timeout: Option<Duration>,
}

/// Options for baking APKs into a fresh clone.
#[derive(Clone, Debug, Default)]
pub struct BakeApksOptions {
    pub base_name: String,
    pub clone_name: String,
    pub golden_path: String,
    pub apk_paths: Vec<String>,
    /// Boot wait budget; defaults to 3 min.
    pub boot_timeout: Option<Duration>,
}

/// A started emulator as reported to callers.
#[derive(Clone, Debug, Serialize)]
pub struct StartedEmulator {
    pub serial: String,
    pub port: u16,
    pub log_path: PathBuf,
}

const DEFAULT_EXTRA_SETTLE: Duration = Duration::from_secs(30);
const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(180);
const RUN_SERIAL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Manager {
    env: Env,
    enumerator: Arc<dyn ProcessEnumerator>,
    starting: DashMap<String, ()>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// Manager over the auto-detected environment.
    pub fn new() -> Self {
        Self::with_env(Env::detect())
    }

    /// Manager over a caller-supplied environment.
    pub fn with_env(env: Env) -> Self {
        Self {
            env,
            enumerator: Arc::new(ProcfsEnumerator),
            starting: DashMap::new(),
        }
    }

    /// Auto-detected environment with logs and spans tied to a workflow id.
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        let mut env = Env::detect();
        env.correlation_id = Some(correlation_id.into());
        Self::with_env(env)
    }

    /// Replaces the process enumerator; hosts without a readable procfs
    /// (and tests) supply their own.
    pub fn with_enumerator(mut self, enumerator: Arc<dyn ProcessEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.env.correlation_id.as_deref()
    }

    /// Handle callers fire to cancel this manager's in-flight operations
    /// at their next poll boundary.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.env.cancel.clone()
    }

    fn corr(&self) -> &str {
        self.env.correlation_id.as_deref().unwrap_or("")
    }

    fn observed<T>(result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            error!(target: "avdpool", error = %err, "operation failed");
        }
        result
    }

    fn acquire_start(&self, name: &str) -> Result<StartPermit<'_>> {
        use dashmap::mapref::entry::Entry;
        match self.starting.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::collision(format!(
                "AVD {name} already has a start in progress"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(StartPermit {
                    names: &self.starting,
                    name: name.to_string(),
                })
            }
        }
    }

    fn ensure_not_running(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::precondition("empty AVD name"));
        }
        for process in discovery::list_running(&self.env, self.enumerator.as_ref())? {
            if process.name == name {
                return Err(Error::collision(format!(
                    "AVD {name} already running on {}",
                    process.serial
                )));
            }
        }
        Ok(())
    }

    /// Creates a base AVD, installing its system image when missing.
    pub fn init_base(&self, opts: &InitBaseOptions) -> Result<AvdInfo> {
        let span = info_span!("init_base", correlation_id = %self.corr(), name = %opts.name);
        let _guard = span.enter();
        Self::observed(image::init_base(
            &self.env,
            &opts.name,
            &opts.system_image,
            &opts.device,
        ))
    }

    /// Lists every AVD under the AVD home.
    pub fn list(&self) -> Result<Vec<AvdInfo>> {
        let span = info_span!("list", correlation_id = %self.corr());
        let _guard = span.enter();
        Self::observed(image::list(&self.env))
    }

    /// Exports an AVD's writable images to a golden directory.
    pub fn save_golden(&self, opts: &SaveGoldenOptions) -> Result<GoldenImage> {
        let span = info_span!("save_golden", correlation_id = %self.corr(), name = %opts.name);
        let _guard = span.enter();
        let dest = self.golden_destination(&opts.name, opts.destination.as_deref());
        Self::observed(image::save_golden(&self.env, &opts.name, &dest))
    }

    /// Creates a clone of a base AVD from a golden directory.
    pub fn clone(&self, opts: &CloneOptions) -> Result<AvdInfo> {
        let span = info_span!(
            "clone",
            correlation_id = %self.corr(),
            base = %opts.base_name,
            clone = %opts.clone_name
        );
        let _guard = span.enter();
        Self::observed(self.clone_inner(opts))
    }

    fn clone_inner(&self, opts: &CloneOptions) -> Result<AvdInfo> {
        self.ensure_not_running(&opts.clone_name)?;
        image::clone_from_golden(
            &self.env,
            &opts.base_name,
            &opts.clone_name,
            &opts.golden_path,
        )
    }

    /// Starts an emulator and waits until adb reports its serial.
    ///
    /// With a fixed port, the call returns as soon as the child is
    /// launched; the busy-port probe inside the supervisor rejects a pair
    /// that stays occupied.
    pub fn run(&self, opts: &RunOptions) -> Result<StartedEmulator> {
        let span = info_span!("run", correlation_id = %self.corr(), name = %opts.name);
        let _guard = span.enter();
        Self::observed(self.run_inner(opts))
    }

    fn run_inner(&self, opts: &RunOptions) -> Result<StartedEmulator> {
        if opts.name.is_empty() {
            return Err(Error::precondition("empty AVD name"));
        }
        let _permit = self.acquire_start(&opts.name)?;
        self.ensure_not_running(&opts.name)?;

        match opts.port {
            Some(port) => {
                let launched =
                    supervisor::start_on_port(&self.env, &opts.name, port, &opts.extra_args)?;
                Ok(StartedEmulator {
                    serial: launched.serial,
                    port: launched.port,
                    log_path: launched.log_path,
                })
            }
            None => {
                discovery::ensure_adb_server(&self.env);
                let launched = supervisor::start(&self.env, &opts.name, &opts.extra_args)?;
                discovery::wait_for_serial(&self.env, &launched.serial, RUN_SERIAL_TIMEOUT)
                    .map_err(|err| err.with_log_hint(&launched.log_path))?;
                Ok(StartedEmulator {
                    serial: launched.serial,
                    port: launched.port,
                    log_path: launched.log_path,
                })
            }
        }
    }

    /// Lists running emulators from the union of the adb listing and the
    /// process-table scan.
    pub fn list_running(&self) -> Result<Vec<ProcessInfo>> {
        let span = info_span!("list_running", correlation_id = %self.corr());
        let _guard = span.enter();
        Self::observed(discovery::list_running(&self.env, self.enumerator.as_ref()))
    }

    /// Reports the named AVD's running emulator, or `NotFound`.
    pub fn status(&self, name: &str) -> Result<ProcessInfo> {
        let span = info_span!("status", correlation_id = %self.corr(), name = %name);
        let _guard = span.enter();
        let result = discovery::list_running(&self.env, self.enumerator.as_ref())
            .and_then(|running| {
                running
                    .into_iter()
                    .find(|process| process.name == name)
                    .ok_or_else(|| Error::NotFound(format!("running emulator for AVD {name}")))
            });
        Self::observed(result)
    }

    /// Stops the emulator with the given serial; idempotent.
    pub fn stop(&self, serial: &str) -> Result<()> {
        let span = info_span!("stop", correlation_id = %self.corr(), serial = %serial);
        let _guard = span.enter();
        Self::observed(stop::stop_by_serial(
            &self.env,
            self.enumerator.as_ref(),
            serial,
        ))
    }

    /// Stops the emulator running the named AVD; not running is success.
    pub fn stop_by_name(&self, name: &str) -> Result<()> {
        let span = info_span!("stop_by_name", correlation_id = %self.corr(), name = %name);
        let _guard = span.enter();
        Self::observed(stop::stop_by_name(
            &self.env,
            self.enumerator.as_ref(),
            name,
        ))
    }

    /// Deletes an AVD's directory and pointer file; idempotent.
    pub fn delete(&self, name: &str) -> Result<()> {
        let span = info_span!("delete", correlation_id = %self.corr(), name = %name);
        let _guard = span.enter();
        Self::observed(image::delete(&self.env, name))
    }

    /// Boots an AVD once and freezes the result as a golden directory.
    pub fn prewarm(&self, opts: &PrewarmOptions) -> Result<GoldenImage> {
        let span = info_span!("prewarm", correlation_id = %self.corr(), name = %opts.name);
        let _guard = span.enter();
        Self::observed(self.prewarm_inner(opts))
    }

    fn prewarm_inner(&self, opts: &PrewarmOptions) -> Result<GoldenImage> {
        let _permit = self.acquire_start(&opts.name)?;
        self.ensure_not_running(&opts.name)?;
        let dest = self.golden_destination(&opts.name, opts.destination.as_deref());
        golden::prewarm(
            &self.env,
            &opts.name,
            &dest,
            opts.extra_settle.unwrap_or(DEFAULT_EXTRA_SETTLE),
            opts.boot_timeout.unwrap_or(DEFAULT_BOOT_TIMEOUT),
        )
    }

    /// Clones from a golden, installs APKs, and reports the baked clone's
    /// userdata path and size.
    pub fn bake_apks(&self, opts: &BakeApksOptions) -> Result<(PathBuf, u64)> {
        let span = info_span!(
            "bake_apks",
            correlation_id = %self.corr(),
            base = %opts.base_name,
            clone = %opts.clone_name
        );
        let _guard = span.enter();
        Self::observed(self.bake_inner(opts))
    }

    fn bake_inner(&self, opts: &BakeApksOptions) -> Result<(PathBuf, u64)> {
        let _permit = self.acquire_start(&opts.clone_name)?;
        self.ensure_not_running(&opts.clone_name)?;
        golden::bake_apks(
            &self.env,
            &opts.base_name,
            &opts.clone_name,
            &opts.golden_path,
            &opts.apk_paths,
            opts.boot_timeout.unwrap_or(DEFAULT_BOOT_TIMEOUT),
        )
    }

    /// Waits for the OS behind `serial` to finish booting.
    pub fn wait_for_boot(&self, serial: &str, timeout: Duration) -> Result<()> {
        self.wait_for_boot_with_progress(serial, timeout, |_, _| {})
    }

    /// Boot wait with per-stage progress callbacks.
    pub fn wait_for_boot_with_progress<F>(
        &self,
        serial: &str,
        timeout: Duration,
        progress: F,
    ) -> Result<()>
    where
        F: FnMut(BootStage, Duration),
    {
        let span = info_span!("wait_for_boot", correlation_id = %self.corr(), serial = %serial);
        let _guard = span.enter();
        Self::observed(boot::wait_for_boot_with_progress(
            &self.env, serial, timeout, progress,
        ))
    }

    /// First free even console-port pair in `[start, end)`.
    pub fn find_free_port(&self, start: u16, end: u16) -> Result<u16> {
        ports::find_free_even_port(start, end)
    }

    /// Reports orphaned emulator processes and clone directories; with
    /// `force`, stops and deletes them.
    pub fn cleanup_orphans(&self, force: bool) -> Result<CleanupReport> {
        let span = info_span!("cleanup_orphans", correlation_id = %self.corr(), force = force);
        let _guard = span.enter();
        Self::observed(stop::cleanup_orphans(
            &self.env,
            self.enumerator.as_ref(),
            force,
        ))
    }

    /// Force-stops every emulator process on the host in repeated passes.
    pub fn kill_all(&self, opts: KillAllOptions) -> Result<KillAllReport> {
        let span = info_span!("kill_all", correlation_id = %self.corr());
        let _guard = span.enter();
        Self::observed(stop::kill_all_emulators(
            &self.env,
            self.enumerator.as_ref(),
            opts,
        ))
    }

    /// Starts a windowed emulator for manual customization.
    pub fn customize_start(&self, name: &str) -> Result<PathBuf> {
        let span = info_span!("customize_start", correlation_id = %self.corr(), name = %name);
        let _guard = span.enter();
        let result = (|| {
            let _permit = self.acquire_start(name)?;
            self.ensure_not_running(name)?;
            golden::customize_start(&self.env, name)
        })();
        Self::observed(result)
    }

    /// Stops a customization session and freezes the result.
    pub fn customize_finish(&self, name: &str, dest: Option<&str>) -> Result<GoldenImage> {
        let span = info_span!("customize_finish", correlation_id = %self.corr(), name = %name);
        let _guard = span.enter();
        Self::observed(golden::customize_finish(
            &self.env,
            self.enumerator.as_ref(),
            name,
            dest,
        ))
    }

    fn golden_destination(&self, name: &str, destination: Option<&str>) -> String {
        match destination.filter(|d| !d.is_empty()) {
            Some(dest) => dest.to_string(),
            None => self
                .env
                .golden_dir
                .join(name)
                .to_string_lossy()
                .into_owned(),
        }
    }
}

struct StartPermit<'a> {
    names: &'a DashMap<String, ()>,
    name: String,
}

impl Drop for StartPermit<'_> {
    fn drop(&mut self) {
        self.names.remove(&self.name);
    }
}
