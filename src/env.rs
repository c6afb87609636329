use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Cooperative cancellation flag shared between a caller and the polling
/// loops inside long-running operations.
///
/// Cloning the handle shares the underlying flag. Loops call
/// [`CancelHandle::checkpoint`] at each poll boundary; once the flag is
/// fired the next boundary returns [`Error::Cancelled`] without issuing
/// further subprocess calls.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Immutable per-request bag of tool paths, storage roots, and request
/// identity. Operations never read ambient process state after an `Env`
/// has been built.
#[derive(Clone, Debug)]
pub struct Env {
    /// Android SDK root, when known. Used to probe installed system images
    /// and to locate `mksdcard`.
    pub sdk_root: Option<PathBuf>,
    /// Directory holding `<name>.avd` directories and `<name>.ini` pointers.
    pub avd_home: PathBuf,
    /// Default destination root for golden directories.
    pub golden_dir: PathBuf,
    /// Default destination root for clones.
    pub clones_dir: PathBuf,
    /// Optional config.ini template applied to clones instead of the base's.
    pub config_template: Option<PathBuf>,
    pub emulator: PathBuf,
    pub adb: PathBuf,
    pub avdmanager: PathBuf,
    pub sdkmanager: PathBuf,
    pub qemu_img: PathBuf,
    /// Ties log events and spans to a caller workflow.
    pub correlation_id: Option<String>,
    pub cancel: CancelHandle,
}

impl Env {
    /// Builds an environment from host variables with fixed fallbacks.
    ///
    /// Tools default to bare names and are resolved through `PATH` by the
    /// invoking shell. Detection never fails; a missing `HOME` degrades to
    /// the current directory.
    pub fn detect() -> Self {
        let home = home_dir();
        Env {
            sdk_root: path_var("ANDROID_SDK_ROOT"),
            avd_home: path_var("ANDROID_AVD_HOME")
                .unwrap_or_else(|| home.join(".android").join("avd")),
            golden_dir: path_var("AVDPOOL_GOLDEN_DIR").unwrap_or_else(|| home.join("avd-golden")),
            clones_dir: path_var("AVDPOOL_CLONES_DIR").unwrap_or_else(|| home.join("avd-clones")),
            config_template: path_var("AVDPOOL_CONFIG_TEMPLATE"),
            emulator: PathBuf::from("emulator"),
            adb: PathBuf::from("adb"),
            avdmanager: PathBuf::from("avdmanager"),
            sdkmanager: PathBuf::from("sdkmanager"),
            qemu_img: PathBuf::from("qemu-img"),
            correlation_id: string_var("AVDPOOL_CORRELATION_ID"),
            cancel: CancelHandle::new(),
        }
    }

    pub fn avd_dir(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.avd"))
    }

    pub fn ini_path(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.ini"))
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn path_var(key: &str) -> Option<PathBuf> {
    env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn string_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Returns `path` unchanged when absolute, otherwise anchored at the
/// current working directory.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        use crate::error::IoContext;
        Ok(env::current_dir()
            .io_context(|| format!("resolving {} against the working directory", path.display()))?
            .join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avd_paths_follow_the_home_layout() {
        let env = Env {
            avd_home: PathBuf::from("/data/avd"),
            ..Env::detect()
        };
        assert_eq!(env.avd_dir("w-acme"), PathBuf::from("/data/avd/w-acme.avd"));
        assert_eq!(env.ini_path("w-acme"), PathBuf::from("/data/avd/w-acme.ini"));
    }

    #[test]
    fn cancel_handle_trips_checkpoints() {
        let cancel = CancelHandle::new();
        assert!(cancel.checkpoint().is_ok());

        let shared = cancel.clone();
        shared.cancel();
        assert!(cancel.is_cancelled());
        assert!(matches!(cancel.checkpoint(), Err(Error::Cancelled)));
    }

    #[test]
    fn absolute_keeps_absolute_paths() {
        let path = Path::new("/g/base-a35");
        assert_eq!(absolute(path).unwrap(), PathBuf::from("/g/base-a35"));

        let relative = absolute(Path::new("golden")).unwrap();
        assert!(relative.is_absolute());
        assert!(relative.ends_with("golden"));
    }
}
