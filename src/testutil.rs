use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::env::{CancelHandle, Env};

/// Builds an environment rooted in a temp directory, with every tool
/// pointed at a no-op stub so nothing reaches a real SDK.
pub(crate) fn test_env(root: &Path) -> Env {
    let avd_home = root.join("avd");
    fs::create_dir_all(&avd_home).unwrap();
    let adb = root.join("adb");
    write_stub(&adb, "#!/bin/sh\nexit 0\n");

    Env {
        sdk_root: None,
        avd_home,
        golden_dir: root.join("golden"),
        clones_dir: root.join("clones"),
        config_template: None,
        emulator: PathBuf::from("/bin/true"),
        adb,
        avdmanager: PathBuf::from("/bin/true"),
        sdkmanager: PathBuf::from("/bin/true"),
        qemu_img: PathBuf::from("/bin/true"),
        correlation_id: None,
        cancel: CancelHandle::new(),
    }
}

/// Writes an executable shell script, replacing any previous stub.
pub(crate) fn write_stub(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Creates a minimal base AVD directory with a config and a few read-only
/// artifacts worth symlinking.
pub(crate) fn make_base_avd(env: &Env, name: &str) {
    let dir = env.avd_dir(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("config.ini"),
        "hw.device.name=pixel_6\nsdcard.size=512M\n",
    )
    .unwrap();
    fs::write(dir.join("kernel-ranchu"), "kernel-bits").unwrap();
    fs::create_dir_all(dir.join("data")).unwrap();
    fs::write(dir.join("data").join("misc.bin"), "misc").unwrap();
    fs::write(dir.join("userdata-qemu.img"), "base-userdata").unwrap();
    fs::write(dir.join("multiinstance.lock"), "").unwrap();
}

/// Creates a golden directory populated with every writable image.
pub(crate) fn make_golden_dir(root: &Path) -> PathBuf {
    let dir = root.join("golden-src");
    fs::create_dir_all(&dir).unwrap();
    for (index, name) in crate::image::WRITABLE_IMAGES.iter().enumerate() {
        fs::write(dir.join(name), format!("golden-data-{index}")).unwrap();
    }
    dir
}
