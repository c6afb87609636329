//! On-disk AVD layout: base directories, golden directories, and clones.
//!
//! This module is the only writer under the AVD home. A clone's writable
//! images are full byte copies of a golden directory's raw images; its
//! read-only artifacts are symlinks into the base AVD so many clones can
//! share one set of system images.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::config;
use crate::env::{absolute, Env};
use crate::error::{Error, IoContext, Result};
use crate::exec;

/// Writable image filenames copied between an AVD, a golden directory, and
/// a clone. The set is part of the on-disk contract.
pub const WRITABLE_IMAGES: [&str; 4] = [
    "userdata-qemu.img",
    "encryptionkey.img",
    "cache.img",
    "sdcard.img",
];

/// Marker written into every clone directory; orphan cleanup keys on it to
/// tell clones apart from hand-built AVDs.
pub const CLONE_MARKER: &str = ".clone-origin";

/// An AVD's on-disk identity: its directory plus the userdata image that
/// dominates its footprint.
#[derive(Clone, Debug, Serialize)]
pub struct AvdInfo {
    pub name: String,
    pub path: PathBuf,
    pub userdata: PathBuf,
    pub size_bytes: u64,
}

/// A saved golden directory and the total size of its raw images.
#[derive(Clone, Debug, Serialize)]
pub struct GoldenImage {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Lists every `<name>.avd` directory under the AVD home.
pub fn list(env: &Env) -> Result<Vec<AvdInfo>> {
    let entries = match fs::read_dir(&env.avd_home) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(Error::io(
                format!("reading AVD home {}", env.avd_home.display()),
                err,
            ))
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.io_context(|| format!("reading AVD home {}", env.avd_home.display()))?;
        if !entry.path().is_dir() {
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
        out.push(info_of(env, &name));
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Best-effort identity lookup. The userdata path prefers the overlay
/// variant, then the raw copy, then the legacy name; a missing file is
/// reported with size zero rather than an error.
pub fn info_of(env: &Env, name: &str) -> AvdInfo {
    let dir = env.avd_dir(name);
    let candidates = [
        dir.join("userdata-qemu.img.qcow2"),
        dir.join("userdata-qemu.img"),
        dir.join("userdata.img"),
    ];
    for candidate in &candidates {
        if let Ok(meta) = fs::metadata(candidate) {
            return AvdInfo {
                name: name.to_string(),
                path: dir.clone(),
                userdata: candidate.clone(),
                size_bytes: meta.len(),
            };
        }
    }
    AvdInfo {
        name: name.to_string(),
        userdata: dir.join("userdata-qemu.img"),
        path: dir,
        size_bytes: 0,
    }
}

fn ensure_system_image(env: &Env, package: &str) -> Result<()> {
    if let Some(sdk) = &env.sdk_root {
        let parts: Vec<&str> = package.split(';').collect();
        if parts.len() >= 3 {
            let probe = sdk
                .join("system-images")
                .join(parts[1])
                .join(parts[2])
                .join("x86_64");
            if probe.exists() {
                return Ok(());
            }
        }
    }
    // License acceptance is best-effort; the install reports real failures.
    let _ = exec::run_tool(env, &env.sdkmanager, &["--licenses"]);
    exec::run_tool(env, &env.sdkmanager, &[package]).map(|_| ())
}

/// Creates a base AVD, installing the system image package first when the
/// SDK probe misses it.
pub fn init_base(env: &Env, name: &str, system_image: &str, device: &str) -> Result<AvdInfo> {
    if name.is_empty() {
        return Err(Error::precondition("empty AVD name"));
    }
    fs::create_dir_all(&env.avd_home)
        .io_context(|| format!("creating AVD home {}", env.avd_home.display()))?;
    ensure_system_image(env, system_image)?;

    // avdmanager prompts for a custom hardware profile; always decline.
    exec::run_tool_with_stdin(
        env,
        &env.avdmanager,
        &[
            "create",
            "avd",
            "-n",
            name,
            "-k",
            system_image,
            "-d",
            device,
            "--force",
        ],
        "no\n",
    )?;
    Ok(info_of(env, name))
}

/// Strips the legacy overlay suffix so old single-file destinations land
/// on the directory that replaced them.
fn golden_dir_of(dest: &str) -> PathBuf {
    match dest.strip_suffix(".qcow2") {
        Some(stripped) => PathBuf::from(stripped),
        None => PathBuf::from(dest),
    }
}

/// Exports an AVD's writable images into a golden directory as raw images.
///
/// Overlay variants are preferred as sources (they hold the
/// customizations); conversion goes through a temp file and an atomic
/// rename so a crash never leaves a half-written golden image in place.
pub fn save_golden(env: &Env, name: &str, dest: &str) -> Result<GoldenImage> {
    if name.is_empty() {
        return Err(Error::precondition("empty AVD name"));
    }
    let avd_dir = env.avd_dir(name);
    let golden_dir = golden_dir_of(dest);
    fs::create_dir_all(&golden_dir)
        .io_context(|| format!("creating golden directory {}", golden_dir.display()))?;

    info!(
        target: "avdpool",
        "save_golden: exporting {} into {}",
        name,
        golden_dir.display()
    );

    let mut total = 0u64;
    for image in WRITABLE_IMAGES {
        let overlay = avd_dir.join(format!("{image}.qcow2"));
        let source = if overlay.exists() {
            overlay
        } else {
            let raw = avd_dir.join(image);
            if !raw.exists() {
                continue;
            }
            raw
        };

        let dst = golden_dir.join(image);
        let tmp = golden_dir.join(format!("{image}.tmp"));
        let source_arg = source.to_string_lossy().into_owned();
        let tmp_arg = tmp.to_string_lossy().into_owned();
        exec::run_tool(
            env,
            &env.qemu_img,
            &["convert", "-O", "raw", &source_arg, &tmp_arg],
        )?;
        fs::rename(&tmp, &dst)
            .io_context(|| format!("moving {} into place", dst.display()))?;
        if let Ok(meta) = fs::metadata(&dst) {
            total += meta.len();
        }
    }

    info!(
        target: "avdpool",
        "save_golden: {} exported ({} bytes)",
        name,
        total
    );
    Ok(GoldenImage {
        path: golden_dir,
        size_bytes: total,
    })
}

/// Creates a clone of `base` whose writable images are byte copies of the
/// golden directory's raw images.
pub fn clone_from_golden(env: &Env, base: &str, name: &str, golden: &str) -> Result<AvdInfo> {
    info!(
        target: "avdpool",
        "clone_from_golden: start base={} clone={} golden={}",
        base,
        name,
        golden
    );
    if name.is_empty() {
        return Err(Error::precondition("empty clone name"));
    }
    let base_dir = absolute(&env.avd_dir(base))?;
    let clone_dir = absolute(&env.avd_dir(name))?;
    if !base_dir.exists() {
        return Err(Error::precondition(format!(
            "base AVD {base} not found at {}",
            base_dir.display()
        )));
    }
    fs::create_dir_all(&clone_dir)
        .io_context(|| format!("creating clone directory {}", clone_dir.display()))?;

    let golden_dir = absolute(&golden_dir_of(golden))?;

    // Configuration: template wins over the base's config, both sanitized,
    // and the clone always runs raw images.
    let config_text = match &env.config_template {
        Some(template) => fs::read_to_string(template)
            .io_context(|| format!("reading config template {}", template.display()))?,
        None => {
            let base_config = base_dir.join("config.ini");
            fs::read_to_string(&base_config)
                .io_context(|| format!("reading base config {}", base_config.display()))?
        }
    };
    let config_text = config::force_raw_userdata(&config::sanitize_config(&config_text));
    let clone_config = clone_dir.join("config.ini");
    fs::write(&clone_config, format!("{config_text}\n"))
        .io_context(|| format!("writing clone config {}", clone_config.display()))?;

    link_read_only_entries(&base_dir, &base_dir, &clone_dir)?;

    for image in WRITABLE_IMAGES {
        let golden_file = golden_dir.join(image);
        if !golden_file.exists() {
            if image == "sdcard.img" {
                create_sdcard(env, &clone_dir, &clone_config)?;
            }
            continue;
        }
        copy_image(&golden_file, &clone_dir.join(image))?;
    }

    // A stray snapshot tree or overlay file would defeat the raw-copy
    // isolation; scrub both.
    let _ = fs::remove_dir_all(clone_dir.join("snapshots"));
    if let Ok(entries) = fs::read_dir(&clone_dir) {
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_string_lossy()
                .ends_with(".qcow2")
            {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    let marker = clone_dir.join(CLONE_MARKER);
    fs::write(
        &marker,
        format!("base={base}\ngolden={}\n", golden_dir.display()),
    )
    .io_context(|| format!("writing clone marker {}", marker.display()))?;

    let ini = env.ini_path(name);
    let body = format!(
        "avd.ini.encoding=UTF-8\npath={}\npath.rel=avd/{name}.avd\n",
        clone_dir.display()
    );
    fs::write(&ini, body).io_context(|| format!("writing pointer file {}", ini.display()))?;

    let userdata = clone_dir.join("userdata-qemu.img");
    let (userdata, meta) = match fs::metadata(&userdata) {
        Ok(meta) => (userdata, meta),
        Err(_) => {
            let overlay = clone_dir.join("userdata-qemu.img.qcow2");
            let meta = fs::metadata(&overlay)
                .io_context(|| format!("stat userdata for clone {name}"))?;
            (overlay, meta)
        }
    };

    info!(
        target: "avdpool",
        "clone_from_golden: finished clone={} path={} size_bytes={}",
        name,
        clone_dir.display(),
        meta.len()
    );
    Ok(AvdInfo {
        name: name.to_string(),
        path: clone_dir,
        userdata,
        size_bytes: meta.len(),
    })
}

/// Mirrors the base directory into the clone: subdirectories are created,
/// everything else becomes a symlink to the base entry's absolute path.
/// Writable state (snapshots, cache/userdata/encryptionkey files, the
/// config itself, lock files) is skipped.
fn link_read_only_entries(dir: &Path, base_root: &Path, clone_root: &Path) -> Result<()> {
    let entries =
        fs::read_dir(dir).io_context(|| format!("reading base directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry.io_context(|| format!("reading base directory {}", dir.display()))?;
        let path = entry.path();
        let rel = path
            .strip_prefix(base_root)
            .expect("walk stays under the base root");
        let rel_str = rel.to_string_lossy();
        if rel_str.starts_with("snapshots")
            || rel_str.starts_with("cache")
            || rel_str.starts_with("userdata")
            || rel_str.starts_with("encryptionkey")
            || rel_str == "config.ini"
            || rel_str.ends_with(".lock")
        {
            continue;
        }

        let dst = clone_root.join(rel);
        let file_type = entry
            .file_type()
            .io_context(|| format!("inspecting {}", path.display()))?;
        if file_type.is_dir() {
            fs::create_dir_all(&dst)
                .io_context(|| format!("creating directory {}", dst.display()))?;
            link_read_only_entries(&path, base_root, clone_root)?;
        } else if let Err(err) = symlink(&path, &dst) {
            // A re-clone finds its own links from the previous run.
            if err.kind() != io::ErrorKind::AlreadyExists {
                return Err(Error::io(format!("linking {}", dst.display()), err));
            }
        }
    }
    Ok(())
}

/// Streamed copy; golden images are multi-gigabyte and must never be
/// buffered whole.
fn copy_image(source: &Path, dst: &Path) -> Result<()> {
    debug!(
        target: "avdpool",
        "copy_image: {} -> {}",
        source.display(),
        dst.display()
    );
    let mut reader =
        File::open(source).io_context(|| format!("opening golden image {}", source.display()))?;
    let mut writer = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(dst)
        .io_context(|| format!("creating clone image {}", dst.display()))?;
    io::copy(&mut reader, &mut writer)
        .io_context(|| format!("copying {}", source.display()))?;
    Ok(())
}

/// Synthesizes an sdcard image sized from the clone's configuration,
/// preferring the SDK's `mksdcard`, falling back to a raw allocation.
fn create_sdcard(env: &Env, avd_dir: &Path, config_path: &Path) -> Result<()> {
    let config_text = fs::read_to_string(config_path)
        .io_context(|| format!("reading {}", config_path.display()))?;
    let size = config::declared_sdcard_size(&config_text);
    let sdcard = avd_dir.join("sdcard.img");
    let sdcard_arg = sdcard.to_string_lossy().into_owned();

    if let Some(sdk) = &env.sdk_root {
        let mksdcard = sdk.join("emulator").join("mksdcard");
        if mksdcard.exists() {
            return exec::run_tool(env, &mksdcard, &[size.as_str(), sdcard_arg.as_str()])
                .map(|_| ());
        }
    }
    exec::run_tool(
        env,
        &env.qemu_img,
        &["create", "-f", "raw", &sdcard_arg, &size],
    )
    .map(|_| ())
}

/// Removes an AVD's directory and pointer file. Each removal is
/// independent and a missing target is not an error, so repeated deletes
/// succeed.
pub fn delete(env: &Env, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::precondition("empty AVD name"));
    }
    let _ = fs::remove_dir_all(env.avd_dir(name));
    let _ = fs::remove_file(env.ini_path(name));
    Ok(())
}
