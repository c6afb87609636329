//! Pure transformations over an AVD's `config.ini`.
//!
//! The emulator must cold-boot every start: sanitizing strips every
//! snapshot-, quickboot-, and data-partition-related directive and appends
//! a canonical cold-boot block. Clones additionally pin raw image mode so
//! their writable images stay full copies rather than overlays.

/// Keys (exact or prefix) removed from every sanitized configuration.
const DROPPED_KEYS: [&str; 6] = [
    "QuickBoot.mode=",
    "snapshot.present=",
    "fastboot.",
    "disk.dataPartition.",
    "userdata.useQcow2=",
    "firstboot.",
];

/// Canonical cold-boot block appended after the drop pass.
const CANONICAL_LINES: [&str; 4] = [
    "QuickBoot.mode=disabled",
    "snapshot.present=false",
    "fastboot.forceColdBoot=yes",
    "userdata.useQcow2=yes",
];

/// Rewrites a configuration so the emulator always cold-boots.
///
/// Applying the function twice yields the same result as applying it once.
pub fn sanitize_config(text: &str) -> String {
    let mut out: Vec<&str> = text
        .lines()
        .filter(|line| !DROPPED_KEYS.iter().any(|key| line.starts_with(key)))
        .collect();
    out.extend(CANONICAL_LINES);
    out.join("\n")
}

/// Pins raw image mode for a clone: replaces an existing
/// `userdata.useQcow2` line, or appends the directive when absent.
pub fn force_raw_userdata(text: &str) -> String {
    if text.contains("userdata.useQcow2") {
        text.lines()
            .map(|line| {
                if line.starts_with("userdata.useQcow2=") {
                    "userdata.useQcow2=no"
                } else {
                    line
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        format!("{}\nuserdata.useQcow2=no", text.trim_end_matches('\n'))
    }
}

/// Reads the declared sdcard size, normalized to the `<digits><M|G>` form
/// the image tools accept. Falls back to 512M when absent or unparseable.
pub fn declared_sdcard_size(text: &str) -> String {
    let declared = text
        .lines()
        .find_map(|line| line.strip_prefix("sdcard.size="))
        .map(|value| value.trim().replace(' ', "").to_uppercase())
        .unwrap_or_default();

    if declared.is_empty() || (!declared.contains('M') && !declared.contains('G')) {
        return "512M".to_string();
    }
    declared
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "hw.device.name=pixel_6\n\
        QuickBoot.mode=enabled\n\
        snapshot.present=true\n\
        fastboot.forceColdBoot=no\n\
        disk.dataPartition.size=6G\n\
        userdata.useQcow2=yes\n\
        firstboot.bootFromDownloadableSnapshot=yes\n\
        sdcard.size=512 MB\n";

    #[test]
    fn sanitize_drops_stateful_keys_and_appends_cold_boot_block() {
        let out = sanitize_config(SAMPLE);
        assert!(out.contains("hw.device.name=pixel_6"));
        assert!(out.contains("sdcard.size=512 MB"));
        assert!(!out.contains("QuickBoot.mode=enabled"));
        assert!(!out.contains("snapshot.present=true"));
        assert!(!out.contains("disk.dataPartition.size"));
        assert!(!out.contains("firstboot."));
        assert!(out.contains("QuickBoot.mode=disabled"));
        assert!(out.contains("snapshot.present=false"));
        assert!(out.contains("fastboot.forceColdBoot=yes"));
        assert!(out.ends_with("userdata.useQcow2=yes"));
    }

    #[test]
    fn sanitize_is_a_fixed_point() {
        let once = sanitize_config(SAMPLE);
        assert_eq!(sanitize_config(&once), once);
    }

    #[test]
    fn force_raw_replaces_existing_directive() {
        let out = force_raw_userdata("a=b\nuserdata.useQcow2=yes\nc=d");
        assert_eq!(out, "a=b\nuserdata.useQcow2=no\nc=d");
    }

    #[test]
    fn force_raw_appends_when_missing() {
        let out = force_raw_userdata("a=b\n");
        assert_eq!(out, "a=b\nuserdata.useQcow2=no");
    }

    #[test]
    fn sanitize_then_force_raw_pins_raw_mode() {
        let out = force_raw_userdata(&sanitize_config(SAMPLE));
        assert!(out.contains("userdata.useQcow2=no"));
        assert!(!out.contains("userdata.useQcow2=yes"));
    }

    #[test]
    fn sdcard_size_normalization() {
        assert_eq!(declared_sdcard_size("sdcard.size=512 MB\n"), "512MB");
        assert_eq!(declared_sdcard_size("sdcard.size=1G\n"), "1G");
        assert_eq!(declared_sdcard_size("sdcard.size=12345\n"), "512M");
        assert_eq!(declared_sdcard_size("hw.ramSize=2048\n"), "512M");
    }
}
