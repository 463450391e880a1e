/// Canonical file paths for hotplugd on the device image.
///
/// Everything here is a fixed, well-known location:
///   - hotplugd.toml   Optional settings overrides, read once at startup.
///   - hotplugd.lock   Singleton lock file holding the daemon pid.
///   - hotplugd.log    Append-only log, mirrored to stdout.
use std::path::PathBuf;

pub const SETTINGS_FILE: &str = "/etc/hotplugd.toml";
pub const LOCK_FILE: &str = "/tmp/hotplugd.lock";
pub const LOG_FILE: &str = "/var/log/hotplugd.log";

/// DRM connector class directory scanned by the primary HDMI probe.
pub const DRM_CLASS_DIR: &str = "/sys/class/drm";

/// Running-kernel module registry checked by the joystick toggle.
pub const MODULE_DIR: &str = "/sys/module";

/// ALSA device node that must appear before mixer controls can be set.
pub const SND_DEV: &str = "/dev/snd";

/// Directories searched for a systemd unit file governing the compositor.
pub const UNIT_DIRS: [&str; 3] = [
    "/etc/systemd/system",
    "/lib/systemd/system",
    "/usr/lib/systemd/system",
];

pub fn settings_file() -> PathBuf {
    PathBuf::from(SETTINGS_FILE)
}

pub fn lock_file() -> PathBuf {
    PathBuf::from(LOCK_FILE)
}

pub fn log_file() -> PathBuf {
    PathBuf::from(LOG_FILE)
}

pub fn unit_dirs() -> Vec<PathBuf> {
    UNIT_DIRS.iter().map(PathBuf::from).collect()
}
