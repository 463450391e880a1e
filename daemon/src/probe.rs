/// HDMI presence detection.
///
/// Two mutually exclusive backends:
///   1. KMS: per-connector `status` files under /sys/class/drm. Used
///      whenever at least one HDMI connector exposes a status file, even if
///      every file currently reads a transitional value — presence of the
///      files is a capability test, not a value test.
///   2. Legacy FKMS/DispmanX: `tvservice -d` dumps the EDID block to a
///      scratch file; a populated block (>= 128 bytes) means a sink is
///      attached. Only reached when no status files exist at all.
use std::path::PathBuf;
use std::time::Duration;

use crate::logger::Logger;
use crate::runner::{CmdError, CommandRunner};

/// Minimum EDID dump size accepted as "a display answered".
const EDID_MIN_BYTES: u64 = 128;

const TVSERVICE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct DisplayProbe {
    drm_root: PathBuf,
    tvservice: PathBuf,
}

impl DisplayProbe {
    pub fn new(drm_root: PathBuf) -> Self {
        Self {
            drm_root,
            tvservice: PathBuf::from("/usr/bin/tvservice"),
        }
    }

    #[cfg(test)]
    fn with_tvservice(drm_root: PathBuf, tvservice: PathBuf) -> Self {
        Self { drm_root, tvservice }
    }

    pub fn is_connected(&self, runner: &dyn CommandRunner, log: &Logger) -> bool {
        let status_files = self.hdmi_status_files();
        if !status_files.is_empty() {
            return kms_connected(&status_files);
        }
        self.legacy_edid_present(runner, log)
    }

    /// `status` files of HDMI-class connectors: card*-HDMI-A-*/status.
    fn hdmi_status_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.drm_root) else {
            return files;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("card") && name.contains("-HDMI-A-") {
                let status = entry.path().join("status");
                if status.exists() {
                    files.push(status);
                }
            }
        }
        files
    }

    fn legacy_edid_present(&self, runner: &dyn CommandRunner, log: &Logger) -> bool {
        let tmp = match tempfile::NamedTempFile::new() {
            Ok(t) => t,
            Err(e) => {
                log.log(&format!("edid scratch file error: {e}"));
                return false;
            }
        };
        let tmp_path = tmp.path().to_string_lossy().into_owned();
        let tvservice = self.tvservice.to_string_lossy();
        let argv = [tvservice.as_ref(), "-d", tmp_path.as_str()];

        match runner.run(&argv, TVSERVICE_TIMEOUT) {
            Ok(0) => std::fs::metadata(tmp.path())
                .map(|m| m.len() >= EDID_MIN_BYTES)
                .unwrap_or(false),
            Ok(_) => false,
            // A hung tvservice means the firmware side is wedged; report
            // disconnected rather than falling back anywhere.
            Err(CmdError::Timeout) => false,
            Err(CmdError::NotFound) => false,
            Err(e) => {
                log.log(&format!("tvservice error: {e}"));
                false
            }
        }
    }
}

fn kms_connected(status_files: &[PathBuf]) -> bool {
    status_files.iter().any(|p| {
        std::fs::read_to_string(p)
            .map(|s| s.trim() == "connected")
            .unwrap_or(false)
    })
}
