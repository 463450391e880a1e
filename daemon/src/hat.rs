/// Joystick-HAT kernel module toggle.
///
/// The arcade-stick driver fights the HDMI display pipeline for GPIO pins,
/// so it runs only while no external display is attached. Load state is
/// read from the running-kernel module registry (/sys/module); modprobe is
/// invoked only on an actual state change.
use std::path::PathBuf;
use std::time::Duration;

use crate::logger::Logger;
use crate::runner::CommandRunner;

const MODPROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HatToggle {
    module: String,
    module_root: PathBuf,
}

impl HatToggle {
    pub fn new(module: String, module_root: PathBuf) -> Self {
        Self {
            module,
            module_root,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.module_root.join(&self.module).exists()
    }

    pub fn set_enabled(&self, runner: &dyn CommandRunner, log: &Logger, enable: bool) {
        let loaded = self.is_loaded();
        let result = if enable && !loaded {
            runner.run(&["modprobe", self.module.as_str()], MODPROBE_TIMEOUT)
        } else if !enable && loaded {
            runner.run(&["modprobe", "-r", self.module.as_str()], MODPROBE_TIMEOUT)
        } else {
            return;
        };

        match result {
            Ok(0) => {}
            Ok(code) => log.log(&format!("modprobe {} exit status {code}", self.module)),
            Err(e) => log.log(&format!("modprobe {} {e}", self.module)),
        }
    }
}
