/// Display-compositor process supervision.
///
/// The compositor must always be alive and running with the exact expected
/// argv. Two ownership modes:
///   - `SelfManaged`: this daemon spawns, terminates and restarts the
///     process directly (SIGTERM, bounded wait, SIGKILL for survivors).
///   - `ExternallyManaged`: a systemd unit owns the process; when it is
///     down we ask systemd to start it on a 10 s cooldown, and after six
///     consecutive failed attempts we permanently take over.
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, Signal, System};

use crate::debounce::Cadence;
use crate::logger::Logger;
use crate::runner::{CmdError, CommandRunner};

/// Setting this to `1` forces externally-managed mode regardless of unit
/// detection.
pub const EXTERNAL_MANAGER_ENV: &str = "GBZ_EXTERNAL_FBCP";

const EXTERNAL_FAILURE_THRESHOLD: u32 = 6;
const EXTERNAL_RETRY_PERIOD: Duration = Duration::from_secs(10);
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(2);
const UNIT_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Graceful-exit window: 10 polls of 100 ms each.
const TERM_WAIT_POLLS: u32 = 10;
const TERM_WAIT_SLICE: Duration = Duration::from_millis(100);
/// Pause after SIGKILL before respawning.
const KILL_SETTLE: Duration = Duration::from_millis(100);
/// Pause after a spawn so the SPI/DMA pipeline can reinitialize before the
/// next hardware operation.
const SPAWN_SETTLE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionMode {
    SelfManaged,
    ExternallyManaged,
}

/// The one correct invocation of the managed process.
#[derive(Debug, Clone)]
pub struct ManagedProcessSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
}

impl ManagedProcessSpec {
    pub fn base_name(&self) -> &OsStr {
        self.path.file_name().unwrap_or_else(|| self.path.as_os_str())
    }
}

/// True when `cmd` is the expected invocation: either the exact argv, or
/// the same argv with an argv[0] that resolves (through symlinks) to the
/// same real file as the expected path.
pub fn argv_matches(spec: &ManagedProcessSpec, cmd: &[OsString]) -> bool {
    let Some((argv0, rest)) = cmd.split_first() else {
        return false;
    };
    let args_match = rest.len() == spec.args.len()
        && rest
            .iter()
            .zip(&spec.args)
            .all(|(got, want)| got.as_os_str() == OsStr::new(want));
    if !args_match {
        return false;
    }
    if Path::new(argv0) == spec.path {
        return true;
    }
    matches!(
        (std::fs::canonicalize(argv0), std::fs::canonicalize(&spec.path)),
        (Ok(a), Ok(b)) if a == b
    )
}

/// Determines who owns the compositor at startup. The environment override
/// wins outright; otherwise a unit file present in any unit directory that
/// systemd reports enabled or active means an external manager owns it.
pub fn detect_mode(
    runner: &dyn CommandRunner,
    unit: &str,
    env_override: bool,
    unit_dirs: &[PathBuf],
) -> SupervisionMode {
    if env_override {
        return SupervisionMode::ExternallyManaged;
    }
    for dir in unit_dirs {
        if !dir.join(unit).exists() {
            continue;
        }
        for query in ["is-enabled", "is-active"] {
            if let Ok(0) = runner.run(&["systemctl", query, unit], UNIT_QUERY_TIMEOUT) {
                return SupervisionMode::ExternallyManaged;
            }
        }
    }
    SupervisionMode::SelfManaged
}

/// A process that has exited but not yet been reaped still has a process
/// table entry; it must not count as a running compositor.
fn is_live(p: &Process) -> bool {
    !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

pub fn env_override_set() -> bool {
    std::env::var(EXTERNAL_MANAGER_ENV)
        .map(|v| v.trim() == "1")
        .unwrap_or(false)
}

pub struct Supervisor {
    spec: ManagedProcessSpec,
    unit: String,
    early_unit: String,
    mode: SupervisionMode,
    external_failures: u32,
    external_retry: Cadence,
    system: System,
    children: Vec<Child>,
}

impl Supervisor {
    pub fn new(
        spec: ManagedProcessSpec,
        unit: String,
        early_unit: String,
        mode: SupervisionMode,
    ) -> Self {
        Self {
            spec,
            unit,
            early_unit,
            mode,
            external_failures: 0,
            external_retry: Cadence::new(EXTERNAL_RETRY_PERIOD),
            system: System::new(),
            children: Vec::new(),
        }
    }

    pub fn mode(&self) -> SupervisionMode {
        self.mode
    }

    fn base_name(&self) -> String {
        self.spec.base_name().to_string_lossy().into_owned()
    }

    /// Waits on any of our own spawned children that have exited, so they
    /// leave the process table instead of lingering as zombies.
    fn reap_children(&mut self) {
        self.children
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));
    }

    /// Current live pids of the managed executable, by base name.
    fn refresh_pids(&mut self) -> Vec<Pid> {
        self.reap_children();
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let pids: Vec<Pid> = self
            .system
            .processes_by_exact_name(self.spec.base_name())
            .filter(|p| is_live(p))
            .map(|p| p.pid())
            .collect();
        pids
    }

    pub fn is_running(&mut self) -> bool {
        !self.refresh_pids().is_empty()
    }

    /// True when some running instance was started with the expected argv
    /// (tolerating a symlinked executable path).
    pub fn matches_expected_invocation(&mut self) -> bool {
        self.reap_children();
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let matched = self
            .system
            .processes_by_exact_name(self.spec.base_name())
            .any(|p| is_live(p) && argv_matches(&self.spec, p.cmd()));
        matched
    }

    /// Brings the process up if it is missing. Never kills a running
    /// instance, even one with mismatched args: an unnecessary restart
    /// blanks the panel.
    pub fn ensure_running(&mut self, log: &Logger) {
        if self.is_running() {
            return;
        }
        log.log(&format!("{} not running; starting", self.base_name()));
        self.spawn(log);
    }

    /// Full restart: stop the early-boot unit, SIGTERM every instance, wait
    /// up to one second, SIGKILL the survivors, then spawn fresh.
    pub fn restart(&mut self, runner: &dyn CommandRunner, log: &Logger) {
        self.stop_early_boot(runner, log);

        let pids = self.refresh_pids();
        for pid in &pids {
            if let Some(p) = self.system.process(*pid) {
                p.kill_with(Signal::Term);
            }
        }

        let mut survivors = pids;
        let mut exited_in_time = survivors.is_empty();
        if !exited_in_time {
            for _ in 0..TERM_WAIT_POLLS {
                self.reap_children();
                self.system
                    .refresh_processes(ProcessesToUpdate::Some(&survivors), true);
                survivors.retain(|pid| self.system.process(*pid).is_some_and(is_live));
                if survivors.is_empty() {
                    exited_in_time = true;
                    break;
                }
                std::thread::sleep(TERM_WAIT_SLICE);
            }
        }

        // Force-kill only when the graceful window elapsed in full.
        if !exited_in_time {
            log.log(&format!(
                "{} survivors after SIGTERM: {}; sending SIGKILL",
                self.base_name(),
                survivors.len()
            ));
            for pid in &survivors {
                if let Some(p) = self.system.process(*pid) {
                    p.kill_with(Signal::Kill);
                }
            }
            std::thread::sleep(KILL_SETTLE);
        }

        self.spawn(log);
    }

    fn spawn(&mut self, log: &Logger) {
        match Command::new(&self.spec.path)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                // Keep the handle so the child can be reaped once it exits.
                self.children.push(child);
                std::thread::sleep(SPAWN_SETTLE);
            }
            Err(e) => log.log(&format!("failed to start {}: {e}", self.base_name())),
        }
    }

    /// Stops the boot-time compositor unit, tolerating its absence.
    pub fn stop_early_boot(&self, runner: &dyn CommandRunner, log: &Logger) {
        match runner.run(
            &["systemctl", "stop", &self.early_unit],
            SYSTEMCTL_TIMEOUT,
        ) {
            Ok(_) => {}
            Err(CmdError::Timeout) => {
                log.log(&format!("systemctl stop {} timed out", self.early_unit));
            }
            Err(CmdError::NotFound) => {}
            Err(e) => log.log(&format!("systemctl stop {} error: {e}", self.early_unit)),
        }
    }

    fn start_unit(&self, runner: &dyn CommandRunner, log: &Logger) {
        if let Err(e) = runner.run(&["systemctl", "start", &self.unit], SYSTEMCTL_TIMEOUT) {
            log.log(&format!("failed to start {}: {e}", self.unit));
        }
    }

    /// One-time ownership handling at daemon startup.
    pub fn startup(&mut self, runner: &dyn CommandRunner, log: &Logger) {
        match self.mode {
            SupervisionMode::SelfManaged => {
                self.stop_early_boot(runner, log);
                if !self.is_running() {
                    log.log(&format!(
                        "{} not running at startup; starting",
                        self.base_name()
                    ));
                    self.ensure_running(log);
                } else if !self.matches_expected_invocation() {
                    log.log(&format!(
                        "{} args mismatch at startup; restarting",
                        self.base_name()
                    ));
                    self.restart(runner, log);
                } else {
                    log.log(&format!(
                        "{} already running with expected args",
                        self.base_name()
                    ));
                }
            }
            SupervisionMode::ExternallyManaged => {
                log.log(&format!(
                    "external manager detected; hotplugd will not manage {}",
                    self.base_name()
                ));
                if !self.is_running() {
                    log.log(&format!(
                        "{} not running; attempting to start {}",
                        self.base_name(),
                        self.unit
                    ));
                    self.start_unit(runner, log);
                }
            }
        }
    }

    /// Externally-managed recovery, called every loop iteration. Attempts a
    /// unit start at most every 10 s while the process is down; six failed
    /// attempts in a row demote the supervisor to direct management for the
    /// rest of the run.
    pub fn external_recovery(&mut self, runner: &dyn CommandRunner, log: &Logger, now: Instant) {
        if self.mode != SupervisionMode::ExternallyManaged || self.is_running() {
            return;
        }
        if !self.external_retry.due(now) {
            return;
        }
        log.log(&format!(
            "{} not running; asking systemd to start {}",
            self.base_name(),
            self.unit
        ));
        self.start_unit(runner, log);

        let came_up = self.is_running();
        if self.record_external_attempt(came_up) {
            log.log(&format!(
                "{} did not bring up {}; falling back to direct management",
                self.unit,
                self.base_name()
            ));
            self.ensure_running(log);
        }
    }

    /// Tracks consecutive external-start failures; returns true exactly
    /// when the failure threshold demotes us to `SelfManaged`.
    fn record_external_attempt(&mut self, came_up: bool) -> bool {
        if came_up {
            self.external_failures = 0;
            return false;
        }
        self.external_failures += 1;
        if self.external_failures >= EXTERNAL_FAILURE_THRESHOLD
            && self.mode == SupervisionMode::ExternallyManaged
        {
            self.mode = SupervisionMode::SelfManaged;
            return true;
        }
        false
    }
}
