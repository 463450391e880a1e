mod audio;
mod config;
mod debounce;
mod hat;
mod lock;
mod logger;
mod paths;
mod probe;
mod runner;
mod supervisor;

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::audio::{AudioProfile, AudioRouter};
use crate::debounce::{Cadence, Debounce, Transition, DEBOUNCE_POLLS};
use crate::hat::HatToggle;
use crate::logger::Logger;
use crate::probe::DisplayProbe;
use crate::runner::SystemRunner;
use crate::supervisor::{ManagedProcessSpec, SupervisionMode, Supervisor};

const POLL_DELAY: Duration = Duration::from_secs(2);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
const ERROR_COOLDOWN: Duration = Duration::from_secs(1);
const SND_WAIT: Duration = Duration::from_secs(20);

/// Everything the control loop mutates, threaded explicitly instead of
/// living in globals.
struct Daemon {
    logger: Arc<Logger>,
    runner: SystemRunner,
    probe: DisplayProbe,
    audio: AudioRouter,
    hat: HatToggle,
    supervisor: Supervisor,
    debounce: Debounce,
    heartbeat: Cadence,
}

impl Daemon {
    /// One control-loop iteration: heartbeat, recovery, liveness, poll,
    /// debounced side effects — in that fixed order.
    fn tick(&mut self) {
        let now = Instant::now();

        if self.heartbeat.due(now) {
            let running = self.supervisor.is_running();
            let hdmi = self.probe.is_connected(&self.runner, &self.logger);
            self.logger.log(&format!(
                "heartbeat compositor_running={running} hdmi={hdmi} last_applied={:?}",
                self.debounce.applied()
            ));
        }

        self.supervisor
            .external_recovery(&self.runner, &self.logger, now);

        // If something else killed the compositor, bring it back.
        if self.supervisor.mode() == SupervisionMode::SelfManaged
            && !self.supervisor.is_running()
        {
            self.logger.log("compositor not running; restarting");
            self.supervisor.restart(&self.runner, &self.logger);
        }

        let raw = self.probe.is_connected(&self.runner, &self.logger);
        if let Some(transition) = self.debounce.observe(raw) {
            self.apply_transition(transition);
        }
    }

    fn apply_transition(&mut self, transition: Transition) {
        self.logger.log(&format!(
            "HDMI {} - reconfiguring",
            if transition.connected {
                "connected"
            } else {
                "disconnected"
            }
        ));

        let profile = if transition.connected {
            AudioProfile::Hdmi
        } else {
            AudioProfile::Headphone
        };
        let t0 = Instant::now();
        self.audio.route(&self.runner, &self.logger, profile);
        self.logger
            .log(&format!("audio route took {:.2}s", t0.elapsed().as_secs_f64()));

        self.hat
            .set_enabled(&self.runner, &self.logger, !transition.connected);

        // On the first applied reading the compositor was already handled
        // during startup; restarting it again would blank the panel.
        if self.supervisor.mode() == SupervisionMode::SelfManaged && !transition.first {
            let t1 = Instant::now();
            self.supervisor.restart(&self.runner, &self.logger);
            self.logger.log(&format!(
                "compositor restart took {:.2}s",
                t1.elapsed().as_secs_f64()
            ));
        }
    }
}

#[tokio::main]
async fn main() {
    let logger = Arc::new(Logger::new(paths::log_file()));

    // Supervisors on the image may launch us redundantly; a second
    // instance is an intentional no-op.
    let _lock = match lock::acquire(&paths::lock_file()) {
        Ok(Some(l)) => l,
        Ok(None) => {
            eprintln!("hotplugd already running, exiting.");
            logger.log("another instance holds the lock; exiting");
            return;
        }
        Err(e) => {
            eprintln!("hotplugd lock error: {e:#}");
            logger.log(&format!("lock error: {e:#}"));
            return;
        }
    };

    let settings = config::load_or_default(&paths::settings_file()).unwrap_or_else(|e| {
        logger.log(&format!("settings error (using defaults): {e:#}"));
        config::Config::default()
    });

    logger.log(&format!("hotplugd v{} starting", env!("CARGO_PKG_VERSION")));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_tasks(Arc::clone(&logger), shutdown_tx);

    let runner = SystemRunner;
    let spec = ManagedProcessSpec {
        path: settings.display.compositor.clone(),
        args: settings.display.compositor_args.clone(),
    };
    let mode = supervisor::detect_mode(
        &runner,
        &settings.display.unit,
        supervisor::env_override_set(),
        &paths::unit_dirs(),
    );
    let mut compositor = Supervisor::new(
        spec,
        settings.display.unit.clone(),
        settings.display.early_unit.clone(),
        mode,
    );
    compositor.startup(&runner, &logger);

    if !audio::wait_for_device(Path::new(paths::SND_DEV), SND_WAIT) {
        logger.log(&format!(
            "{} not present after {}s; continuing",
            paths::SND_DEV,
            SND_WAIT.as_secs()
        ));
    }

    let mut daemon = Daemon {
        logger: Arc::clone(&logger),
        runner,
        probe: DisplayProbe::new(PathBuf::from(paths::DRM_CLASS_DIR)),
        audio: AudioRouter::new(settings.audio.clone()),
        hat: HatToggle::new(
            settings.joystick.module.clone(),
            PathBuf::from(paths::MODULE_DIR),
        ),
        supervisor: compositor,
        debounce: Debounce::new(DEBOUNCE_POLLS),
        heartbeat: Cadence::new(HEARTBEAT_PERIOD),
    };

    let mut ticker = tokio::time::interval(POLL_DELAY);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if *shutdown_rx.borrow() {
            logger.log("shutdown requested; exiting");
            break;
        }
        // The loop must survive anything a single iteration throws at it.
        if std::panic::catch_unwind(AssertUnwindSafe(|| daemon.tick())).is_err() {
            logger.log("unhandled panic in main loop; continuing");
            tokio::time::sleep(ERROR_COOLDOWN).await;
        }
    }
}

/// Installs SIGINT/SIGTERM/SIGHUP handlers that log the signal and flip the
/// shutdown flag; the loop observes it at the top of the next iteration.
fn spawn_signal_tasks(logger: Arc<Logger>, tx: watch::Sender<bool>) {
    {
        let logger = Arc::clone(&logger);
        let tx = tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                logger.log("received SIGINT; exiting");
                let _ = tx.send(true);
            }
        });
    }

    for (kind, name) in [
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::hangup(), "SIGHUP"),
    ] {
        let logger = Arc::clone(&logger);
        let tx = tx.clone();
        tokio::spawn(async move {
            match signal(kind) {
                Ok(mut sig) => {
                    if sig.recv().await.is_some() {
                        logger.log(&format!("received {name}; exiting"));
                        let _ = tx.send(true);
                    }
                }
                Err(e) => logger.log(&format!("failed to install {name} handler: {e}")),
            }
        });
    }
}
