/// Audio output routing between the HDMI sink and the headphone jack.
///
/// Routing has two independent halves, both best-effort:
///   - mixer state: per-card switch/volume controls written through amixer,
///     with readback verification and up to three attempts per control;
///   - file state: the profile's asound snippet copied over the system and
///     user ALSA configs (only when content differs), `alsactl restore`,
///     and the `audio_device=` key in the game-launch config.
/// A failure in either half never prevents the other from being attempted.
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use crate::config::AudioConfig;
use crate::logger::Logger;
use crate::runner::{CmdError, CommandRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioProfile {
    Hdmi,
    Headphone,
}

impl AudioProfile {
    /// Logical device name written into the game-launch config.
    pub fn device_name(self) -> &'static str {
        match self {
            AudioProfile::Hdmi => "hdmi",
            AudioProfile::Headphone => "local",
        }
    }
}

const MIXER_ATTEMPTS: u32 = 3;
const AMIXER_TIMEOUT: Duration = Duration::from_secs(1);
const ALSACTL_TIMEOUT: Duration = Duration::from_secs(2);

/// Fallback snippet content used when a canonical snippet file is missing
/// from the image.
const FALLBACK_HDMI_SNIPPET: &str = "defaults.pcm.card 0\ndefaults.ctl.card 0\n";
const FALLBACK_HEADPHONE_SNIPPET: &str = "defaults.pcm.card 1\ndefaults.ctl.card 1\n";

pub struct AudioRouter {
    cfg: AudioConfig,
}

impl AudioRouter {
    pub fn new(cfg: AudioConfig) -> Self {
        Self { cfg }
    }

    pub fn route(&self, runner: &dyn CommandRunner, log: &Logger, profile: AudioProfile) {
        let (on_card, off_card) = match profile {
            AudioProfile::Hdmi => (&self.cfg.hdmi_card, &self.cfg.headphone_card),
            AudioProfile::Headphone => (&self.cfg.headphone_card, &self.cfg.hdmi_card),
        };

        self.set_control(runner, log, on_card, &self.cfg.switch_numid, "1");
        self.set_control(runner, log, on_card, &self.cfg.volume_numid, &self.cfg.volume);
        self.set_control(runner, log, off_card, &self.cfg.switch_numid, "0");
        self.set_control(runner, log, off_card, &self.cfg.volume_numid, "0");

        self.swap_asound(runner, log, profile);
    }

    /// Writes one mixer control and verifies it by reading the control back,
    /// retrying up to [`MIXER_ATTEMPTS`] times. Some cards drop a cset issued
    /// right after a hotplug event, hence the verification loop.
    fn set_control(
        &self,
        runner: &dyn CommandRunner,
        log: &Logger,
        card: &str,
        numid: &str,
        value: &str,
    ) {
        let cset_numid = format!("numid={numid}");
        for _ in 0..MIXER_ATTEMPTS {
            let set = runner.run(
                &["amixer", "-q", "-c", card, "cset", &cset_numid, value],
                AMIXER_TIMEOUT,
            );
            let readback = match set {
                Ok(_) => runner.capture(
                    &["amixer", "-c", card, "cget", &cset_numid],
                    AMIXER_TIMEOUT,
                ),
                Err(e) => Err(e),
            };
            match readback {
                Ok(out) => {
                    if readback_confirms(value, &out) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(CmdError::Timeout) => {
                    log.log(&format!("amixer timeout card={card} numid={numid}"));
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(CmdError::NotFound) => {
                    log.log("amixer not found");
                    return;
                }
                Err(e) => {
                    log.log(&format!("amixer error card={card} numid={numid}: {e}"));
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    fn swap_asound(&self, runner: &dyn CommandRunner, log: &Logger, profile: AudioProfile) {
        self.ensure_snippets(log);

        let src = match profile {
            AudioProfile::Hdmi => &self.cfg.hdmi_snippet,
            AudioProfile::Headphone => &self.cfg.headphone_snippet,
        };
        for dst in [&self.cfg.system_asound, &self.cfg.user_asound] {
            match copy_if_differs(src, dst) {
                Ok(_) => {}
                Err(e) if matches!(e.kind(), ErrorKind::PermissionDenied | ErrorKind::NotFound) => {}
                Err(e) => log.log(&format!("asound copy error dst={}: {e}", dst.display())),
            }
        }

        match runner.run(&["alsactl", "restore"], ALSACTL_TIMEOUT) {
            Ok(_) => {}
            Err(CmdError::Timeout) => log.log("alsactl restore timed out"),
            Err(CmdError::NotFound) => log.log("alsactl not found"),
            Err(e) => log.log(&format!("alsactl restore error: {e}")),
        }

        self.rewrite_audio_device(log, profile.device_name());
    }

    /// Writes fallback content for any missing snippet file so the copy
    /// step has a source to work with.
    fn ensure_snippets(&self, log: &Logger) {
        for (path, fallback) in [
            (&self.cfg.hdmi_snippet, FALLBACK_HDMI_SNIPPET),
            (&self.cfg.headphone_snippet, FALLBACK_HEADPHONE_SNIPPET),
        ] {
            if !path.exists() {
                log.log(&format!(
                    "Warning: {} missing, using fallback",
                    path.display()
                ));
                if let Err(e) = std::fs::write(path, fallback) {
                    log.log(&format!("snippet fallback write error: {e}"));
                }
            }
        }
    }

    /// Rewrites only the `audio_device=` key of the game-launch config,
    /// preserving every other line verbatim.
    fn rewrite_audio_device(&self, log: &Logger, device: &str) {
        let path = &self.cfg.runcommand;
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                log.log(&format!("{} read error: {e}", path.display()));
                return;
            }
        };
        match std::fs::write(path, rewrite_audio_device_key(&content, device)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                log.log(&format!("permission denied writing {}", path.display()));
            }
            Err(e) => log.log(&format!("{} write error: {e}", path.display())),
        }
    }
}

/// True when the `cget` output confirms the value just written: numeric
/// values must appear as an exact `values=<v>` field, symbolic values as a
/// bracketed `[<v>]` token.
pub(crate) fn readback_confirms(value: &str, output: &str) -> bool {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        output.contains(&format!("values={value}"))
    } else {
        output.contains(&format!("[{value}]"))
    }
}

/// Copies `src` to `dst` only when `dst` is absent or its bytes differ,
/// avoiding needless writes (and the device restarts they trigger).
fn copy_if_differs(src: &Path, dst: &Path) -> std::io::Result<bool> {
    let src_bytes = std::fs::read(src)?;
    if let Ok(dst_bytes) = std::fs::read(dst) {
        if dst_bytes == src_bytes {
            return Ok(false);
        }
    }
    std::fs::write(dst, &src_bytes)?;
    Ok(true)
}

/// Drops every existing `audio_device=` line and appends the new value as
/// the final line.
pub(crate) fn rewrite_audio_device_key(content: &str, device: &str) -> String {
    let mut lines: Vec<&str> = content
        .lines()
        .filter(|l| !l.starts_with("audio_device="))
        .collect();
    let key = format!("audio_device={device}");
    lines.push(&key);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Polls for `path` to appear, for sound-card bring-up at boot.
pub fn wait_for_device(path: &Path, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;

    fn test_logger(dir: &Path) -> Logger {
        Logger::new(dir.join("test.log"))
    }

    fn test_cfg(dir: &Path) -> AudioConfig {
        AudioConfig {
            hdmi_card: "0".into(),
            headphone_card: "1".into(),
            volume_numid: "1".into(),
            switch_numid: "2".into(),
            volume: "250".into(),
            hdmi_snippet: dir.join("asound.hdmi.conf"),
            headphone_snippet: dir.join("asound.hp.conf"),
            system_asound: dir.join("asound.conf"),
            user_asound: dir.join(".asoundrc"),
            runcommand: dir.join("runcommand.cfg"),
        }
    }

    // ── readback_confirms ─────────────────────────────────────────────────────

    #[test]
    fn numeric_value_matches_values_field() {
        assert!(readback_confirms("1", "  : values=1\n"));
        assert!(readback_confirms("250", "  : values=250,250\n"));
        assert!(!readback_confirms("1", "  : values=0\n"));
    }

    #[test]
    fn numeric_value_does_not_match_bracketed_token() {
        assert!(!readback_confirms("1", "  | [1]\n"));
    }

    #[test]
    fn symbolic_value_matches_by_containment() {
        assert!(readback_confirms("on", "Front Left: Playback [on]\n"));
        assert!(!readback_confirms("on", "Front Left: Playback [off]\n"));
    }

    // ── set_control retry loop ────────────────────────────────────────────────

    #[test]
    fn confirmed_write_stops_after_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let router = AudioRouter::new(test_cfg(dir.path()));
        let runner = FakeRunner::new(|argv: &[&str]| {
            if argv.contains(&"cget") {
                Ok((0, ": values=1\n".to_string()))
            } else {
                Ok((0, String::new()))
            }
        });

        router.set_control(&runner, &test_logger(dir.path()), "0", "2", "1");

        // One cset + one cget, nothing more.
        assert_eq!(runner.call_count(), 2);
    }

    #[test]
    fn unconfirmed_write_retries_three_times() {
        let dir = tempfile::tempdir().unwrap();
        let router = AudioRouter::new(test_cfg(dir.path()));
        let runner = FakeRunner::new(|argv: &[&str]| {
            if argv.contains(&"cget") {
                // Readback never matches the written value.
                Ok((0, ": values=0\n".to_string()))
            } else {
                Ok((0, String::new()))
            }
        });

        router.set_control(&runner, &test_logger(dir.path()), "0", "2", "1");

        assert_eq!(runner.call_count(), 6);
    }

    #[test]
    fn missing_amixer_gives_up_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let router = AudioRouter::new(test_cfg(dir.path()));
        let runner = FakeRunner::new(|_| Err(CmdError::NotFound));

        router.set_control(&runner, &test_logger(dir.path()), "0", "2", "1");

        assert_eq!(runner.call_count(), 1);
    }

    #[test]
    fn timeout_retries_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let router = AudioRouter::new(test_cfg(dir.path()));
        let runner = FakeRunner::new(|_| Err(CmdError::Timeout));

        router.set_control(&runner, &test_logger(dir.path()), "0", "2", "1");

        // One cset per attempt; the readback is never reached.
        assert_eq!(runner.call_count(), 3);
    }

    // ── route mixer ordering ──────────────────────────────────────────────────

    #[test]
    fn hdmi_route_unmutes_hdmi_and_mutes_headphone() {
        let dir = tempfile::tempdir().unwrap();
        let router = AudioRouter::new(test_cfg(dir.path()));
        let runner = FakeRunner::new(|argv: &[&str]| {
            if argv[0] == "amixer" && argv.contains(&"cget") {
                // Confirm whatever was last written.
                Ok((0, ": values=0 values=1 values=250\n".to_string()))
            } else {
                Ok((0, String::new()))
            }
        });

        router.route(&runner, &test_logger(dir.path()), AudioProfile::Hdmi);

        let calls = runner.calls.borrow();
        let csets: Vec<Vec<String>> = calls
            .iter()
            .filter(|c| c.contains(&"cset".to_string()))
            .cloned()
            .collect();
        assert_eq!(csets.len(), 4);
        // Target card first: switch on, volume up.
        assert_eq!(csets[0][3], "0");
        assert_eq!(csets[0][6], "1");
        assert_eq!(csets[1][3], "0");
        assert_eq!(csets[1][6], "250");
        // Other card muted and zeroed.
        assert_eq!(csets[2][3], "1");
        assert_eq!(csets[2][6], "0");
        assert_eq!(csets[3][3], "1");
        assert_eq!(csets[3][6], "0");
    }

    // ── asound file half ──────────────────────────────────────────────────────

    #[test]
    fn copies_snippet_to_both_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        std::fs::write(&cfg.hdmi_snippet, "pcm hdmi\n").unwrap();
        std::fs::write(&cfg.headphone_snippet, "pcm hp\n").unwrap();
        let router = AudioRouter::new(cfg.clone());
        let runner = FakeRunner::new(|_| Ok((0, String::new())));

        router.swap_asound(&runner, &test_logger(dir.path()), AudioProfile::Hdmi);

        assert_eq!(std::fs::read_to_string(&cfg.system_asound).unwrap(), "pcm hdmi\n");
        assert_eq!(std::fs::read_to_string(&cfg.user_asound).unwrap(), "pcm hdmi\n");
    }

    #[test]
    fn missing_snippet_gets_fallback_content() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        let router = AudioRouter::new(cfg.clone());
        let runner = FakeRunner::new(|_| Ok((0, String::new())));

        router.swap_asound(&runner, &test_logger(dir.path()), AudioProfile::Headphone);

        assert_eq!(
            std::fs::read_to_string(&cfg.headphone_snippet).unwrap(),
            FALLBACK_HEADPHONE_SNIPPET
        );
        assert_eq!(
            std::fs::read_to_string(&cfg.system_asound).unwrap(),
            FALLBACK_HEADPHONE_SNIPPET
        );
    }

    #[test]
    fn identical_destination_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, "same\n").unwrap();
        std::fs::write(&dst, "same\n").unwrap();
        assert!(!copy_if_differs(&src, &dst).unwrap());

        std::fs::write(&dst, "different\n").unwrap();
        assert!(copy_if_differs(&src, &dst).unwrap());
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "same\n");
    }

    #[test]
    fn swap_runs_alsactl_restore() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        std::fs::write(&cfg.hdmi_snippet, "x\n").unwrap();
        std::fs::write(&cfg.headphone_snippet, "y\n").unwrap();
        let router = AudioRouter::new(cfg);
        let runner = FakeRunner::new(|_| Ok((0, String::new())));

        router.swap_asound(&runner, &test_logger(dir.path()), AudioProfile::Hdmi);

        assert!(runner
            .calls
            .borrow()
            .iter()
            .any(|c| c == &vec!["alsactl".to_string(), "restore".to_string()]));
    }

    // ── runcommand key rewrite ────────────────────────────────────────────────

    #[test]
    fn rewrite_replaces_existing_key_and_keeps_other_lines() {
        let content = "video_smoothing=1\naudio_device=local\ngovernor=performance\n";
        let out = rewrite_audio_device_key(content, "hdmi");
        assert_eq!(
            out,
            "video_smoothing=1\ngovernor=performance\naudio_device=hdmi\n"
        );
    }

    #[test]
    fn rewrite_appends_key_when_absent() {
        assert_eq!(
            rewrite_audio_device_key("", "local"),
            "audio_device=local\n"
        );
        assert_eq!(
            rewrite_audio_device_key("foo=bar\n", "local"),
            "foo=bar\naudio_device=local\n"
        );
    }

    #[test]
    fn rewrite_drops_duplicate_keys() {
        let content = "audio_device=hdmi\naudio_device=local\n";
        assert_eq!(
            rewrite_audio_device_key(content, "hdmi"),
            "audio_device=hdmi\n"
        );
    }

    #[test]
    fn route_writes_device_name_to_runcommand() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_cfg(dir.path());
        std::fs::write(&cfg.runcommand, "video_smoothing=1\n").unwrap();
        std::fs::write(&cfg.hdmi_snippet, "x\n").unwrap();
        std::fs::write(&cfg.headphone_snippet, "y\n").unwrap();
        let router = AudioRouter::new(cfg.clone());
        let runner = FakeRunner::new(|_| Ok((0, ": values=whatever".to_string())));

        router.route(&runner, &test_logger(dir.path()), AudioProfile::Headphone);

        let content = std::fs::read_to_string(&cfg.runcommand).unwrap();
        assert!(content.contains("video_smoothing=1"));
        assert!(content.ends_with("audio_device=local\n"));
    }

    // ── wait_for_device ───────────────────────────────────────────────────────

    #[test]
    fn wait_for_device_returns_immediately_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        assert!(wait_for_device(dir.path(), Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_for_device_times_out_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("snd");
        assert!(!wait_for_device(&missing, Duration::from_millis(250)));
    }
}
