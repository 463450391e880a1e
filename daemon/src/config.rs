use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root settings structure. Deserialized from /etc/hotplugd.toml when that
/// file exists; every field has a default matching the stock device image,
/// so a missing or partial file is fine.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub joystick: JoystickConfig,
}

/// Display-compositor process and its systemd units.
#[derive(Debug, Deserialize, Clone)]
pub struct DisplayConfig {
    /// Absolute path of the compositor binary.
    #[serde(default = "default_compositor")]
    pub compositor: PathBuf,
    /// Exact argument list the compositor must be running with
    /// (panel geometry, offset and scaling flags).
    #[serde(default = "default_compositor_args")]
    pub compositor_args: Vec<String>,
    /// systemd unit that may own the compositor instead of us.
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Boot-time unit that starts a throwaway compositor before we do.
    #[serde(default = "default_early_unit")]
    pub early_unit: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            compositor: default_compositor(),
            compositor_args: default_compositor_args(),
            unit: default_unit(),
            early_unit: default_early_unit(),
        }
    }
}

/// ALSA routing: card/control ids for the two outputs plus the files the
/// router rewrites.
#[derive(Debug, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_hdmi_card")]
    pub hdmi_card: String,
    #[serde(default = "default_headphone_card")]
    pub headphone_card: String,
    /// `amixer` numid of the volume control on each card.
    #[serde(default = "default_volume_numid")]
    pub volume_numid: String,
    /// `amixer` numid of the mute switch on each card.
    #[serde(default = "default_switch_numid")]
    pub switch_numid: String,
    /// Volume written to the active output (0–400 alsamixer scale).
    #[serde(default = "default_volume")]
    pub volume: String,
    #[serde(default = "default_hdmi_snippet")]
    pub hdmi_snippet: PathBuf,
    #[serde(default = "default_headphone_snippet")]
    pub headphone_snippet: PathBuf,
    /// System-wide ALSA config overwritten on every profile change.
    #[serde(default = "default_system_asound")]
    pub system_asound: PathBuf,
    /// Per-user ALSA config overwritten on every profile change.
    #[serde(default = "default_user_asound")]
    pub user_asound: PathBuf,
    /// Game-launch config whose `audio_device=` key follows the profile.
    #[serde(default = "default_runcommand")]
    pub runcommand: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            hdmi_card: default_hdmi_card(),
            headphone_card: default_headphone_card(),
            volume_numid: default_volume_numid(),
            switch_numid: default_switch_numid(),
            volume: default_volume(),
            hdmi_snippet: default_hdmi_snippet(),
            headphone_snippet: default_headphone_snippet(),
            system_asound: default_system_asound(),
            user_asound: default_user_asound(),
            runcommand: default_runcommand(),
        }
    }
}

/// Joystick-HAT kernel module toggled opposite to HDMI presence.
#[derive(Debug, Deserialize, Clone)]
pub struct JoystickConfig {
    #[serde(default = "default_module")]
    pub module: String,
}

impl Default for JoystickConfig {
    fn default() -> Self {
        Self {
            module: default_module(),
        }
    }
}

/// Loads the settings file at `path`, returning `Config::default()` if the
/// file does not exist. Returns an error if the file exists but cannot be
/// read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))
}

fn default_compositor() -> PathBuf {
    PathBuf::from("/usr/local/bin/fbcp-ili9341")
}

fn default_compositor_args() -> Vec<String> {
    ["-x", "200", "-y", "120", "-w", "240", "-h", "240", "-noscaling"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_unit() -> String {
    "fbcp-ili9341.service".to_string()
}

fn default_early_unit() -> String {
    "fbcp-early.service".to_string()
}

fn default_hdmi_card() -> String {
    "0".to_string()
}

fn default_headphone_card() -> String {
    "1".to_string()
}

fn default_volume_numid() -> String {
    "1".to_string()
}

fn default_switch_numid() -> String {
    "2".to_string()
}

fn default_volume() -> String {
    "250".to_string()
}

fn default_hdmi_snippet() -> PathBuf {
    PathBuf::from("/etc/asound.hdmi.conf")
}

fn default_headphone_snippet() -> PathBuf {
    PathBuf::from("/etc/asound.hp.conf")
}

fn default_system_asound() -> PathBuf {
    PathBuf::from("/etc/asound.conf")
}

fn default_user_asound() -> PathBuf {
    PathBuf::from("/home/pi/.asoundrc")
}

fn default_runcommand() -> PathBuf {
    PathBuf::from("/opt/retropie/configs/all/runcommand.cfg")
}

fn default_module() -> String {
    "mk_arcade_joystick_rpi".to_string()
}
