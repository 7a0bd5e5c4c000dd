//! Engine settings stored at `~/.config/JarLauncher/engine.ini`.
//!
//! Every key is optional; missing or unparsable values fall back to the
//! defaults below. `sweepIntervalMs` must be non-zero.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ini::IniFile;

const SECTION: &str = "Engine";

const DEFAULT_SWEEP_INTERVAL_MS: u64 = 2_000;
const DEFAULT_RESTART_DELAY_MS: u64 = 2_000;
const DEFAULT_CLOSE_DELAY_MS: u64 = 1_500;
const DEFAULT_DOWNLOAD_GRACE_MS: u64 = 3_000;
const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;

/// Timing knobs for the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Consistency sweeper period.
    pub sweep_interval: Duration,
    /// Pause between a `server-restart-now` event and the restart call.
    pub restart_delay: Duration,
    /// How long the install "ready" message stays up before teardown.
    pub close_delay: Duration,
    /// How long failed/stalled/cancelled download rows stay visible.
    pub download_grace: Duration,
    /// Existence resync period. `None` disables the resync task.
    pub resync_interval: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            restart_delay: Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
            close_delay: Duration::from_millis(DEFAULT_CLOSE_DELAY_MS),
            download_grace: Duration::from_millis(DEFAULT_DOWNLOAD_GRACE_MS),
            resync_interval: Some(Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS)),
        }
    }
}

impl EngineSettings {
    /// Load from the default location, or defaults if the file is absent.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from an explicit path, or defaults if the file is absent.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = IniFile::read(path)?;
        Ok(Self::from_ini(&ini))
    }

    pub fn from_ini(ini: &IniFile) -> Self {
        let defaults = Self::default();
        let resync_secs = read_u64(
            ini,
            "resyncIntervalSecs",
            defaults.resync_interval.map_or(0, |d| d.as_secs()),
        );
        Self {
            sweep_interval: read_nonzero_ms(ini, "sweepIntervalMs", defaults.sweep_interval),
            restart_delay: read_ms(ini, "restartDelayMs", defaults.restart_delay),
            close_delay: read_ms(ini, "closeDelayMs", defaults.close_delay),
            download_grace: read_ms(ini, "downloadGraceMs", defaults.download_grace),
            resync_interval: (resync_secs > 0).then(|| Duration::from_secs(resync_secs)),
        }
    }

    pub fn to_ini(&self) -> IniFile {
        let mut ini = IniFile::default();
        ini.set(
            SECTION,
            "sweepIntervalMs",
            &self.sweep_interval.as_millis().to_string(),
        );
        ini.set(
            SECTION,
            "restartDelayMs",
            &self.restart_delay.as_millis().to_string(),
        );
        ini.set(
            SECTION,
            "closeDelayMs",
            &self.close_delay.as_millis().to_string(),
        );
        ini.set(
            SECTION,
            "downloadGraceMs",
            &self.download_grace.as_millis().to_string(),
        );
        ini.set(
            SECTION,
            "resyncIntervalSecs",
            &self.resync_interval.map_or(0, |d| d.as_secs()).to_string(),
        );
        ini
    }

    /// Save to the default location.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save settings to `path`, creating the directory if needed.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.to_ini().write(path)
    }

    /// Default settings file path (`~/.config/JarLauncher/engine.ini`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("JarLauncher")
            .join("engine.ini")
    }
}

fn read_u64(ini: &IniFile, key: &str, default: u64) -> u64 {
    match ini.get_parsed::<u64>(SECTION, key) {
        Ok(Some(v)) => v,
        Ok(None) => default,
        Err(raw) => {
            tracing::warn!("Ignoring invalid {key}={raw:?} in engine settings, using {default}");
            default
        }
    }
}

fn read_ms(ini: &IniFile, key: &str, default: Duration) -> Duration {
    Duration::from_millis(read_u64(ini, key, default.as_millis() as u64))
}

fn read_nonzero_ms(ini: &IniFile, key: &str, default: Duration) -> Duration {
    let value = read_ms(ini, key, default);
    if value.is_zero() {
        tracing::warn!(
            "Ignoring {key}=0 in engine settings, using {}",
            default.as_millis()
        );
        return default;
    }
    value
}
