//! Progress signals of the two install pipelines and the single line of text
//! shown for them.
//!
//! The loader pipeline (runtime + mod loader) reports named steps per
//! instance. The download batch (modpack files) reports a stage with a
//! current/total counter. Both may run at the same time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Step name the loader pipeline reports when it is done.
pub const LOADER_STEP_COMPLETE: &str = "complete";

/// Shown between the end of both pipelines and teardown.
pub const READY_TEXT: &str = "Ready!";

/// Stage of the modpack download batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BatchStage {
    Downloading,
    CreatingInstance,
    ResolvingMods,
    DownloadingMods,
    ExtractingOverrides,
    Completed,
    Cancelled,
    Other(String),
}

impl From<String> for BatchStage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "downloading" => BatchStage::Downloading,
            "creating_instance" => BatchStage::CreatingInstance,
            "resolving_mods" => BatchStage::ResolvingMods,
            "downloading_mods" => BatchStage::DownloadingMods,
            "extracting_overrides" => BatchStage::ExtractingOverrides,
            "completed" => BatchStage::Completed,
            "cancelled" => BatchStage::Cancelled,
            _ => BatchStage::Other(s),
        }
    }
}

impl From<BatchStage> for String {
    fn from(stage: BatchStage) -> Self {
        stage.to_string()
    }
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStage::Downloading => "downloading",
            BatchStage::CreatingInstance => "creating_instance",
            BatchStage::ResolvingMods => "resolving_mods",
            BatchStage::DownloadingMods => "downloading_mods",
            BatchStage::ExtractingOverrides => "extracting_overrides",
            BatchStage::Completed => "completed",
            BatchStage::Cancelled => "cancelled",
            BatchStage::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// One `modpack-install-progress` report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub stage: BatchStage,
    #[serde(default)]
    pub current: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub current_file: Option<String>,
}

impl BatchProgress {
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let pct = (u64::from(self.current.min(self.total)) * 100) / u64::from(self.total);
        Some(pct as u8)
    }

    fn counter_text(&self) -> String {
        match &self.current_file {
            Some(file) => format!(
                "Downloading mods ({}/{}): {file}",
                self.current, self.total
            ),
            None => format!("Downloading mods ({}/{})", self.current, self.total),
        }
    }

    fn stage_text(&self) -> String {
        match self.stage {
            BatchStage::Downloading => "Downloading modpack...".to_string(),
            BatchStage::CreatingInstance => "Creating instance...".to_string(),
            BatchStage::ResolvingMods => "Resolving mods...".to_string(),
            BatchStage::DownloadingMods => self.counter_text(),
            BatchStage::ExtractingOverrides => "Extracting overrides...".to_string(),
            BatchStage::Completed => "Modpack files installed".to_string(),
            BatchStage::Cancelled => "Cancelled".to_string(),
            BatchStage::Other(_) => "Installing...".to_string(),
        }
    }
}

/// Latest step of the loader pipeline for the tracked instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderProgress {
    pub step: String,
    pub message: Option<String>,
}

impl LoaderProgress {
    pub fn complete() -> Self {
        Self {
            step: LOADER_STEP_COMPLETE.to_string(),
            message: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.step == LOADER_STEP_COMPLETE
    }

    fn text(&self) -> String {
        self.message.clone().unwrap_or_else(|| self.step.clone())
    }
}

/// The progress line.
///
/// 1. Loader mid-step while the batch is downloading mods: the batch counter.
/// 2. Loader mid-step otherwise: the loader's own message.
/// 3. Otherwise the batch stage text, or a generic "Installing...".
pub fn progress_text(loader: Option<&LoaderProgress>, batch: Option<&BatchProgress>) -> String {
    let loader_mid_step = loader.filter(|l| !l.is_complete());
    match (loader_mid_step, batch) {
        (Some(_), Some(b)) if b.stage == BatchStage::DownloadingMods => b.counter_text(),
        (Some(l), _) => l.text(),
        (None, Some(b)) => b.stage_text(),
        (None, None) => "Installing...".to_string(),
    }
}

/// Percentage that matches whatever [`progress_text`] shows.
pub fn progress_percent(loader: Option<&LoaderProgress>, batch: Option<&BatchProgress>) -> Option<u8> {
    let loader_mid_step = loader.is_some_and(|l| !l.is_complete());
    match batch {
        Some(b) if b.stage == BatchStage::DownloadingMods => b.percent(),
        Some(b) if b.stage == BatchStage::Completed && !loader_mid_step => Some(100),
        _ if loader.is_some_and(LoaderProgress::is_complete) => Some(100),
        _ if loader_mid_step => None,
        Some(b) => b.percent(),
        None => None,
    }
}
