//! Per-file transfer rows fed by `download-progress` events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DownloadStatus {
    Requesting,
    Downloading,
    Verifying,
    Completed,
    Failed,
    Stalled,
    Cancelled,
    Other(String),
}

impl DownloadStatus {
    /// Ended badly; the row stays visible for a grace period.
    pub fn is_lingering(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Failed | DownloadStatus::Stalled | DownloadStatus::Cancelled
        )
    }
}

impl From<String> for DownloadStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "requesting" => DownloadStatus::Requesting,
            "downloading" => DownloadStatus::Downloading,
            "verifying" => DownloadStatus::Verifying,
            "completed" => DownloadStatus::Completed,
            "failed" => DownloadStatus::Failed,
            "stalled" => DownloadStatus::Stalled,
            "cancelled" => DownloadStatus::Cancelled,
            _ => DownloadStatus::Other(s),
        }
    }
}

impl From<DownloadStatus> for String {
    fn from(status: DownloadStatus) -> Self {
        match status {
            DownloadStatus::Requesting => "requesting".into(),
            DownloadStatus::Downloading => "downloading".into(),
            DownloadStatus::Verifying => "verifying".into(),
            DownloadStatus::Completed => "completed".into(),
            DownloadStatus::Failed => "failed".into(),
            DownloadStatus::Stalled => "stalled".into(),
            DownloadStatus::Cancelled => "cancelled".into(),
            DownloadStatus::Other(s) => s,
        }
    }
}

/// One file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub downloaded: u64,
    #[serde(default)]
    pub total: u64,
    /// Bytes per second
    #[serde(default)]
    pub speed: u64,
    pub status: DownloadStatus,
    #[serde(default)]
    pub source: Option<String>,
}

/// What happened to the row after applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFate {
    Kept,
    Removed,
    /// Updated to a failed/stalled/cancelled state; pass `seq` back to
    /// [`DownloadRows::expire`] after the grace delay.
    Expiring { seq: u64 },
}

#[derive(Debug, Clone)]
struct TrackedRow {
    progress: DownloadProgress,
    seq: u64,
}

/// Visible download rows keyed by file id.
///
/// Every update stamps the row with a new sequence number, so an expiry
/// scheduled for an earlier update never removes a row that changed since.
#[derive(Debug, Clone, Default)]
pub struct DownloadRows {
    rows: BTreeMap<String, TrackedRow>,
    next_seq: u64,
}

impl DownloadRows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event.
    pub fn apply(&mut self, progress: DownloadProgress) -> RowFate {
        if progress.status == DownloadStatus::Completed {
            self.rows.remove(&progress.id);
            return RowFate::Removed;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let fate = if progress.status.is_lingering() {
            RowFate::Expiring { seq }
        } else {
            RowFate::Kept
        };
        self.rows
            .insert(progress.id.clone(), TrackedRow { progress, seq });
        fate
    }

    /// Drop the row at the end of its grace delay, unless it has been updated
    /// since the event that scheduled the expiry.
    pub fn expire(&mut self, id: &str, seq: u64) -> bool {
        let due = self
            .rows
            .get(id)
            .is_some_and(|row| row.seq == seq && row.progress.status.is_lingering());
        if due {
            self.rows.remove(id);
        }
        due
    }

    pub fn get(&self, id: &str) -> Option<&DownloadProgress> {
        self.rows.get(id).map(|row| &row.progress)
    }

    pub fn values(&self) -> impl Iterator<Item = &DownloadProgress> {
        self.rows.values().map(|row| &row.progress)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

impl DownloadProgress {
    /// One-line rendering: "jei.jar 1.5/4.0 MB at 320 KB/s".
    pub fn summary_line(&self) -> String {
        let mut line = format!("{} ", self.name);
        if self.total > 0 {
            line.push_str(&format!(
                "{}/{}",
                format_size(self.downloaded),
                format_size(self.total)
            ));
        } else {
            line.push_str(&format_size(self.downloaded));
        }
        match self.status {
            DownloadStatus::Downloading if self.speed > 0 => {
                line.push_str(&format!(" at {}", format_rate(self.speed)));
            }
            DownloadStatus::Downloading => {}
            ref other => {
                line.push_str(&format!(" ({})", String::from(other.clone())));
            }
        }
        line
    }
}

/// Byte count for download rows: "1.5 MB", "320 KB", "12 B".
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Transfer speed: "320 KB/s".
pub fn format_rate(bytes_per_sec: u64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}
