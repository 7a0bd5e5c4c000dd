//! Instance records as the engine mirrors them from the backend.
//!
//! An instance is one user-managed game client or server environment. The
//! engine only interprets `id`, `status`, `instance_type` and the two
//! installation fields; everything else is carried through untouched.

pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::InstanceStore;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Installing,
    Error,
    Crashed,
    Restarting,
}

impl InstanceStatus {
    /// Settled states: nothing further is pending for a guarded operation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Running
                | InstanceStatus::Stopped
                | InstanceStatus::Error
                | InstanceStatus::Crashed
        )
    }

    /// Statuses that release an outstanding guard when reported by the backend.
    pub fn releases_guard(self) -> bool {
        self.is_terminal() || self == InstanceStatus::Restarting
    }

    /// A start request against an instance in this state is ignored.
    pub fn blocks_start(self) -> bool {
        matches!(
            self,
            InstanceStatus::Running | InstanceStatus::Starting | InstanceStatus::Stopping
        )
    }

    /// A stop request against an instance in this state is ignored.
    pub fn blocks_stop(self) -> bool {
        matches!(self, InstanceStatus::Stopped | InstanceStatus::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Installing => "installing",
            InstanceStatus::Error => "error",
            InstanceStatus::Crashed => "crashed",
            InstanceStatus::Restarting => "restarting",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    #[default]
    Client,
    Server,
}

/// One instance as last reported by the backend or optimistically updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub instance_type: InstanceType,
    #[serde(default)]
    pub installation_error: Option<String>,
    #[serde(default)]
    pub installation_step: Option<String>,
    /// Game version, e.g. `1.20.1`
    #[serde(default)]
    pub version: Option<String>,
    /// Mod loader, e.g. `fabric`
    #[serde(default)]
    pub loader: Option<String>,
    #[serde(default)]
    pub loader_version: Option<String>,
    /// Memory limits in MiB
    #[serde(default)]
    pub memory_min: Option<u32>,
    #[serde(default)]
    pub memory_max: Option<u32>,
    /// Accumulated playtime in seconds
    #[serde(default)]
    pub total_playtime: u64,
    #[serde(default)]
    pub last_played: Option<DateTime<Utc>>,
    /// Backend fields the engine does not model.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Instance {
    /// A bare record with only identity, name and type set.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instance_type: InstanceType,
        status: InstanceStatus,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status,
            instance_type,
            installation_error: None,
            installation_step: None,
            version: None,
            loader: None,
            loader_version: None,
            memory_min: None,
            memory_max: None,
            total_playtime: 0,
            last_played: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_server(&self) -> bool {
        self.instance_type == InstanceType::Server
    }
}

/// A partial update. Only fields set to `Some` are touched.
///
/// The installation fields are doubly optional: `Some(None)` clears the
/// field, `None` leaves it alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancePatch {
    pub status: Option<InstanceStatus>,
    pub installation_step: Option<Option<String>>,
    pub installation_error: Option<Option<String>>,
}

impl InstancePatch {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_step(mut self, step: Option<String>) -> Self {
        self.installation_step = Some(step);
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.installation_error = Some(error);
        self
    }

    /// Settled after an install finished: status plus both installation fields cleared.
    pub fn settled(status: InstanceStatus) -> Self {
        Self::status(status).with_step(None).with_error(None)
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.installation_step.is_none() && self.installation_error.is_none()
    }

    /// Merge into `instance`. Returns whether anything changed.
    pub fn apply(&self, instance: &mut Instance) -> bool {
        let mut changed = false;
        if let Some(status) = self.status {
            changed |= instance.status != status;
            instance.status = status;
        }
        if let Some(step) = &self.installation_step {
            changed |= instance.installation_step != *step;
            instance.installation_step = step.clone();
        }
        if let Some(error) = &self.installation_error {
            changed |= instance.installation_error != *error;
            instance.installation_error = error.clone();
        }
        changed
    }
}
