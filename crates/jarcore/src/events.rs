//! Push events from the backend.
//!
//! Events arrive on the bus as `(name, JSON payload)` pairs. They are decoded
//! into [`BackendEvent`] once, right at the subscription boundary, so the
//! reconciler dispatches with an exhaustive `match`.

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::install::downloads::DownloadProgress;
use crate::install::progress::BatchProgress;
use crate::install::InstallSummary;
use crate::instance::InstanceStatus;

/// Handler invoked with each raw payload, one at a time, in arrival order.
pub type EventHandler = Box<dyn Fn(Value) + Send + Sync>;

/// Push-event source. Delivery is at-most-once with no replay.
pub trait EventBus: Send + Sync {
    fn subscribe(&self, event: &str, handler: EventHandler) -> Result<Subscription, BusError>;
}

/// Registration handle. Dropping it unsubscribes.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

/// Every event category the engine listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusChanged,
    Installing,
    InstallProgress,
    Created,
    Reinstalled,
    Repaired,
    Reinstalling,
    Repairing,
    CreationFailed,
    ReinstallFailed,
    RepairFailed,
    Removed,
    ServerRestartNow,
    ModpackOperationStarted,
    InstanceOperationStarted,
    OperationCancelled,
    ModpackInstallProgress,
    ModpackInstallSummary,
    DownloadProgress,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        EventKind::StatusChanged,
        EventKind::Installing,
        EventKind::InstallProgress,
        EventKind::Created,
        EventKind::Reinstalled,
        EventKind::Repaired,
        EventKind::Reinstalling,
        EventKind::Repairing,
        EventKind::CreationFailed,
        EventKind::ReinstallFailed,
        EventKind::RepairFailed,
        EventKind::Removed,
        EventKind::ServerRestartNow,
        EventKind::ModpackOperationStarted,
        EventKind::InstanceOperationStarted,
        EventKind::OperationCancelled,
        EventKind::ModpackInstallProgress,
        EventKind::ModpackInstallSummary,
        EventKind::DownloadProgress,
    ];

    /// Name on the bus.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::StatusChanged => "instance-status-changed",
            EventKind::Installing => "instance-installing",
            EventKind::InstallProgress => "instance-install-progress",
            EventKind::Created => "instance-created",
            EventKind::Reinstalled => "instance-reinstalled",
            EventKind::Repaired => "instance-repaired",
            EventKind::Reinstalling => "instance-reinstalling",
            EventKind::Repairing => "instance-repairing",
            EventKind::CreationFailed => "instance-creation-failed",
            EventKind::ReinstallFailed => "instance-reinstall-failed",
            EventKind::RepairFailed => "instance-repair-failed",
            EventKind::Removed => "instance-removed",
            EventKind::ServerRestartNow => "server-restart-now",
            EventKind::ModpackOperationStarted => "modpack-operation-started",
            EventKind::InstanceOperationStarted => "instance-operation-started",
            EventKind::OperationCancelled => "operation-cancelled",
            EventKind::ModpackInstallProgress => "modpack-install-progress",
            EventKind::ModpackInstallSummary => "modpack-install-summary",
            EventKind::DownloadProgress => "download-progress",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

/// A decoded backend event.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    StatusChanged { id: String, status: InstanceStatus },
    Installing { id: String, name: String },
    InstallProgress { id: String, step: String, message: Option<String> },
    Created { id: String },
    Reinstalled { id: String },
    Repaired { id: String },
    Reinstalling { id: String },
    Repairing { id: String },
    CreationFailed { id: String, error: Option<String> },
    ReinstallFailed { id: String, error: Option<String> },
    RepairFailed { id: String, error: Option<String> },
    Removed { id: String },
    ServerRestartNow { instance_id: String },
    ModpackOperationStarted { operation_id: String },
    InstanceOperationStarted { operation_id: String },
    OperationCancelled { id: String },
    ModpackInstallProgress(BatchProgress),
    ModpackInstallSummary(InstallSummary),
    DownloadProgress(DownloadProgress),
}

#[derive(Deserialize)]
struct IdPayload {
    id: String,
}

#[derive(Deserialize)]
struct StatusPayload {
    id: String,
    status: InstanceStatus,
}

#[derive(Deserialize)]
struct InstallingPayload {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct InstallProgressPayload {
    id: String,
    step: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct FailurePayload {
    id: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct RestartPayload {
    instance_id: String,
}

#[derive(Deserialize)]
struct OperationPayload {
    operation_id: String,
}

impl BackendEvent {
    pub fn decode(kind: EventKind, payload: Value) -> Result<Self, serde_json::Error> {
        use serde_json::from_value;

        let event = match kind {
            EventKind::StatusChanged => {
                let p: StatusPayload = from_value(payload)?;
                BackendEvent::StatusChanged {
                    id: p.id,
                    status: p.status,
                }
            }
            EventKind::Installing => {
                let p: InstallingPayload = from_value(payload)?;
                BackendEvent::Installing {
                    id: p.id,
                    name: p.name,
                }
            }
            EventKind::InstallProgress => {
                let p: InstallProgressPayload = from_value(payload)?;
                BackendEvent::InstallProgress {
                    id: p.id,
                    step: p.step,
                    message: p.message,
                }
            }
            EventKind::Created => BackendEvent::Created {
                id: from_value::<IdPayload>(payload)?.id,
            },
            EventKind::Reinstalled => BackendEvent::Reinstalled {
                id: from_value::<IdPayload>(payload)?.id,
            },
            EventKind::Repaired => BackendEvent::Repaired {
                id: from_value::<IdPayload>(payload)?.id,
            },
            EventKind::Reinstalling => BackendEvent::Reinstalling {
                id: from_value::<IdPayload>(payload)?.id,
            },
            EventKind::Repairing => BackendEvent::Repairing {
                id: from_value::<IdPayload>(payload)?.id,
            },
            EventKind::CreationFailed => {
                let p: FailurePayload = from_value(payload)?;
                BackendEvent::CreationFailed {
                    id: p.id,
                    error: p.error,
                }
            }
            EventKind::ReinstallFailed => {
                let p: FailurePayload = from_value(payload)?;
                BackendEvent::ReinstallFailed {
                    id: p.id,
                    error: p.error,
                }
            }
            EventKind::RepairFailed => {
                let p: FailurePayload = from_value(payload)?;
                BackendEvent::RepairFailed {
                    id: p.id,
                    error: p.error,
                }
            }
            EventKind::Removed => BackendEvent::Removed {
                id: from_value::<IdPayload>(payload)?.id,
            },
            EventKind::ServerRestartNow => BackendEvent::ServerRestartNow {
                instance_id: from_value::<RestartPayload>(payload)?.instance_id,
            },
            EventKind::ModpackOperationStarted => BackendEvent::ModpackOperationStarted {
                operation_id: from_value::<OperationPayload>(payload)?.operation_id,
            },
            EventKind::InstanceOperationStarted => BackendEvent::InstanceOperationStarted {
                operation_id: from_value::<OperationPayload>(payload)?.operation_id,
            },
            EventKind::OperationCancelled => BackendEvent::OperationCancelled {
                id: from_value::<IdPayload>(payload)?.id,
            },
            EventKind::ModpackInstallProgress => {
                BackendEvent::ModpackInstallProgress(from_value(payload)?)
            }
            EventKind::ModpackInstallSummary => {
                BackendEvent::ModpackInstallSummary(from_value(payload)?)
            }
            EventKind::DownloadProgress => BackendEvent::DownloadProgress(from_value(payload)?),
        };
        Ok(event)
    }
}

/// Register one subscription per [`EventKind`], each forwarding decoded
/// events into `tx`.
///
/// A failed registration is logged and skipped; the others still go ahead.
/// Payloads that do not decode are logged and dropped.
pub fn subscribe_all(
    bus: &dyn EventBus,
    tx: &mpsc::UnboundedSender<BackendEvent>,
) -> Vec<Subscription> {
    let mut subscriptions = Vec::with_capacity(EventKind::ALL.len());
    for kind in EventKind::ALL {
        let tx = tx.clone();
        let handler: EventHandler = Box::new(move |payload| {
            match BackendEvent::decode(kind, payload) {
                Ok(event) => {
                    // Receiver gone means the engine was disposed
                    let _ = tx.send(event);
                }
                Err(e) => tracing::warn!("Dropping malformed {} event: {e}", kind.name()),
            }
        });
        match bus.subscribe(kind.name(), handler) {
            Ok(sub) => subscriptions.push(sub),
            Err(e) => tracing::warn!("Event subscription failed, continuing without it: {e}"),
        }
    }
    subscriptions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::downloads::DownloadStatus;
    use crate::install::progress::BatchStage;
    use serde_json::json;

    #[test]
    fn test_names_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::from_name("instance-exploded"), None);
    }

    #[test]
    fn test_decode_status_changed() {
        let event = BackendEvent::decode(
            EventKind::StatusChanged,
            json!({ "id": "a", "status": "running" }),
        )
        .unwrap();
        assert_eq!(
            event,
            BackendEvent::StatusChanged {
                id: "a".into(),
                status: InstanceStatus::Running
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        let res = BackendEvent::decode(
            EventKind::StatusChanged,
            json!({ "id": "a", "status": "levitating" }),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_decode_failure_without_message() {
        let event =
            BackendEvent::decode(EventKind::RepairFailed, json!({ "id": "a" })).unwrap();
        assert_eq!(
            event,
            BackendEvent::RepairFailed {
                id: "a".into(),
                error: None
            }
        );
    }

    #[test]
    fn test_decode_batch_progress() {
        let event = BackendEvent::decode(
            EventKind::ModpackInstallProgress,
            json!({ "stage": "downloading_mods", "current": 3, "total": 40, "current_file": "sodium.jar" }),
        )
        .unwrap();
        let BackendEvent::ModpackInstallProgress(p) = event else {
            panic!("wrong variant");
        };
        assert_eq!(p.stage, BatchStage::DownloadingMods);
        assert_eq!(p.current, 3);
        assert_eq!(p.current_file.as_deref(), Some("sodium.jar"));
    }

    #[test]
    fn test_decode_download_progress() {
        let event = BackendEvent::decode(
            EventKind::DownloadProgress,
            json!({
                "id": "mod-sodium", "name": "sodium", "downloaded": 10, "total": 100,
                "speed": 5, "status": "downloading", "source": "modrinth"
            }),
        )
        .unwrap();
        let BackendEvent::DownloadProgress(d) = event else {
            panic!("wrong variant");
        };
        assert_eq!(d.status, DownloadStatus::Downloading);
        assert_eq!(d.source.as_deref(), Some("modrinth"));
    }

    struct RefusingBus;

    impl EventBus for RefusingBus {
        fn subscribe(&self, event: &str, _handler: EventHandler) -> Result<Subscription, BusError> {
            if event == "instance-removed" {
                return Err(BusError {
                    event: event.to_string(),
                    message: "listener limit".into(),
                });
            }
            Ok(Subscription::new(|| {}))
        }
    }

    #[test]
    fn test_failed_registration_skips_only_that_kind() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let subs = subscribe_all(&RefusingBus, &tx);
        assert_eq!(subs.len(), EventKind::ALL.len() - 1);
    }

    #[test]
    fn test_subscription_drop_unsubscribes_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
