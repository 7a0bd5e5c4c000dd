//! Modpack install tracking.
//!
//! One install runs two backend jobs at once: the loader pipeline for the new
//! instance and the download batch for the pack's files. Each announces its
//! own cancellation token. The correlator merges their progress into one
//! line, cancels both on request, and decides when the whole thing is over.
//!
//! The install call only returns once the files are down, but the loader
//! pipeline can finish first and emit `instance-created` before the caller
//! knows the id. That early id is remembered and matched when the call
//! returns.

pub mod downloads;
pub mod progress;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::context::EngineContext;
use crate::error::{EngineError, GatewayError};
use crate::gateway::RemoteGateway;

use downloads::{DownloadProgress, DownloadRows, RowFate};
use progress::{BatchProgress, BatchStage, LoaderProgress, READY_TEXT};

const CANCELLING_TEXT: &str = "Cancelling...";

/// Payload of `modpack-install-summary`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSummary {
    pub total_mods: u32,
    pub from_curseforge: Vec<String>,
    pub from_modrinth: Vec<String>,
    /// Mods that could not be resolved from any source.
    pub failed: Vec<String>,
}

impl InstallSummary {
    /// Needs the user's attention before the install is torn down.
    pub fn needs_review(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// How an install ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Completed { instance_id: String },
    Cancelled,
    Failed(String),
}

/// Cancellation tokens of the two jobs. Either may be missing, and the
/// backend may hand out the same token for both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelTokens {
    /// Download batch
    pub modpack: Option<String>,
    /// Loader pipeline
    pub instance: Option<String>,
}

#[derive(Debug, Default)]
pub struct CancelReport {
    pub attempted: usize,
    pub accepted: usize,
    pub failures: Vec<GatewayError>,
}

impl CancelTokens {
    pub fn is_empty(&self) -> bool {
        self.modpack.is_none() && self.instance.is_none()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.modpack.as_deref() == Some(token) || self.instance.as_deref() == Some(token)
    }

    /// Cancel every known token concurrently. One failing does not stop the other.
    pub async fn cancel_all(&self, gateway: &dyn RemoteGateway) -> CancelReport {
        let batch = self.modpack.as_deref();
        let loader = self.instance.as_deref().filter(|t| Some(*t) != batch);

        let (a, b) = tokio::join!(cancel_one(gateway, batch), cancel_one(gateway, loader));

        let mut report = CancelReport::default();
        for (token, result) in [(batch, a), (loader, b)] {
            let (Some(token), Some(result)) = (token, result) else {
                continue;
            };
            report.attempted += 1;
            match result {
                Ok(true) => report.accepted += 1,
                Ok(false) => tracing::info!("Backend declined to cancel {token}"),
                Err(e) => {
                    tracing::warn!("Failed to cancel {token}: {e}");
                    report.failures.push(e);
                }
            }
        }
        report
    }
}

async fn cancel_one(
    gateway: &dyn RemoteGateway,
    token: Option<&str>,
) -> Option<Result<bool, GatewayError>> {
    match token {
        Some(token) => Some(gateway.cancel_operation(token).await),
        None => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Showing the ready text before teardown.
    Closing,
    /// Finished, waiting for the user to dismiss the summary.
    AwaitingSummary,
}

#[derive(Debug, Clone)]
struct InstallOperation {
    generation: u64,
    tokens: CancelTokens,
    /// Instance whose loader progress is displayed.
    progress_instance_id: Option<String>,
    /// Id the install call returned.
    returned_instance_id: Option<String>,
    /// `instance-created` seen before the call returned.
    early_completion_id: Option<String>,
    completed_instance_id: Option<String>,
    loader: Option<LoaderProgress>,
    batch: Option<BatchProgress>,
    summary: Option<InstallSummary>,
    cancel_requested: bool,
    phase: Phase,
}

impl InstallOperation {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            tokens: CancelTokens::default(),
            progress_instance_id: None,
            returned_instance_id: None,
            early_completion_id: None,
            completed_instance_id: None,
            loader: None,
            batch: None,
            summary: None,
            cancel_requested: false,
            phase: Phase::Running,
        }
    }

    fn summary_pending(&self) -> bool {
        self.summary.as_ref().is_some_and(InstallSummary::needs_review)
    }
}

/// Observable install state for the rendering layer.
#[derive(Debug, Clone, Default)]
pub struct InstallState {
    operation: Option<InstallOperation>,
    downloads: DownloadRows,
    /// Overrides the computed progress text (ready / cancelling).
    status_line: Option<String>,
}

impl InstallState {
    pub fn installing(&self) -> bool {
        self.operation.is_some()
    }

    pub fn progress_text(&self) -> Option<String> {
        let op = self.operation.as_ref()?;
        if let Some(line) = &self.status_line {
            return Some(line.clone());
        }
        Some(progress::progress_text(op.loader.as_ref(), op.batch.as_ref()))
    }

    pub fn progress_percent(&self) -> Option<u8> {
        let op = self.operation.as_ref()?;
        progress::progress_percent(op.loader.as_ref(), op.batch.as_ref())
    }

    pub fn downloads(&self) -> impl Iterator<Item = &DownloadProgress> {
        self.downloads.values()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.len()
    }

    /// Summary waiting for [`crate::InstanceEngine::dismiss_install_summary`].
    pub fn pending_summary(&self) -> Option<&InstallSummary> {
        let op = self.operation.as_ref()?;
        if op.phase == Phase::AwaitingSummary {
            op.summary.as_ref()
        } else {
            None
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        let op = self.operation.as_ref()?;
        op.returned_instance_id
            .as_deref()
            .or(op.progress_instance_id.as_deref())
    }

    pub fn tokens(&self) -> Option<&CancelTokens> {
        self.operation.as_ref().map(|op| &op.tokens)
    }

    fn reset(&mut self) -> Option<InstallOperation> {
        self.downloads.clear();
        self.status_line = None;
        self.operation.take()
    }
}

#[derive(Clone)]
pub(crate) struct InstallCorrelator {
    ctx: Arc<EngineContext>,
    shared: Arc<Shared>,
}

struct Shared {
    state: watch::Sender<InstallState>,
    completion: Mutex<Option<oneshot::Sender<InstallOutcome>>>,
    next_generation: AtomicU64,
}

impl InstallCorrelator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let (state, _rx) = watch::channel(InstallState::default());
        Self {
            ctx,
            shared: Arc::new(Shared {
                state,
                completion: Mutex::new(None),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> InstallState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallState> {
        self.shared.state.subscribe()
    }

    /// Open a new operation. Only one may be active.
    pub fn begin(&self) -> Result<oneshot::Receiver<InstallOutcome>, EngineError> {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut completion = self
            .shared
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let opened = self.shared.state.send_if_modified(|s| {
            if s.operation.is_some() {
                return false;
            }
            s.operation = Some(InstallOperation::new(generation));
            s.status_line = None;
            true
        });
        if !opened {
            return Err(EngineError::InstallInProgress);
        }
        *completion = Some(tx);
        tracing::info!("Modpack install started (operation {generation})");
        Ok(rx)
    }

    pub fn on_call_returned(&self, instance_id: &str) {
        let mut close = false;
        self.shared.state.send_if_modified(|s| {
            let Some(op) = s.operation.as_mut() else {
                return false;
            };
            op.returned_instance_id = Some(instance_id.to_string());
            if op.progress_instance_id.is_none() {
                op.progress_instance_id = Some(instance_id.to_string());
            }
            close = op.early_completion_id.as_deref() == Some(instance_id);
            true
        });
        if close {
            tracing::info!("Instance {instance_id} was created before the install call returned");
            self.begin_close(instance_id);
        }
    }

    pub fn on_call_failed(&self, err: GatewayError) {
        let cancelled = self
            .shared
            .state
            .borrow()
            .operation
            .as_ref()
            .is_some_and(|op| op.cancel_requested);
        if cancelled {
            tracing::info!("Install call ended after cancellation: {err}");
            self.finish(InstallOutcome::Cancelled);
        } else {
            self.ctx.report_error(err.to_string());
            self.finish(InstallOutcome::Failed(err.to_string()));
        }
    }

    pub fn on_created(&self, instance_id: &str) {
        let mut close = false;
        self.shared.state.send_if_modified(|s| {
            let Some(op) = s.operation.as_mut() else {
                return false;
            };
            match op.returned_instance_id.as_deref() {
                Some(returned) => {
                    close = returned == instance_id;
                    false
                }
                None => {
                    let foreign = op
                        .progress_instance_id
                        .as_deref()
                        .is_some_and(|p| p != instance_id);
                    if foreign {
                        return false;
                    }
                    op.early_completion_id = Some(instance_id.to_string());
                    true
                }
            }
        });
        if close {
            self.begin_close(instance_id);
        }
    }

    pub fn on_creation_failed(&self, instance_id: &str, error: Option<&str>) {
        if !self.tracks(instance_id) {
            return;
        }
        let message = error.unwrap_or("instance creation failed").to_string();
        self.ctx.report_error(message.clone());
        self.finish(InstallOutcome::Failed(message));
    }

    pub fn on_instance_installing(&self, instance_id: &str) {
        self.shared.state.send_if_modified(|s| match s.operation.as_mut() {
            Some(op) if op.progress_instance_id.is_none() => {
                op.progress_instance_id = Some(instance_id.to_string());
                true
            }
            _ => false,
        });
    }

    pub fn on_loader_progress(&self, instance_id: &str, step: &str, message: Option<&str>) {
        self.shared.state.send_if_modified(|s| match s.operation.as_mut() {
            Some(op)
                if op.phase == Phase::Running
                    && op.progress_instance_id.as_deref() == Some(instance_id) =>
            {
                op.loader = Some(LoaderProgress {
                    step: step.to_string(),
                    message: message.map(str::to_string),
                });
                true
            }
            _ => false,
        });
    }

    pub fn on_batch_token(&self, token: &str) {
        self.set_token(token, |t| &mut t.modpack);
    }

    pub fn on_loader_token(&self, token: &str) {
        self.set_token(token, |t| &mut t.instance);
    }

    pub fn on_operation_cancelled(&self, token: &str) {
        let ours = self
            .shared
            .state
            .borrow()
            .operation
            .as_ref()
            .is_some_and(|op| op.tokens.contains(token));
        if ours {
            tracing::info!("Install operation {token} cancelled");
            self.finish(InstallOutcome::Cancelled);
        }
    }

    pub fn on_batch_progress(&self, progress: BatchProgress) {
        if progress.stage == BatchStage::Cancelled {
            if self.shared.state.borrow().installing() {
                tracing::info!("Download batch reported cancellation");
                self.finish(InstallOutcome::Cancelled);
            }
            return;
        }
        self.shared.state.send_if_modified(|s| match s.operation.as_mut() {
            Some(op) if op.phase == Phase::Running => {
                op.batch = Some(progress);
                true
            }
            _ => false,
        });
    }

    pub fn on_summary(&self, summary: InstallSummary) {
        self.shared.state.send_if_modified(|s| match s.operation.as_mut() {
            Some(op) => {
                if summary.needs_review() {
                    tracing::warn!(
                        "{} of {} mods could not be resolved",
                        summary.failed.len(),
                        summary.total_mods
                    );
                }
                op.summary = Some(summary);
                true
            }
            None => false,
        });
    }

    /// Rows are tracked with or without an active install.
    pub fn on_download_progress(&self, progress: DownloadProgress) {
        let id = progress.id.clone();
        let mut fate = RowFate::Kept;
        self.shared.state.send_modify(|s| {
            fate = s.downloads.apply(progress);
        });
        let RowFate::Expiring { seq } = fate else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            if !this.ctx.pause(this.ctx.settings.download_grace).await {
                return;
            }
            this.shared
                .state
                .send_if_modified(|s| s.downloads.expire(&id, seq));
        });
    }

    /// Ask the backend to cancel both jobs. The operation closes once the
    /// backend confirms through an event or the install call ends.
    pub async fn cancel(&self) -> Result<Option<CancelReport>, EngineError> {
        let mut tokens = None;
        self.shared.state.send_if_modified(|s| match s.operation.as_mut() {
            Some(op) if op.phase == Phase::Running => {
                op.cancel_requested = true;
                tokens = Some(op.tokens.clone());
                s.status_line = Some(CANCELLING_TEXT.to_string());
                true
            }
            _ => false,
        });
        let Some(tokens) = tokens else {
            return Ok(None);
        };
        if tokens.is_empty() {
            tracing::warn!("Cancel requested before the backend announced any operation");
        }

        let gateway = self.ctx.gateway.clone();
        let report = self
            .ctx
            .unless_torn_down(tokens.cancel_all(gateway.as_ref()))
            .await
            .ok_or(EngineError::Disposed)?;
        Ok(Some(report))
    }

    /// Close the summary. Returns whether there was one to close.
    pub fn dismiss_summary(&self) -> bool {
        let mut done = None;
        let mut dismissed = false;
        self.shared.state.send_if_modified(|s| {
            let Some(op) = s.operation.as_mut() else {
                return false;
            };
            if op.summary.is_none() {
                return false;
            }
            dismissed = true;
            if op.phase == Phase::AwaitingSummary {
                done = s.reset().and_then(|op| op.completed_instance_id);
            } else {
                op.summary = None;
            }
            true
        });
        if let Some(instance_id) = done {
            self.complete(InstallOutcome::Completed { instance_id });
        }
        dismissed
    }

    /// Drop the operation without an outcome; the waiting caller sees the
    /// channel close.
    pub fn abandon(&self) {
        self.shared.state.send_if_modified(|s| s.reset().is_some());
        self.take_completion();
    }

    fn tracks(&self, instance_id: &str) -> bool {
        self.shared.state.borrow().operation.as_ref().is_some_and(|op| {
            op.returned_instance_id.as_deref() == Some(instance_id)
                || op.progress_instance_id.as_deref() == Some(instance_id)
        })
    }

    fn set_token(&self, token: &str, slot: impl FnOnce(&mut CancelTokens) -> &mut Option<String>) {
        let accepted = self.shared.state.send_if_modified(|s| match s.operation.as_mut() {
            Some(op) => {
                *slot(&mut op.tokens) = Some(token.to_string());
                true
            }
            None => false,
        });
        if !accepted {
            tracing::debug!("Ignoring operation token {token}: no install in progress");
        }
    }

    fn begin_close(&self, instance_id: &str) {
        let mut generation = None;
        self.shared.state.send_if_modified(|s| {
            let Some(op) = s.operation.as_mut() else {
                return false;
            };
            if op.phase != Phase::Running {
                return false;
            }
            op.phase = Phase::Closing;
            op.loader = Some(LoaderProgress::complete());
            op.completed_instance_id = Some(instance_id.to_string());
            generation = Some(op.generation);
            s.status_line = Some(READY_TEXT.to_string());
            true
        });
        let Some(generation) = generation else {
            return;
        };

        let this = self.clone();
        tokio::spawn(async move {
            if this.ctx.pause(this.ctx.settings.close_delay).await {
                this.after_close_delay(generation);
            }
        });
    }

    fn after_close_delay(&self, generation: u64) {
        let mut done = None;
        self.shared.state.send_if_modified(|s| {
            let Some(op) = s.operation.as_mut() else {
                return false;
            };
            if op.generation != generation || op.phase != Phase::Closing {
                return false;
            }
            if op.summary_pending() {
                op.phase = Phase::AwaitingSummary;
                return true;
            }
            done = s.reset().and_then(|op| op.completed_instance_id);
            true
        });
        match done {
            Some(instance_id) => self.complete(InstallOutcome::Completed { instance_id }),
            None => tracing::debug!("Install held open for summary review"),
        }
    }

    fn finish(&self, outcome: InstallOutcome) {
        if self.shared.state.send_if_modified(|s| s.reset().is_some()) {
            self.complete(outcome);
        }
    }

    fn complete(&self, outcome: InstallOutcome) {
        tracing::info!("Modpack install finished: {outcome:?}");
        if let Some(tx) = self.take_completion() {
            let _ = tx.send(outcome);
        }
    }

    fn take_completion(&self) -> Option<oneshot::Sender<InstallOutcome>> {
        self.shared
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EngineSettings;
    use crate::loopback::LoopbackBackend;
    use super::downloads::DownloadStatus;
    use tokio::sync::oneshot::error::TryRecvError;

    fn correlator() -> (InstallCorrelator, LoopbackBackend) {
        let backend = LoopbackBackend::new();
        let ctx = Arc::new(EngineContext::new(
            Arc::new(backend.clone()),
            EngineSettings::default(),
        ));
        (InstallCorrelator::new(ctx), backend)
    }

    fn summary(failed: &[&str]) -> InstallSummary {
        InstallSummary {
            total_mods: 10,
            from_modrinth: vec!["sodium".into()],
            failed: failed.iter().map(|s| s.to_string()).collect(),
            ..InstallSummary::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_before_call_returns_closes_without_second_event() {
        let (c, _) = correlator();
        let rx = c.begin().unwrap();

        c.on_created("x");
        assert!(c.state().installing());
        c.on_call_returned("x");
        assert_eq!(c.state().progress_text().as_deref(), Some(READY_TEXT));

        let outcome = rx.await.unwrap();
        assert_eq!(outcome, InstallOutcome::Completed { instance_id: "x".into() });
        assert!(!c.state().installing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_after_call_returns() {
        let (c, _) = correlator();
        let mut rx = c.begin().unwrap();

        c.on_call_returned("x");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        c.on_created("x");
        assert_eq!(
            rx.await.unwrap(),
            InstallOutcome::Completed { instance_id: "x".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_for_other_instance_is_ignored() {
        let (c, _) = correlator();
        let mut rx = c.begin().unwrap();

        c.on_instance_installing("x");
        c.on_created("other");
        c.on_call_returned("x");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_second_begin_is_rejected() {
        let (c, _) = correlator();
        let _rx = c.begin().unwrap();
        assert!(matches!(c.begin(), Err(EngineError::InstallInProgress)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_with_failures_holds_teardown() {
        let (c, _) = correlator();
        let mut rx = c.begin().unwrap();

        c.on_call_returned("x");
        c.on_summary(summary(&["optifine"]));
        c.on_created("x");
        tokio::time::sleep(Duration::from_secs(5)).await;

        let state = c.state();
        assert!(state.installing());
        assert_eq!(state.pending_summary().unwrap().failed, vec!["optifine"]);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        assert!(c.dismiss_summary());
        assert_eq!(
            rx.await.unwrap(),
            InstallOutcome::Completed { instance_id: "x".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_summary_does_not_hold_teardown() {
        let (c, _) = correlator();
        let rx = c.begin().unwrap();
        c.on_summary(summary(&[]));
        c.on_call_returned("x");
        c.on_created("x");
        assert!(matches!(rx.await.unwrap(), InstallOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_hits_both_tokens_then_waits_for_confirmation() {
        let (c, backend) = correlator();
        let rx = c.begin().unwrap();
        c.on_batch_token("batch-1");
        c.on_loader_token("loader-1");

        let report = c.cancel().await.unwrap().unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(backend.call_count("cancel_operation"), 2);
        assert_eq!(c.state().progress_text().as_deref(), Some(CANCELLING_TEXT));

        c.on_operation_cancelled("loader-1");
        assert_eq!(rx.await.unwrap(), InstallOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_same_token_once_and_failures_are_collected() {
        let (_, backend) = correlator();
        let same = CancelTokens {
            modpack: Some("t".into()),
            instance: Some("t".into()),
        };
        assert_eq!(same.cancel_all(&backend).await.attempted, 1);

        backend.fail("cancel_operation", "pipe closed");
        let both = CancelTokens {
            modpack: Some("a".into()),
            instance: Some("b".into()),
        };
        let report = both.cancel_all(&backend).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(backend.call_count("cancel_operation"), 3);
    }

    #[tokio::test]
    async fn test_cancelled_stage_closes_operation() {
        let (c, _) = correlator();
        let rx = c.begin().unwrap();
        c.on_batch_progress(BatchProgress {
            stage: BatchStage::Cancelled,
            current: 0,
            total: 0,
            current_file: None,
        });
        assert_eq!(rx.await.unwrap(), InstallOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_call_failure_after_cancel_is_cancelled() {
        let (c, _) = correlator();
        let rx = c.begin().unwrap();
        c.cancel().await.unwrap();
        c.on_call_failed(GatewayError::new("install_modpack", "aborted"));
        assert_eq!(rx.await.unwrap(), InstallOutcome::Cancelled);
        assert_eq!(c.ctx.status().error, None);
    }

    #[tokio::test]
    async fn test_call_failure_reports_error() {
        let (c, _) = correlator();
        let rx = c.begin().unwrap();
        c.on_call_failed(GatewayError::new("install_modpack", "bad manifest"));
        assert_eq!(
            rx.await.unwrap(),
            InstallOutcome::Failed("install_modpack failed: bad manifest".into())
        );
        assert!(c.ctx.status().error.is_some());
    }

    #[tokio::test]
    async fn test_progress_follows_tracked_instance_only() {
        let (c, _) = correlator();
        let _rx = c.begin().unwrap();
        c.on_instance_installing("x");
        c.on_loader_progress("y", "java", Some("Installing Java"));
        assert_eq!(c.state().progress_text().as_deref(), Some("Installing..."));

        c.on_loader_progress("x", "forge", Some("Running Forge installer"));
        assert_eq!(
            c.state().progress_text().as_deref(),
            Some("Running Forge installer")
        );
        c.on_batch_progress(BatchProgress {
            stage: BatchStage::DownloadingMods,
            current: 3,
            total: 12,
            current_file: Some("jei.jar".into()),
        });
        assert_eq!(
            c.state().progress_text().as_deref(),
            Some("Downloading mods (3/12): jei.jar")
        );
        assert_eq!(c.state().progress_percent(), Some(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_download_row_expires_after_grace() {
        let (c, _) = correlator();
        c.on_download_progress(DownloadProgress {
            id: "jei".into(),
            name: "jei.jar".into(),
            downloaded: 10,
            total: 100,
            speed: 0,
            status: DownloadStatus::Failed,
            source: Some("curseforge".into()),
        });
        assert_eq!(c.state().download_count(), 1);

        tokio::time::sleep(c.ctx.settings.download_grace + Duration::from_millis(10)).await;
        assert_eq!(c.state().download_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refailed_download_row_gets_full_grace() {
        let (c, _) = correlator();
        let grace = c.ctx.settings.download_grace;
        let update = |status: DownloadStatus| DownloadProgress {
            id: "jei".into(),
            name: "jei.jar".into(),
            downloaded: 10,
            total: 100,
            speed: 0,
            status,
            source: None,
        };

        c.on_download_progress(update(DownloadStatus::Failed));
        tokio::time::sleep(grace / 2).await;
        c.on_download_progress(update(DownloadStatus::Downloading));
        c.on_download_progress(update(DownloadStatus::Failed));

        // First timer fires here; the second failure must still be shown
        tokio::time::sleep(grace / 2 + Duration::from_millis(10)).await;
        assert_eq!(c.state().download_count(), 1);

        tokio::time::sleep(grace / 2).await;
        assert_eq!(c.state().download_count(), 0);
    }

    #[tokio::test]
    async fn test_abandon_closes_channel() {
        let (c, _) = correlator();
        let rx = c.begin().unwrap();
        c.abandon();
        assert!(rx.await.is_err());
        assert!(!c.state().installing());
    }
}
