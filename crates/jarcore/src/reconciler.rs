//! Applies backend push events to the store and guard.
//!
//! Events are authoritative over local optimism: every handler merges what
//! the event says, whatever the store held before. Handlers run one at a
//! time on a single task. Anything that needs a backend call is spawned and
//! re-checks the store when it resumes.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::{log_best_effort, EngineContext};
use crate::events::BackendEvent;
use crate::install::InstallCorrelator;
use crate::instance::{Instance, InstancePatch, InstanceStatus, InstanceType};

pub(crate) struct EventReconciler {
    ctx: Arc<EngineContext>,
    install: InstallCorrelator,
}

impl EventReconciler {
    pub fn new(ctx: Arc<EngineContext>, install: InstallCorrelator) -> Self {
        Self { ctx, install }
    }

    pub async fn run(self, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
        let shutdown = self.ctx.shutdown_token();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }
        tracing::debug!("Event reconciler stopped");
    }

    pub fn handle(&self, event: BackendEvent) {
        if self.ctx.is_torn_down() {
            return;
        }
        let store = &self.ctx.store;
        let guard = &self.ctx.guard;

        match event {
            BackendEvent::StatusChanged { id, status } => {
                if !store.set_status(&id, status) {
                    tracing::debug!("Status {status} for untracked instance {id}");
                }
                if status.releases_guard() {
                    guard.release(&id);
                }
            }
            BackendEvent::Installing { id, name } => {
                self.install.on_instance_installing(&id);
                if !store.set_status(&id, InstanceStatus::Installing) {
                    store.insert_if_absent(Instance::new(
                        id.clone(),
                        name,
                        InstanceType::Client,
                        InstanceStatus::Installing,
                    ));
                    self.spawn_hydrate(id);
                }
            }
            BackendEvent::InstallProgress { id, step, message } => {
                store.patch(&id, &InstancePatch::default().with_step(Some(step.clone())));
                self.install
                    .on_loader_progress(&id, &step, message.as_deref());
            }
            BackendEvent::Created { id } => {
                if !store.patch(&id, &InstancePatch::settled(InstanceStatus::Stopped)) {
                    self.spawn_fetch_created(id.clone());
                }
                guard.release(&id);
                self.install.on_created(&id);
            }
            BackendEvent::Reinstalled { id } | BackendEvent::Repaired { id } => {
                store.patch(&id, &InstancePatch::settled(InstanceStatus::Stopped));
                guard.release(&id);
            }
            BackendEvent::Reinstalling { id } | BackendEvent::Repairing { id } => {
                store.set_status(&id, InstanceStatus::Installing);
            }
            BackendEvent::CreationFailed { id, error } => {
                self.mark_failed(&id, error.clone());
                self.install.on_creation_failed(&id, error.as_deref());
            }
            BackendEvent::ReinstallFailed { id, error }
            | BackendEvent::RepairFailed { id, error } => {
                self.mark_failed(&id, error);
            }
            BackendEvent::Removed { id } => {
                if store.remove(&id).is_some() {
                    tracing::info!("Instance {id} removed");
                }
                guard.release(&id);
            }
            BackendEvent::ServerRestartNow { instance_id } => {
                tracing::info!("Server {instance_id} requested a restart");
                store.set_status(&instance_id, InstanceStatus::Stopped);
                guard.release(&instance_id);
                tokio::spawn(restart_after_delay(self.ctx.clone(), instance_id));
            }
            BackendEvent::ModpackOperationStarted { operation_id } => {
                self.install.on_batch_token(&operation_id);
            }
            BackendEvent::InstanceOperationStarted { operation_id } => {
                self.install.on_loader_token(&operation_id);
            }
            BackendEvent::OperationCancelled { id } => {
                self.install.on_operation_cancelled(&id);
            }
            BackendEvent::ModpackInstallProgress(progress) => {
                self.install.on_batch_progress(progress);
            }
            BackendEvent::ModpackInstallSummary(summary) => {
                self.install.on_summary(summary);
            }
            BackendEvent::DownloadProgress(progress) => {
                self.install.on_download_progress(progress);
            }
        }
    }

    fn mark_failed(&self, id: &str, error: Option<String>) {
        if let Some(message) = &error {
            tracing::warn!("Installation of {id} failed: {message}");
        }
        self.ctx.store.patch(
            id,
            &InstancePatch::status(InstanceStatus::Error).with_error(error),
        );
        self.ctx.guard.release(id);
    }

    /// Replace the placeholder from `instance-installing` with the real record.
    fn spawn_hydrate(&self, id: String) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let gateway = ctx.gateway.clone();
            match ctx.unless_torn_down(gateway.get_instance(&id)).await {
                None => {}
                Some(Ok(mut fresh)) => {
                    // Only while nothing newer has touched the placeholder
                    if ctx.store.status(&id) == Some(InstanceStatus::Installing) {
                        fresh.status = InstanceStatus::Installing;
                        ctx.store.upsert(fresh);
                    }
                }
                Some(Err(e)) => log_best_effort("Instance fetch", &id, &e),
            }
        });
    }

    /// `instance-created` for a record the store has never seen.
    fn spawn_fetch_created(&self, id: String) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let gateway = ctx.gateway.clone();
            match ctx.unless_torn_down(gateway.get_instance(&id)).await {
                None => {}
                Some(Ok(mut fresh)) => {
                    fresh.status = InstanceStatus::Stopped;
                    fresh.installation_step = None;
                    fresh.installation_error = None;
                    ctx.store.insert_if_absent(fresh);
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        "Could not fetch created instance {id}, adding a placeholder: {e}"
                    );
                    ctx.store.insert_if_absent(Instance::new(
                        id.clone(),
                        id,
                        InstanceType::Client,
                        InstanceStatus::Stopped,
                    ));
                }
            }
        });
    }
}

/// Second half of a `server-restart-now`: the record has already been marked
/// stopped, so every event handled meanwhile can veto the restart.
async fn restart_after_delay(ctx: Arc<EngineContext>, id: String) {
    if !ctx.pause(ctx.settings.restart_delay).await {
        return;
    }
    if !still_stopped(&ctx, &id) {
        return;
    }

    let gateway = ctx.gateway.clone();
    match ctx.unless_torn_down(gateway.save_launch_snapshot(&id)).await {
        None => return,
        Some(Err(e)) => log_best_effort("Launch snapshot", &id, &e),
        Some(Ok(())) => {}
    }
    if !still_stopped(&ctx, &id) {
        return;
    }

    let Some(result) = ctx.unless_torn_down(gateway.start_instance(&id)).await else {
        return;
    };
    match result {
        Ok(()) => tracing::info!("Server {id} restarted"),
        Err(e) => {
            tracing::error!("Auto-restart of {id} failed: {e}");
            ctx.store.set_status(&id, InstanceStatus::Crashed);
        }
    }
}

fn still_stopped(ctx: &EngineContext, id: &str) -> bool {
    match ctx.store.status(id) {
        Some(InstanceStatus::Stopped) => true,
        Some(status) => {
            tracing::info!("Auto-restart of {id} skipped: now {status}");
            false
        }
        None => {
            tracing::info!("Auto-restart of {id} skipped: instance is gone");
            false
        }
    }
}
