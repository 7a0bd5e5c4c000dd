//! Start/stop/delete/repair/reinstall/update requests.
//!
//! Each guarded request applies its optimistic status, calls the backend,
//! and reconciles with the response. Guards for start and stop stay up
//! until a settled status is observed (the backend's process supervisor
//! reports it later); delete, repair and reinstall release their guard as
//! soon as the call returns, whatever the outcome.

use std::sync::Arc;

use crate::context::{log_best_effort, EngineContext};
use crate::error::EngineError;
use crate::gateway::InstanceUpdate;
use crate::instance::{Instance, InstancePatch, InstanceStatus};

/// Whether a request reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Issued,
    /// Dropped without a backend call: guarded, or in a state that makes it moot.
    Skipped,
}

#[derive(Clone, Copy)]
enum GuardedCall {
    Delete,
    Reinstall,
    Repair,
}

impl GuardedCall {
    fn label(self) -> &'static str {
        match self {
            GuardedCall::Delete => "delete",
            GuardedCall::Reinstall => "reinstall",
            GuardedCall::Repair => "repair",
        }
    }
}

#[derive(Clone)]
pub(crate) struct LifecycleCoordinator {
    ctx: Arc<EngineContext>,
}

impl LifecycleCoordinator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn start(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.ctx.ensure_live()?;

        if let Some(status) = self.ctx.store.status(id) {
            if status.blocks_start() {
                tracing::info!("Ignoring start for {id}: already {status}");
                return Ok(Dispatch::Skipped);
            }
        }
        if !self.ctx.guard.try_acquire(id) {
            tracing::info!("Ignoring start for {id}: another operation is in flight");
            return Ok(Dispatch::Skipped);
        }

        self.ctx.store.set_status(id, InstanceStatus::Starting);

        let gateway = self.ctx.gateway.clone();
        match self.ctx.unless_torn_down(gateway.save_launch_snapshot(id)).await {
            None => return Err(EngineError::Disposed),
            Some(Err(e)) => log_best_effort("Launch snapshot", id, &e),
            Some(Ok(())) => {}
        }

        let Some(result) = self.ctx.unless_torn_down(gateway.start_instance(id)).await else {
            return Err(EngineError::Disposed);
        };
        if let Err(e) = result {
            self.ctx.store.set_status(id, InstanceStatus::Stopped);
            self.ctx.guard.release(id);
            return Err(self.ctx.surface(e));
        }

        tracing::info!("Start requested for {id}");

        // The status event may be late or lost; ask for the real state now.
        match self.ctx.unless_torn_down(gateway.get_instance(id)).await {
            None => return Err(EngineError::Disposed),
            Some(Ok(fresh)) => {
                self.ctx.store.set_status(id, fresh.status);
                if fresh.status.is_terminal() {
                    self.ctx.guard.release(id);
                }
            }
            Some(Err(e)) => log_best_effort("Post-start status fetch", id, &e),
        }

        Ok(Dispatch::Issued)
    }

    pub async fn stop(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.ctx.ensure_live()?;

        let current = self.ctx.store.get(id);
        if let Some(status) = current.as_ref().map(|i| i.status) {
            if status.blocks_stop() {
                tracing::info!("Ignoring stop for {id}: already {status}");
                return Ok(Dispatch::Skipped);
            }
        }
        if !self.ctx.guard.try_acquire(id) {
            tracing::info!("Ignoring stop for {id}: another operation is in flight");
            return Ok(Dispatch::Skipped);
        }

        let running_server = current
            .as_ref()
            .is_some_and(|i| i.is_server() && i.status == InstanceStatus::Running);

        self.ctx.store.set_status(id, InstanceStatus::Stopping);

        let gateway = self.ctx.gateway.clone();
        if running_server {
            match self.ctx.unless_torn_down(gateway.graceful_stop_server(id)).await {
                None => return Err(EngineError::Disposed),
                Some(Ok(())) => {
                    // The process exit arrives later as a status event.
                    tracing::info!("Graceful stop sent to server {id}");
                    return Ok(Dispatch::Issued);
                }
                Some(Err(e)) => {
                    tracing::warn!("Graceful stop failed for {id}, forcing: {e}");
                }
            }
        }

        let Some(result) = self.ctx.unless_torn_down(gateway.stop_instance(id)).await else {
            return Err(EngineError::Disposed);
        };
        match result {
            Ok(()) => {
                tracing::info!("Stop requested for {id}");
                Ok(Dispatch::Issued)
            }
            Err(e) => {
                self.ctx.store.set_status(id, InstanceStatus::Running);
                self.ctx.guard.release(id);
                Err(self.ctx.surface(e))
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.guarded_call(id, GuardedCall::Delete).await
    }

    pub async fn reinstall(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.guarded_call(id, GuardedCall::Reinstall).await
    }

    pub async fn repair(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.guarded_call(id, GuardedCall::Repair).await
    }

    /// Metadata edit. Not guarded; concurrent edits are fine.
    pub async fn update(&self, id: &str, update: &InstanceUpdate) -> Result<Instance, EngineError> {
        self.ctx.ensure_live()?;
        let gateway = self.ctx.gateway.clone();
        let Some(result) = self
            .ctx
            .unless_torn_down(gateway.update_instance(id, update))
            .await
        else {
            return Err(EngineError::Disposed);
        };
        match result {
            Ok(instance) => {
                self.ctx.store.upsert(instance.clone());
                Ok(instance)
            }
            Err(e) => Err(self.ctx.surface(e)),
        }
    }

    async fn guarded_call(&self, id: &str, call: GuardedCall) -> Result<Dispatch, EngineError> {
        self.ctx.ensure_live()?;
        if !self.ctx.guard.try_acquire(id) {
            tracing::info!(
                "Ignoring {} for {id}: another operation is in flight",
                call.label()
            );
            return Ok(Dispatch::Skipped);
        }

        let gateway = self.ctx.gateway.clone();
        let outcome = match call {
            GuardedCall::Delete => self.ctx.unless_torn_down(gateway.delete_instance(id)).await,
            GuardedCall::Reinstall => {
                self.ctx
                    .unless_torn_down(gateway.reinstall_instance(id))
                    .await
            }
            GuardedCall::Repair => self.ctx.unless_torn_down(gateway.repair_instance(id)).await,
        };
        let Some(result) = outcome else {
            return Err(EngineError::Disposed);
        };

        let reply = match result {
            Ok(()) => {
                match call {
                    GuardedCall::Delete => {
                        self.ctx.store.remove(id);
                    }
                    GuardedCall::Reinstall | GuardedCall::Repair => {
                        self.ctx
                            .store
                            .patch(id, &InstancePatch::status(InstanceStatus::Installing));
                    }
                }
                tracing::info!("{} requested for {id}", call.label());
                Ok(Dispatch::Issued)
            }
            Err(e) => Err(self.ctx.surface(e)),
        };
        self.ctx.guard.release(id);
        reply
    }
}
