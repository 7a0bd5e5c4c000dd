//! State shared by the coordinator, reconciler, correlator and sweeper.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSettings;
use crate::error::{EngineError, GatewayError};
use crate::gateway::RemoteGateway;
use crate::guard::OperationGuard;
use crate::instance::InstanceStore;

/// Subsystem-wide flags exposed to the rendering layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub loading: bool,
    /// Last call failure. One value for the whole engine; the next failure overwrites it.
    pub error: Option<String>,
}

pub(crate) struct EngineContext {
    pub store: InstanceStore,
    pub guard: OperationGuard,
    pub gateway: Arc<dyn RemoteGateway>,
    pub settings: EngineSettings,
    status: watch::Sender<EngineStatus>,
    shutdown: CancellationToken,
}

impl EngineContext {
    pub fn new(gateway: Arc<dyn RemoteGateway>, settings: EngineSettings) -> Self {
        let (status, _rx) = watch::channel(EngineStatus::default());
        Self {
            store: InstanceStore::new(),
            guard: OperationGuard::new(),
            gateway,
            settings,
            status,
            shutdown: CancellationToken::new(),
        }
    }

    /// Checked before every state write that follows a suspension point.
    pub fn is_torn_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn ensure_live(&self) -> Result<(), EngineError> {
        if self.is_torn_down() {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    pub fn tear_down(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sleep unless torn down first. Returns `false` if the engine went away.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(duration) => !self.is_torn_down(),
        }
    }

    /// Run `fut` unless torn down first. `None` if the engine went away.
    pub async fn unless_torn_down<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            () = self.shutdown.cancelled() => None,
            out = fut => (!self.is_torn_down()).then_some(out),
        }
    }

    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.status.send_modify(|s| s.error = Some(message));
    }

    /// Turn a rejected call into the error returned to the caller, recording it.
    pub fn surface(&self, err: GatewayError) -> EngineError {
        self.report_error(err.to_string());
        EngineError::Gateway(err)
    }

    pub fn clear_error(&self) {
        self.status.send_if_modified(|s| s.error.take().is_some());
    }

    pub fn set_loading(&self, loading: bool) {
        self.status.send_if_modified(|s| {
            let changed = s.loading != loading;
            s.loading = loading;
            changed
        });
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }
}

/// Best-effort failures are only worth a line in development builds.
pub(crate) fn log_best_effort(what: &str, id: &str, err: &dyn std::fmt::Display) {
    if cfg!(debug_assertions) {
        tracing::debug!("{what} for {id} failed (ignored): {err}");
    }
}
