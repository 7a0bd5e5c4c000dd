//! The instance engine: one owned service the rendering layer talks to.
//!
//! Create it with a gateway and an event bus, call [`InstanceEngine::init`]
//! from inside a tokio runtime, and [`InstanceEngine::dispose`] (or drop it)
//! when done. Renderers read through the snapshot and `subscribe_*` views;
//! only the engine writes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::EngineSettings;
use crate::context::{EngineContext, EngineStatus};
use crate::error::EngineError;
use crate::events::{self, EventBus, Subscription};
use crate::gateway::{CreateInstanceRequest, InstanceUpdate, ModpackInstallRequest, RemoteGateway};
use crate::install::{CancelReport, InstallCorrelator, InstallOutcome, InstallState};
use crate::instance::store::InstanceMap;
use crate::instance::Instance;
use crate::lifecycle::{Dispatch, LifecycleCoordinator};
use crate::reconciler::EventReconciler;
use crate::sweeper;

struct Runtime {
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct InstanceEngine {
    ctx: Arc<EngineContext>,
    lifecycle: LifecycleCoordinator,
    install: InstallCorrelator,
    bus: Arc<dyn EventBus>,
    runtime: Mutex<Option<Runtime>>,
}

impl InstanceEngine {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        bus: Arc<dyn EventBus>,
        settings: EngineSettings,
    ) -> Self {
        let ctx = Arc::new(EngineContext::new(gateway, settings));
        Self {
            lifecycle: LifecycleCoordinator::new(ctx.clone()),
            install: InstallCorrelator::new(ctx.clone()),
            ctx,
            bus,
            runtime: Mutex::new(None),
        }
    }

    /// Subscribe to the bus and spawn the background tasks. Calling it
    /// again is a no-op.
    pub fn init(&self) -> Result<(), EngineError> {
        self.ctx.ensure_live()?;
        let mut runtime = self.runtime();
        if runtime.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = events::subscribe_all(self.bus.as_ref(), &tx);

        let reconciler = EventReconciler::new(self.ctx.clone(), self.install.clone());
        let mut tasks = vec![
            tokio::spawn(reconciler.run(rx)),
            tokio::spawn(sweeper::run_sweeper(self.ctx.clone())),
        ];
        if let Some(period) = self.ctx.settings.resync_interval {
            tasks.push(tokio::spawn(sweeper::run_resync(self.ctx.clone(), period)));
        }

        tracing::info!(
            "Instance engine ready ({} event subscriptions)",
            subscriptions.len()
        );
        *runtime = Some(Runtime {
            subscriptions,
            tasks,
        });
        Ok(())
    }

    /// Stop everything. Pending continuations see the teardown and make no
    /// further writes; later calls fail with [`EngineError::Disposed`].
    pub fn dispose(&self) {
        if self.ctx.is_torn_down() {
            return;
        }
        self.ctx.tear_down();
        if let Some(runtime) = self.runtime().take() {
            drop(runtime.subscriptions);
            for task in runtime.tasks {
                task.abort();
            }
        }
        self.install.abandon();
        tracing::info!("Instance engine disposed");
    }

    fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_ready(&self) -> Result<(), EngineError> {
        self.ctx.ensure_live()?;
        if self.runtime().is_none() {
            return Err(EngineError::NotInitialized);
        }
        Ok(())
    }

    // --- operations ---

    /// Replace the store with the backend's list.
    pub async fn load(&self) -> Result<(), EngineError> {
        self.ensure_ready()?;
        self.ctx.set_loading(true);
        let gateway = self.ctx.gateway.clone();
        let Some(result) = self.ctx.unless_torn_down(gateway.list_instances()).await else {
            return Err(EngineError::Disposed);
        };
        self.ctx.set_loading(false);

        let instances = result.map_err(|e| self.ctx.surface(e))?;
        tracing::info!("Loaded {} instances", instances.len());
        self.ctx.store.replace_all(instances);
        Ok(())
    }

    pub async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> Result<Instance, EngineError> {
        self.ensure_ready()?;
        let gateway = self.ctx.gateway.clone();
        let Some(result) = self.ctx.unless_torn_down(gateway.create_instance(req)).await else {
            return Err(EngineError::Disposed);
        };
        let instance = result.map_err(|e| self.ctx.surface(e))?;
        tracing::info!("Created instance {} ({})", instance.name, instance.id);
        // The created event may already have settled it
        self.ctx.store.insert_if_absent(instance.clone());
        Ok(instance)
    }

    pub async fn start_instance(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.ensure_ready()?;
        self.lifecycle.start(id).await
    }

    pub async fn stop_instance(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.ensure_ready()?;
        self.lifecycle.stop(id).await
    }

    pub async fn delete_instance(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.ensure_ready()?;
        self.lifecycle.delete(id).await
    }

    pub async fn reinstall_instance(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.ensure_ready()?;
        self.lifecycle.reinstall(id).await
    }

    pub async fn repair_instance(&self, id: &str) -> Result<Dispatch, EngineError> {
        self.ensure_ready()?;
        self.lifecycle.repair(id).await
    }

    pub async fn update_instance(
        &self,
        id: &str,
        update: &InstanceUpdate,
    ) -> Result<Instance, EngineError> {
        self.ensure_ready()?;
        self.lifecycle.update(id, update).await
    }

    /// Install a modpack into a new instance and wait until the install is
    /// fully closed (including any summary the user must dismiss).
    pub async fn install_modpack(
        &self,
        req: &ModpackInstallRequest,
    ) -> Result<InstallOutcome, EngineError> {
        self.ensure_ready()?;
        let done = self.install.begin()?;

        let gateway = self.ctx.gateway.clone();
        match self.ctx.unless_torn_down(gateway.install_modpack(req)).await {
            None => return Err(EngineError::Disposed),
            Some(Ok(instance_id)) => self.install.on_call_returned(&instance_id),
            Some(Err(e)) => self.install.on_call_failed(e),
        }

        match self.ctx.unless_torn_down(done).await {
            Some(Ok(outcome)) => Ok(outcome),
            _ => Err(EngineError::Disposed),
        }
    }

    /// Cancel the running install. `None` if nothing was running.
    pub async fn cancel_install(&self) -> Result<Option<CancelReport>, EngineError> {
        self.ensure_ready()?;
        self.install.cancel().await
    }

    pub fn dismiss_install_summary(&self) -> bool {
        self.install.dismiss_summary()
    }

    // --- views ---

    pub fn instances(&self) -> Vec<Instance> {
        self.ctx.store.list()
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.ctx.store.get(id)
    }

    pub fn subscribe_instances(&self) -> watch::Receiver<InstanceMap> {
        self.ctx.store.subscribe()
    }

    /// Whether a guarded request for `id` is still outstanding.
    pub fn is_busy(&self, id: &str) -> bool {
        self.ctx.guard.contains(id)
    }

    pub fn status(&self) -> EngineStatus {
        self.ctx.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.ctx.subscribe_status()
    }

    pub fn clear_error(&self) {
        self.ctx.clear_error();
    }

    pub fn install_state(&self) -> InstallState {
        self.install.state()
    }

    pub fn subscribe_install(&self) -> watch::Receiver<InstallState> {
        self.install.subscribe()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }
}

impl Drop for InstanceEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::gateway::ModpackSource;
    use crate::instance::{InstanceStatus, InstanceType};
    use crate::loopback::LoopbackBackend;

    fn client(id: &str, status: InstanceStatus) -> Instance {
        Instance::new(id, "Vanilla", InstanceType::Client, status)
    }

    fn server(id: &str, status: InstanceStatus) -> Instance {
        Instance::new(id, "Survival SMP", InstanceType::Server, status)
    }

    async fn engine_with(instances: Vec<Instance>) -> (InstanceEngine, LoopbackBackend) {
        let backend = LoopbackBackend::with_instances(instances);
        let engine = InstanceEngine::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            EngineSettings::default(),
        );
        engine.init().unwrap();
        engine.load().await.unwrap();
        (engine, backend)
    }

    /// Let the reconciler drain the events emitted so far.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_issues_one_call() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;
        backend.set_latency(Duration::from_millis(50));

        let (first, second) = tokio::join!(engine.start_instance("a"), engine.start_instance("a"));

        let mut results = vec![first.unwrap(), second.unwrap()];
        results.sort_by_key(|d| *d == Dispatch::Skipped);
        assert_eq!(results, vec![Dispatch::Issued, Dispatch::Skipped]);
        assert_eq!(backend.call_count("start_instance"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_running_event_clears_guard() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;

        assert_eq!(engine.start_instance("a").await.unwrap(), Dispatch::Issued);
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Starting);
        assert!(engine.is_busy("a"));

        backend.emit(
            "instance-status-changed",
            json!({ "id": "a", "status": "running" }),
        );
        settle().await;

        assert!(!engine.is_busy("a"));
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_failure_does_not_block_start() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;
        backend.fail("save_launch_snapshot", "disk full");

        assert_eq!(engine.start_instance("a").await.unwrap(), Dispatch::Issued);
        assert_eq!(backend.call_count("start_instance"), 1);
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Starting);
        assert_eq!(engine.status().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_reverts_to_stopped() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;
        backend.fail("start_instance", "java not found");

        let err = engine.start_instance("a").await.unwrap_err();
        assert!(matches!(err, EngineError::Gateway(_)));
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Stopped);
        assert!(!engine.is_busy("a"));
        assert_eq!(
            engine.status().error.as_deref(),
            Some("start_instance failed: java not found")
        );

        engine.clear_error();
        assert_eq!(engine.status().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_adopts_settled_status_from_fetch() {
        let (engine, backend) = engine_with(vec![
            client("a", InstanceStatus::Stopped),
            client("b", InstanceStatus::Stopped),
        ])
        .await;

        backend.set_start_status(InstanceStatus::Running);
        assert_eq!(engine.start_instance("a").await.unwrap(), Dispatch::Issued);
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Running);
        assert!(!engine.is_busy("a"));

        backend.set_start_status(InstanceStatus::Error);
        engine.start_instance("b").await.unwrap();
        assert_eq!(engine.instance("b").unwrap().status, InstanceStatus::Error);
        assert!(!engine.is_busy("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fetch_failure_waits_for_event() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;
        backend.set_start_status(InstanceStatus::Running);
        backend.fail("get_instance", "timed out");

        assert_eq!(engine.start_instance("a").await.unwrap(), Dispatch::Issued);
        assert_eq!(backend.call_count("get_instance"), 1);
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Starting);
        assert!(engine.is_busy("a"));
        assert_eq!(engine.status().error, None);

        backend.emit(
            "instance-status-changed",
            json!({ "id": "a", "status": "running" }),
        );
        settle().await;
        assert!(!engine.is_busy("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_ignored_while_running() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Running)]).await;
        assert_eq!(engine.start_instance("a").await.unwrap(), Dispatch::Skipped);
        assert_eq!(backend.call_count("start_instance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_failure_forces_once() {
        let (engine, backend) = engine_with(vec![server("s", InstanceStatus::Running)]).await;
        backend.fail("graceful_stop_server", "rcon unreachable");

        assert_eq!(engine.stop_instance("s").await.unwrap(), Dispatch::Issued);
        assert_eq!(backend.call_count("graceful_stop_server"), 1);
        assert_eq!(backend.call_count("stop_instance"), 1);
        assert_eq!(engine.instance("s").unwrap().status, InstanceStatus::Stopping);
        assert!(engine.is_busy("s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_keeps_guard_until_event() {
        let (engine, backend) = engine_with(vec![server("s", InstanceStatus::Running)]).await;

        assert_eq!(engine.stop_instance("s").await.unwrap(), Dispatch::Issued);
        assert_eq!(backend.call_count("stop_instance"), 0);
        assert!(engine.is_busy("s"));

        backend.emit(
            "instance-status-changed",
            json!({ "id": "s", "status": "stopped" }),
        );
        settle().await;
        assert!(!engine.is_busy("s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_stop_skips_graceful() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Running)]).await;
        engine.stop_instance("a").await.unwrap();
        assert_eq!(backend.call_count("graceful_stop_server"), 0);
        assert_eq!(backend.call_count("stop_instance"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_reverts_to_running() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Running)]).await;
        backend.fail("stop_instance", "no such process");

        assert!(engine.stop_instance("a").await.is_err());
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Running);
        assert!(!engine.is_busy("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_releases_guard_either_way() {
        let (engine, backend) = engine_with(vec![
            client("a", InstanceStatus::Stopped),
            client("b", InstanceStatus::Stopped),
        ])
        .await;

        assert_eq!(engine.delete_instance("a").await.unwrap(), Dispatch::Issued);
        assert!(engine.instance("a").is_none());
        assert!(!engine.is_busy("a"));

        backend.fail("delete_instance", "files locked");
        assert!(engine.delete_instance("b").await.is_err());
        assert!(engine.instance("b").is_some());
        assert!(!engine.is_busy("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_sets_installing_and_releases_guard() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;

        assert_eq!(engine.repair_instance("a").await.unwrap(), Dispatch::Issued);
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Installing);
        assert!(!engine.is_busy("a"));

        backend.emit("instance-repaired", json!({ "id": "a" }));
        settle().await;
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinstall_sets_installing_and_releases_guard() {
        let (engine, backend) = engine_with(vec![
            client("a", InstanceStatus::Stopped),
            client("b", InstanceStatus::Stopped),
        ])
        .await;

        assert_eq!(engine.reinstall_instance("a").await.unwrap(), Dispatch::Issued);
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Installing);
        assert!(!engine.is_busy("a"));

        backend.emit("instance-reinstalled", json!({ "id": "a" }));
        settle().await;
        assert_eq!(engine.instance("a").unwrap().status, InstanceStatus::Stopped);

        backend.fail("reinstall_instance", "version manifest missing");
        assert!(engine.reinstall_instance("b").await.is_err());
        assert_eq!(engine.instance("b").unwrap().status, InstanceStatus::Stopped);
        assert!(!engine.is_busy("b"));
        assert_eq!(
            engine.status().error.as_deref(),
            Some("reinstall_instance failed: version manifest missing")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_replaces_record() {
        let (engine, _) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;
        let updated = engine
            .update_instance(
                "a",
                &InstanceUpdate {
                    name: Some("Renamed".into()),
                    ..InstanceUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(engine.instance("a").unwrap().name, "Renamed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_installing_event_on_empty_store() {
        let (engine, backend) = engine_with(vec![]).await;
        backend.emit("instance-installing", json!({ "id": "a", "name": "Foo" }));
        settle().await;

        let list = engine.instances();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "a");
        assert_eq!(list[0].status, InstanceStatus::Installing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_clears_guard_after_lost_event() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;
        engine.start_instance("a").await.unwrap();
        assert!(engine.is_busy("a"));

        // Settled locally, but the status event that would release the guard was lost
        engine.ctx.store.set_status("a", InstanceStatus::Error);

        tokio::time::sleep(engine.settings().sweep_interval + Duration::from_millis(10)).await;
        assert!(!engine.is_busy("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_restart_abort_after_delete() {
        let (engine, backend) = engine_with(vec![server("s", InstanceStatus::Running)]).await;

        backend.emit("server-restart-now", json!({ "instance_id": "s" }));
        settle().await;
        assert_eq!(engine.instance("s").unwrap().status, InstanceStatus::Stopped);

        engine.delete_instance("s").await.unwrap();
        tokio::time::sleep(engine.settings().restart_delay * 2).await;

        assert_eq!(backend.call_count("start_instance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modpack_install_with_early_completion() {
        let (engine, backend) = engine_with(vec![]).await;
        backend.set_auto_events(true);

        let outcome = engine
            .install_modpack(&ModpackInstallRequest {
                source: ModpackSource::Modrinth {
                    slug: "fabulously-optimized".into(),
                    version_id: None,
                },
                instance_name: "FO".into(),
            })
            .await
            .unwrap();

        let InstallOutcome::Completed { instance_id } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(
            engine.instance(&instance_id).unwrap().status,
            InstanceStatus::Stopped
        );
        let state = engine.install_state();
        assert!(!state.installing());
        assert_eq!(state.download_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_install_rejected_while_running() {
        let (engine, backend) = engine_with(vec![]).await;
        backend.set_latency(Duration::from_secs(60));
        let req = ModpackInstallRequest {
            source: ModpackSource::File {
                path: "/tmp/pack.mrpack".into(),
            },
            instance_name: "Pack".into(),
        };

        let first = engine.install_modpack(&req);
        tokio::pin!(first);
        tokio::select! {
            _ = &mut first => panic!("install finished early"),
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        assert!(engine.install_state().installing());
        assert_eq!(
            engine.install_modpack(&req).await,
            Err(EngineError::InstallInProgress)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_call_failure_resolves_failed() {
        let (engine, backend) = engine_with(vec![]).await;
        backend.fail("install_modpack", "manifest missing");
        let outcome = engine
            .install_modpack(&ModpackInstallRequest {
                source: ModpackSource::CurseForge {
                    project_id: 1,
                    file_id: Some(2),
                },
                instance_name: "Broken".into(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, InstallOutcome::Failed(_)));
        assert!(engine.status().error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_instance_then_created_event() {
        let (engine, backend) = engine_with(vec![]).await;
        backend.set_auto_events(true);

        let created = engine
            .create_instance(&CreateInstanceRequest {
                name: "Fresh".into(),
                version: "1.21.1".into(),
                loader: "fabric".into(),
                ..CreateInstanceRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(engine.instance(&created.id).unwrap().status, InstanceStatus::Installing);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.instance(&created.id).unwrap().status, InstanceStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_keeps_store_and_reports() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;
        backend.fail("list_instances", "backend offline");

        assert!(engine.load().await.is_err());
        assert_eq!(engine.instances().len(), 1);
        let status = engine.status();
        assert!(!status.loading);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_refused_subscription_does_not_block_others() {
        let backend = LoopbackBackend::new();
        backend.refuse_subscription("download-progress");
        let engine = InstanceEngine::new(
            Arc::new(backend.clone()),
            Arc::new(backend.clone()),
            EngineSettings::default(),
        );
        engine.init().unwrap();

        assert_eq!(backend.listener_count("download-progress"), 0);
        assert_eq!(backend.listener_count("instance-removed"), 1);
    }

    #[tokio::test]
    async fn test_operations_require_init() {
        let backend = LoopbackBackend::new();
        let engine = InstanceEngine::new(
            Arc::new(backend.clone()),
            Arc::new(backend),
            EngineSettings::default(),
        );
        assert_eq!(engine.load().await, Err(EngineError::NotInitialized));
    }

    #[tokio::test]
    async fn test_dispose_unsubscribes_and_rejects_calls() {
        let (engine, backend) = engine_with(vec![client("a", InstanceStatus::Stopped)]).await;
        engine.init().unwrap();
        assert_eq!(backend.listener_count("instance-removed"), 1);

        engine.dispose();
        assert_eq!(backend.listener_count("instance-removed"), 0);
        assert_eq!(
            engine.start_instance("a").await,
            Err(EngineError::Disposed)
        );
        assert_eq!(engine.init(), Err(EngineError::Disposed));
    }
}
