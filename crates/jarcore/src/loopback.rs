//! In-memory backend implementing both [`RemoteGateway`] and [`EventBus`].
//!
//! It keeps its own instance table, records every call by name, and can be
//! told to fail calls, slow them down, or refuse subscriptions. With
//! auto-events on it also plays the part of the launcher's process
//! supervisor and install pipelines, emitting the events they would.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{BusError, GatewayError};
use crate::events::{EventBus, EventHandler, Subscription};
use crate::gateway::{CreateInstanceRequest, InstanceUpdate, ModpackInstallRequest, RemoteGateway};
use crate::instance::{Instance, InstanceStatus, InstanceType};

type Listener = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Clone, Default)]
pub struct LoopbackBackend {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BackendState>,
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_listener: AtomicU64,
}

struct BackendState {
    instances: BTreeMap<String, Instance>,
    calls: Vec<String>,
    failing: HashMap<&'static str, String>,
    refused: HashSet<String>,
    latency: Duration,
    step_delay: Duration,
    auto_events: bool,
    start_status: InstanceStatus,
    next_id: u64,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            instances: BTreeMap::new(),
            calls: Vec::new(),
            failing: HashMap::new(),
            refused: HashSet::new(),
            latency: Duration::ZERO,
            step_delay: Duration::from_millis(200),
            auto_events: false,
            start_status: InstanceStatus::Starting,
            next_id: 1,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instances(instances: impl IntoIterator<Item = Instance>) -> Self {
        let backend = Self::new();
        for inst in instances {
            backend.insert_instance(inst);
        }
        backend
    }

    // --- scripting ---

    pub fn insert_instance(&self, instance: Instance) {
        lock(&self.inner.state)
            .instances
            .insert(instance.id.clone(), instance);
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        lock(&self.inner.state).instances.get(id).cloned()
    }

    /// Change the backend's own record without emitting anything.
    pub fn set_status(&self, id: &str, status: InstanceStatus) {
        self.inner.set_status(id, status);
    }

    /// Drop the backend's own record without emitting anything.
    pub fn forget_instance(&self, id: &str) {
        lock(&self.inner.state).instances.remove(id);
    }

    /// Make every later `call` fail with `message`.
    pub fn fail(&self, call: &'static str, message: impl Into<String>) {
        lock(&self.inner.state).failing.insert(call, message.into());
    }

    pub fn recover(&self, call: &'static str) {
        lock(&self.inner.state).failing.remove(call);
    }

    /// Delay applied to every call after it is recorded.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.inner.state).latency = latency;
    }

    /// Pause between simulated pipeline steps when auto-events are on.
    pub fn set_step_delay(&self, delay: Duration) {
        lock(&self.inner.state).step_delay = delay;
    }

    /// Status a successful start call leaves the record in (`starting` by default).
    pub fn set_start_status(&self, status: InstanceStatus) {
        lock(&self.inner.state).start_status = status;
    }

    pub fn set_auto_events(&self, enabled: bool) {
        lock(&self.inner.state).auto_events = enabled;
    }

    pub fn refuse_subscription(&self, event: &str) {
        lock(&self.inner.state).refused.insert(event.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.inner.state).calls.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        lock(&self.inner.state)
            .calls
            .iter()
            .filter(|c| *c == call)
            .count()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.inner.listeners)
            .get(event)
            .map_or(0, |l| l.len())
    }

    /// Deliver an event to every listener of `event`.
    pub fn emit(&self, event: &str, payload: Value) {
        self.inner.emit(event, payload);
    }

    // --- internals ---

    async fn enter(&self, call: &'static str) -> Result<(), GatewayError> {
        let (latency, failure) = {
            let mut st = lock(&self.inner.state);
            st.calls.push(call.to_string());
            (st.latency, st.failing.get(call).cloned())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(message) => Err(GatewayError::new(call, message)),
            None => Ok(()),
        }
    }

    fn auto(&self) -> Option<Duration> {
        let st = lock(&self.inner.state);
        st.auto_events.then_some(st.step_delay)
    }

    fn require(&self, call: &'static str, id: &str) -> Result<Instance, GatewayError> {
        self.instance(id)
            .ok_or_else(|| GatewayError::new(call, format!("instance {id} not found")))
    }

    fn allocate_id(&self) -> String {
        let mut st = lock(&self.inner.state);
        let id = format!("inst-{}", st.next_id);
        st.next_id += 1;
        id
    }

    /// Set the status after `delay` and announce it.
    fn settle_later(&self, id: &str, delay: Duration, status: InstanceStatus) {
        let inner = self.inner.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.set_status(&id, status);
            inner.emit(
                "instance-status-changed",
                json!({ "id": id, "status": status.as_str() }),
            );
        });
    }
}

impl Inner {
    fn emit(&self, event: &str, payload: Value) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .get(event)
            .map(|l| l.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(payload.clone());
        }
    }

    fn set_status(&self, id: &str, status: InstanceStatus) {
        if let Some(inst) = lock(&self.state).instances.get_mut(id) {
            inst.status = status;
        }
    }
}

impl EventBus for LoopbackBackend {
    fn subscribe(&self, event: &str, handler: EventHandler) -> Result<Subscription, BusError> {
        if lock(&self.inner.state).refused.contains(event) {
            return Err(BusError {
                event: event.to_string(),
                message: "subscription refused".to_string(),
            });
        }
        let key = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners)
            .entry(event.to_string())
            .or_default()
            .push((key, Arc::from(handler)));

        let inner = self.inner.clone();
        let event = event.to_string();
        Ok(Subscription::new(move || {
            if let Some(list) = lock(&inner.listeners).get_mut(&event) {
                list.retain(|(k, _)| *k != key);
            }
        }))
    }
}

#[async_trait]
impl RemoteGateway for LoopbackBackend {
    async fn list_instances(&self) -> Result<Vec<Instance>, GatewayError> {
        self.enter("list_instances").await?;
        Ok(lock(&self.inner.state).instances.values().cloned().collect())
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, GatewayError> {
        self.enter("get_instance").await?;
        self.require("get_instance", id)
    }

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<Instance, GatewayError> {
        self.enter("create_instance").await?;
        let mut instance = Instance::new(
            self.allocate_id(),
            req.name.clone(),
            req.instance_type,
            InstanceStatus::Installing,
        );
        instance.version = Some(req.version.clone());
        instance.loader = Some(req.loader.clone());
        instance.loader_version = req.loader_version.clone();
        instance.memory_min = req.memory_min;
        instance.memory_max = req.memory_max;
        self.insert_instance(instance.clone());

        if let Some(delay) = self.auto() {
            self.emit(
                "instance-installing",
                json!({ "id": instance.id, "name": instance.name }),
            );
            let inner = self.inner.clone();
            let id = instance.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.set_status(&id, InstanceStatus::Stopped);
                inner.emit("instance-created", json!({ "id": id }));
            });
        }
        Ok(instance)
    }

    async fn start_instance(&self, id: &str) -> Result<(), GatewayError> {
        self.enter("start_instance").await?;
        self.require("start_instance", id)?;
        let status = lock(&self.inner.state).start_status;
        self.set_status(id, status);
        if let Some(delay) = self.auto() {
            self.emit(
                "instance-status-changed",
                json!({ "id": id, "status": "starting" }),
            );
            self.settle_later(id, delay, InstanceStatus::Running);
        }
        Ok(())
    }

    async fn stop_instance(&self, id: &str) -> Result<(), GatewayError> {
        self.enter("stop_instance").await?;
        self.require("stop_instance", id)?;
        self.set_status(id, InstanceStatus::Stopping);
        if let Some(delay) = self.auto() {
            self.settle_later(id, delay, InstanceStatus::Stopped);
        }
        Ok(())
    }

    async fn graceful_stop_server(&self, id: &str) -> Result<(), GatewayError> {
        self.enter("graceful_stop_server").await?;
        let instance = self.require("graceful_stop_server", id)?;
        if instance.instance_type != InstanceType::Server {
            return Err(GatewayError::new(
                "graceful_stop_server",
                format!("{id} has no server console"),
            ));
        }
        self.set_status(id, InstanceStatus::Stopping);
        if let Some(delay) = self.auto() {
            self.settle_later(id, delay, InstanceStatus::Stopped);
        }
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> Result<(), GatewayError> {
        self.enter("delete_instance").await?;
        self.require("delete_instance", id)?;
        self.forget_instance(id);
        if self.auto().is_some() {
            self.emit("instance-removed", json!({ "id": id }));
        }
        Ok(())
    }

    async fn reinstall_instance(&self, id: &str) -> Result<(), GatewayError> {
        self.enter("reinstall_instance").await?;
        self.rebuild(id, "reinstall_instance", "instance-reinstalling", "instance-reinstalled")
    }

    async fn repair_instance(&self, id: &str) -> Result<(), GatewayError> {
        self.enter("repair_instance").await?;
        self.rebuild(id, "repair_instance", "instance-repairing", "instance-repaired")
    }

    async fn update_instance(
        &self,
        id: &str,
        update: &InstanceUpdate,
    ) -> Result<Instance, GatewayError> {
        self.enter("update_instance").await?;
        let mut st = lock(&self.inner.state);
        let Some(inst) = st.instances.get_mut(id) else {
            return Err(GatewayError::new(
                "update_instance",
                format!("instance {id} not found"),
            ));
        };
        if let Some(name) = &update.name {
            inst.name = name.clone();
        }
        if update.memory_min.is_some() {
            inst.memory_min = update.memory_min;
        }
        if update.memory_max.is_some() {
            inst.memory_max = update.memory_max;
        }
        for (key, value) in [
            ("java_args", &update.java_args),
            ("game_args", &update.game_args),
            ("notes", &update.notes),
        ] {
            if let Some(v) = value {
                inst.extra.insert(key.to_string(), Value::String(v.clone()));
            }
        }
        Ok(inst.clone())
    }

    async fn save_launch_snapshot(&self, id: &str) -> Result<(), GatewayError> {
        self.enter("save_launch_snapshot").await?;
        self.require("save_launch_snapshot", id).map(|_| ())
    }

    async fn install_modpack(&self, req: &ModpackInstallRequest) -> Result<String, GatewayError> {
        self.enter("install_modpack").await?;
        let id = self.allocate_id();
        self.insert_instance(Instance::new(
            id.clone(),
            req.instance_name.clone(),
            InstanceType::Client,
            InstanceStatus::Installing,
        ));

        if let Some(delay) = self.auto() {
            self.run_modpack_pipeline(&id, &req.instance_name, delay).await;
        }
        Ok(id)
    }

    async fn cancel_operation(&self, token: &str) -> Result<bool, GatewayError> {
        self.enter("cancel_operation").await?;
        if self.auto().is_some() {
            self.emit(
                "operation-cancelled",
                json!({ "id": token, "status": "cancelled" }),
            );
        }
        Ok(true)
    }
}

impl LoopbackBackend {
    fn rebuild(
        &self,
        id: &str,
        call: &'static str,
        started: &str,
        finished: &'static str,
    ) -> Result<(), GatewayError> {
        self.require(call, id)?;
        self.set_status(id, InstanceStatus::Installing);
        if let Some(delay) = self.auto() {
            self.emit(started, json!({ "id": id }));
            let inner = self.inner.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.set_status(&id, InstanceStatus::Stopped);
                inner.emit(finished, json!({ "id": id }));
            });
        }
        Ok(())
    }

    /// Both pipelines of a modpack install, with the loader finishing
    /// before the download batch returns.
    async fn run_modpack_pipeline(&self, id: &str, name: &str, delay: Duration) {
        let batch_token = format!("modpack-install-{id}");
        let loader_token = format!("instance-install-{id}");
        self.emit(
            "modpack-operation-started",
            json!({ "operation_id": batch_token }),
        );
        self.emit(
            "modpack-install-progress",
            json!({ "stage": "creating_instance", "current": 0, "total": 1 }),
        );
        self.emit("instance-installing", json!({ "id": id, "name": name }));
        self.emit(
            "instance-operation-started",
            json!({ "operation_id": loader_token }),
        );

        let mods = ["sodium", "lithium", "iris", "modmenu"];
        self.emit(
            "modpack-install-progress",
            json!({ "stage": "resolving_mods", "current": 0, "total": mods.len() }),
        );
        tokio::time::sleep(delay).await;

        for (n, file) in mods.iter().enumerate() {
            self.emit(
                "instance-install-progress",
                json!({ "id": id, "step": "libraries", "message": format!("Downloading libraries ({}/{})", n + 1, mods.len()) }),
            );
            self.emit(
                "modpack-install-progress",
                json!({ "stage": "downloading_mods", "current": n, "total": mods.len(), "current_file": format!("{file}.jar") }),
            );
            self.emit(
                "download-progress",
                json!({ "id": format!("mod-{file}"), "name": format!("{file}.jar"), "downloaded": 0, "total": 1_048_576, "speed": 0, "status": "downloading", "source": "modrinth" }),
            );
            tokio::time::sleep(delay).await;
            self.emit(
                "download-progress",
                json!({ "id": format!("mod-{file}"), "name": format!("{file}.jar"), "downloaded": 1_048_576, "total": 1_048_576, "speed": 524_288, "status": "completed", "source": "modrinth" }),
            );
        }

        // Loader done first: the created event beats the call's return.
        self.emit(
            "instance-install-progress",
            json!({ "id": id, "step": "complete", "message": "Loader installed" }),
        );
        self.inner.set_status(id, InstanceStatus::Stopped);
        self.emit("instance-created", json!({ "id": id }));

        self.emit(
            "modpack-install-progress",
            json!({ "stage": "extracting_overrides", "current": 0, "total": 1 }),
        );
        tokio::time::sleep(delay).await;
        self.emit(
            "modpack-install-progress",
            json!({ "stage": "completed", "current": 1, "total": 1 }),
        );
        self.emit(
            "modpack-install-summary",
            json!({ "total_mods": mods.len(), "from_curseforge": [], "from_modrinth": mods, "failed": [] }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> Instance {
        Instance::new(id, "SMP", InstanceType::Server, InstanceStatus::Running)
    }

    #[tokio::test]
    async fn test_records_calls_and_failures() {
        let backend = LoopbackBackend::with_instances([server("a")]);
        backend.fail("start_instance", "java not found");

        let err = backend.start_instance("a").await.unwrap_err();
        assert_eq!(err.to_string(), "start_instance failed: java not found");

        backend.recover("start_instance");
        backend.start_instance("a").await.unwrap();
        assert_eq!(backend.call_count("start_instance"), 2);
        assert_eq!(backend.instance("a").unwrap().status, InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn test_graceful_stop_requires_server() {
        let backend = LoopbackBackend::with_instances([Instance::new(
            "c",
            "Client",
            InstanceType::Client,
            InstanceStatus::Running,
        )]);
        assert!(backend.graceful_stop_server("c").await.is_err());
    }

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let backend = LoopbackBackend::new();
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        let sub = backend
            .subscribe(
                "instance-removed",
                Box::new(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        backend.emit("instance-removed", json!({ "id": "a" }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(backend.listener_count("instance-removed"), 0);
        backend.emit("instance-removed", json!({ "id": "a" }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refused_subscription() {
        let backend = LoopbackBackend::new();
        backend.refuse_subscription("download-progress");
        assert!(backend
            .subscribe("download-progress", Box::new(|_| {}))
            .is_err());
    }

    #[tokio::test]
    async fn test_update_keeps_unmodelled_fields() {
        let backend = LoopbackBackend::with_instances([server("a")]);
        let updated = backend
            .update_instance(
                "a",
                &InstanceUpdate {
                    notes: Some("restart nightly".into()),
                    memory_max: Some(6144),
                    ..InstanceUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.memory_max, Some(6144));
        assert_eq!(updated.extra["notes"], "restart nightly");
        assert_eq!(updated.status, InstanceStatus::Running);
    }
}
