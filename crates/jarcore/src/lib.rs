//! Instance lifecycle engine for the launcher.
//!
//! Mirrors the backend's instances locally, guards against duplicate
//! start/stop/delete/repair/reinstall requests, applies optimistic status
//! changes, and corrects them from pushed events, a guard sweeper and an
//! existence resync. Modpack installs are tracked across their two backend
//! jobs until both have settled.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod guard;
pub mod install;
pub mod instance;
pub mod lifecycle;
pub mod loopback;

mod context;
mod reconciler;
mod sweeper;

pub use config::EngineSettings;
pub use context::EngineStatus;
pub use engine::InstanceEngine;
pub use error::{BusError, EngineError, GatewayError};
pub use events::{BackendEvent, EventBus, EventHandler, EventKind, Subscription};
pub use gateway::{
    CreateInstanceRequest, InstanceUpdate, ModpackInstallRequest, ModpackSource, RemoteGateway,
};
pub use install::{CancelReport, CancelTokens, InstallOutcome, InstallState, InstallSummary};
pub use instance::{Instance, InstancePatch, InstanceStatus, InstanceStore, InstanceType};
pub use lifecycle::Dispatch;
pub use loopback::LoopbackBackend;
