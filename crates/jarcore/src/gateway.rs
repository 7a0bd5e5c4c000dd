//! Remote call seam: the backend commands the engine issues.
//!
//! The transport is not the engine's concern. Each method is one named
//! remote procedure that resolves to a single response or a [`GatewayError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::instance::{Instance, InstanceType};

/// Parameters for a fresh instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub version: String,
    pub loader: String,
    pub loader_version: Option<String>,
    pub instance_type: InstanceType,
    pub memory_min: Option<u32>,
    pub memory_max: Option<u32>,
}

/// Metadata edits. Unset fields are left alone by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub java_args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Where a modpack comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModpackSource {
    Modrinth {
        slug: String,
        version_id: Option<String>,
    },
    CurseForge {
        project_id: u64,
        file_id: Option<u64>,
    },
    File {
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModpackInstallRequest {
    pub source: ModpackSource,
    pub instance_name: String,
}

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<Instance>, GatewayError>;

    async fn get_instance(&self, id: &str) -> Result<Instance, GatewayError>;

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<Instance, GatewayError>;

    async fn start_instance(&self, id: &str) -> Result<(), GatewayError>;

    /// Force stop.
    async fn stop_instance(&self, id: &str) -> Result<(), GatewayError>;

    /// Send an in-band stop to a server console. Fails if the backend cannot
    /// reach the server's stdin or RCON.
    async fn graceful_stop_server(&self, id: &str) -> Result<(), GatewayError>;

    async fn delete_instance(&self, id: &str) -> Result<(), GatewayError>;

    async fn reinstall_instance(&self, id: &str) -> Result<(), GatewayError>;

    async fn repair_instance(&self, id: &str) -> Result<(), GatewayError>;

    async fn update_instance(
        &self,
        id: &str,
        update: &InstanceUpdate,
    ) -> Result<Instance, GatewayError>;

    /// Record the pre-launch state of the instance. Best effort.
    async fn save_launch_snapshot(&self, id: &str) -> Result<(), GatewayError>;

    /// Resolves with the new instance id once the mod downloads are done.
    /// The loader pipeline may still be running, or may already be finished.
    async fn install_modpack(&self, req: &ModpackInstallRequest) -> Result<String, GatewayError>;

    /// Ask the backend to cancel the operation behind `token`.
    async fn cancel_operation(&self, token: &str) -> Result<bool, GatewayError>;
}
