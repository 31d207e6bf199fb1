//! Wire messages exchanged with the management server
//!
//! Every frame is a JSON object carrying a `type` discriminator. Inbound
//! frames are decoded in two steps: the envelope first, then the payload of
//! the matching variant. Payload fields all default, so a partially
//! malformed payload still dispatches with zero values.

use crate::error::{AgentError, AgentResult};
use crate::metrics::{
    Container, ContainerProject, ContainerUsage, Disk, MemoryState, MemoryUsage, Process,
    Software, ZfsPool,
};
use crate::snapshot::{CpuUsage, DiskUsage, NetworkUsage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::warn;

pub const TYPE_AUTH_SUCCESS: &str = "DAEMON_AUTH_SUCCESS";
pub const TYPE_AUTH_FAILURE: &str = "DAEMON_AUTH_FAILURE";
pub const TYPE_REQUEST_RESOURCES: &str = "DAEMON_REQUEST_RESOURCES";
pub const TYPE_REQUEST_STATS: &str = "DAEMON_REQUEST_STATS";
pub const TYPE_REQUEST_DATABASE_BACKUP: &str = "DAEMON_REQUEST_DATABASE_BACKUP";
pub const TYPE_CONNECT_CONTAINER_LOG: &str = "DAEMON_CONNECT_CONTAINER_LOG";
pub const TYPE_REQUEST_CONTAINER_LOG: &str = "DAEMON_REQUEST_CONTAINER_LOG";
pub const TYPE_DISCONNECT_CONTAINER_LOG: &str = "DAEMON_DISCONNECT_CONTAINER_LOG";
pub const TYPE_BUILD_SMB_CONFIG: &str = "DAEMON_BUILD_SMB_CONFIG";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Every message the server may send
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    AuthSuccess(AuthSuccess),
    AuthFailure(AuthFailure),
    RequestResources(RequestResources),
    RequestStats,
    RequestDatabaseBackup(DatabaseBackupRequest),
    ConnectContainerLog(ConnectContainerLog),
    RequestContainerLog(RequestContainerLog),
    DisconnectContainerLog(DisconnectContainerLog),
    BuildSmbConfig(BuildSmbConfig),
}

impl Inbound {
    pub fn decode(raw: &str) -> AgentResult<Self> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| AgentError::Protocol(format!("invalid envelope: {}", e)))?;

        let message = match envelope.kind.as_str() {
            TYPE_AUTH_SUCCESS => Inbound::AuthSuccess(payload(raw, &envelope.kind)),
            TYPE_AUTH_FAILURE => Inbound::AuthFailure(payload(raw, &envelope.kind)),
            TYPE_REQUEST_RESOURCES => Inbound::RequestResources(payload(raw, &envelope.kind)),
            TYPE_REQUEST_STATS => Inbound::RequestStats,
            TYPE_REQUEST_DATABASE_BACKUP => {
                Inbound::RequestDatabaseBackup(payload(raw, &envelope.kind))
            }
            TYPE_CONNECT_CONTAINER_LOG => Inbound::ConnectContainerLog(payload(raw, &envelope.kind)),
            TYPE_REQUEST_CONTAINER_LOG => Inbound::RequestContainerLog(payload(raw, &envelope.kind)),
            TYPE_DISCONNECT_CONTAINER_LOG => {
                Inbound::DisconnectContainerLog(payload(raw, &envelope.kind))
            }
            TYPE_BUILD_SMB_CONFIG => Inbound::BuildSmbConfig(payload(raw, &envelope.kind)),
            other => {
                return Err(AgentError::Protocol(format!("unknown message type: {}", other)));
            }
        };
        Ok(message)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::AuthSuccess(_) => TYPE_AUTH_SUCCESS,
            Inbound::AuthFailure(_) => TYPE_AUTH_FAILURE,
            Inbound::RequestResources(_) => TYPE_REQUEST_RESOURCES,
            Inbound::RequestStats => TYPE_REQUEST_STATS,
            Inbound::RequestDatabaseBackup(_) => TYPE_REQUEST_DATABASE_BACKUP,
            Inbound::ConnectContainerLog(_) => TYPE_CONNECT_CONTAINER_LOG,
            Inbound::RequestContainerLog(_) => TYPE_REQUEST_CONTAINER_LOG,
            Inbound::DisconnectContainerLog(_) => TYPE_DISCONNECT_CONTAINER_LOG,
            Inbound::BuildSmbConfig(_) => TYPE_BUILD_SMB_CONFIG,
        }
    }
}

fn payload<T: DeserializeOwned + Default>(raw: &str, kind: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("Malformed {} payload, using defaults ({})", kind, e);
        T::default()
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthSuccess {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthFailure {
    pub reason: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    WrongToken,
    VersionMismatch(String),
    Other(String),
}

impl AuthFailure {
    pub fn rejection(&self) -> AuthRejection {
        match self.reason.as_str() {
            "WRONG_TOKEN" => AuthRejection::WrongToken,
            "VERSION_MISMATCH" => {
                AuthRejection::VersionMismatch(self.version.clone().unwrap_or_default())
            }
            other => AuthRejection::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceCategory {
    General,
    Containers,
    Disks,
}

impl FromStr for ResourceCategory {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GENERAL" => Ok(ResourceCategory::General),
            "CONTAINERS" => Ok(ResourceCategory::Containers),
            "DISKS" => Ok(ResourceCategory::Disks),
            other => Err(AgentError::Protocol(format!("unknown resource category: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RequestResources {
    pub resources: Vec<String>,
}

impl RequestResources {
    /// Requested categories as a set; unknown names are logged and skipped
    pub fn categories(&self) -> BTreeSet<ResourceCategory> {
        self.resources
            .iter()
            .filter_map(|name| match name.parse() {
                Ok(category) => Some(category),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseBackupRequest {
    pub database: String,
    pub data: bool,
    pub task: String,
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectContainerLog {
    pub container: LogContainer,
    pub options: LogOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogContainer {
    pub id: String,
    pub name: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    pub project: bool,
    pub tail: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RequestContainerLog {
    pub id: String,
    pub task: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DisconnectContainerLog {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BuildSmbConfig {
    pub config: String,
}

/// Every message the agent sends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "DAEMON_AUTH")]
    Auth(AuthMessage),
    #[serde(rename = "DAEMON_REQUEST_RESOURCES_REPLY")]
    ResourcesReply(ResourcesReply),
    #[serde(rename = "DAEMON_REQUEST_STATS_REPLY")]
    StatsReply(StatsReply),
    #[serde(rename = "DAEMON_TASK_PROGRESS")]
    TaskProgress(TaskProgress),
    #[serde(rename = "DAEMON_CONTAINER_LOG_MESSAGE")]
    ContainerLogMessage(ContainerLogMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthMessage {
    pub token: String,
    pub version: String,
    pub databases: Vec<String>,
}

/// Only the requested categories are serialized
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<Vec<Software>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_list: Option<Vec<Process>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<Disk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zfs: Option<Vec<ZfsPool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<Container>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_projects: Option<Vec<ContainerProject>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsReply {
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub disks: Vec<DiskUsage>,
    pub network: NetworkUsage,
    pub containers: Vec<ContainerUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Failed,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub id: String,
    pub progress: f32,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerLogMessage {
    pub id: String,
    pub message: String,
}
