//! Wire types for the devroute control socket and HTTP management surface.
//!
//! Every IPC message is a single JSON object tagged by `"type"`, sent as one
//! line. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};

/// One registered backend dev server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerRegistration {
    /// Opaque id assigned by the daemon (`server-<n>`).
    pub id: String,
    pub port: u16,
    pub bundle_id: String,
    /// Absolute project root of the dev server.
    pub root: String,
    /// Milliseconds since the Unix epoch.
    pub registered_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<u64>,
    /// Owning process, when the registering client reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl ServerRegistration {
    /// Timestamp used to rank servers by recent activity.
    pub fn activity_time(&self) -> u64 {
        self.last_active_at.unwrap_or(self.registered_at)
    }
}

/// A sticky routing decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteBinding {
    /// A bundle id, `default`, or a synthetic per-device key.
    pub key: String,
    pub server_id: String,
    pub created_at: u64,
}

/// On-disk projection of a registration, used for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedServer {
    pub port: u16,
    pub bundle_id: String,
    pub root: String,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl From<&ServerRegistration> for PersistedServer {
    fn from(s: &ServerRegistration) -> Self {
        Self {
            port: s.port,
            bundle_id: s.bundle_id.clone(),
            root: s.root.clone(),
            pid: s.pid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Simulator {
    pub name: String,
    pub udid: String,
    pub state: String,
}

/// Server entry as exposed by `GET /__daemon/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub port: u16,
    pub bundle_id: String,
    pub root: String,
}

impl From<&ServerRegistration> for ServerSummary {
    fn from(s: &ServerRegistration) -> Self {
        Self {
            id: s.id.clone(),
            port: s.port,
            bundle_id: s.bundle_id.clone(),
            root: s.root.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpStatus {
    pub servers: Vec<ServerSummary>,
    pub simulators: Vec<Simulator>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    Register {
        port: u16,
        bundle_id: String,
        root: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Unregister {
        id: String,
    },
    /// Pin `bundle_id` to a server.
    Route {
        bundle_id: String,
        server_id: String,
    },
    RouteClear {
        bundle_id: String,
    },
    Status,
    Ping,
    Touch {
        id: String,
    },
    GetLastActive,
    Stop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Response {
    Registered {
        id: String,
    },
    Unregistered,
    Routed,
    Status {
        servers: Vec<ServerRegistration>,
        routes: Vec<RouteBinding>,
    },
    Pong,
    Touched,
    LastActive {
        server: Option<ServerRegistration>,
    },
    Stopping,
    Error {
        message: String,
    },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}
