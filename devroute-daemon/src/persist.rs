//! Advisory on-disk mirror of registered servers.
//!
//! The file is read only at startup for recovery and by diagnostic tools;
//! live routing never consults it. Writes are read-modify-write without a
//! lock: the daemon holding the public port is the only writer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use devroute_protocol::{PersistedServer, ServerRegistration};
use tokio::net::TcpStream;

use crate::events::{EventsHub, RegistryEvent};
use crate::registry::{ServerSpec, SharedState};

const ALIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServersFile {
    path: PathBuf,
}

impl ServersFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries; a missing or corrupt file reads as empty.
    pub async fn read_all(&self) -> Vec<PersistedServer> {
        let Ok(contents) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::debug!(path = %self.path.display(), error = %e, "ignoring unreadable servers file");
            Vec::new()
        })
    }

    /// Insert `server`, replacing any entry with the same root.
    pub async fn write_server(&self, server: PersistedServer) -> std::io::Result<()> {
        let mut servers = self.read_all().await;
        servers.retain(|s| s.root != server.root);
        servers.push(server);
        self.replace_all(&servers).await
    }

    pub async fn remove_server(&self, root: &str) -> std::io::Result<()> {
        let mut servers = self.read_all().await;
        servers.retain(|s| s.root != root);
        self.replace_all(&servers).await
    }

    /// Rewrite the whole file via a temp file and rename.
    pub async fn replace_all(&self, servers: &[PersistedServer]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(servers)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

/// Whether a process with `pid` exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether something accepts TCP connections on the local port.
pub async fn port_alive(port: u16) -> bool {
    matches!(
        tokio::time::timeout(ALIVE_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Re-register persisted servers that are still running and prune the rest.
pub async fn recover_servers(file: &ServersFile, state: &SharedState) -> Vec<ServerRegistration> {
    let persisted = file.read_all().await;
    if persisted.is_empty() {
        return Vec::new();
    }

    let mut alive = Vec::new();
    for entry in persisted.iter() {
        let pid_ok = entry.pid.is_none_or(pid_alive);
        if pid_ok && port_alive(entry.port).await {
            alive.push(entry.clone());
        } else {
            tracing::info!(
                bundle_id = %entry.bundle_id,
                port = entry.port,
                root = %entry.root,
                "pruning stale persisted server"
            );
        }
    }

    let recovered = {
        let mut s = state.lock();
        alive
            .iter()
            .map(|entry| {
                s.register_server(ServerSpec {
                    port: entry.port,
                    bundle_id: entry.bundle_id.clone(),
                    root: entry.root.clone(),
                    pid: entry.pid,
                })
            })
            .collect::<Vec<_>>()
    };

    if alive.len() != persisted.len()
        && let Err(e) = file.replace_all(&alive).await
    {
        tracing::warn!(path = %file.path().display(), error = %e, "failed to prune servers file");
    }

    recovered
}

/// Unregister servers whose port no longer accepts connections.
///
/// Removals are published like IPC unregistrations so the servers file and
/// logs follow along.
pub async fn prune_dead_servers(state: &SharedState, events: &EventsHub) -> Vec<ServerRegistration> {
    let servers = state.lock().all_servers();
    let mut pruned = Vec::new();
    for server in servers {
        if port_alive(server.port).await {
            continue;
        }
        let removed = state.lock().unregister_server(&server.id);
        if let Some(removed) = removed {
            events.broadcast(RegistryEvent::Unregistered {
                id: removed.id.clone(),
                server: Some(removed.clone()),
            });
            pruned.push(removed);
        }
    }
    pruned
}
