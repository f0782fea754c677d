//! Decides which registered server handles an inbound request.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use devroute_protocol::ServerRegistration;
use hyper::HeaderMap;
use hyper::header::USER_AGENT;
use parking_lot::Mutex;

use crate::picker::{PickOutcome, PickRequest, ServerPicker};
use crate::registry::SharedState;

/// Route key used when a request names no app.
pub const DEFAULT_ROUTE_KEY: &str = "default";

/// How long an HTTP routing decision is reused for upgrades from the same
/// client address.
pub const CONNECTION_MEMORY: Duration = Duration::from_secs(5);

/// User agents shared by every app running inside a generic dev client.
const GENERIC_AGENTS: &[&str] = &["Expo/", "Exponent/"];

pub fn route_key(bundle_id: Option<&str>) -> &str {
    bundle_id.unwrap_or(DEFAULT_ROUTE_KEY)
}

/// Per-device route key derived from request headers: `app:<name>` for a
/// built app's own user agent, `eas:<id>` for a dev client that sends an
/// `eas-client-id`, else `ua:<user-agent>`.
pub fn client_key(headers: &HeaderMap) -> Option<String> {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !GENERIC_AGENTS.iter().any(|p| user_agent.starts_with(p)) {
        let product = user_agent.split(' ').next().unwrap_or_default();
        let name = product.split('/').next().unwrap_or_default();
        if !name.is_empty() {
            return Some(format!("app:{name}"));
        }
    }

    if let Some(id) = headers
        .get("eas-client-id")
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
    {
        return Some(format!("eas:{id}"));
    }

    (!user_agent.is_empty()).then(|| format!("ua:{user_agent}"))
}

/// What the daemon knows about who sent a request.
#[derive(Debug, Clone, Default)]
pub struct ClientHint {
    pub peer: Option<SocketAddr>,
    /// See [`client_key`].
    pub key: Option<String>,
}

impl ClientHint {
    pub fn new(peer: SocketAddr, headers: &HeaderMap) -> Self {
        Self {
            peer: Some(peer),
            key: client_key(headers),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    NonInteractive,
    Upgrade,
    Cancelled,
    TimedOut,
    /// The picked server went away while the picker was open.
    Vanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    OnlyCandidate,
    StickyRoute,
    /// Route bound to the requesting device's client key.
    ClientRoute,
    Picked { remember: bool },
    /// Upgrade following an HTTP request from the same client address.
    RecentConnection,
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    NoCandidates,
    Target {
        server: ServerRegistration,
        via: ResolvedVia,
    },
}

impl Resolution {
    pub fn server(&self) -> Option<&ServerRegistration> {
        match self {
            Resolution::NoCandidates => None,
            Resolution::Target { server, .. } => Some(server),
        }
    }
}

/// Last server each client address was routed to.
#[derive(Debug)]
pub struct ConnectionMemory {
    window: Duration,
    recent: Mutex<HashMap<SocketAddr, (String, Instant)>>,
}

impl Default for ConnectionMemory {
    fn default() -> Self {
        Self::new(CONNECTION_MEMORY)
    }
}

impl ConnectionMemory {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember(&self, peer: SocketAddr, server_id: &str) {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        recent.retain(|_, (_, at)| now.duration_since(*at) < self.window);
        recent.insert(peer, (server_id.to_string(), now));
    }

    pub fn recall(&self, peer: SocketAddr) -> Option<String> {
        let recent = self.recent.lock();
        let (server_id, at) = recent.get(&peer)?;
        (at.elapsed() < self.window).then(|| server_id.clone())
    }
}

enum Shortcut {
    Done(Resolution),
    Ambiguous(Vec<ServerRegistration>),
}

pub struct RouteResolver {
    state: SharedState,
    picker: Arc<dyn ServerPicker>,
    interactive: bool,
    picker_timeout: Duration,
    connections: ConnectionMemory,
}

impl RouteResolver {
    pub fn new(
        state: SharedState,
        picker: Arc<dyn ServerPicker>,
        interactive: bool,
        picker_timeout: Duration,
    ) -> Self {
        Self {
            state,
            picker,
            interactive,
            picker_timeout,
            connections: ConnectionMemory::default(),
        }
    }

    pub fn picker(&self) -> &Arc<dyn ServerPicker> {
        &self.picker
    }

    /// Servers that may handle a request for `bundle_id`, first candidate
    /// first. No bundle id means every server.
    pub fn candidates(&self, bundle_id: Option<&str>) -> Vec<ServerRegistration> {
        let s = self.state.lock();
        match bundle_id {
            Some(bundle_id) => s.find_servers_by_bundle_id(bundle_id),
            None => s.all_servers(),
        }
    }

    fn shortcut(&self, bundle_id: Option<&str>, client: &ClientHint) -> Shortcut {
        let mut candidates = self.candidates(bundle_id);
        match candidates.len() {
            0 => return Shortcut::Done(Resolution::NoCandidates),
            1 => {
                return Shortcut::Done(Resolution::Target {
                    server: candidates.swap_remove(0),
                    via: ResolvedVia::OnlyCandidate,
                });
            }
            _ => {}
        }

        let keys = [
            (Some(route_key(bundle_id)), ResolvedVia::StickyRoute),
            (client.key.as_deref(), ResolvedVia::ClientRoute),
        ];
        for (key, via) in keys {
            let Some(key) = key else { continue };
            let bound = self
                .state
                .lock()
                .route(key)
                .map(|binding| binding.server_id.clone());
            let Some(server_id) = bound else { continue };
            if let Some(server) = candidates.iter().find(|s| s.id == server_id) {
                return Shortcut::Done(Resolution::Target {
                    server: server.clone(),
                    via,
                });
            }
            tracing::debug!(route_key = key, server_id = %server_id, "ignoring route outside candidates");
        }

        Shortcut::Ambiguous(candidates)
    }

    /// Resolve a plain HTTP request, asking the picker when ambiguous and
    /// interactive. The decision is remembered for the client's address.
    pub async fn resolve_http(&self, bundle_id: Option<&str>, client: &ClientHint) -> Resolution {
        let resolution = self.resolve_http_inner(bundle_id, client).await;
        if let (Some(peer), Some(server)) = (client.peer, resolution.server()) {
            self.connections.remember(peer, &server.id);
        }
        resolution
    }

    async fn resolve_http_inner(
        &self,
        bundle_id: Option<&str>,
        client: &ClientHint,
    ) -> Resolution {
        let candidates = match self.shortcut(bundle_id, client) {
            Shortcut::Done(resolution) => return resolution,
            Shortcut::Ambiguous(candidates) => candidates,
        };
        let key = route_key(bundle_id);

        if !self.interactive {
            return fallback(key, candidates, FallbackReason::NonInteractive);
        }

        let request = PickRequest {
            bundle_id: key.to_string(),
            servers: candidates.clone(),
        };
        let outcome =
            match tokio::time::timeout(self.picker_timeout, self.picker.pick(request)).await {
                Ok(outcome) => outcome,
                Err(_) => return fallback(key, candidates, FallbackReason::TimedOut),
            };

        let selection = match outcome {
            PickOutcome::Selected(selection) => selection,
            PickOutcome::Cancelled => {
                return fallback(key, candidates, FallbackReason::Cancelled);
            }
        };

        let mut s = self.state.lock();
        let Some(server) = s.find_server_by_id(&selection.server.id).cloned() else {
            drop(s);
            let remaining = self.candidates(bundle_id);
            return fallback(key, remaining, FallbackReason::Vanished);
        };
        if selection.remember {
            for key in std::iter::once(key).chain(client.key.as_deref()) {
                s.set_route(key, &server.id);
                tracing::info!(route_key = key, server_id = %server.id, port = server.port, "remembered route");
            }
        }
        Resolution::Target {
            server,
            via: ResolvedVia::Picked {
                remember: selection.remember,
            },
        }
    }

    /// Resolve a WebSocket upgrade. Never waits on the picker. Routes win;
    /// after them comes the server the same client address was just routed to.
    pub fn resolve_upgrade(&self, bundle_id: Option<&str>, client: &ClientHint) -> Resolution {
        let candidates = match self.shortcut(bundle_id, client) {
            Shortcut::Done(resolution) => return resolution,
            Shortcut::Ambiguous(candidates) => candidates,
        };

        let recent = client.peer.and_then(|p| self.connections.recall(p));
        if let Some(server) = recent.and_then(|id| candidates.iter().find(|s| s.id == id)) {
            return Resolution::Target {
                server: server.clone(),
                via: ResolvedVia::RecentConnection,
            };
        }
        fallback(route_key(bundle_id), candidates, FallbackReason::Upgrade)
    }
}

fn fallback(key: &str, candidates: Vec<ServerRegistration>, reason: FallbackReason) -> Resolution {
    let slots = candidates
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {} (port {})", i + 1, s.root, s.port))
        .collect::<Vec<_>>()
        .join(", ");
    let Some(server) = candidates.into_iter().next() else {
        return Resolution::NoCandidates;
    };

    tracing::warn!(
        route_key = key,
        reason = ?reason,
        port = server.port,
        candidates = %slots,
        "multiple servers match; using the first. Pin one with `devroute route --app {key} --slot <n>` or POST /__daemon/route?bundleId={key}&serverId=<id>"
    );
    Resolution::Target {
        server,
        via: ResolvedVia::Fallback(reason),
    }
}
