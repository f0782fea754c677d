//! In-memory daemon state: registered servers and sticky routes.
//!
//! Every operation is synchronous and completes without suspending, so a
//! caller holding the state lock never observes a partial mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use devroute_protocol::{RouteBinding, ServerRegistration};

pub type SharedState = Arc<parking_lot::Mutex<DaemonState>>;

/// Fields a dev server supplies when it registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub port: u16,
    pub bundle_id: String,
    pub root: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Default)]
pub struct DaemonState {
    servers: HashMap<String, ServerRegistration>,
    routes: HashMap<String, RouteBinding>,
    next_seq: u64,
    clock: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Registration sequence encoded in a `server-<n>` id.
fn id_sequence(id: &str) -> u64 {
    id.strip_prefix("server-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Order servers by registration: ascending `registered_at`, then sequence.
pub fn sort_by_registration(servers: &mut [ServerRegistration]) {
    servers.sort_by(|a, b| {
        a.registered_at
            .cmp(&b.registered_at)
            .then_with(|| id_sequence(&a.id).cmp(&id_sequence(&b.id)))
    });
}

impl DaemonState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedState {
        Arc::new(parking_lot::Mutex::new(Self::new()))
    }

    /// Timestamps handed out by one state never repeat or go backwards.
    fn stamp(&mut self) -> u64 {
        self.clock = now_ms().max(self.clock + 1);
        self.clock
    }

    pub fn register_server(&mut self, spec: ServerSpec) -> ServerRegistration {
        self.next_seq += 1;
        let registration = ServerRegistration {
            id: format!("server-{}", self.next_seq),
            port: spec.port,
            bundle_id: spec.bundle_id,
            root: spec.root,
            registered_at: self.stamp(),
            last_active_at: None,
            pid: spec.pid,
        };
        self.servers
            .insert(registration.id.clone(), registration.clone());
        registration
    }

    /// Remove a server and every route bound to it.
    pub fn unregister_server(&mut self, id: &str) -> Option<ServerRegistration> {
        let removed = self.servers.remove(id);
        self.routes.retain(|_, route| route.server_id != id);
        removed
    }

    pub fn find_servers_by_bundle_id(&self, bundle_id: &str) -> Vec<ServerRegistration> {
        let mut matches: Vec<_> = self
            .servers
            .values()
            .filter(|s| s.bundle_id == bundle_id)
            .cloned()
            .collect();
        sort_by_registration(&mut matches);
        matches
    }

    pub fn find_server_by_id(&self, id: &str) -> Option<&ServerRegistration> {
        self.servers.get(id)
    }

    pub fn all_servers(&self) -> Vec<ServerRegistration> {
        let mut servers: Vec<_> = self.servers.values().cloned().collect();
        sort_by_registration(&mut servers);
        servers
    }

    pub fn all_routes(&self) -> Vec<RouteBinding> {
        let mut routes: Vec<_> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.key.cmp(&b.key));
        routes
    }

    pub fn route(&self, key: &str) -> Option<&RouteBinding> {
        self.routes.get(key)
    }

    /// Bind `key` to `server_id`, replacing any previous binding.
    ///
    /// Callers validate that the server exists.
    pub fn set_route(&mut self, key: &str, server_id: &str) -> RouteBinding {
        let binding = RouteBinding {
            key: key.to_string(),
            server_id: server_id.to_string(),
            created_at: self.stamp(),
        };
        self.routes.insert(key.to_string(), binding.clone());
        binding
    }

    pub fn clear_route(&mut self, key: &str) -> bool {
        self.routes.remove(key).is_some()
    }

    pub fn touch_server(&mut self, id: &str) -> bool {
        if !self.servers.contains_key(id) {
            return false;
        }
        let now = self.stamp();
        if let Some(server) = self.servers.get_mut(id) {
            server.last_active_at = Some(now);
        }
        true
    }

    /// The server with the greatest `last_active_at ?? registered_at`.
    pub fn last_active_server(&self) -> Option<ServerRegistration> {
        self.servers
            .values()
            .max_by(|a, b| {
                a.activity_time()
                    .cmp(&b.activity_time())
                    .then_with(|| id_sequence(&a.id).cmp(&id_sequence(&b.id)))
            })
            .cloned()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(port: u16, bundle_id: &str, root: &str) -> ServerSpec {
        ServerSpec {
            port,
            bundle_id: bundle_id.to_string(),
            root: root.to_string(),
            pid: None,
        }
    }

    #[test]
    fn register_assigns_unique_ids() {
        let mut state = DaemonState::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            let s = state.register_server(spec(3000 + i, "app", "/p"));
            assert!(seen.insert(s.id.clone()), "duplicate id {}", s.id);
            if i % 3 == 0 {
                state.unregister_server(&s.id);
            }
        }
    }

    #[test]
    fn ids_are_not_reused_after_unregister() {
        let mut state = DaemonState::new();
        let a = state.register_server(spec(3001, "app", "/p/a"));
        state.unregister_server(&a.id);
        let b = state.register_server(spec(3001, "app", "/p/a"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn unregister_cascades_routes() {
        let mut state = DaemonState::new();
        let a = state.register_server(spec(3001, "app", "/p/a"));
        let b = state.register_server(spec(3002, "app", "/p/b"));
        state.set_route("app", &a.id);
        state.set_route("sim:1234", &a.id);
        state.set_route("other", &b.id);

        assert!(state.unregister_server(&a.id).is_some());
        let routes = state.all_routes();
        assert!(routes.iter().all(|r| r.server_id != a.id));
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].key, "other");
    }

    #[test]
    fn unregister_unknown_returns_none() {
        let mut state = DaemonState::new();
        assert!(state.unregister_server("server-99").is_none());
    }

    #[test]
    fn routes_never_point_at_unregistered_servers() {
        let mut state = DaemonState::new();
        let mut live = Vec::new();
        for round in 0..20u16 {
            let s = state.register_server(spec(4000 + round, "app", "/p"));
            state.set_route(&format!("key-{round}"), &s.id);
            state.set_route("app", &s.id);
            live.push(s.id);
            if round % 2 == 1 {
                let victim = live.remove(0);
                state.unregister_server(&victim);
                assert!(state.all_routes().iter().all(|r| r.server_id != victim));
            }
        }
        for route in state.all_routes() {
            assert!(state.find_server_by_id(&route.server_id).is_some());
        }
    }

    #[test]
    fn find_by_bundle_id_returns_registration_order() {
        let mut state = DaemonState::new();
        let a = state.register_server(spec(3001, "app", "/p/a"));
        state.register_server(spec(3002, "other", "/p/o"));
        let b = state.register_server(spec(3003, "app", "/p/b"));

        let found = state.find_servers_by_bundle_id("app");
        let ids: Vec<_> = found.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
        assert!(state.find_servers_by_bundle_id("missing").is_empty());
    }

    #[test]
    fn set_route_overwrites_and_clear_reports_removal() {
        let mut state = DaemonState::new();
        let a = state.register_server(spec(3001, "app", "/p/a"));
        let b = state.register_server(spec(3002, "app", "/p/b"));
        state.set_route("app", &a.id);
        state.set_route("app", &b.id);
        assert_eq!(state.route("app").unwrap().server_id, b.id);
        assert_eq!(state.all_routes().len(), 1);

        assert!(state.clear_route("app"));
        assert!(!state.clear_route("app"));
    }

    #[test]
    fn touch_updates_last_active() {
        let mut state = DaemonState::new();
        assert!(state.last_active_server().is_none());

        let a = state.register_server(spec(3001, "app", "/p/a"));
        let b = state.register_server(spec(3002, "app", "/p/b"));
        assert_eq!(state.last_active_server().unwrap().id, b.id);

        assert!(state.touch_server(&a.id));
        let last = state.last_active_server().unwrap();
        assert_eq!(last.id, a.id);
        assert!(last.last_active_at.is_some());

        assert!(!state.touch_server("server-404"));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut state = DaemonState::new();
        let a = state.register_server(spec(3001, "app", "/p/a"));
        let b = state.register_server(spec(3002, "app", "/p/b"));
        assert!(b.registered_at > a.registered_at);
    }

    #[test]
    fn sort_by_registration_breaks_ties_by_sequence() {
        let mk = |id: &str| ServerRegistration {
            id: id.to_string(),
            port: 1,
            bundle_id: "app".to_string(),
            root: "/".to_string(),
            registered_at: 5,
            last_active_at: None,
            pid: None,
        };
        let mut servers = vec![mk("server-10"), mk("server-2"), mk("server-1")];
        sort_by_registration(&mut servers);
        let ids: Vec<_> = servers.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["server-1", "server-2", "server-10"]);
    }
}
