//! The daemon process: public HTTP/WebSocket listener, control socket,
//! registry event mirror and liveness pruning, with ordered teardown.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use devroute_protocol::{HttpStatus, PersistedServer, ServerSummary};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::events::{EventsHub, RegistryEvent};
use crate::ipc::{self, IpcContext, wait_for_shutdown};
use crate::paths::shorten_home;
use crate::persist::{self, ServersFile};
use crate::picker::{InteractivePicker, ServerPicker};
use crate::proxy::{self, ProxyBody, full, is_upgrade_request, text_response};
use crate::registry::{DaemonState, SharedState};
use crate::resolver::{ClientHint, Resolution, RouteResolver};
use crate::simulators;

const MANAGEMENT_PREFIX: &str = "/__daemon";

/// A running daemon.
pub struct DaemonHandle {
    http_addr: SocketAddr,
    socket_path: PathBuf,
    state: SharedState,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Request teardown without waiting for it.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until teardown finished, whatever triggered it.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "daemon task failed");
        }
    }

    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

/// Start a daemon with the interactive picker.
pub async fn start(config: DaemonConfig) -> Result<DaemonHandle, DaemonError> {
    let picker = Arc::new(InteractivePicker::new(config.native_dialog));
    start_with_picker(config, picker).await
}

pub async fn start_with_picker(
    config: DaemonConfig,
    picker: Arc<dyn ServerPicker>,
) -> Result<DaemonHandle, DaemonError> {
    // The public port is bound first so a second instance fails before it
    // touches the control socket.
    let addr = config.listen_addr();
    let http_listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| DaemonError::BindHttp {
            addr: addr.clone(),
            source,
        })?;
    let http_addr = http_listener.local_addr()?;

    let socket_path = config.socket_path();
    let control_listener = ipc::bind_control_socket(&socket_path).await?;

    let state = DaemonState::shared();
    let events = EventsHub::default();
    let servers_file = ServersFile::new(config.servers_file_path());

    for server in persist::recover_servers(&servers_file, &state).await {
        tracing::info!(
            id = %server.id,
            bundle_id = %server.bundle_id,
            port = server.port,
            root = %shorten_home(&server.root),
            "recovered server"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(mirror_events(
        events.subscribe(),
        servers_file,
        state.clone(),
        shutdown_rx.clone(),
    ));
    if let Some(interval) = config.prune_interval {
        tokio::spawn(prune_loop(
            state.clone(),
            events.clone(),
            interval,
            shutdown_rx.clone(),
        ));
    }

    let ctx = IpcContext {
        state: state.clone(),
        events,
        shutdown_tx: shutdown_tx.clone(),
    };
    let app = Arc::new(App {
        state: state.clone(),
        resolver: RouteResolver::new(
            state.clone(),
            picker.clone(),
            config.interactive,
            config.picker_timeout,
        ),
    });

    tracing::info!(
        listen = %http_addr,
        sock = %socket_path.display(),
        interactive = config.interactive,
        "devroute daemon listening"
    );

    let sock = socket_path.clone();
    let task = tokio::spawn(async move {
        let ipc_task = tokio::spawn(ipc::serve(control_listener, ctx, shutdown_rx.clone()));
        serve_http(http_listener, app, shutdown_rx).await;
        if let Err(e) = ipc_task.await {
            tracing::warn!(error = %e, "control socket task failed");
        }
        picker.shutdown();
        match tokio::fs::remove_file(&sock).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(sock = %sock.display(), error = %e, "failed to remove control socket"),
        }
        tracing::info!("devroute daemon stopped");
    });

    Ok(DaemonHandle {
        http_addr,
        socket_path,
        state,
        shutdown_tx,
        task,
    })
}

/// Run in the foreground until a signal or a `stop` request.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    let handle = start(config).await?;
    spawn_signal_listeners(handle.shutdown_tx.clone());
    handle.wait().await;
    Ok(())
}

fn spawn_signal_listeners(shutdown_tx: watch::Sender<bool>) {
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, shutting down");
                let _ = shutdown_tx.send(true);
            }
        });
    }
    tokio::spawn(async move {
        if let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            let _ = sigterm.recv().await;
            tracing::info!("terminated, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
}

/// Log registry changes and mirror them to the servers file.
async fn mirror_events(
    mut events: mpsc::UnboundedReceiver<RegistryEvent>,
    file: ServersFile,
    state: SharedState,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let result = match event {
            RegistryEvent::Registered(server) => {
                tracing::info!(
                    id = %server.id,
                    bundle_id = %server.bundle_id,
                    port = server.port,
                    root = %shorten_home(&server.root),
                    "server registered"
                );
                file.write_server(PersistedServer::from(&server)).await
            }
            RegistryEvent::Unregistered {
                id,
                server: Some(server),
            } => {
                tracing::info!(id = %id, bundle_id = %server.bundle_id, port = server.port, "server unregistered");
                // Another live server may still own the same root.
                let survivor = state
                    .lock()
                    .all_servers()
                    .into_iter()
                    .rev()
                    .find(|s| s.root == server.root);
                match survivor {
                    Some(survivor) => file.write_server(PersistedServer::from(&survivor)).await,
                    None => file.remove_server(&server.root).await,
                }
            }
            RegistryEvent::Unregistered { id, server: None } => {
                tracing::debug!(id = %id, "unregister for unknown server");
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(path = %file.path().display(), error = %e, "failed to update servers file");
        }
    }
}

async fn prune_loop(
    state: SharedState,
    events: EventsHub,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            _ = ticker.tick() => {
                let pruned = persist::prune_dead_servers(&state, &events).await;
                for server in &pruned {
                    tracing::info!(
                        id = %server.id,
                        bundle_id = %server.bundle_id,
                        port = server.port,
                        "pruned dead server"
                    );
                }
            }
        }
    }
}

async fn serve_http(
    listener: TcpListener,
    app: Arc<App>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "public port accept failed");
                        continue;
                    }
                };
                let app = app.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let app = app.clone();
                        async move { Ok::<_, Infallible>(app.handle(req, peer).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        tracing::debug!(peer = %peer, error = %e, "http connection error");
                    }
                });
            }
        }
    }
}

struct App {
    state: SharedState,
    resolver: RouteResolver,
}

impl App {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        tracing::debug!(method = %req.method(), uri = %req.uri(), peer = %peer, "request");

        if req.uri().path().starts_with(MANAGEMENT_PREFIX) {
            return self.handle_management(req.method(), req.uri()).await;
        }

        let bundle_id = query_param(req.uri(), "app").filter(|b| !b.is_empty());
        let upgrade = is_upgrade_request(&req);
        let client = ClientHint::new(peer, req.headers());
        let resolution = if upgrade {
            self.resolver.resolve_upgrade(bundle_id.as_deref(), &client)
        } else {
            self.resolver.resolve_http(bundle_id.as_deref(), &client).await
        };

        let server = match resolution {
            Resolution::NoCandidates => {
                let body = match &bundle_id {
                    Some(bundle_id) => format!("No server for app: {bundle_id}"),
                    None => "No servers registered".to_string(),
                };
                return text_response(StatusCode::NOT_FOUND, body);
            }
            Resolution::Target { server, via } => {
                tracing::debug!(id = %server.id, port = server.port, via = ?via, upgrade, "resolved");
                server
            }
        };

        self.state.lock().touch_server(&server.id);
        if upgrade {
            proxy::forward_upgrade(req, server.port, Some(peer)).await
        } else {
            proxy::forward_http(req, server.port, Some(peer)).await
        }
    }

    async fn handle_management(&self, method: &Method, uri: &Uri) -> Response<ProxyBody> {
        match (method, uri.path()) {
            (_, "/__daemon/status") => self.status().await,
            (&Method::POST, "/__daemon/route") => self.set_route(uri),
            _ => text_response(StatusCode::NOT_FOUND, "Not found"),
        }
    }

    async fn status(&self) -> Response<ProxyBody> {
        let servers = self
            .state
            .lock()
            .all_servers()
            .iter()
            .map(ServerSummary::from)
            .collect();
        let simulators = simulators::booted_simulators().await;

        match serde_json::to_string_pretty(&HttpStatus {
            servers,
            simulators,
        }) {
            Ok(json) => {
                let mut resp = Response::new(full(json));
                resp.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                resp
            }
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    fn set_route(&self, uri: &Uri) -> Response<ProxyBody> {
        let bundle_id = query_param(uri, "bundleId").filter(|v| !v.is_empty());
        let server_id = query_param(uri, "serverId").filter(|v| !v.is_empty());
        let (Some(bundle_id), Some(server_id)) = (bundle_id, server_id) else {
            return text_response(StatusCode::BAD_REQUEST, "Missing bundleId or serverId");
        };

        {
            let mut s = self.state.lock();
            if s.find_server_by_id(&server_id).is_none() {
                return text_response(StatusCode::NOT_FOUND, "Server not found");
            }
            s.set_route(&bundle_id, &server_id);
        }
        if self
            .resolver
            .picker()
            .resolve_pending(&bundle_id, &server_id)
        {
            tracing::debug!(bundle_id = %bundle_id, "completed pending picker");
        }
        tracing::info!(bundle_id = %bundle_id, server_id = %server_id, "route set");
        text_response(StatusCode::OK, "Route set")
    }
}

/// First value of `name` in the query string, form-decoded.
pub fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (form_decode(key) == name).then(|| form_decode(value))
    })
}

fn form_decode(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    percent_decode_str(&raw).decode_utf8_lossy().into_owned()
}
