//! Control socket: newline-delimited JSON requests from CLI clients.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use devroute_protocol::{Request, Response};
use devroute_socket::serve_jsonl_connection;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::error::DaemonError;
use crate::events::{EventsHub, RegistryEvent};
use crate::registry::{ServerSpec, SharedState};

/// What a control connection may touch.
#[derive(Clone)]
pub struct IpcContext {
    pub state: SharedState,
    pub events: EventsHub,
    pub shutdown_tx: watch::Sender<bool>,
}

/// Bind the control socket, clearing a stale socket file first.
///
/// A socket file that still accepts connections belongs to a running daemon
/// and is left alone.
pub async fn bind_control_socket(path: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::AlreadyRunning(path.to_path_buf()));
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(sock = %path.display(), "removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let listener = UnixListener::bind(path).map_err(|source| DaemonError::BindSocket {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

pub fn handle_request(ctx: &IpcContext, req: Request) -> Response {
    match req {
        Request::Register {
            port,
            bundle_id,
            root,
            pid,
        } => {
            let registration = ctx.state.lock().register_server(ServerSpec {
                port,
                bundle_id,
                root,
                pid,
            });
            let id = registration.id.clone();
            ctx.events.broadcast(RegistryEvent::Registered(registration));
            Response::Registered { id }
        }
        Request::Unregister { id } => {
            let server = ctx.state.lock().unregister_server(&id);
            ctx.events
                .broadcast(RegistryEvent::Unregistered { id, server });
            Response::Unregistered
        }
        Request::Route {
            bundle_id,
            server_id,
        } => {
            let mut s = ctx.state.lock();
            if s.find_server_by_id(&server_id).is_none() {
                return Response::error(format!("Server not found: {server_id}"));
            }
            s.set_route(&bundle_id, &server_id);
            Response::Routed
        }
        Request::RouteClear { bundle_id } => {
            ctx.state.lock().clear_route(&bundle_id);
            Response::Routed
        }
        Request::Status => {
            let s = ctx.state.lock();
            Response::Status {
                servers: s.all_servers(),
                routes: s.all_routes(),
            }
        }
        Request::Ping => Response::Pong,
        Request::Touch { id } => {
            if ctx.state.lock().touch_server(&id) {
                Response::Touched
            } else {
                Response::error(format!("Server not found: {id}"))
            }
        }
        Request::GetLastActive => Response::LastActive {
            server: ctx.state.lock().last_active_server(),
        },
        Request::Stop => {
            let _ = ctx.shutdown_tx.send(true);
            Response::Stopping
        }
        Request::Unknown => Response::error("Unknown message type"),
    }
}

pub async fn serve_connection(stream: UnixStream, ctx: IpcContext) -> std::io::Result<()> {
    serve_jsonl_connection(
        stream,
        |req: Request| {
            let resp = handle_request(&ctx, req);
            async move { resp }
        },
        |e| Response::error(e.to_string()),
    )
    .await
}

/// Resolves once shutdown is requested or every sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Accept control connections until shutdown is signalled. The listener is
/// dropped on return.
pub async fn serve(
    listener: UnixListener,
    ctx: IpcContext,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, ctx).await {
                                tracing::warn!(error = %e, "control connection error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "control socket accept failed"),
                }
            }
        }
    }
}
