//! Client helpers for talking to a running daemon over its control socket.
//!
//! Each call opens a fresh connection, sends one request, waits for exactly
//! one response and closes. Calls are never retried.

use std::path::{Path, PathBuf};
use std::time::Duration;

use devroute_protocol::{Request, Response, RouteBinding, ServerRegistration};
use devroute_socket::request_response;
use tokio::net::UnixStream;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not connect to daemon at {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon did not respond within {0:?}")]
    Timeout(Duration),

    #[error("daemon closed the connection without responding")]
    Closed,

    #[error("{0}")]
    Daemon(String),

    #[error("unexpected response from daemon: {0:?}")]
    Unexpected(Box<Response>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub servers: Vec<ServerRegistration>,
    pub routes: Vec<RouteBinding>,
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn for_home(home: &Path) -> Self {
        Self::new(crate::paths::socket_path(home))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Liveness check: `false` without connecting when the socket file is
    /// absent, otherwise a ping bounded by [`PING_TIMEOUT`].
    pub async fn is_running(&self) -> bool {
        if !self.socket_path.exists() {
            return false;
        }
        matches!(
            self.send_with_timeout(&Request::Ping, PING_TIMEOUT).await,
            Ok(Response::Pong)
        )
    }

    pub async fn send(&self, req: &Request) -> Result<Response, ClientError> {
        self.send_with_timeout(req, REQUEST_TIMEOUT).await
    }

    pub async fn send_with_timeout(
        &self,
        req: &Request,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let exchange = async {
            let stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|source| ClientError::Connect {
                    path: self.socket_path.clone(),
                    source,
                })?;
            request_response::<_, _, Response>(stream, req)
                .await?
                .ok_or(ClientError::Closed)
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    /// Register a dev server on behalf of the current process.
    pub async fn register(
        &self,
        port: u16,
        bundle_id: &str,
        root: &str,
    ) -> Result<String, ClientError> {
        let resp = self
            .send(&Request::Register {
                port,
                bundle_id: bundle_id.to_string(),
                root: root.to_string(),
                pid: Some(std::process::id()),
            })
            .await?;
        match resp {
            Response::Registered { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unregister(&self, id: &str) -> Result<(), ClientError> {
        match self.send(&Request::Unregister { id: id.to_string() }).await? {
            Response::Unregistered => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<StatusSnapshot, ClientError> {
        match self.send(&Request::Status).await? {
            Response::Status { servers, routes } => Ok(StatusSnapshot { servers, routes }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_route(&self, bundle_id: &str, server_id: &str) -> Result<(), ClientError> {
        let resp = self
            .send(&Request::Route {
                bundle_id: bundle_id.to_string(),
                server_id: server_id.to_string(),
            })
            .await?;
        match resp {
            Response::Routed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn clear_route(&self, bundle_id: &str) -> Result<(), ClientError> {
        let resp = self
            .send(&Request::RouteClear {
                bundle_id: bundle_id.to_string(),
            })
            .await?;
        match resp {
            Response::Routed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn touch(&self, id: &str) -> Result<(), ClientError> {
        match self.send(&Request::Touch { id: id.to_string() }).await? {
            Response::Touched => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn last_active(&self) -> Result<Option<ServerRegistration>, ClientError> {
        match self.send(&Request::GetLastActive).await? {
            Response::LastActive { server } => Ok(server),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        match self.send(&Request::Stop).await? {
            Response::Stopping => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(resp: Response) -> ClientError {
    match resp {
        Response::Error { message } => ClientError::Daemon(message),
        other => ClientError::Unexpected(Box::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devroute_socket::{read_json_line, write_json_line};
    use tempfile::TempDir;
    use tokio::io::BufReader;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn is_running_is_false_without_socket_file() {
        let temp = TempDir::new().unwrap();
        let client = DaemonClient::for_home(temp.path());
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn is_running_is_false_for_stale_socket() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(!DaemonClient::new(&path).is_running().await);
    }

    #[tokio::test]
    async fn send_times_out_when_daemon_never_answers() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let err = DaemonClient::new(&path)
            .send_with_timeout(&Request::Ping, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        silent.abort();
    }

    #[tokio::test]
    async fn daemon_error_responses_become_client_errors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut r = BufReader::new(r);
            let req: Request = read_json_line(&mut r).await.unwrap().unwrap();
            assert!(matches!(req, Request::Touch { .. }));
            write_json_line(&mut w, &Response::error("Server not found: server-7"))
                .await
                .unwrap();
        });

        let err = DaemonClient::new(&path).touch("server-7").await.unwrap_err();
        match err {
            ClientError::Daemon(message) => assert_eq!(message, "Server not found: server-7"),
            other => panic!("unexpected: {other:?}"),
        }
        server.await.unwrap();
    }
}
