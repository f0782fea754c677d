use std::convert::Infallible;
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use devroute_daemon::picker::ServerPicker;
use devroute_daemon::{DaemonClient, DaemonConfig, DaemonHandle};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

pub fn can_bind_local_ports() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

#[allow(dead_code)]
pub fn dead_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[allow(dead_code)]
pub async fn wait_for<F, Fut>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub fn test_config(home: &TempDir) -> DaemonConfig {
    let mut config = DaemonConfig::new(home.path());
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.interactive = false;
    config.native_dialog = false;
    config.prune_interval = None;
    config
}

#[allow(dead_code)]
pub struct TestDaemon {
    pub handle: DaemonHandle,
    pub client: DaemonClient,
    pub home: TempDir,
}

#[allow(dead_code)]
impl TestDaemon {
    pub async fn start() -> Self {
        let home = TempDir::new().unwrap();
        Self::start_in(home, |_| {}).await
    }

    pub async fn start_in(home: TempDir, tweak: impl FnOnce(&mut DaemonConfig)) -> Self {
        let mut config = test_config(&home);
        tweak(&mut config);
        let handle = devroute_daemon::start(config).await.expect("daemon start");
        let client = DaemonClient::new(handle.socket_path());
        Self {
            handle,
            client,
            home,
        }
    }

    pub async fn start_with_picker(picker: Arc<dyn ServerPicker>) -> Self {
        let home = TempDir::new().unwrap();
        let mut config = test_config(&home);
        config.interactive = true;
        let handle = devroute_daemon::start_with_picker(config, picker)
            .await
            .expect("daemon start");
        let client = DaemonClient::new(handle.socket_path());
        Self {
            handle,
            client,
            home,
        }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.handle.http_addr(), path_and_query)
    }

    pub async fn get(&self, path_and_query: &str) -> (StatusCode, String) {
        let resp = http_client()
            .get(self.url(path_and_query))
            .send()
            .await
            .expect("request");
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.text().await.unwrap())
    }

    pub async fn post(&self, path_and_query: &str) -> (StatusCode, String) {
        let resp = http_client()
            .post(self.url(path_and_query))
            .send()
            .await
            .expect("request");
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        (status, resp.text().await.unwrap())
    }
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Tiny backend: answers `"<name> <path?query>"`, and echoes bytes back
/// after switching to the `echo` protocol.
#[allow(dead_code)]
pub struct Backend {
    pub name: &'static str,
    pub port: u16,
    task: JoinHandle<()>,
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(dead_code)]
impl Backend {
    pub async fn spawn(name: &'static str) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(move |req| backend_handle(name, req));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await;
                });
            }
        });
        Self { name, port, task }
    }
}

async fn backend_handle(
    name: &'static str,
    mut req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.headers().contains_key(header::UPGRADE) {
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            let Ok(upgraded) = on_upgrade.await else {
                return;
            };
            let mut io = TokioIo::new(upgraded);
            let mut buf = [0u8; 1024];
            loop {
                let n = match io.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if io.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        let resp = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "echo")
            .header("x-backend", name)
            .body(Full::default())
            .unwrap();
        return Ok(resp);
    }

    let forwarded_host = req
        .headers()
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let body = format!("{name} {} fwd-host={forwarded_host}", req.uri());
    Ok(Response::new(Full::new(Bytes::from(body))))
}

/// Send a raw upgrade request and return the response head plus the stream.
#[allow(dead_code)]
pub async fn raw_upgrade(addr: SocketAddr, path: &str) -> (String, tokio::net::TcpStream) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("response head timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    (String::from_utf8_lossy(&head).to_string(), stream)
}
