use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("could not bind public port on {addr}: {source}")]
    BindHttp {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not bind control socket at {}: {source}", path.display())]
    BindSocket {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon already running (socket exists at {})", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure talking to a backend while proxying.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("could not connect to 127.0.0.1:{port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream HTTP error: {0}")]
    Upstream(#[from] hyper::Error),
}
