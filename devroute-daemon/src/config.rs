use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PICKER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(5);

/// Everything a daemon instance needs to start.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory holding the control socket and the servers file.
    pub home: PathBuf,
    pub host: String,
    /// Public HTTP/WebSocket port. `0` picks an ephemeral port.
    pub port: u16,
    /// Whether ambiguous requests may ask a human.
    pub interactive: bool,
    /// Try a native OS dialog before the terminal menu.
    pub native_dialog: bool,
    pub picker_timeout: Duration,
    /// How often registered ports are checked; `None` disables pruning.
    pub prune_interval: Option<Duration>,
}

impl DaemonConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            interactive: detect_interactive(),
            native_dialog: true,
            picker_timeout: DEFAULT_PICKER_TIMEOUT,
            prune_interval: Some(DEFAULT_PRUNE_INTERVAL),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        crate::paths::socket_path(&self.home)
    }

    pub fn servers_file_path(&self) -> PathBuf {
        crate::paths::servers_file_path(&self.home)
    }

    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Command-line options shared by `devroute-daemon` and `devroute daemon`.
#[derive(Debug, Clone, clap::Args)]
pub struct DaemonArgs {
    /// Public port for proxied HTTP and WebSocket traffic
    #[arg(long, env = "DEVROUTE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind the public port on
    #[arg(long, env = "DEVROUTE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Never ask which server to use; route ambiguous requests to the first one
    #[arg(long)]
    pub non_interactive: bool,

    /// Skip the native dialog and use the terminal menu
    #[arg(long)]
    pub no_native_dialog: bool,

    /// Seconds to wait for an interactive selection
    #[arg(long, default_value_t = DEFAULT_PICKER_TIMEOUT.as_secs())]
    pub picker_timeout_secs: u64,

    /// Seconds between liveness checks of registered servers (0 disables)
    #[arg(long, default_value_t = DEFAULT_PRUNE_INTERVAL.as_secs())]
    pub prune_interval_secs: u64,
}

impl DaemonArgs {
    pub fn into_config(self, home: &Path) -> DaemonConfig {
        DaemonConfig {
            home: home.to_path_buf(),
            host: self.host,
            port: self.port,
            interactive: !self.non_interactive && detect_interactive(),
            native_dialog: !self.no_native_dialog,
            picker_timeout: Duration::from_secs(self.picker_timeout_secs),
            prune_interval: (self.prune_interval_secs > 0)
                .then(|| Duration::from_secs(self.prune_interval_secs)),
        }
    }
}

/// Interactive means a terminal is attached and no CI flag is set.
pub fn detect_interactive() -> bool {
    std::io::stdin().is_terminal() && !ci_flag_set(std::env::var("CI").ok().as_deref())
}

fn ci_flag_set(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => !(v == "0" || v.eq_ignore_ascii_case("false")),
    }
}
