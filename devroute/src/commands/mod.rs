pub mod daemon;
pub mod route;
pub mod status;

use devroute_daemon::{DaemonClient, paths};

/// Client for the daemon under the current home, or an error when nothing
/// answers on its socket.
pub(crate) async fn running_client() -> Result<DaemonClient, Box<dyn std::error::Error>> {
    let home = paths::devroute_home_dir()?;
    let client = DaemonClient::for_home(&home);
    if !client.is_running().await {
        return Err("Daemon is not running".into());
    }
    Ok(client)
}
