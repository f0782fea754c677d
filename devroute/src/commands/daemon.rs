use std::time::{Duration, Instant};

use devroute_daemon::{DaemonArgs, paths};

use crate::commands::running_client;
use crate::output;

const STOP_WAIT: Duration = Duration::from_secs(5);

pub async fn run(args: DaemonArgs) -> Result<(), Box<dyn std::error::Error>> {
    let home = paths::devroute_home_dir()?;
    devroute_daemon::run(args.into_config(&home)).await?;
    Ok(())
}

pub async fn stop() -> Result<(), Box<dyn std::error::Error>> {
    let client = running_client().await?;
    client.stop().await?;

    let deadline = Instant::now() + STOP_WAIT;
    while client.is_running().await {
        if Instant::now() >= deadline {
            output::warning("Daemon acknowledged stop but is still answering");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    output::success("Daemon stopped");
    Ok(())
}
