use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devroute-daemon", version, about = "Route dev clients to local dev servers")]
struct Args {
    #[command(flatten)]
    daemon: devroute_daemon::DaemonArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let home = devroute_daemon::paths::devroute_home_dir()?;
    devroute_daemon::run(args.daemon.into_config(&home)).await?;
    Ok(())
}
