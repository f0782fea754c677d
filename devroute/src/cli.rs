use std::path::PathBuf;

use clap::{ArgGroup, CommandFactory, Parser, Subcommand};
use devroute_daemon::DaemonArgs;

use crate::commands::{self, route::Target};

/// devroute - one public port for all of your local dev servers
#[derive(Parser)]
#[command(name = "devroute")]
#[command(version)]
#[command(about = "devroute - one public port for all of your local dev servers")]
pub struct Cli {
    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the routing daemon in the foreground
    Daemon(DaemonArgs),

    /// Show registered servers and sticky routes
    Status,

    /// Pin an app to one of its servers
    #[command(group(ArgGroup::new("target").required(true).args(["slot", "project"])))]
    Route {
        /// Bundle id of the client app (`default` for clients without one)
        #[arg(long)]
        app: String,

        /// 1-based position among the app's servers, in registration order
        #[arg(long)]
        slot: Option<usize>,

        /// Project root of the server to pin
        #[arg(long, value_name = "PATH")]
        project: Option<PathBuf>,
    },

    /// Forget the sticky route for an app
    Unroute {
        /// Bundle id of the client app
        #[arg(long)]
        app: String,
    },

    /// Stop the running daemon
    Stop,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is unset. The foreground daemon logs
    /// at info.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose || matches!(self.command, Some(Commands::Daemon(_))) {
            "info"
        } else {
            "warn"
        }
    }

    pub fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let Some(command) = self.command else {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        };

        let rt = tokio::runtime::Runtime::new()?;
        match command {
            Commands::Daemon(args) => rt.block_on(commands::daemon::run(args)),
            Commands::Status => rt.block_on(commands::status::run()),
            Commands::Route { app, slot, project } => {
                let target = match (slot, project) {
                    (Some(slot), _) => Target::Slot(slot),
                    (None, Some(project)) => Target::Project(project),
                    (None, None) => return Err("either --slot or --project is required".into()),
                };
                rt.block_on(commands::route::run(&app, target))
            }
            Commands::Unroute { app } => rt.block_on(commands::route::clear(&app)),
            Commands::Stop => rt.block_on(commands::daemon::stop()),
        }
    }
}
