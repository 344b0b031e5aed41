use anyhow::Result;
use clap::{Parser, Subcommand};
use tinysched::commands;

#[derive(Parser)]
#[command(author, version, about = "Reconcile a remote task queue with local worker processes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run reconciliation: one pass by default, or a perpetual loop
    Run {
        /// Run exactly one reconciliation pass (the default)
        #[arg(long, conflicts_with = "daemon")]
        once: bool,

        /// Loop forever, one pass per interval
        #[arg(long)]
        daemon: bool,

        /// Log intended actions without mutating anything
        #[arg(long)]
        dry_run: bool,

        /// Seconds between passes in daemon mode
        #[arg(long)]
        loop_interval: Option<u64>,
    },
    /// Check paths, limits, and the agent registry
    ValidateConfig {
        /// Create missing directories and a default agent control file
        #[arg(long)]
        fix: bool,
    },
    /// Show leases and their health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            once: _,
            daemon,
            dry_run,
            loop_interval,
        } => {
            commands::run::run(commands::run::RunArgs {
                daemon,
                dry_run,
                loop_interval,
            })
            .await
        }
        Commands::ValidateConfig { fix } => commands::validate::run(fix).await,
        Commands::Status => commands::status::run().await,
    }
}
