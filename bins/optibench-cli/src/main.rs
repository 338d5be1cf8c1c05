mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "optibench-cli")]
#[command(about = "Optibench CLI - Enqueue submissions and inspect evaluation results", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a submission archive directly, bypassing the HTTP API
    Submit {
        /// Submitter name (use the same name for repeat submissions)
        #[arg(short, long)]
        name: String,

        /// Path to the submission archive (or an unpacked directory)
        #[arg(short, long)]
        archive: String,
    },

    /// Show one submission's result or live status
    Status {
        /// Submission id
        #[arg(short, long)]
        id: String,
    },

    /// Print the ranked leaderboard
    Leaderboard,

    /// Show pending/running queue depths
    Queue,

    /// Re-enqueue a submission's payload as a new row (for runs stuck
    /// RUNNING after a worker died mid-claim)
    Requeue {
        /// Submission id of the stuck run
        #[arg(short, long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit { name, archive } => {
            commands::submit(&name, &archive).await?;
        }
        Commands::Status { id } => {
            commands::status(&id).await?;
        }
        Commands::Leaderboard => {
            commands::leaderboard().await?;
        }
        Commands::Queue => {
            commands::queue().await?;
        }
        Commands::Requeue { id } => {
            commands::requeue(&id).await?;
        }
    }

    Ok(())
}
