//! Outbox relay daemon - publishes committed outbox messages and keeps both
//! message tables healthy.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relay_config_and_utils::{init_logging, Paths, RelayConfig};

/// Outbox relay command-line interface.
#[derive(Parser)]
#[command(name = "outbox-relay")]
#[command(about = "Transactional outbox relay with inbox and retention maintenance")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (database, config). Defaults to ~/.outbox-relay
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay loop, both reapers and the retention sweeper until Ctrl-C
    Run,
    /// Run one outbox and one inbox reaper pass, then exit
    Reap,
    /// Run one retention sweep, then exit
    Sweep,
    /// Write a message into the outbox
    Enqueue {
        /// Target exchange
        #[arg(long)]
        exchange: String,
        /// Routing key
        #[arg(long)]
        routing_key: String,
        /// Workflow tag carried in the envelope
        #[arg(long)]
        workflow_type: String,
        /// Unit of work to escalate on permanent failure
        #[arg(long)]
        job_id: Option<String>,
        /// Correlation id; defaults to the message id
        #[arg(long)]
        correlation_id: Option<String>,
        /// JSON body carried as the envelope data
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Print one outbox message as JSON
    Show {
        /// Message id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = RelayConfig::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level);

    match cli.command {
        Some(Commands::Run) | None => {
            app::run_relay(config, paths).await?;
        }
        Some(Commands::Reap) => {
            app::reap_once(config, paths).await?;
        }
        Some(Commands::Sweep) => {
            app::sweep_once(config, paths).await?;
        }
        Some(Commands::Enqueue {
            exchange,
            routing_key,
            workflow_type,
            job_id,
            correlation_id,
            data,
        }) => {
            let request = app::EnqueueRequest {
                exchange,
                routing_key,
                workflow_type,
                job_id,
                correlation_id,
                data,
            };
            app::enqueue(paths, request).await?;
        }
        Some(Commands::Show { id }) => {
            app::show(paths, &id).await?;
        }
    }

    Ok(())
}
