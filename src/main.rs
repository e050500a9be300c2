use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use offlinerelay::{
    config::Config,
    logging,
    queue::QueueStore,
    replay::{DrainOutcome, Replayer},
    storage::FileBlobStore,
    transport::{Connectivity, HttpTransport, Transport},
};

#[derive(Debug, Parser)]
#[command(name = "offlinerelay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Inspect and drain the offline request queue.
    Queue {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
        #[command(subcommand)]
        action: QueueCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum QueueCommand {
    /// List queued requests, oldest first.
    List,
    /// Remove a queued request by id.
    Remove { id: String },
    /// Replay the queue against the live network once.
    Drain,
}

fn open_queue(config: &Config) -> anyhow::Result<QueueStore> {
    let store = FileBlobStore::open(&config.queue.path)?;
    Ok(QueueStore::new(Arc::new(store)))
}

async fn run_queue_command(config: &Config, action: QueueCommand) -> anyhow::Result<()> {
    let queue = open_queue(config)?;

    match action {
        QueueCommand::List => {
            let entries = queue.list();
            if entries.is_empty() {
                println!("queue is empty");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{}  {}  {} {}",
                    entry.id, entry.ts, entry.item.init.method, entry.item.url
                );
            }
        }
        QueueCommand::Remove { id } => {
            let before = queue.len();
            queue.remove(&id);
            if queue.len() == before {
                anyhow::bail!("no queued request with id `{id}`");
            }
            println!("removed {id}");
        }
        QueueCommand::Drain => {
            let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
            let replayer = Replayer::new(
                queue,
                transport,
                Connectivity::new(true),
                config.replay.binary_body_policy,
            );
            match replayer.process_queue().await {
                DrainOutcome::Empty => println!("queue is empty"),
                DrainOutcome::Completed {
                    replayed,
                    rejected,
                    discarded,
                    halted,
                } => {
                    println!(
                        "replayed {replayed}, rejected {rejected}, discarded {discarded}{}",
                        if halted { ", halted on network failure" } else { "" }
                    );
                }
                DrainOutcome::Offline | DrainOutcome::AlreadyRunning => {
                    unreachable!("single-shot drain is always online and single-flight")
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Queue {
            config,
            log_level,
            action,
        } => {
            let config = Config::discover(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            run_queue_command(&config, action).await
        }
    }
}
