//! dockyardd — the Dockyard daemon.
//!
//! One binary for both roles of a cluster:
//! - Registry: enrollment, image storage, placement, upgrades (HTTP API)
//! - Worker: heartbeats the registry and runs containers through docker
//!
//! # Usage
//!
//! ```text
//! dockyardd registry init --name prod
//! dockyardd registry serve --port 7420
//! dockyardd worker join --registry 10.0.0.1:7420 --master-key <key> --name w1
//! dockyardd worker run
//! ```

mod registry_mode;
mod worker_mode;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use dockyard_core::ClusterConfig;

#[derive(Parser)]
#[command(name = "dockyardd", about = "Dockyard daemon")]
struct Cli {
    /// Path to dockyard.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `cluster.data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Registry node commands.
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
    /// Worker node commands.
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
}

#[derive(Subcommand)]
enum RegistryCommand {
    /// Create the registry state and print the master key.
    Init {
        /// Cluster name.
        #[arg(long)]
        name: String,
    },
    /// Serve the registry API.
    Serve {
        /// Override `cluster.port`.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Enroll this host with a registry.
    Join {
        /// Registry `host:port`.
        #[arg(long)]
        registry: String,

        /// Registry master key.
        #[arg(long, env = "DOCKYARD_MASTER_KEY")]
        master_key: String,

        /// Worker name.
        #[arg(long)]
        name: String,

        /// Public hostname announced in heartbeats.
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Run the agent for every joined cluster (or just one).
    Run {
        #[arg(long)]
        cluster: Option<String>,

        /// Override `worker.engine`.
        #[arg(long)]
        engine: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,dockyardd=debug,dockyard=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<ClusterConfig> {
    let mut config = match path {
        Some(path) => ClusterConfig::from_file(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(data_dir) = data_dir {
        config.cluster.data_dir = data_dir;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = load_config(cli.config.as_deref(), cli.data_dir)?;
    info!(data_dir = ?config.cluster.data_dir, "configuration loaded");

    match cli.command {
        Command::Registry { command } => match command {
            RegistryCommand::Init { name } => registry_mode::init(&config, &name),
            RegistryCommand::Serve { port } => {
                if let Some(port) = port {
                    config.cluster.port = port;
                }
                registry_mode::serve(config).await
            }
        },
        Command::Worker { command } => match command {
            WorkerCommand::Join {
                registry,
                master_key,
                name,
                endpoint,
            } => worker_mode::join(&config, &registry, &master_key, &name, endpoint).await,
            WorkerCommand::Run { cluster, engine } => {
                if let Some(engine) = engine {
                    config.worker.engine = engine;
                }
                config.validate()?;
                worker_mode::run(config, cluster).await
            }
        },
    }
}
