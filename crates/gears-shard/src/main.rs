use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gears_cluster::{serve_tcp, ClusterTopology, TcpConnector};
use gears_core::{CallbackRegistry, GearsConfig, ShardId};
use gears_plan::register_builtins;
use gears_shard::{init_logging, CommandReply, Shard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "gears-node")]
#[command(author, version, about = "Gears shard node - distributed dataflow over a sharded keyspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shard and read commands from stdin
    Serve {
        /// Shard id as listed in the topology
        #[arg(short, long)]
        id: String,

        /// Cluster topology file (JSON)
        #[arg(short, long)]
        topology: PathBuf,

        /// Registrations file, restored at start and saved at exit
        #[arg(short, long)]
        registrations: Option<PathBuf>,
    },

    /// Print the default configuration
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => GearsConfig::from_file(path)
            .with_context(|| format!("loading config from {:?}", path))?,
        None => GearsConfig::default(),
    };

    match cli.command {
        Commands::Serve {
            id,
            topology,
            registrations,
        } => serve(config, ShardId::new(id), &topology, registrations.as_deref()).await,
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(
    config: GearsConfig,
    id: ShardId,
    topology_path: &Path,
    registrations: Option<&Path>,
) -> Result<()> {
    let topology: ClusterTopology = serde_json::from_str(
        &tokio::fs::read_to_string(topology_path)
            .await
            .with_context(|| format!("reading topology {:?}", topology_path))?,
    )?;
    let address = topology
        .node(&id)
        .map(|node| node.address())
        .with_context(|| format!("shard {} is not part of the topology", id))?;

    let callbacks = Arc::new(CallbackRegistry::new());
    register_builtins(&callbacks);
    let shard = Shard::new(id, config, callbacks, Arc::new(TcpConnector))?;

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {}", address))?;
    info!("Shard {} listening on {}", shard.id(), address);
    let handler = Arc::new(shard.transport().clone());
    tokio::spawn(async move {
        if let Err(e) = serve_tcp(listener, handler).await {
            error!("Inter-shard listener stopped: {}", e);
        }
    });
    shard.set_topology(topology);

    if let Some(path) = registrations {
        if path.exists() {
            shard.load_registrations(path)?;
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if args.is_empty() {
            continue;
        }
        let reply = shard.dispatch(&args).await;
        stdout.write_all(format_reply(&reply).as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    if let Some(path) = registrations {
        shard.save_registrations(path)?;
    }
    Ok(())
}

fn format_reply(reply: &CommandReply) -> String {
    match reply {
        CommandReply::Ok => "OK".to_string(),
        CommandReply::Nil => "(nil)".to_string(),
        CommandReply::Int(i) => format!("(integer) {}", i),
        CommandReply::Str(s) => s.clone(),
        CommandReply::Error(e) => format!("(error) {}", e),
        CommandReply::Array(items) => {
            let inner: Vec<String> = items.iter().map(format_reply).collect();
            format!("[{}]", inner.join(", "))
        }
    }
}
