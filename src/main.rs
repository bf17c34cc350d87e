use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use ccp_agent::algorithms::AlgorithmRegistry;
use ccp_agent::datapath::UnixDatagramBackend;
use ccp_agent::supervisor::{self, SupervisorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Ipc {
    /// Datagram sockets on the local filesystem
    Unix,
}

#[derive(Parser)]
#[command(name = "ccp-agent")]
#[command(about = "Userspace congestion control plane")]
struct Args {
    /// Socket the datapath sends reports to
    #[arg(long, default_value = "/tmp/ccp-in")]
    listen: PathBuf,

    /// Socket the datapath receives patterns on
    #[arg(long, default_value = "/tmp/ccp-out")]
    send: PathBuf,

    #[arg(long, value_enum, default_value = "unix")]
    ipc: Ipc,

    #[arg(long, default_value = "1460")]
    mss: u32,

    #[arg(long, default_value = "10")]
    init_cwnd_pkts: u32,

    #[arg(long, default_value = "60")]
    idle_timeout_secs: u64,

    /// Print the available algorithms and exit
    #[arg(long)]
    list: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let registry = AlgorithmRegistry::with_defaults();
    if args.list {
        println!("Available algorithms:");
        for name in registry.list() {
            println!("  - {}", name);
        }
        return Ok(());
    }

    info!("Starting congestion control plane");
    info!("  mss: {} bytes", args.mss);
    info!("  init_cwnd: {} packets", args.init_cwnd_pkts);
    info!("  idle timeout: {} s", args.idle_timeout_secs);

    let config = SupervisorConfig {
        packet_size: args.mss,
        init_cwnd_pkts: args.init_cwnd_pkts,
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        ..SupervisorConfig::default()
    };

    let backend = match args.ipc {
        Ipc::Unix => UnixDatagramBackend::bind(&args.listen, &args.send).with_context(|| {
            format!("failed to bind datapath socket {}", args.listen.display())
        })?,
    };

    supervisor::serve(backend, config, registry, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;

    info!("Stopped");
    Ok(())
}
