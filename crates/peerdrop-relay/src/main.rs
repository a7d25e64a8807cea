//! peerdrop relay daemon
//!
//! Usage:
//!   peerdrop-relay start [--addr 127.0.0.1:4000]

use anyhow::Result;
use clap::{Parser, Subcommand};
use peerdrop_relay::RelayServer;

#[derive(Parser)]
#[command(name = "peerdrop-relay")]
#[command(about = "Relay brokering peer discovery and connection negotiation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay
    Start {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:4000")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { addr } => {
            let server = RelayServer::new(addr.clone());
            println!("peerdrop relay listening on ws://{}/ws", addr);
            server.run().await?;
        }
    }
    Ok(())
}
