//! Chat server binary.
//!
//! Logging goes through `env_logger` — set `RUST_LOG=parlor=debug` for
//! per-frame detail.

use clap::Parser;
use std::path::PathBuf;

use parlor::server::{ChatServer, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "parlor", about = "Durable chat room server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,

    /// Directory for per-room SQLite files. Without it, room history
    /// lives only as long as the room stays occupied.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let server = ChatServer::new(ServerConfig {
        bind_addr: args.bind,
        storage_dir: args.data_dir,
    });
    server.run().await
}
