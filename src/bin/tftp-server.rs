//! Entry point for `tftp-server`.
//!
//! Owns only process setup: argument parsing, logging, and the SIGINT
//! handler that flips the shared shutdown flag. Protocol work happens in
//! the library's server multiplexer.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::Parser;
use tftp::Server;

/// TFTP server (RFC 1350 + RFC 2347 option negotiation).
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Service port to listen on.
    #[arg(short, long, default_value_t = tftp::DEFAULT_PORT)]
    port: u16,

    /// Root directory served; must exist and be readable and writable.
    root: PathBuf,
}

fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut server = Server::bind(cli.root, cli.port)?;

    let flag = server.shutdown_flag();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("interrupt received, shutting down");
                flag.store(true, Ordering::Relaxed);
            }
        });
        server.run().await
    })?;

    Ok(())
}
