//! Single-shot client driver.
//!
//! Instantiates one [`Transfer`] configured as the initiating side and runs
//! it to a terminal state. With no remote path the driver uploads standard
//! input under the target name; with one it downloads the remote file into
//! a freshly created local destination.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Weak;

use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::Stdin;

use crate::options::Options;
use crate::packet::Format;
use crate::transfer::{ClientEndpoint, Transfer, TransferError};

/// One client invocation.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname or address.
    pub host: String,
    /// Server service port.
    pub port: u16,
    /// Remote path to download; `None` means upload standard input.
    pub remote: Option<String>,
    /// Local destination path (download) or remote target name (upload).
    pub target: String,
    pub format: Format,
    /// Options to propose with the request.
    pub options: Options,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("host '{0}' did not resolve to an IPv4 address")]
    BadHost(String),
    #[error("cannot create '{path}': {source}")]
    Destination {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Setup(#[from] std::io::Error),
    #[error("transfer failed: {0}")]
    Transfer(TransferError),
    #[error("transfer failed")]
    PeerClosed,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| ClientError::BadHost(host.to_string()))?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| ClientError::BadHost(host.to_string()))
}

/// Runs one transfer to completion. `Ok` means the engine reached
/// `Completed`; anything else is reported for a non-zero exit.
pub async fn run(config: ClientConfig, shutdown: Weak<AtomicBool>) -> Result<(), ClientError> {
    let server = resolve(&config.host, config.port)?;

    match &config.remote {
        None => {
            // Upload: payload comes from standard input, named `target`
            // on the server.
            let mut transfer = Transfer::initiate_upload(
                server,
                config.target.clone(),
                config.format,
                config.options,
                tokio::io::stdin(),
                shutdown,
            )?;
            finish(&mut transfer).await
        }
        Some(remote) => {
            // Download: refuse to overwrite an existing destination. The
            // transfer owns the file and unlinks it if the exchange errors.
            let dest_path = PathBuf::from(&config.target);
            let dest = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&dest_path)
                .await
                .map_err(|source| ClientError::Destination {
                    path: config.target.clone(),
                    source,
                })?;

            let mut transfer = Transfer::<ClientEndpoint<Stdin>>::initiate_download(
                server,
                remote.clone(),
                config.format,
                config.options,
                dest,
                dest_path,
                shutdown,
            )?;
            finish(&mut transfer).await
        }
    }
}

async fn finish<E: crate::transfer::Endpoint>(
    transfer: &mut Transfer<E>,
) -> Result<(), ClientError> {
    transfer.run().await;
    if transfer.is_errored() {
        return Err(match transfer.take_error() {
            Some(e) => ClientError::Transfer(e),
            None => ClientError::PeerClosed,
        });
    }
    Ok(())
}
