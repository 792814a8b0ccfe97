//! Server multiplexer.
//!
//! Owns the service socket, accepts RRQ/WRQ datagrams on it and spawns one
//! [`Transfer`] per accepted request on a fresh ephemeral socket. All
//! transfers are driven cooperatively on the current thread: each runs as a
//! local task woken by socket readiness, while the accept loop's one-second
//! receive tick doubles as the shutdown poll.
//!
//! Anything other than a request arriving on the service socket is dropped
//! without a reply; answering strangers there would make the server an
//! amplification vector.

use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::packet::Packet;
use crate::socket::{Received, SocketError, TftpSocket};
use crate::transfer::Transfer;

/// Default TFTP service port.
pub const DEFAULT_PORT: u16 = 69;

/// Cadence of the shutdown/reap tick in the accept loop.
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("'{0}' does not exist")]
    RootMissing(String),
    #[error("'{0}' is not a directory")]
    RootNotADirectory(String),
    #[error("'{0}' is not readable")]
    RootNotReadable(String),
    #[error("'{0}' is not writable")]
    RootNotWritable(String),
    #[error("failed to bind service port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },
    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Checks that the root exists, is a directory, and is both readable and
/// writable before any request is accepted.
///
/// Writable must mean writable by this process, so instead of inspecting
/// mode bits (which ignore ownership) a throwaway file is created under the
/// root and removed again.
fn validate_root(root: &PathBuf) -> Result<(), ServerError> {
    let name = root.display().to_string();
    let meta = fs::metadata(root).map_err(|_| ServerError::RootMissing(name.clone()))?;
    if !meta.is_dir() {
        return Err(ServerError::RootNotADirectory(name));
    }
    if fs::read_dir(root).is_err() {
        return Err(ServerError::RootNotReadable(name));
    }

    let probe = root.join(format!(".tftp-write-probe-{}", std::process::id()));
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
    {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&probe);
        }
        Err(_) => return Err(ServerError::RootNotWritable(name)),
    }
    Ok(())
}

pub struct Server {
    sock: TftpSocket,
    root: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Validates the root directory and binds the service socket.
    pub fn bind(root: impl Into<PathBuf>, port: u16) -> Result<Server, ServerError> {
        let root = root.into();
        validate_root(&root)?;
        let sock = TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into())
            .map_err(|source| ServerError::Bind { port, source })?;
        Ok(Server {
            sock,
            root,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The shared shutdown flag; setting it stops the accept loop and
    /// terminates every live transfer.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// The bound service port (useful when bound to port 0 in tests).
    pub fn port(&self) -> u16 {
        self.sock.tid()
    }

    /// Accepts requests and drives transfers until the shutdown flag is
    /// observed. Must run inside a `tokio::task::LocalSet`.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        log::info!("TFTP server listening on port {}", self.port());
        let mut live: HashMap<SocketAddr, JoinHandle<()>> = HashMap::new();

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.sock.recv_timeout(TICK).await? {
                Received::Packet(packet, origin) => {
                    live.retain(|_, handle| !handle.is_finished());
                    self.accept(packet, origin, &mut live);
                }
                Received::Malformed(e, origin) => {
                    log::debug!("dropping undecodable datagram from {origin}: {e}");
                }
                Received::None => {
                    // Tick: reap transfers that reached a terminal state.
                    live.retain(|_, handle| !handle.is_finished());
                }
            }
        }

        log::info!("shutting down, waiting for {} transfer(s)", live.len());
        for (_, handle) in live {
            let _ = handle.await;
        }
        log::info!("TFTP server on port {} stopped", self.port());
        Ok(())
    }

    fn accept(
        &self,
        packet: Packet,
        origin: SocketAddr,
        live: &mut HashMap<SocketAddr, JoinHandle<()>>,
    ) {
        let Packet::Request {
            kind,
            filename,
            format,
            options,
        } = packet
        else {
            // Not a request; the service socket never answers these.
            log::debug!("dropping non-request packet from {origin}");
            return;
        };

        if live.contains_key(&origin) {
            // A retransmitted request from a client whose transfer is
            // already running; its engine will re-send the last reply on
            // its own timeout.
            log::info!("duplicate request from {origin}, already being served");
            return;
        }

        match Transfer::answer(
            kind,
            filename,
            format,
            options,
            origin,
            self.root.clone(),
            Arc::downgrade(&self.shutdown),
        ) {
            Ok(mut transfer) => {
                live.insert(
                    origin,
                    tokio::task::spawn_local(async move { transfer.run().await }),
                );
            }
            Err(e) => log::error!("failed to set up transfer for {origin}: {e}"),
        }
    }
}
