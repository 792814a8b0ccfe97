//! Wrapper around a non-blocking UDP socket that speaks in decoded TFTP
//! packets rather than raw datagrams.
//!
//! The receive path is deliberately three-way: a deadline can pass with
//! nothing to read, a well-formed packet can arrive, or a datagram can
//! arrive that does not decode. The caller must handle each case, so the
//! distinction is encoded in [`Received`] instead of being collapsed into
//! an error.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use async_io::Async;
use rand::Rng;
use thiserror::Error;
use tokio::time::timeout;

use crate::packet::{self, DecodeError, EncodeError, Packet};

/// Largest datagram ever accepted: the maximum negotiable block size plus
/// the four-byte DATA header.
pub const MAX_DATAGRAM: usize = crate::options::BLKSIZE_MAX as usize + 4;

/// An error returned from the TFTP socket.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("refusing to send: {0}")]
    Encode(#[from] EncodeError),
}

/// Outcome of one receive attempt.
#[derive(Debug)]
pub enum Received {
    /// Nothing readable before the deadline (or an empty non-packet).
    None,
    /// A well-formed packet and its origin address.
    Packet(Packet, SocketAddr),
    /// A datagram arrived but did not decode.
    Malformed(DecodeError, SocketAddr),
}

pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// Binds to a random ephemeral port; the chosen port is this side's
    /// TID for the lifetime of one transfer. Retries on collision.
    pub fn bind_ephemeral() -> io::Result<TftpSocket> {
        let mut rng = rand::thread_rng();
        let mut last_err = None;
        for _ in 0..16 {
            let port: u16 = rng.gen_range(1024..65535);
            match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into()) {
                Ok(sock) => return Ok(sock),
                Err(e) => {
                    log::warn!("couldn't bind port {port}: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse)))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    /// The local transfer identifier, i.e. the bound port.
    pub fn tid(&self) -> u16 {
        self.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Waits up to `ttl` for one datagram and decodes it.
    pub async fn recv_timeout(&self, ttl: Duration) -> Result<Received, SocketError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, origin) = match timeout(ttl, self.sock.recv_from(&mut buf)).await {
            Ok(res) => res?,
            Err(_elapsed) => return Ok(Received::None),
        };

        match packet::decode(&buf[..len]) {
            Ok(Some(packet)) => {
                log::debug!("[{}] <- {} | {}", self.tid(), origin, packet);
                Ok(Received::Packet(packet, origin))
            }
            Ok(None) => Ok(Received::None),
            Err(e) => {
                log::debug!("[{}] <- {} | undecodable: {}", self.tid(), origin, e);
                Ok(Received::Malformed(e, origin))
            }
        }
    }

    /// Encodes and sends one packet.
    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> Result<(), SocketError> {
        let payload = packet.encode()?;
        self.sock.send_to(&payload, dst).await?;
        log::debug!("[{}] -> {} | {}", self.tid(), dst, packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_assigns_tid() {
        let sock = TftpSocket::bind_ephemeral().unwrap();
        let tid = sock.tid();
        assert!(tid >= 1024);
        assert_eq!(sock.local_addr().unwrap().port(), tid);
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses_quietly() {
        let sock = TftpSocket::bind_ephemeral().unwrap();
        match sock.recv_timeout(Duration::from_millis(20)).await.unwrap() {
            Received::None => {}
            other => panic!("expected nothing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_round_trip() {
        let a = TftpSocket::bind_ephemeral().unwrap();
        let b = TftpSocket::bind_ephemeral().unwrap();
        let dst: SocketAddr = (Ipv4Addr::LOCALHOST, b.tid()).into();

        a.send(&Packet::Ack { block: 7 }, dst).await.unwrap();
        match b.recv_timeout(Duration::from_secs(1)).await.unwrap() {
            Received::Packet(Packet::Ack { block: 7 }, origin) => {
                assert_eq!(origin.port(), a.tid());
            }
            other => panic!("unexpected receive: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_reported_not_fatal() {
        let a = TftpSocket::bind_ephemeral().unwrap();
        let b = TftpSocket::bind_ephemeral().unwrap();
        let dst: SocketAddr = (Ipv4Addr::LOCALHOST, b.tid()).into();

        a.sock.send_to(&[0x00, 0x09, 0x00], dst).await.unwrap();
        match b.recv_timeout(Duration::from_secs(1)).await.unwrap() {
            Received::Malformed(DecodeError::BadOpcode(9), origin) => {
                assert_eq!(origin.port(), a.tid());
            }
            other => panic!("unexpected receive: {other:?}"),
        }
    }
}
