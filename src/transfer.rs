//! The per-transfer connection engine.
//!
//! One [`Transfer`] drives a single RRQ/WRQ exchange from request to a
//! terminal state. It owns its UDP socket (whose port is the local TID) and
//! its file handle exclusively. The two sides of the handshake differ only
//! in how the request phase plays out and where upload payload bytes come
//! from, so those two concerns live behind the [`Endpoint`] strategy trait
//! with a server and a client implementation.
//!
//! The engine is advanced by `step()`; each step runs exactly one state
//! handler. `run()` loops `step()` until the transfer completes or errors.
//! Every receive is bounded, so a stepping caller observes shutdown and
//! retransmission deadlines promptly.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::netascii;
use crate::options::{self, OptionError, Options};
use crate::packet::{DecodeError, ErrorCode, Format, Packet, RequestKind};
use crate::socket::{Received, SocketError, TftpSocket};

/// Total send attempts for one packet: the original plus three retransmits.
pub const MAX_RETRIES: u32 = 4;

/// Ceiling on any single receive wait, independent of the TFTP timer.
pub const RECV_CEILING: Duration = Duration::from_secs(4);

/// Connection state. A transfer enters `Completed` or `Errored` exactly
/// once and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Requesting,
    Uploading,
    Downloading,
    Awaiting,
    Errored,
    Completed,
}

/// Which way payload bytes flow, independent of who initiated: a server
/// answering an RRQ is uploading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Everything that can terminate a transfer abnormally.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed bytes from the established peer.
    #[error("malformed packet: {0}")]
    Decode(#[from] DecodeError),
    /// A well-formed packet in the wrong state or with the wrong block.
    #[error("{0}")]
    Protocol(String),
    /// Local file failure; the wire code depends on the I/O error kind.
    #[error("file error: {0}")]
    File(#[from] io::Error),
    /// The peer's OACK does not match what was proposed.
    #[error("option negotiation: {0}")]
    Options(#[from] OptionError),
    /// The file outgrew the 16-bit block space.
    #[error("file too big")]
    TooBig,
    /// All retransmission attempts exhausted.
    #[error("retransmission timeout")]
    Timeout,
    /// The process-wide shutdown flag was observed.
    #[error("terminated by user")]
    Shutdown,
    /// The peer sent an ERROR packet; nothing is sent back.
    #[error("peer errored with code {0}")]
    Peer(ErrorCode),
    /// The transfer socket itself failed.
    #[error("{0}")]
    Socket(#[from] SocketError),
}

impl TransferError {
    /// The ERROR packet owed to the peer for this fault, if any.
    fn wire(&self) -> Option<(ErrorCode, String)> {
        match self {
            TransferError::Decode(e) => Some((ErrorCode::IllegalOperation, e.to_string())),
            TransferError::Protocol(msg) => Some((ErrorCode::IllegalOperation, msg.clone())),
            TransferError::File(e) => Some((ErrorCode::from(e.kind()), e.to_string())),
            TransferError::Options(OptionError::Unrequested(name)) => Some((
                ErrorCode::IllegalOperation,
                format!("option '{name}' was never requested"),
            )),
            TransferError::Options(e) => Some((ErrorCode::OptionNegotiation, e.to_string())),
            TransferError::TooBig => Some((ErrorCode::Undefined, "file too big".to_string())),
            TransferError::Timeout => Some((
                ErrorCode::Undefined,
                "retransmission timeout".to_string(),
            )),
            TransferError::Shutdown => {
                Some((ErrorCode::Undefined, "terminated by user".to_string()))
            }
            TransferError::Peer(_) | TransferError::Socket(_) => None,
        }
    }
}

/// Side-specific behaviour of a transfer: how the request phase is carried
/// out, and where raw upload bytes come from.
#[allow(async_fn_in_trait)]
pub trait Endpoint {
    /// Runs the request phase once: open or create files, send or accept
    /// the initial request, pick the next state. Re-entered verbatim when
    /// a request-phase send times out, so it must be idempotent.
    async fn handle_request(&mut self, core: &mut Core) -> Result<(), TransferError>;

    /// Reads raw (pre-NetASCII) upload bytes. `Ok(0)` means end of stream.
    async fn read_source(&mut self, core: &mut Core, buf: &mut [u8]) -> io::Result<usize>;
}

/// Engine state shared by both sides.
pub struct Core {
    sock: TftpSocket,
    peer: SocketAddr,
    /// The peer address is pinned (server side: the requester already
    /// knows our TID) rather than latched from the first reply.
    addr_static: bool,
    peer_latched: bool,
    direction: Direction,
    state: State,
    prev_state: State,
    block_n: u16,
    is_last: bool,
    /// Last NetASCII byte written to the local file was CR.
    cr_end: bool,
    send_tries: u32,
    last_sent_at: Instant,
    format: Format,
    blksize: usize,
    timeout: Duration,
    /// Server: an OACK (with `accepted`) opens the exchange.
    oack_init: bool,
    /// Client: the reply to our request may legitimately be an OACK.
    oack_expect: bool,
    accepted: Vec<(String, String)>,
    proposed: Options,
    file: Option<File>,
    file_path: Option<PathBuf>,
    file_created: bool,
    /// Payload of the DATA block currently in flight, kept for retransmit.
    pending: Option<Vec<u8>>,
    /// Payload accepted by await-download, consumed by the download handler.
    rx_data: Option<Vec<u8>>,
    /// NetASCII-encoded upload bytes not yet emitted.
    outbuf: Vec<u8>,
    /// A chunk-final CR withheld from encoding until its follower is known.
    carry_cr: bool,
    src_eof: bool,
    error: Option<TransferError>,
    shutdown: Weak<AtomicBool>,
}

impl Core {
    fn new(
        sock: TftpSocket,
        peer: SocketAddr,
        direction: Direction,
        format: Format,
        addr_static: bool,
        shutdown: Weak<AtomicBool>,
    ) -> Core {
        Core {
            sock,
            peer,
            addr_static,
            peer_latched: addr_static,
            direction,
            state: State::Requesting,
            prev_state: State::Idle,
            block_n: 0,
            is_last: false,
            cr_end: false,
            send_tries: 0,
            last_sent_at: Instant::now(),
            format,
            blksize: Options::none().block_size(),
            timeout: Options::none().timeout(),
            oack_init: false,
            oack_expect: false,
            accepted: Vec::new(),
            proposed: Options::none(),
            file: None,
            file_path: None,
            file_created: false,
            pending: None,
            rx_data: None,
            outbuf: Vec::new(),
            carry_cr: false,
            src_eof: false,
            error: None,
            shutdown,
        }
    }

    pub fn tid(&self) -> u16 {
        self.sock.tid()
    }

    fn set_state(&mut self, new_state: State) {
        self.prev_state = self.state;
        self.state = new_state;
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .upgrade()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    async fn send_now(&mut self, packet: &Packet) -> Result<(), TransferError> {
        self.sock.send(packet, self.peer).await?;
        self.last_sent_at = Instant::now();
        Ok(())
    }

    /// Logs the fault, sends the owed ERROR packet once (a courtesy, never
    /// retransmitted or acknowledged) and enters the terminal state.
    async fn fail(&mut self, err: TransferError) {
        log::error!("[{}] {}", self.tid(), err);
        if let Some((code, message)) = err.wire() {
            let _ = self
                .sock
                .send(
                    &Packet::Error {
                        code,
                        message: Some(message),
                    },
                    self.peer,
                )
                .await;
            self.last_sent_at = Instant::now();
        }
        self.error = Some(err);
        self.set_state(State::Errored);
    }

    /// Checks the retransmission deadline. Returns `true` when the state
    /// was rolled back for a retransmit; errs when attempts are exhausted.
    fn check_timeout(&mut self) -> Result<bool, TransferError> {
        if self.last_sent_at.elapsed() <= self.timeout {
            return Ok(false);
        }
        if self.send_tries + 1 >= MAX_RETRIES {
            return Err(TransferError::Timeout);
        }
        self.send_tries += 1;
        log::info!(
            "[{}] retransmitting block {:X} (attempt {})",
            self.tid(),
            self.block_n,
            self.send_tries + 1
        );
        // Roll straight back without pushing: the retried state must keep
        // restarting from the same predecessor.
        self.state = self.prev_state;
        Ok(true)
    }

    /// Receives one packet destined for this transfer, or nothing.
    ///
    /// Packets from any other origin get an ERROR 5 reply addressed to the
    /// origin and leave the transfer untouched, except that the very first
    /// reply of a client-initiated exchange latches the peer's fresh TID.
    async fn recv_one(&mut self) -> Result<Option<Packet>, TransferError> {
        let remaining = self.timeout.saturating_sub(self.last_sent_at.elapsed());
        let ttl = remaining.min(RECV_CEILING);
        if ttl.is_zero() {
            return Ok(None);
        }

        match self.sock.recv_timeout(ttl).await? {
            Received::None => Ok(None),
            Received::Packet(packet, origin) => {
                if self.accept_origin(origin).await {
                    Ok(Some(packet))
                } else {
                    Ok(None)
                }
            }
            Received::Malformed(e, origin) => {
                if origin == self.peer || !self.peer_latched {
                    Err(TransferError::Decode(e))
                } else {
                    self.reject_origin(origin).await;
                    Ok(None)
                }
            }
        }
    }

    async fn accept_origin(&mut self, origin: SocketAddr) -> bool {
        if origin == self.peer {
            self.peer_latched = true;
            return true;
        }
        if !self.peer_latched && !self.addr_static {
            log::info!("[{}] peer TID latched to {}", self.tid(), origin);
            self.peer = origin;
            self.peer_latched = true;
            return true;
        }
        self.reject_origin(origin).await;
        false
    }

    async fn reject_origin(&mut self, origin: SocketAddr) {
        log::info!("[{}] packet from unexpected origin {}", self.tid(), origin);
        let _ = self
            .sock
            .send(
                &Packet::Error {
                    code: ErrorCode::UnknownTid,
                    message: Some("Unexpected packet origin".to_string()),
                },
                origin,
            )
            .await;
    }

    /// Applies a verified OACK to the effective transfer parameters.
    fn apply_oack(&mut self, offered: &[(String, String)]) -> Result<(), TransferError> {
        let agreed = options::verify_oack(&self.proposed, offered)?;
        self.blksize = agreed.block_size();
        self.timeout = agreed.timeout();
        log::info!(
            "[{}] options agreed: blksize {}, timeout {:?}",
            self.tid(),
            self.blksize,
            self.timeout
        );
        Ok(())
    }

    /// Produces the next DATA payload: up to `blksize` bytes, NetASCII
    /// encoded when the transfer format asks for it.
    async fn next_payload<E: Endpoint>(
        &mut self,
        endpoint: &mut E,
    ) -> Result<Vec<u8>, TransferError> {
        match self.format {
            Format::Octet => {
                let mut buf = vec![0u8; self.blksize];
                let mut filled = 0;
                // A single read may come back short of a full block without
                // being at end of stream; keep filling.
                while filled < buf.len() {
                    let n = endpoint.read_source(&mut *self, &mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            Format::NetAscii => {
                while self.outbuf.len() < self.blksize && !self.src_eof {
                    let mut raw = vec![0u8; self.blksize];
                    let n = endpoint.read_source(&mut *self, &mut raw).await?;
                    if n == 0 {
                        self.src_eof = true;
                        if self.carry_cr {
                            // Nothing follows the withheld CR; it encodes
                            // as a literal.
                            self.outbuf.extend_from_slice(b"\r\0");
                            self.carry_cr = false;
                        }
                        break;
                    }
                    raw.truncate(n);

                    let mut chunk = Vec::with_capacity(n + 1);
                    if self.carry_cr {
                        chunk.push(b'\r');
                        self.carry_cr = false;
                    }
                    chunk.extend_from_slice(&raw);
                    // Whether a chunk-final CR encodes as CR LF or CR NUL
                    // depends on the byte after it; hold it back.
                    if chunk.last() == Some(&b'\r') {
                        chunk.pop();
                        self.carry_cr = true;
                    }
                    self.outbuf.extend(netascii::to_netascii(&chunk));
                }
                let take = self.outbuf.len().min(self.blksize);
                Ok(self.outbuf.drain(..take).collect())
            }
        }
    }

    /// Uploading state: send the OACK (first round with accepted options)
    /// or the current DATA block, then await acknowledgement.
    async fn handle_upload<E: Endpoint>(&mut self, endpoint: &mut E) -> Result<(), TransferError> {
        if self.block_n == 0 && self.oack_init {
            log::info!("[{}] sending OACK", self.tid());
            let oack = Packet::OptionAck {
                options: self.accepted.clone(),
            };
            self.send_now(&oack).await?;
            self.set_state(State::Awaiting);
            return Ok(());
        }

        // No OACK round means no ACK 0 either; blocks start at 1.
        if self.block_n == 0 {
            self.block_n = 1;
        }

        if self.pending.is_none() {
            let payload = self.next_payload(endpoint).await?;
            self.is_last = payload.len() < self.blksize;
            self.pending = Some(payload);
        }
        let payload = self.pending.clone().unwrap_or_default();

        log::info!(
            "[{}] sending DATA block {:X} ({} bytes)",
            self.tid(),
            self.block_n,
            payload.len()
        );
        let data = Packet::Data {
            block: self.block_n,
            payload,
        };
        self.send_now(&data).await?;
        self.set_state(State::Awaiting);
        Ok(())
    }

    /// Accepts an ACK for the block in flight and moves the upload along.
    fn advance_upload(&mut self) -> Result<(), TransferError> {
        self.send_tries = 0;
        if self.is_last {
            log::info!("[{}] upload complete", self.tid());
            self.set_state(State::Completed);
            return Ok(());
        }
        self.pending = None;
        self.block_n = self.block_n.checked_add(1).ok_or(TransferError::TooBig)?;
        self.set_state(State::Uploading);
        Ok(())
    }

    /// Awaiting state, upload direction: wait for the ACK of the block in
    /// flight (or the OACK answering our request).
    async fn handle_await_upload(&mut self) -> Result<(), TransferError> {
        if self.check_timeout()? {
            return Ok(());
        }
        let Some(packet) = self.recv_one().await? else {
            return Ok(());
        };

        match packet {
            Packet::Error { code, message } => {
                if let Some(message) = message {
                    log::error!("[{}] peer error: '{message}'", self.tid());
                }
                Err(TransferError::Peer(code))
            }
            Packet::OptionAck { options } => {
                if !self.oack_expect {
                    log::info!("[{}] unexpected OACK, ignoring", self.tid());
                    return Ok(());
                }
                self.oack_expect = false;
                self.apply_oack(&options)?;
                // Proceed exactly as if ACK 0 had arrived.
                self.advance_upload()
            }
            Packet::Ack { block } => {
                self.oack_expect = false;
                if block < self.block_n {
                    log::info!("[{}] stray ACK for block {block:X}, ignoring", self.tid());
                    return Ok(());
                }
                if block > self.block_n {
                    return Err(TransferError::Protocol(format!(
                        "received ACK for future block {block:X}, current is {:X}",
                        self.block_n
                    )));
                }
                self.advance_upload()
            }
            other => Err(TransferError::Protocol(format!(
                "expected an ACK packet, got {}",
                other.opcode()
            ))),
        }
    }

    /// Awaiting state, download direction: wait for the next DATA block
    /// (or the OACK answering our request).
    async fn handle_await_download(&mut self) -> Result<(), TransferError> {
        if self.check_timeout()? {
            return Ok(());
        }
        let Some(packet) = self.recv_one().await? else {
            return Ok(());
        };

        match packet {
            Packet::Error { code, message } => {
                if let Some(message) = message {
                    log::error!("[{}] peer error: '{message}'", self.tid());
                }
                Err(TransferError::Peer(code))
            }
            Packet::OptionAck { options } => {
                if !self.oack_expect {
                    log::info!("[{}] unexpected OACK, ignoring", self.tid());
                    return Ok(());
                }
                self.oack_expect = false;
                self.apply_oack(&options)?;
                self.send_tries = 0;
                // Block 0 with nothing buffered: the download handler
                // acknowledges the OACK with ACK 0.
                self.set_state(State::Downloading);
                Ok(())
            }
            Packet::Data { block, payload } => {
                self.oack_expect = false;
                let expected = u32::from(self.block_n) + 1;
                if u32::from(block) < expected {
                    log::info!("[{}] stray DATA block {block:X}, ignoring", self.tid());
                    return Ok(());
                }
                if u32::from(block) > expected {
                    return Err(TransferError::Protocol(format!(
                        "received DATA for future block {block:X}, expected {expected:X}"
                    )));
                }
                self.block_n = self.block_n.checked_add(1).ok_or(TransferError::TooBig)?;
                self.send_tries = 0;
                self.rx_data = Some(payload);
                self.set_state(State::Downloading);
                Ok(())
            }
            other => Err(TransferError::Protocol(format!(
                "expected a DATA packet, got {}",
                other.opcode()
            ))),
        }
    }

    /// Downloading state: write the buffered block and acknowledge it; or,
    /// with nothing buffered, (re)send the opening OACK or current ACK.
    async fn handle_download(&mut self) -> Result<(), TransferError> {
        if self.block_n == 0 && self.oack_init {
            log::info!("[{}] sending OACK", self.tid());
            let oack = Packet::OptionAck {
                options: self.accepted.clone(),
            };
            self.send_now(&oack).await?;
            self.set_state(State::Awaiting);
            return Ok(());
        }

        let Some(payload) = self.rx_data.take() else {
            // ACK 0 accepting a write request, the ACK answering an OACK,
            // or a retransmission of the last ACK after a timeout.
            log::info!("[{}] sending ACK for block {:X}", self.tid(), self.block_n);
            let ack = Packet::Ack {
                block: self.block_n,
            };
            self.send_now(&ack).await?;
            self.set_state(State::Awaiting);
            return Ok(());
        };

        let wire_len = payload.len();
        let wire_ends_cr = payload.last() == Some(&b'\r');
        let mut data = payload;

        if self.format == Format::NetAscii && !data.is_empty() {
            if self.cr_end && data[0] == b'\n' {
                // CR | LF split across blocks: the CR already on disk was
                // really the head of a line break.
                self.truncate_trailing_cr().await?;
            } else if self.cr_end && data[0] == b'\0' {
                // CR | NUL split: the CR already on disk stands for itself.
                data.remove(0);
            }
            data = netascii::from_netascii(&data);
            self.cr_end = wire_ends_cr;
        }

        log::info!(
            "[{}] received block {:X} ({} bytes)",
            self.tid(),
            self.block_n,
            wire_len
        );

        if let Some(file) = self.file.as_mut() {
            file.write_all(&data).await.map_err(|e| {
                TransferError::File(io::Error::new(io::ErrorKind::PermissionDenied, e))
            })?;
        }

        log::info!("[{}] sending ACK for block {:X}", self.tid(), self.block_n);
        let ack = Packet::Ack {
            block: self.block_n,
        };
        self.send_now(&ack).await?;

        if wire_len < self.blksize {
            if let Some(file) = self.file.as_mut() {
                file.flush().await?;
            }
            log::info!("[{}] download complete", self.tid());
            self.set_state(State::Completed);
            return Ok(());
        }
        if self.block_n == u16::MAX {
            // The next block could not be numbered.
            return Err(TransferError::TooBig);
        }
        self.set_state(State::Awaiting);
        Ok(())
    }

    /// Removes the CR previously written when the next block reveals it
    /// was the head of a split CR LF pair.
    async fn truncate_trailing_cr(&mut self) -> Result<(), TransferError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        // Writes are buffered; the length is only trustworthy after a flush.
        file.flush().await?;
        let len = file.metadata().await?.len();
        if len > 0 {
            file.set_len(len - 1).await.map_err(|e| {
                TransferError::File(io::Error::new(io::ErrorKind::PermissionDenied, e))
            })?;
            file.seek(io::SeekFrom::End(0)).await?;
        }
        Ok(())
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        // A partial file created by a transfer that errored is not left
        // behind.
        if self.state == State::Errored && self.file_created {
            if let Some(path) = &self.file_path {
                if std::fs::remove_file(path).is_ok() {
                    log::info!("[{}] removed partial file {}", self.tid(), path.display());
                }
            }
        }
        log::info!("[{}] closed connection", self.tid());
    }
}

/// The connection engine for one transfer.
pub struct Transfer<E: Endpoint> {
    core: Core,
    endpoint: E,
}

impl<E: Endpoint> Transfer<E> {
    pub fn state(&self) -> State {
        self.core.state
    }

    pub fn is_running(&self) -> bool {
        self.core.state != State::Completed && self.core.state != State::Errored
    }

    pub fn is_errored(&self) -> bool {
        self.core.state == State::Errored
    }

    /// The fault that terminated the transfer, when it errored locally.
    pub fn error(&self) -> Option<&TransferError> {
        self.core.error.as_ref()
    }

    /// Takes ownership of the terminating fault for reporting.
    pub fn take_error(&mut self) -> Option<TransferError> {
        self.core.error.take()
    }

    /// The local transfer identifier (the ephemeral port this side bound).
    pub fn tid(&self) -> u16 {
        self.core.tid()
    }

    /// Advances the state machine by one unit of work.
    pub async fn step(&mut self) {
        if !self.is_running() {
            return;
        }
        if self.core.shutdown_requested() {
            self.core.fail(TransferError::Shutdown).await;
            return;
        }

        let result = match self.core.state {
            State::Idle | State::Requesting => {
                self.core.set_state(State::Requesting);
                self.endpoint.handle_request(&mut self.core).await
            }
            State::Uploading => self.core.handle_upload(&mut self.endpoint).await,
            State::Downloading => self.core.handle_download().await,
            State::Awaiting => match self.core.direction {
                Direction::Upload => self.core.handle_await_upload().await,
                Direction::Download => self.core.handle_await_download().await,
            },
            State::Completed | State::Errored => return,
        };

        if let Err(e) = result {
            self.core.fail(e).await;
        }
    }

    /// Loops `step()` until the transfer reaches a terminal state.
    pub async fn run(&mut self) {
        while self.is_running() {
            self.step().await;
        }
    }
}

/// Server side of a transfer: answers a decoded RRQ or WRQ under a root
/// directory.
pub struct ServerEndpoint {
    root: PathBuf,
    kind: RequestKind,
    filename: String,
    options: Vec<(String, String)>,
}

impl Endpoint for ServerEndpoint {
    async fn handle_request(&mut self, core: &mut Core) -> Result<(), TransferError> {
        let (agreed, accepted) = options::negotiate(&self.options);
        core.blksize = agreed.block_size();
        core.timeout = agreed.timeout();
        core.oack_init = !accepted.is_empty();
        core.accepted = accepted;

        // An absolute request path is interpreted relative to the root.
        let path = self.root.join(self.filename.trim_start_matches('/'));

        match self.kind {
            RequestKind::Read => {
                log::info!("[{}] read request for {}", core.tid(), path.display());
                let file = File::open(&path).await?;
                let meta = file.metadata().await?;
                if meta.len() > core.blksize as u64 * u64::from(u16::MAX) - 1 {
                    return Err(TransferError::TooBig);
                }
                core.file = Some(file);
                core.file_path = Some(path);
                core.set_state(State::Uploading);
            }
            RequestKind::Write => {
                log::info!("[{}] write request for {}", core.tid(), path.display());
                if core.file.is_none() {
                    let file = OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o644)
                        .open(&path)
                        .await?;
                    core.file = Some(file);
                    core.file_path = Some(path);
                    core.file_created = true;
                }
                core.set_state(State::Downloading);
            }
        }
        Ok(())
    }

    async fn read_source(&mut self, core: &mut Core, buf: &mut [u8]) -> io::Result<usize> {
        match core.file.as_mut() {
            Some(file) => file.read(buf).await,
            None => Ok(0),
        }
    }
}

/// Client side of a transfer: composes and sends the initial request; an
/// upload draws its payload from `source` (standard input in the CLI).
pub struct ClientEndpoint<R> {
    request: Packet,
    source: Option<R>,
}

impl<R: AsyncRead + Unpin> Endpoint for ClientEndpoint<R> {
    async fn handle_request(&mut self, core: &mut Core) -> Result<(), TransferError> {
        log::info!("[{}] sending {}", core.tid(), self.request);
        core.send_now(&self.request).await?;
        core.oack_expect = !core.proposed.is_none();
        core.set_state(State::Awaiting);
        Ok(())
    }

    async fn read_source(&mut self, _core: &mut Core, buf: &mut [u8]) -> io::Result<usize> {
        match self.source.as_mut() {
            Some(source) => source.read(buf).await,
            None => Ok(0),
        }
    }
}

impl Transfer<ServerEndpoint> {
    /// Builds the engine answering a decoded request, bound to a fresh
    /// ephemeral socket. The requester sent to the service port and will
    /// learn this TID from our first reply, so the peer address is pinned.
    pub fn answer(
        kind: RequestKind,
        filename: String,
        format: Format,
        request_options: Vec<(String, String)>,
        origin: SocketAddr,
        root: PathBuf,
        shutdown: Weak<AtomicBool>,
    ) -> io::Result<Transfer<ServerEndpoint>> {
        let sock = TftpSocket::bind_ephemeral()?;
        log::info!("[{}] new connection from {}", sock.tid(), origin);
        let direction = match kind {
            RequestKind::Read => Direction::Upload,
            RequestKind::Write => Direction::Download,
        };
        Ok(Transfer {
            core: Core::new(sock, origin, direction, format, true, shutdown),
            endpoint: ServerEndpoint {
                root,
                kind,
                filename,
                options: request_options,
            },
        })
    }
}

#[cfg(test)]
impl<E: Endpoint> Transfer<E> {
    /// Shrinks the retransmission timer so lost-packet tests run quickly.
    fn set_packet_timeout(&mut self, timeout: Duration) {
        self.core.timeout = timeout;
    }
}

impl<R: AsyncRead + Unpin> Transfer<ClientEndpoint<R>> {
    /// Builds the engine initiating a write: payload is drawn from
    /// `source` and sent to `server` under the name `remote`.
    pub fn initiate_upload(
        server: SocketAddr,
        remote: String,
        format: Format,
        proposed: Options,
        source: R,
        shutdown: Weak<AtomicBool>,
    ) -> io::Result<Transfer<ClientEndpoint<R>>> {
        let sock = TftpSocket::bind_ephemeral()?;
        let mut core = Core::new(sock, server, Direction::Upload, format, false, shutdown);
        core.proposed = proposed;
        Ok(Transfer {
            core,
            endpoint: ClientEndpoint {
                request: Packet::Request {
                    kind: RequestKind::Write,
                    filename: remote,
                    format,
                    options: proposed.to_pairs(),
                },
                source: Some(source),
            },
        })
    }

    /// Builds the engine initiating a read of `remote` into an already
    /// created destination file (the driver opened it with fail-if-exists
    /// semantics, so an errored transfer can unlink it on drop).
    pub fn initiate_download(
        server: SocketAddr,
        remote: String,
        format: Format,
        proposed: Options,
        dest: File,
        dest_path: PathBuf,
        shutdown: Weak<AtomicBool>,
    ) -> io::Result<Transfer<ClientEndpoint<R>>> {
        let sock = TftpSocket::bind_ephemeral()?;
        let mut core = Core::new(sock, server, Direction::Download, format, false, shutdown);
        core.proposed = proposed;
        core.file = Some(dest);
        core.file_path = Some(dest_path);
        core.file_created = true;
        Ok(Transfer {
            core,
            endpoint: ClientEndpoint {
                request: Packet::Request {
                    kind: RequestKind::Read,
                    filename: remote,
                    format,
                    options: proposed.to_pairs(),
                },
                source: None,
            },
        })
    }
}
