//! An implementation of the Trivial File Transfer Protocol.
//!
//! Covers RFC 1350 with the option-negotiation extension of RFC 2347
//! (`blksize`, `timeout` and `tsize`) and NetASCII encoding per RFC 764.
//!
//! A transfer starts with a read or write request sent to the service port
//! (69). Each side then binds an ephemeral port, its transfer identifier,
//! and the file moves in lock-step DATA/ACK rounds of at most one block,
//! 512 bytes unless a larger `blksize` was negotiated. A DATA payload
//! shorter than the block size ends the transfer. Errors are signalled with
//! a single unacknowledged ERROR packet; everything else is recovered by
//! retransmission on timeout. The only error a transfer survives is a
//! packet arriving from the wrong transfer identifier, which is answered
//! with error 5 and otherwise ignored.
//!
//! The crate splits into:
//! - [`netascii`]: the line-ending transform applied in `netascii` mode
//! - [`packet`]: typed packets with encode/decode for each wire layout
//! - [`options`]: RFC 2347 negotiation
//! - [`socket`]: a non-blocking UDP socket speaking decoded packets
//! - [`transfer`]: the per-connection engine driving one exchange
//! - [`client`]: the single-shot client driver
//! - [`server`]: the multiplexer serving many transfers on one thread

pub mod client;
pub mod netascii;
pub mod options;
pub mod packet;
pub mod server;
pub mod socket;
pub mod transfer;

pub use client::{ClientConfig, ClientError};
pub use options::Options;
pub use packet::{ErrorCode, Format, Packet};
pub use server::{Server, ServerError, DEFAULT_PORT};
pub use transfer::{State, Transfer};
