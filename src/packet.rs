//! TFTP packet codec.
//!
//! One typed variant per opcode, a fallible `decode` for each wire layout
//! and a total `encode`. The dispatch [`decode`] function is the sole entry
//! point used by the transfer engine: it inspects the opcode and routes to
//! the per-variant parser.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::netascii;

/// Request and OACK packets may never exceed this many bytes (RFC 2347).
pub const MAX_REQUEST_SIZE: usize = 512;

/// Two-byte opcodes as defined in RFC 1350 §5 and RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    fn from_u16(raw: u16) -> Option<Opcode> {
        match raw {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Oack),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Rrq => "RRQ",
            Opcode::Wrq => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
            Opcode::Oack => "OACK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a request asks to read or to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// Transfer format carried in the request's mode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Octet,
    NetAscii,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Octet => "octet",
            Format::NetAscii => "netascii",
        }
    }
}

/// TFTP error codes surfaced by an [`Packet::Error`] packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
    OptionNegotiation = 8,
}

impl ErrorCode {
    fn from_u16(raw: u16) -> Option<ErrorCode> {
        match raw {
            0 => Some(ErrorCode::Undefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTid),
            6 => Some(ErrorCode::FileExists),
            7 => Some(ErrorCode::NoSuchUser),
            8 => Some(ErrorCode::OptionNegotiation),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Undefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "illegal TFTP operation",
            ErrorCode::UnknownTid => "unknown transfer ID",
            ErrorCode::FileExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
            ErrorCode::OptionNegotiation => "option negotiation failed",
        };
        write!(f, "{} ({})", self.code(), name)
    }
}

/// Maps a local file failure to the TFTP error code reported to the peer.
impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
            io::ErrorKind::StorageFull => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read or write request.
    Request {
        kind: RequestKind,
        /// The file path the peer wants to read or write.
        filename: String,
        format: Format,
        /// Proposed options in the order the peer sent them.
        options: Vec<(String, String)>,
    },

    /// A data packet. A payload shorter than the negotiated block size
    /// marks the end of the transfer.
    Data { block: u16, payload: Vec<u8> },

    /// An acknowledgement. Block 0 acknowledges a WRQ (or an OACK).
    Ack { block: u16 },

    /// An error packet; sent once, never acknowledged.
    Error {
        code: ErrorCode,
        message: Option<String>,
    },

    /// An option acknowledgement (RFC 2347) carrying the accepted options.
    OptionAck { options: Vec<(String, String)> },
}

/// Reasons an incoming datagram fails to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode {0}")]
    BadOpcode(u16),
    #[error("packet truncated")]
    Truncated,
    #[error("packet exceeds {MAX_REQUEST_SIZE} bytes")]
    TooLong,
    #[error("unknown transfer mode '{0}'")]
    BadMode(String),
    #[error("duplicate option '{0}'")]
    DuplicateOption(String),
    #[error("option name without a value")]
    TruncatedOption,
    #[error("error code {0} out of range")]
    BadErrorCode(u16),
    #[error("option acknowledgement carries no options")]
    EmptyOack,
}

/// Reasons a packet refuses to serialise.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("encoded packet would exceed {MAX_REQUEST_SIZE} bytes")]
    TooLong,
    #[error("data block numbers start at 1")]
    ZeroBlock,
    #[error("option acknowledgement carries no options")]
    EmptyOack,
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Extracts a null-terminated wire string starting at `at`.
///
/// Returns the decoded string and the index one past the terminating null
/// byte, or `Truncated` if the buffer ends before a null is found.
fn string_from_buffer(buf: &[u8], at: usize) -> Result<(String, usize), DecodeError> {
    let rest = &buf[at..];
    let end = rest
        .iter()
        .position(|&c| c == 0)
        .ok_or(DecodeError::Truncated)?;
    Ok((netascii::from_netascii_string(&rest[..end]), at + end + 1))
}

/// Parses the `name, 0, value, 0` pairs trailing a request or OACK.
fn options_from_buffer(buf: &[u8], mut at: usize) -> Result<Vec<(String, String)>, DecodeError> {
    let mut options = Vec::new();
    while at < buf.len() {
        let (name, after_name) =
            string_from_buffer(buf, at).map_err(|_| DecodeError::TruncatedOption)?;
        if after_name >= buf.len() {
            return Err(DecodeError::TruncatedOption);
        }
        let (value, after_value) =
            string_from_buffer(buf, after_name).map_err(|_| DecodeError::TruncatedOption)?;

        let folded = name.to_lowercase();
        if options
            .iter()
            .any(|(n, _): &(String, String)| n.to_lowercase() == folded)
        {
            return Err(DecodeError::DuplicateOption(folded));
        }
        options.push((name, value));
        at = after_value;
    }
    Ok(options)
}

fn parse_request(buf: &[u8], kind: RequestKind) -> Result<Packet, DecodeError> {
    if buf.len() > MAX_REQUEST_SIZE {
        return Err(DecodeError::TooLong);
    }

    let (filename, after_name) = string_from_buffer(buf, 2)?;
    let (raw_mode, after_mode) = string_from_buffer(buf, after_name)?;

    let format = match raw_mode.to_lowercase().as_str() {
        "octet" => Format::Octet,
        "netascii" => Format::NetAscii,
        _ => return Err(DecodeError::BadMode(raw_mode)),
    };

    let options = options_from_buffer(buf, after_mode)?;
    Ok(Packet::Request {
        kind,
        filename,
        format,
        options,
    })
}

fn parse_data(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(Packet::Data {
        block: u16_from_buffer(&buf[2..4]),
        payload: buf[4..].to_vec(),
    })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(Packet::Ack {
        block: u16_from_buffer(&buf[2..4]),
    })
}

fn parse_error(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Truncated);
    }
    let raw = u16_from_buffer(&buf[2..4]);
    let code = ErrorCode::from_u16(raw).ok_or(DecodeError::BadErrorCode(raw))?;

    // The message runs to the terminating null, or to the end of the
    // datagram when the sender forgot one.
    let rest = &buf[4..];
    let end = rest.iter().position(|&c| c == 0).unwrap_or(rest.len());
    let message = if end == 0 {
        None
    } else {
        Some(netascii::from_netascii_string(&rest[..end]))
    };

    Ok(Packet::Error { code, message })
}

fn parse_oack(buf: &[u8]) -> Result<Packet, DecodeError> {
    if buf.len() > MAX_REQUEST_SIZE {
        return Err(DecodeError::TooLong);
    }
    let options = options_from_buffer(buf, 2)?;
    if options.is_empty() {
        return Err(DecodeError::EmptyOack);
    }
    Ok(Packet::OptionAck { options })
}

/// Decodes one datagram.
///
/// An empty buffer is not a packet and not an error; it decodes to `None`.
pub fn decode(buf: &[u8]) -> Result<Option<Packet>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < 2 {
        return Err(DecodeError::Truncated);
    }

    let raw = u16_from_buffer(&buf[..2]);
    let opcode = Opcode::from_u16(raw).ok_or(DecodeError::BadOpcode(raw))?;
    let packet = match opcode {
        Opcode::Rrq => parse_request(buf, RequestKind::Read)?,
        Opcode::Wrq => parse_request(buf, RequestKind::Write)?,
        Opcode::Data => parse_data(buf)?,
        Opcode::Ack => parse_ack(buf)?,
        Opcode::Error => parse_error(buf)?,
        Opcode::Oack => parse_oack(buf)?,
    };
    Ok(Some(packet))
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&netascii::to_netascii_str(s));
    out.push(0);
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Request {
                kind: RequestKind::Read,
                ..
            } => Opcode::Rrq,
            Packet::Request {
                kind: RequestKind::Write,
                ..
            } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::OptionAck { .. } => Opcode::Oack,
        }
    }

    /// Serialises the packet to wire bytes.
    ///
    /// Request and OACK packets refuse to serialise past the 512-byte
    /// bound; DATA refuses block 0 (the block space is 1-indexed, only
    /// ACK may carry 0).
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
            Packet::Request {
                filename,
                format,
                options,
                ..
            } => {
                push_string(&mut out, filename);
                push_string(&mut out, format.as_str());
                for (name, value) in options {
                    push_string(&mut out, name);
                    push_string(&mut out, value);
                }
                if out.len() > MAX_REQUEST_SIZE {
                    return Err(EncodeError::TooLong);
                }
            }
            Packet::Data { block, payload } => {
                if *block == 0 {
                    return Err(EncodeError::ZeroBlock);
                }
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(payload);
            }
            Packet::Ack { block } => {
                out.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                out.extend_from_slice(&code.code().to_be_bytes());
                if let Some(message) = message {
                    out.extend_from_slice(&netascii::to_netascii_str(message));
                }
                out.push(0);
            }
            Packet::OptionAck { options } => {
                if options.is_empty() {
                    return Err(EncodeError::EmptyOack);
                }
                for (name, value) in options {
                    push_string(&mut out, name);
                    push_string(&mut out, value);
                }
                if out.len() > MAX_REQUEST_SIZE {
                    return Err(EncodeError::TooLong);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Request {
                filename,
                format,
                options,
                ..
            } => write!(
                f,
                "{} {} ({}, {} options)",
                self.opcode(),
                filename,
                format.as_str(),
                options.len()
            ),
            Packet::Data { block, payload } => {
                write!(f, "DATA block {:X} ({} bytes)", block, payload.len())
            }
            Packet::Ack { block } => write!(f, "ACK block {block:X}"),
            Packet::Error { code, message } => match message {
                Some(m) => write!(f, "ERROR {} '{}'", code.code(), m),
                None => write!(f, "ERROR {}", code.code()),
            },
            Packet::OptionAck { options } => write!(f, "OACK ({} options)", options.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_read_request() {
        let buf = b"\x00\x01example.txt\x00octet\x00";
        assert_eq!(
            decode(buf).unwrap(),
            Some(Packet::Request {
                kind: RequestKind::Read,
                filename: "example.txt".to_string(),
                format: Format::Octet,
                options: vec![],
            })
        );
    }

    #[test]
    fn test_decode_write_request_with_options() {
        let buf = b"\x00\x02data.bin\x00NetASCII\x00blksize\x001024\x00tsize\x000\x00";
        assert_eq!(
            decode(buf).unwrap(),
            Some(Packet::Request {
                kind: RequestKind::Write,
                filename: "data.bin".to_string(),
                format: Format::NetAscii,
                options: vec![
                    ("blksize".to_string(), "1024".to_string()),
                    ("tsize".to_string(), "0".to_string()),
                ],
            })
        );
    }

    #[test]
    fn test_decode_request_rejects_duplicate_option() {
        let buf = b"\x00\x01f\x00octet\x00blksize\x008\x00BLKSIZE\x0016\x00";
        assert_eq!(
            decode(buf),
            Err(DecodeError::DuplicateOption("blksize".to_string()))
        );
    }

    #[test]
    fn test_decode_request_rejects_dangling_option_name() {
        let buf = b"\x00\x01f\x00octet\x00blksize\x00";
        assert_eq!(decode(buf), Err(DecodeError::TruncatedOption));
    }

    #[test]
    fn test_decode_request_rejects_unknown_mode() {
        let buf = b"\x00\x01f\x00mail\x00";
        assert_eq!(decode(buf), Err(DecodeError::BadMode("mail".to_string())));
    }

    #[test]
    fn test_decode_request_rejects_oversize() {
        let mut buf = b"\x00\x01".to_vec();
        buf.extend_from_slice(&[b'a'; 520]);
        buf.push(0);
        buf.extend_from_slice(b"octet\x00");
        assert_eq!(decode(&buf), Err(DecodeError::TooLong));
    }

    #[test]
    fn test_decode_data() {
        let buf = b"\x00\x03\x12\x34\xDE\xAD\xBE\xEF";
        assert_eq!(
            decode(buf).unwrap(),
            Some(Packet::Data {
                block: 0x1234,
                payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
            })
        );
    }

    #[test]
    fn test_decode_data_empty_payload() {
        // A zero-byte payload ends a transfer whose size is an exact
        // multiple of the block size.
        let buf = b"\x00\x03\x00\x07";
        assert_eq!(
            decode(buf).unwrap(),
            Some(Packet::Data {
                block: 7,
                payload: vec![],
            })
        );
    }

    #[test]
    fn test_decode_ack() {
        let buf = b"\x00\x04\x10\x2F";
        assert_eq!(decode(buf).unwrap(), Some(Packet::Ack { block: 0x102F }));
    }

    #[test]
    fn test_decode_error() {
        let buf = b"\x00\x05\x00\x04Illegal!\x00";
        assert_eq!(
            decode(buf).unwrap(),
            Some(Packet::Error {
                code: ErrorCode::IllegalOperation,
                message: Some("Illegal!".to_string()),
            })
        );
    }

    #[test]
    fn test_decode_error_without_message() {
        let buf = b"\x00\x05\x00\x01\x00";
        assert_eq!(
            decode(buf).unwrap(),
            Some(Packet::Error {
                code: ErrorCode::FileNotFound,
                message: None,
            })
        );
    }

    #[test]
    fn test_decode_error_rejects_code_out_of_range() {
        let buf = b"\x00\x05\x00\x09nope\x00";
        assert_eq!(decode(buf), Err(DecodeError::BadErrorCode(9)));
    }

    #[test]
    fn test_decode_oack() {
        let buf = b"\x00\x06blksize\x001024\x00";
        assert_eq!(
            decode(buf).unwrap(),
            Some(Packet::OptionAck {
                options: vec![("blksize".to_string(), "1024".to_string())],
            })
        );
    }

    #[test]
    fn test_decode_oack_rejects_empty() {
        assert_eq!(decode(b"\x00\x06"), Err(DecodeError::EmptyOack));
    }

    #[test]
    fn test_decode_empty_is_not_a_packet() {
        assert_eq!(decode(b""), Ok(None));
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(decode(b"\x10"), Err(DecodeError::Truncated));
        assert_eq!(decode(b"\x00\x09"), Err(DecodeError::BadOpcode(9)));
        assert_eq!(decode(b"\x00\x01hi"), Err(DecodeError::Truncated));
        assert_eq!(decode(b"\x00\x01hi\x00"), Err(DecodeError::Truncated));
        assert_eq!(decode(b"\x00\x03\x00"), Err(DecodeError::Truncated));
        assert_eq!(decode(b"\x00\x04\x01"), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let packets = vec![
            Packet::Request {
                kind: RequestKind::Read,
                filename: "dir/file.txt".to_string(),
                format: Format::NetAscii,
                options: vec![
                    ("blksize".to_string(), "8".to_string()),
                    ("timeout".to_string(), "5".to_string()),
                ],
            },
            Packet::Request {
                kind: RequestKind::Write,
                filename: "out.bin".to_string(),
                format: Format::Octet,
                options: vec![],
            },
            Packet::Data {
                block: 1,
                payload: vec![0u8; 512],
            },
            Packet::Data {
                block: 0xFFFF,
                payload: vec![],
            },
            Packet::Ack { block: 0 },
            Packet::Ack { block: 0xFFFF },
            Packet::Error {
                code: ErrorCode::UnknownTid,
                message: Some("Unexpected packet origin".to_string()),
            },
            Packet::Error {
                code: ErrorCode::Undefined,
                message: None,
            },
            Packet::OptionAck {
                options: vec![("tsize".to_string(), "1048576".to_string())],
            },
        ];

        for packet in packets {
            let bytes = packet.encode().unwrap();
            assert_eq!(decode(&bytes).unwrap(), Some(packet));
        }
    }

    #[test]
    fn test_encode_wire_layout() {
        let ack = Packet::Ack { block: 1 }.encode().unwrap();
        assert_eq!(ack, b"\x00\x04\x00\x01");

        let data = Packet::Data {
            block: 1,
            payload: b"abc".to_vec(),
        }
        .encode()
        .unwrap();
        assert_eq!(data, b"\x00\x03\x00\x01abc");

        let rrq = Packet::Request {
            kind: RequestKind::Read,
            filename: "example.txt".to_string(),
            format: Format::Octet,
            options: vec![],
        }
        .encode()
        .unwrap();
        assert_eq!(rrq, b"\x00\x01example.txt\x00octet\x00");
    }

    #[test]
    fn test_encode_refuses_oversize_request() {
        let packet = Packet::Request {
            kind: RequestKind::Read,
            filename: "f".repeat(600),
            format: Format::Octet,
            options: vec![],
        };
        assert_eq!(packet.encode(), Err(EncodeError::TooLong));
    }

    #[test]
    fn test_encode_refuses_data_block_zero() {
        let packet = Packet::Data {
            block: 0,
            payload: vec![],
        };
        assert_eq!(packet.encode(), Err(EncodeError::ZeroBlock));
    }

    #[test]
    fn test_encode_refuses_empty_oack() {
        let packet = Packet::OptionAck { options: vec![] };
        assert_eq!(packet.encode(), Err(EncodeError::EmptyOack));
    }

    #[test]
    fn test_error_code_from_io_kind() {
        assert_eq!(
            ErrorCode::from(io::ErrorKind::NotFound),
            ErrorCode::FileNotFound
        );
        assert_eq!(
            ErrorCode::from(io::ErrorKind::PermissionDenied),
            ErrorCode::AccessViolation
        );
        assert_eq!(
            ErrorCode::from(io::ErrorKind::AlreadyExists),
            ErrorCode::FileExists
        );
        assert_eq!(
            ErrorCode::from(io::ErrorKind::TimedOut),
            ErrorCode::Undefined
        );
    }
}
