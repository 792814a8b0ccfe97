//! NetASCII (RFC 764) byte-stream transforms.
//!
//! On the wire every LF is carried as CR LF and every literal CR as CR NUL,
//! so a bare CR never appears in well-formed NetASCII. Both transforms here
//! are buffer-local; a CR LF or CR NUL pair split across two DATA blocks is
//! reconciled by the transfer engine, not here.

/// Converts plain bytes to NetASCII.
///
/// LF becomes CR LF; a CR not immediately followed by LF becomes CR NUL;
/// an existing CR LF pair passes through unchanged (it is already a wire
/// line break, so a round trip normalises it to a bare LF). The output
/// carries no terminating NUL.
pub fn to_netascii(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\n' => {
                out.push(b'\r');
                out.push(b'\n');
            }
            b'\r' => {
                if data.get(i + 1) == Some(&b'\n') {
                    out.push(b'\r');
                    out.push(b'\n');
                    i += 1;
                } else {
                    out.push(b'\r');
                    out.push(b'\0');
                }
            }
            c => out.push(c),
        }
        i += 1;
    }
    out
}

/// Converts NetASCII bytes back to plain bytes.
///
/// CR LF becomes LF and CR NUL becomes CR. A lone CR at the end of the
/// buffer (its partner byte lives in the next block) is kept as-is.
pub fn from_netascii(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' => match data.get(i + 1) {
                Some(&b'\n') => {
                    out.push(b'\n');
                    i += 1;
                }
                Some(&b'\0') => {
                    out.push(b'\r');
                    i += 1;
                }
                _ => out.push(b'\r'),
            },
            c => out.push(c),
        }
        i += 1;
    }
    out
}

/// Encodes a wire string (filename, mode, option name or value).
pub fn to_netascii_str(s: &str) -> Vec<u8> {
    to_netascii(s.as_bytes())
}

/// Decodes a wire string. Bytes that do not form valid UTF-8 after the
/// NetASCII transform are replaced, never rejected.
pub fn from_netascii_string(data: &[u8]) -> String {
    String::from_utf8_lossy(&from_netascii(data)).into_owned()
}
