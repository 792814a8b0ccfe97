//! Option negotiation (RFC 2347).
//!
//! Three options are recognised, all case-insensitively: `blksize`
//! (RFC 2348), `timeout` and `tsize` (RFC 2349). Anything else a peer
//! proposes is silently ignored, never errored.

use std::time::Duration;

use thiserror::Error;

/// Smallest negotiable DATA payload size.
pub const BLKSIZE_MIN: u16 = 8;
/// Largest negotiable DATA payload size.
pub const BLKSIZE_MAX: u16 = 65464;
/// Payload size used when `blksize` was not negotiated.
pub const DEFAULT_BLKSIZE: u16 = 512;
/// Per-packet timeout used when `timeout` was not negotiated.
pub const DEFAULT_TIMEOUT_SECS: u8 = 3;

/// The set of option values two endpoints have agreed on (or, on the
/// client side, the set it proposes). `None` means "use the default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options {
    pub blksize: Option<u16>,
    pub timeout: Option<u8>,
    pub tsize: Option<u64>,
}

impl Options {
    pub fn none() -> Options {
        Options::default()
    }

    pub fn is_none(&self) -> bool {
        *self == Options::default()
    }

    /// Effective DATA payload size.
    pub fn block_size(&self) -> usize {
        usize::from(self.blksize.unwrap_or(DEFAULT_BLKSIZE))
    }

    /// Effective per-packet retransmission timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)))
    }

    /// Wire `(name, value)` pairs for a request or OACK.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(blksize) = self.blksize {
            pairs.push(("blksize".to_string(), blksize.to_string()));
        }
        if let Some(timeout) = self.timeout {
            pairs.push(("timeout".to_string(), timeout.to_string()));
        }
        if let Some(tsize) = self.tsize {
            pairs.push(("tsize".to_string(), tsize.to_string()));
        }
        pairs
    }

    /// Strict parse of user-supplied `(name, value)` pairs, for the client
    /// CLI. Unlike [`negotiate`], unknown names and bad values are errors.
    pub fn try_from_pairs(pairs: &[(String, String)]) -> Result<Options, OptionError> {
        let mut options = Options::none();
        for (name, value) in pairs {
            let bad = || OptionError::BadValue {
                name: name.to_lowercase(),
                value: value.clone(),
            };
            match name.to_lowercase().as_str() {
                "blksize" => {
                    let v: u16 = value.parse().map_err(|_| bad())?;
                    if !(BLKSIZE_MIN..=BLKSIZE_MAX).contains(&v) {
                        return Err(bad());
                    }
                    options.blksize = Some(v);
                }
                "timeout" => {
                    let v: u8 = value.parse().map_err(|_| bad())?;
                    if v == 0 {
                        return Err(bad());
                    }
                    options.timeout = Some(v);
                }
                "tsize" => {
                    options.tsize = Some(value.parse().map_err(|_| bad())?);
                }
                _ => return Err(OptionError::Unrequested(name.to_lowercase())),
            }
        }
        Ok(options)
    }
}

/// Why a peer's option set was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    /// The OACK carries an option this side never proposed. Surfaces as an
    /// illegal-operation error, not an option-negotiation one.
    #[error("option '{0}' was never requested")]
    Unrequested(String),
    /// A recognised option carries a value outside its grammar; the one
    /// case that warrants wire error 8.
    #[error("option '{name}' has invalid value '{value}'")]
    BadValue { name: String, value: String },
}

/// Server-side negotiation over a request's proposed options.
///
/// Proposals are visited in the order the client sent them and the accepted
/// list preserves that order; it is echoed verbatim in the OACK. Unknown
/// names and out-of-range values are dropped without comment.
pub fn negotiate(proposed: &[(String, String)]) -> (Options, Vec<(String, String)>) {
    let mut options = Options::none();
    let mut accepted = Vec::new();

    for (name, value) in proposed {
        match name.to_lowercase().as_str() {
            "blksize" => {
                if let Ok(v) = value.parse::<u16>() {
                    if (BLKSIZE_MIN..=BLKSIZE_MAX).contains(&v) {
                        options.blksize = Some(v);
                        accepted.push((name.clone(), value.clone()));
                        continue;
                    }
                }
                log::info!("ignoring out-of-range blksize '{value}'");
            }
            "timeout" => {
                if let Ok(v) = value.parse::<u8>() {
                    if v >= 1 {
                        options.timeout = Some(v);
                        accepted.push((name.clone(), value.clone()));
                        continue;
                    }
                }
                log::info!("ignoring out-of-range timeout '{value}'");
            }
            "tsize" => {
                // Informative only; accepted verbatim.
                if let Ok(v) = value.parse::<u64>() {
                    options.tsize = Some(v);
                    accepted.push((name.clone(), value.clone()));
                } else {
                    log::info!("ignoring malformed tsize '{value}'");
                }
            }
            other => log::info!("ignoring unknown option '{other}'"),
        }
    }

    (options, accepted)
}

/// Client-side check of a server OACK against what was proposed.
///
/// Options proposed but absent from the OACK revert to their defaults; an
/// option the server invented is `Unrequested`; a recognised option whose
/// value violates its grammar is `BadValue`.
pub fn verify_oack(
    proposed: &Options,
    offered: &[(String, String)],
) -> Result<Options, OptionError> {
    let mut agreed = Options::none();

    for (name, value) in offered {
        let folded = name.to_lowercase();
        let bad = || OptionError::BadValue {
            name: folded.clone(),
            value: value.clone(),
        };
        match folded.as_str() {
            "blksize" => {
                if proposed.blksize.is_none() {
                    return Err(OptionError::Unrequested(folded));
                }
                let v: u16 = value.parse().map_err(|_| bad())?;
                if !(BLKSIZE_MIN..=BLKSIZE_MAX).contains(&v) {
                    return Err(bad());
                }
                agreed.blksize = Some(v);
            }
            "timeout" => {
                if proposed.timeout.is_none() {
                    return Err(OptionError::Unrequested(folded));
                }
                let v: u8 = value.parse().map_err(|_| bad())?;
                if v == 0 {
                    return Err(bad());
                }
                agreed.timeout = Some(v);
            }
            "tsize" => {
                if proposed.tsize.is_none() {
                    return Err(OptionError::Unrequested(folded));
                }
                agreed.tsize = Some(value.parse().map_err(|_| bad())?);
            }
            _ => return Err(OptionError::Unrequested(folded)),
        }
    }

    Ok(agreed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_negotiate_accepts_known_options_in_order() {
        let proposed = pairs(&[("tsize", "0"), ("BLKSIZE", "1024"), ("timeout", "5")]);
        let (options, accepted) = negotiate(&proposed);
        assert_eq!(
            options,
            Options {
                blksize: Some(1024),
                timeout: Some(5),
                tsize: Some(0),
            }
        );
        // Client order preserved, names echoed as sent.
        assert_eq!(accepted, proposed);
    }

    #[test]
    fn test_negotiate_silently_drops_unknown_and_out_of_range() {
        let proposed = pairs(&[
            ("windowsize", "4"),
            ("blksize", "7"),
            ("blksize", "65465"),
            ("timeout", "0"),
            ("timeout", "256"),
            ("tsize", "x"),
        ]);
        let (options, accepted) = negotiate(&proposed);
        assert_eq!(options, Options::none());
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_negotiate_blksize_bounds() {
        let (low, _) = negotiate(&pairs(&[("blksize", "8")]));
        assert_eq!(low.blksize, Some(8));
        let (high, _) = negotiate(&pairs(&[("blksize", "65464")]));
        assert_eq!(high.blksize, Some(65464));
    }

    #[test]
    fn test_effective_defaults() {
        let options = Options::none();
        assert_eq!(options.block_size(), 512);
        assert_eq!(options.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_verify_oack_reverts_absent_options_to_defaults() {
        let proposed = Options {
            blksize: Some(1024),
            timeout: Some(5),
            tsize: None,
        };
        // Server accepted only blksize.
        let agreed = verify_oack(&proposed, &pairs(&[("blksize", "1024")])).unwrap();
        assert_eq!(agreed.blksize, Some(1024));
        assert_eq!(agreed.timeout, None);
        assert_eq!(agreed.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_verify_oack_accepts_reduced_blksize() {
        let proposed = Options {
            blksize: Some(4096),
            ..Options::none()
        };
        let agreed = verify_oack(&proposed, &pairs(&[("blksize", "512")])).unwrap();
        assert_eq!(agreed.blksize, Some(512));
    }

    #[test]
    fn test_verify_oack_rejects_unrequested_option() {
        let proposed = Options {
            blksize: Some(1024),
            ..Options::none()
        };
        assert_eq!(
            verify_oack(&proposed, &pairs(&[("timeout", "5")])),
            Err(OptionError::Unrequested("timeout".to_string()))
        );
        assert_eq!(
            verify_oack(&proposed, &pairs(&[("windowsize", "4")])),
            Err(OptionError::Unrequested("windowsize".to_string()))
        );
    }

    #[test]
    fn test_verify_oack_rejects_value_outside_grammar() {
        let proposed = Options {
            blksize: Some(1024),
            ..Options::none()
        };
        assert_eq!(
            verify_oack(&proposed, &pairs(&[("blksize", "70000")])),
            Err(OptionError::BadValue {
                name: "blksize".to_string(),
                value: "70000".to_string(),
            })
        );
    }

    #[test]
    fn test_try_from_pairs_strict() {
        let options = Options::try_from_pairs(&pairs(&[("blksize", "2048")])).unwrap();
        assert_eq!(options.blksize, Some(2048));
        assert!(Options::try_from_pairs(&pairs(&[("blksize", "4")])).is_err());
        assert!(Options::try_from_pairs(&pairs(&[("windowsize", "4")])).is_err());
    }

    #[test]
    fn test_to_pairs_round_trip() {
        let options = Options {
            blksize: Some(1432),
            timeout: Some(1),
            tsize: Some(0),
        };
        assert_eq!(
            options.to_pairs(),
            pairs(&[("blksize", "1432"), ("timeout", "1"), ("tsize", "0")])
        );
    }
}
