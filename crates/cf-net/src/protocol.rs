// protocol.rs - Protocol versions and their two textual forms.
//
// Versions are an ordered integer domain. Peers announce theirs on the wire
// as `CFE_v<N>`; operators pick one in configuration by number or name. The
// two parsers stay separate: the wire form preserves versions
// newer than ours so negotiation can downgrade to the common one, while the
// configuration form only accepts what this build understands.

use std::fmt;

use serde::{Deserialize, Serialize};

const WIRE_PREFIX: &str = "CFE_v";

/// A protocol version number. The default is `UNDEFINED`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
    pub const UNDEFINED: ProtocolVersion = ProtocolVersion(0);
    /// Plaintext protocol.
    pub const CLASSIC: ProtocolVersion = ProtocolVersion(1);
    /// Protocol carried inside TLS.
    pub const TLS: ProtocolVersion = ProtocolVersion(2);
    pub const LATEST: ProtocolVersion = ProtocolVersion::TLS;

    pub fn from_raw(value: u32) -> Self {
        ProtocolVersion(value)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub fn is_undefined(self) -> bool {
        self == Self::UNDEFINED
    }

    /// Known to this build (not newer than `LATEST`).
    pub fn is_known(self) -> bool {
        self <= Self::LATEST
    }

    /// Whether sessions at this version must run over TLS.
    pub fn requires_tls(self) -> bool {
        self >= Self::TLS
    }

    /// `CFE_v<N>`.
    pub fn wire_token(self) -> String {
        format!("{}{}", WIRE_PREFIX, self.0)
    }

    /// The version both sides can speak.
    pub fn negotiate(self, peer: ProtocolVersion) -> ProtocolVersion {
        self.min(peer)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNDEFINED => write!(f, "undefined"),
            Self::CLASSIC => write!(f, "classic"),
            Self::TLS => write!(f, "tls"),
            ProtocolVersion(n) => write!(f, "v{}", n),
        }
    }
}

/// Parse a version announced by a peer.
///
/// Accepts `CFE_v<N>` optionally followed by whitespace and anything else
/// (the announcement line carries program name and version). Anything that
/// does not match, does not fit, or is not positive yields `UNDEFINED`.
/// Versions above `LATEST` are returned unchanged.
pub fn parse_from_wire(token: &str) -> ProtocolVersion {
    let rest = match token.strip_prefix(WIRE_PREFIX) {
        Some(rest) => rest,
        None => return ProtocolVersion::UNDEFINED,
    };
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (digits, tail) = rest.split_at(digits_end);
    if digits.is_empty() || !(tail.is_empty() || tail.starts_with(char::is_whitespace)) {
        return ProtocolVersion::UNDEFINED;
    }
    match digits.parse::<u32>() {
        Ok(n) if n > 0 => ProtocolVersion(n),
        _ => ProtocolVersion::UNDEFINED,
    }
}

/// Parse the `protocol_version` configuration setting.
///
/// Matching is case-sensitive. A missing or unrecognized setting yields
/// `UNDEFINED`, which callers treat as "use the latest".
pub fn parse_from_config(setting: Option<&str>) -> ProtocolVersion {
    match setting {
        Some("0") | Some("undefined") => ProtocolVersion::UNDEFINED,
        Some("1") | Some("classic") => ProtocolVersion::CLASSIC,
        Some("2") | Some("tls") => ProtocolVersion::TLS,
        Some("latest") => ProtocolVersion::LATEST,
        _ => ProtocolVersion::UNDEFINED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(ProtocolVersion::UNDEFINED < ProtocolVersion::CLASSIC);
        assert!(ProtocolVersion::CLASSIC < ProtocolVersion::TLS);
        assert_eq!(ProtocolVersion::LATEST, ProtocolVersion::TLS);
    }

    #[test]
    fn wire_tokens() {
        assert_eq!(parse_from_wire("CFE_v1"), ProtocolVersion::CLASSIC);
        assert_eq!(parse_from_wire("CFE_v2"), ProtocolVersion::TLS);
        assert_eq!(parse_from_wire("CFE_v2 cf-serverd 3.24.0"), ProtocolVersion::TLS);
    }

    #[test]
    fn wire_preserves_newer_versions() {
        let v = parse_from_wire("CFE_v3");
        assert_eq!(v.as_raw(), 3);
        assert!(!v.is_known());
        assert_eq!(v.negotiate(ProtocolVersion::LATEST), ProtocolVersion::TLS);
    }

    #[test]
    fn wire_garbage_is_undefined() {
        for token in [
            "garbage", "", "CFE_v", "CFE_v0", "CFE_v-1", "CFE_vx", "CFE_v2x", "cfe_v2",
            "CFE_v99999999999",
        ] {
            assert_eq!(parse_from_wire(token), ProtocolVersion::UNDEFINED, "{}", token);
        }
    }

    #[test]
    fn config_names_and_numbers() {
        assert_eq!(parse_from_config(Some("tls")), ProtocolVersion::TLS);
        assert_eq!(parse_from_config(Some("2")), ProtocolVersion::TLS);
        assert_eq!(parse_from_config(Some("classic")), ProtocolVersion::CLASSIC);
        assert_eq!(parse_from_config(Some("1")), ProtocolVersion::CLASSIC);
        assert_eq!(parse_from_config(Some("latest")), ProtocolVersion::LATEST);
        assert_eq!(parse_from_config(None), ProtocolVersion::UNDEFINED);
        assert_eq!(parse_from_config(Some("undefined")), ProtocolVersion::UNDEFINED);
        assert_eq!(parse_from_config(Some("0")), ProtocolVersion::UNDEFINED);
    }

    #[test]
    fn config_is_case_sensitive() {
        assert_eq!(parse_from_config(Some("TLS")), ProtocolVersion::UNDEFINED);
        assert_eq!(parse_from_config(Some("3")), ProtocolVersion::UNDEFINED);
    }

    #[test]
    fn display_and_token() {
        assert_eq!(ProtocolVersion::TLS.to_string(), "tls");
        assert_eq!(ProtocolVersion::from_raw(7).to_string(), "v7");
        assert_eq!(ProtocolVersion::CLASSIC.wire_token(), "CFE_v1");
    }
}
