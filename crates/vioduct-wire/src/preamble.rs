//! The connect preamble: payload of the first frame on a fresh stream.
//!
//! It reuses the SOCKS5 address encoding — an address-type byte, the
//! address body, then a big-endian port — so the guest can lift the target
//! straight out of the client's CONNECT request.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

use crate::socks::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

/// Target of a tunnelled CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreambleError {
    #[error("unknown address type {0:#04x}")]
    UnknownAddrType(u8),
    #[error("connect preamble truncated")]
    Truncated,
    #[error("zero-length domain name")]
    EmptyDomain,
    #[error("domain name is not ascii")]
    NonAsciiDomain,
    #[error("{0} stray bytes after the connect preamble")]
    TrailingBytes(usize),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    /// Append the wire form: atyp, address body, big-endian port.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
            }
            Self::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
            }
            Self::Domain(name, _) => {
                debug_assert!(name.len() <= 255, "domain length must fit one byte");
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
    }

    /// Parse a whole preamble payload. The payload must hold exactly one
    /// encoded target; stray bytes after the port are rejected.
    pub fn parse(payload: &[u8]) -> Result<Self, PreambleError> {
        match parse_addr(payload)? {
            None => Err(PreambleError::Truncated),
            Some((_, used)) if used < payload.len() => {
                Err(PreambleError::TrailingBytes(payload.len() - used))
            }
            Some((target, _)) => Ok(target),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => addr.fmt(f),
            Self::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

/// Decode one target address from the front of `buf`.
///
/// Returns `None` while `buf` is a strict prefix of a valid encoding, and
/// the decoded target plus its encoded length once enough bytes are there.
/// Shared with the SOCKS request parser, which embeds the same layout.
pub(crate) fn parse_addr(buf: &[u8]) -> Result<Option<(TargetAddr, usize)>, PreambleError> {
    let Some((&atyp, rest)) = buf.split_first() else {
        return Ok(None);
    };
    match atyp {
        ATYP_IPV4 => {
            if rest.len() < 6 {
                return Ok(None);
            }
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            Ok(Some((TargetAddr::Ip(SocketAddr::from((ip, port))), 7)))
        }
        ATYP_DOMAIN => {
            let Some((&len, body)) = rest.split_first() else {
                return Ok(None);
            };
            let len = usize::from(len);
            if len == 0 {
                return Err(PreambleError::EmptyDomain);
            }
            if body.len() < len + 2 {
                return Ok(None);
            }
            let name = &body[..len];
            if !name.is_ascii() {
                return Err(PreambleError::NonAsciiDomain);
            }
            let name = String::from_utf8_lossy(name).into_owned();
            let port = u16::from_be_bytes([body[len], body[len + 1]]);
            Ok(Some((TargetAddr::Domain(name, port), 2 + len + 2)))
        }
        ATYP_IPV6 => {
            if rest.len() < 18 {
                return Ok(None);
            }
            let mut octets = [0_u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            Ok(Some((TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(octets), port))), 19)))
        }
        other => Err(PreambleError::UnknownAddrType(other)),
    }
}
