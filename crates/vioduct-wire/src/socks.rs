//! The SOCKS5 subset spoken to local clients: RFC 1928 with the
//! no-authentication method and the CONNECT command only.
//!
//! The parsers are re-entrant: called with whatever has accumulated so far,
//! they answer [`Parsed::Incomplete`] until a whole packet is buffered, so a
//! handshake split across TCP segments just waits for the next readiness
//! event. Malformed bytes are hard errors that end the client.

use thiserror::Error;

use crate::preamble::{PreambleError, TargetAddr, parse_addr};

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("client speaks socks version {0}, not 5")]
    BadVersion(u8),
    #[error("greeting offers no auth methods")]
    NoMethods,
    #[error("bad connect address: {0}")]
    Address(#[from] PreambleError),
}

/// Outcome of running a parser over a still-growing buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed<T> {
    /// A whole packet was present; the first `consumed` bytes belong to it.
    Complete { value: T, consumed: usize },
    /// The buffer holds a prefix of a valid packet; read more first.
    Incomplete,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Greeting {
    pub offers_no_auth: bool,
}

/// `VER NMETHODS METHODS...`
pub fn parse_greeting(buf: &[u8]) -> Result<Parsed<Greeting>, HandshakeError> {
    if buf.len() < 2 {
        return Ok(Parsed::Incomplete);
    }
    if buf[0] != VERSION {
        return Err(HandshakeError::BadVersion(buf[0]));
    }
    let nmethods = usize::from(buf[1]);
    if nmethods == 0 {
        return Err(HandshakeError::NoMethods);
    }
    if buf.len() < 2 + nmethods {
        return Ok(Parsed::Incomplete);
    }
    let methods = &buf[2..2 + nmethods];
    Ok(Parsed::Complete {
        value: Greeting { offers_no_auth: methods.contains(&METHOD_NO_AUTH) },
        consumed: 2 + nmethods,
    })
}

#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    pub cmd: u8,
    pub target: TargetAddr,
}

/// `VER CMD RSV ATYP ADDR PORT`
///
/// The command is returned rather than validated so the caller can answer
/// an unsupported one with the proper reply code before closing.
pub fn parse_request(buf: &[u8]) -> Result<Parsed<Request>, HandshakeError> {
    if buf.len() < 4 {
        return Ok(Parsed::Incomplete);
    }
    if buf[0] != VERSION {
        return Err(HandshakeError::BadVersion(buf[0]));
    }
    let cmd = buf[1];
    match parse_addr(&buf[3..])? {
        None => Ok(Parsed::Incomplete),
        Some((target, used)) => {
            Ok(Parsed::Complete { value: Request { cmd, target }, consumed: 3 + used })
        }
    }
}

/// `VER METHOD` answer to the greeting.
pub fn method_reply(method: u8) -> [u8; 2] {
    [VERSION, method]
}

/// Ten-byte reply to a request, with the stub bound address `0.0.0.0:0`.
///
/// The real bound address is not known until the far side of the tunnel has
/// connected; clients that do not rely on the field accept the stub.
pub fn reply(code: u8) -> [u8; 10] {
    [VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}
