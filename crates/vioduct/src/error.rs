//! Failure taxonomy for the two proxy loops.
//!
//! The split is by blast radius: a [`FatalError`] poisons the shared
//! transport and tears the whole peer down; a [`SlotError`] ends exactly
//! one multiplexed stream and is logged at the point it is handled; a
//! [`SetupError`] can only happen before the loop starts and surfaces as a
//! non-zero exit.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use vioduct_wire::WireError;
use vioduct_wire::socks::HandshakeError;

/// Failures that make the shared transport unusable. All slots are torn
/// down and the loop exits; there is no resynchronisation.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("framing violated: {0}")]
    Framing(#[from] WireError),
    #[error("frame addressed to stream {slot}, table holds {capacity}")]
    SlotOutOfRange { slot: u16, capacity: usize },
    #[error("transport i/o: {0}")]
    Transport(#[from] io::Error),
}

/// Failures scoped to one stream. The slot is closed, the peer is told via
/// a zero-length frame when it already knows the stream, and the loop keeps
/// running.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("socks handshake: {0}")]
    Protocol(#[from] HandshakeError),
    #[error("upstream: {0}")]
    Upstream(io::Error),
    #[error("socket i/o: {0}")]
    SocketIo(io::Error),
}

/// Initialisation failures, reported by the binaries as exit code 1.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("open transport endpoint {}: {source}", .path.display())]
    OpenTransport { path: PathBuf, source: io::Error },
    #[error("bind socks listener on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("set up poll: {0}")]
    Poll(#[source] io::Error),
}
