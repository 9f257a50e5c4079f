//! The framed, serialised view of the transport endpoint.
//!
//! One `Transport` is owned by one event loop; it is the only writer and
//! the only reader of the endpoint, which is what keeps frames from
//! interleaving on the wire. The read side feeds a [`FrameDecoder`]; the
//! write side pushes encoded frames straight at the endpoint and queues
//! whatever the kernel refuses, draining the backlog on writable events.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::trace;

use vioduct_wire::{FrameDecoder, HEADER_SIZE, encode_into};

use crate::error::FatalError;

/// Whether the far side of the link is still there after a read pass.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadState {
    Open,
    /// Clean EOF from the peer: route what is buffered, then shut down.
    Closed,
}

/// Outcome of one pass of a proxy loop.
#[derive(Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// The peer hung up the link; tear down every stream and exit cleanly.
    TransportClosed,
}

pub struct Transport<E> {
    endpoint: E,
    decoder: FrameDecoder,
    scratch: Vec<u8>,
    /// Encoded frames awaiting write; the front entry may be partially
    /// sent. Entries never interleave.
    backlog: VecDeque<Vec<u8>>,
    backlog_bytes: usize,
    frame_cap: usize,
    token: Token,
    writable_armed: bool,
}

impl<E: Read + Write> Transport<E> {
    pub fn new(endpoint: E, frame_cap: usize) -> Self {
        Self {
            endpoint,
            decoder: FrameDecoder::new(frame_cap),
            scratch: vec![0; HEADER_SIZE + frame_cap],
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            frame_cap,
            token: Token(usize::MAX),
            writable_armed: false,
        }
    }

    /// Read everything currently available into the reassembly buffer.
    pub fn fill(&mut self) -> Result<ReadState, FatalError> {
        loop {
            match self.endpoint.read(&mut self.scratch) {
                Ok(0) => return Ok(ReadState::Closed),
                Ok(n) => self.decoder.feed(&self.scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadState::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FatalError::Transport(e)),
            }
        }
    }

    /// The next buffered frame, if a whole one has arrived.
    pub fn next_frame(&mut self) -> Result<Option<(u16, &[u8])>, FatalError> {
        self.decoder.next_frame().map_err(FatalError::Framing)
    }

    /// Frame out one payload and hand it to the endpoint, queueing whatever
    /// the kernel will not take right now. A zero-length payload is the
    /// half-close signal for `slot`.
    pub fn send(&mut self, slot: u16, payload: &[u8]) -> Result<(), FatalError> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        encode_into(&mut frame, slot, payload, self.frame_cap)?;
        trace!(stream = slot, len = payload.len(), "frame out");
        self.backlog_bytes += frame.len();
        self.backlog.push_back(frame);
        self.flush()
    }

    /// Push backlogged bytes out until the endpoint blocks or the queue is
    /// empty. The front entry is always finished before the next one
    /// starts, so frames never interleave within the stream.
    pub fn flush(&mut self) -> Result<(), FatalError> {
        while let Some(front) = self.backlog.front_mut() {
            match self.endpoint.write(front) {
                Ok(0) => {
                    return Err(FatalError::Transport(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    self.backlog_bytes -= n;
                    if n == front.len() {
                        self.backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FatalError::Transport(e)),
            }
        }
        Ok(())
    }

    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Bytes queued behind a blocked endpoint. The loops compare this to
    /// their high-water mark before taking in more socket data.
    pub fn backlog_bytes(&self) -> usize {
        self.backlog_bytes
    }
}

impl<E: Read + Write + Source> Transport<E> {
    /// Register the endpoint for readability. Write interest comes and goes
    /// with the backlog, via [`update_interest`].
    ///
    /// [`update_interest`]: Transport::update_interest
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.token = token;
        registry.register(&mut self.endpoint, token, Interest::READABLE)
    }

    /// Keep WRITABLE interest in sync with the backlog: armed exactly while
    /// bytes are queued.
    pub fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let want_write = !self.backlog.is_empty();
        if want_write != self.writable_armed {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            registry.reregister(&mut self.endpoint, self.token, interest)?;
            self.writable_armed = want_write;
        }
        Ok(())
    }
}
