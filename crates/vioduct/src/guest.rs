//! The guest-side proxy: a SOCKS5 front end multiplexed onto the tunnel.
//!
//! One mio loop owns the listener, the transport and every client socket.
//! A fresh client walks the handshake (`Negotiating → AwaitingRequest`),
//! then its CONNECT target is framed out as the stream's preamble and the
//! slot goes `Open`: from there client bytes become payload frames and
//! payload frames become client bytes until either side closes.
//!
//! Backpressure runs in both directions. When the transport backlog passes
//! high water, client reads are deferred (the readiness is remembered, not
//! acted on); when one client's socket backlog passes high water, frames
//! stop being pulled out of the transport until it drains.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use vioduct_wire::TargetAddr;
use vioduct_wire::socks::{self, Parsed};

use crate::config::Limits;
use crate::endpoint::Endpoint;
use crate::error::{FatalError, SetupError, SlotError};
use crate::table::{SlotState, SlotTable};
use crate::transport::{LoopState, ReadState, Transport};

const LISTENER: Token = Token(0);
const TRANSPORT: Token = Token(1);
const SLOT_BASE: usize = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const fn slot_token(id: u16) -> Token {
    Token(SLOT_BASE + id as usize)
}

fn token_slot(token: Token) -> u16 {
    (token.0 - SLOT_BASE) as u16
}

/// Next step after parsing whatever handshake bytes have accumulated.
enum Handshake {
    /// Packet still incomplete; wait for more client bytes.
    Wait,
    /// State advanced; the next packet may already be buffered.
    Again,
    /// No acceptable auth method: answer `05 FF`, then close.
    RejectAuth,
    /// Not CONNECT: answer `05 07`, then close.
    RejectCommand,
    /// IPv6 target on the guest path: close without a reply.
    RejectTarget,
    /// Malformed handshake: close without a reply.
    Protocol(vioduct_wire::socks::HandshakeError),
    /// CONNECT accepted; announce the stream to the peer.
    Connect(TargetAddr),
}

/// Outcome of one read into the handshake buffer.
enum Chunk {
    Data,
    Idle,
    Closed,
    TooLong,
    Failed(io::Error),
}

pub struct GuestProxy {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    transport: Transport<Endpoint>,
    table: SlotTable,
    limits: Limits,
    scratch: Vec<u8>,
    /// Stream whose socket backlog is holding up the transport reader.
    stalled_on: Option<u16>,
    /// Transport readability seen while stalled.
    transport_read_deferred: bool,
    transport_eof: bool,
}

impl GuestProxy {
    /// Bind the SOCKS listener and wire everything onto one poll.
    pub fn new(listen: SocketAddr, endpoint: Endpoint, limits: Limits) -> Result<Self, SetupError> {
        let mut listener =
            TcpListener::bind(listen).map_err(|source| SetupError::Bind { addr: listen, source })?;
        let poll = Poll::new().map_err(SetupError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(SetupError::Poll)?;
        let mut transport = Transport::new(endpoint, limits.frame_cap);
        transport.register(poll.registry(), TRANSPORT).map_err(SetupError::Poll)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            listener,
            transport,
            table: SlotTable::new(limits.max_streams),
            limits,
            scratch: vec![0; limits.frame_cap],
            stalled_on: None,
            transport_read_deferred: false,
            transport_eof: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Drive the loop until the transport closes, a fatal error lands, or
    /// `running` is cleared.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), FatalError> {
        while running.load(Ordering::Relaxed) {
            match self.poll_once(Some(POLL_INTERVAL)) {
                Ok(LoopState::Running) => {}
                Ok(LoopState::TransportClosed) => {
                    info!("transport closed by peer");
                    break;
                }
                Err(e) => {
                    self.table.close_all(self.poll.registry());
                    return Err(e);
                }
            }
        }
        self.table.close_all(self.poll.registry());
        Ok(())
    }

    /// One poll pass. Exposed so tests can pump the loop on their own
    /// schedule.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<LoopState, FatalError> {
        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        let state = self.dispatch(&mut events, timeout);
        self.events = events;
        state
    }

    fn dispatch(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> Result<LoopState, FatalError> {
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(LoopState::Running),
            Err(e) => return Err(FatalError::Transport(e)),
        }
        for event in events.iter() {
            match event.token() {
                LISTENER => self.accept_clients()?,
                TRANSPORT => {
                    if event.is_writable() {
                        self.transport.flush()?;
                        self.transport
                            .update_interest(self.poll.registry())
                            .map_err(FatalError::Transport)?;
                        self.resume_deferred_reads()?;
                    }
                    if event.is_readable() {
                        self.drain_transport()?;
                    }
                }
                token => {
                    let id = token_slot(token);
                    // Flush first: a completed drain may free the slot, and
                    // the read path re-checks state.
                    if event.is_writable() {
                        self.slot_writable(id)?;
                    }
                    if event.is_readable() {
                        self.slot_readable(id)?;
                    }
                }
            }
            if self.transport_eof {
                break;
            }
        }
        if self.transport_read_deferred && self.stalled_on.is_none() {
            self.drain_transport()?;
        }
        if self.transport_eof {
            return Ok(LoopState::TransportClosed);
        }
        Ok(LoopState::Running)
    }

    /// Accept until the listener would block. A full table drops the fresh
    /// socket with no SOCKS reply.
    fn accept_clients(&mut self) -> Result<(), FatalError> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let Some(id) = self.table.allocate() else {
                        debug!(%peer, "stream table full, dropping client");
                        continue;
                    };
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        slot_token(id),
                        Interest::READABLE,
                    ) {
                        warn!(%peer, error = %e, "register client socket");
                        self.table.close(id, self.poll.registry());
                        continue;
                    }
                    self.table.attach(id, stream);
                    debug!(stream = id, %peer, "client accepted");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn slot_readable(&mut self, id: u16) -> Result<(), FatalError> {
        match self.table.state(id) {
            Some(SlotState::Negotiating | SlotState::AwaitingRequest) => self.client_handshake(id),
            Some(SlotState::Open) => self.client_payload(id),
            _ => Ok(()),
        }
    }

    fn slot_writable(&mut self, id: u16) -> Result<(), FatalError> {
        enum After {
            Keep,
            Close { notify: bool },
            Finished,
        }
        let (after, below_high_water) = {
            let registry = self.poll.registry();
            let Some(slot) = self.table.get_mut(id) else {
                return Ok(());
            };
            if slot.state == SlotState::Free {
                return Ok(());
            }
            let after = match slot
                .flush_outbound()
                .and_then(|()| slot.update_interest(registry, slot_token(id)))
            {
                Err(e) => {
                    debug!(stream = id, error = %SlotError::SocketIo(e), "client socket flush");
                    After::Close { notify: true }
                }
                Ok(()) if slot.state == SlotState::Closing && !slot.has_outbound() => {
                    After::Finished
                }
                Ok(()) => After::Keep,
            };
            (after, slot.outbound_bytes < self.limits.high_water())
        };
        match after {
            After::Keep => {}
            After::Finished => self.close_slot(id, false)?,
            After::Close { notify } => self.close_slot(id, notify)?,
        }
        if below_high_water && self.stalled_on == Some(id) {
            trace!(stream = id, "socket backlog drained, resuming transport");
            self.stalled_on = None;
            self.drain_transport()?;
        }
        Ok(())
    }

    /// Pull handshake bytes off the client and advance the state machine.
    /// One chunk is parsed at a time so payload a client pipelines behind
    /// its request lands in the relay path, not the handshake buffer.
    fn client_handshake(&mut self, id: u16) -> Result<(), FatalError> {
        loop {
            match self.read_handshake_chunk(id) {
                Chunk::Idle => return Ok(()),
                Chunk::Data => {}
                Chunk::Closed => {
                    debug!(stream = id, "client closed mid-handshake");
                    return self.close_slot(id, false);
                }
                Chunk::TooLong => {
                    debug!(stream = id, "handshake packet exceeds the frame cap");
                    return self.close_slot(id, false);
                }
                Chunk::Failed(e) => {
                    debug!(stream = id, error = %SlotError::SocketIo(e), "handshake read");
                    return self.close_slot(id, false);
                }
            }
            self.advance_handshake(id)?;
            match self.table.state(id) {
                Some(SlotState::Negotiating | SlotState::AwaitingRequest) => {}
                Some(SlotState::Open) => return self.client_payload(id),
                _ => return Ok(()),
            }
        }
    }

    fn read_handshake_chunk(&mut self, id: u16) -> Chunk {
        let Self { table, scratch, limits, .. } = self;
        let Some(slot) = table.get_mut(id) else {
            return Chunk::Idle;
        };
        let Some(socket) = slot.socket.as_mut() else {
            return Chunk::Idle;
        };
        loop {
            match socket.read(scratch.as_mut_slice()) {
                Ok(0) => return Chunk::Closed,
                Ok(n) => {
                    if slot.inbound.len() + n > limits.frame_cap {
                        return Chunk::TooLong;
                    }
                    slot.inbound.extend_from_slice(&scratch[..n]);
                    return Chunk::Data;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Chunk::Idle,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Chunk::Failed(e),
            }
        }
    }

    fn advance_handshake(&mut self, id: u16) -> Result<(), FatalError> {
        loop {
            let step = {
                let Some(slot) = self.table.get_mut(id) else {
                    return Ok(());
                };
                match slot.state {
                    SlotState::Negotiating => match socks::parse_greeting(&slot.inbound) {
                        Ok(Parsed::Incomplete) => Handshake::Wait,
                        Err(e) => Handshake::Protocol(e),
                        Ok(Parsed::Complete { value, consumed }) => {
                            slot.inbound.drain(..consumed);
                            if value.offers_no_auth {
                                slot.queue_outbound(&socks::method_reply(socks::METHOD_NO_AUTH));
                                slot.state = SlotState::AwaitingRequest;
                                Handshake::Again
                            } else {
                                Handshake::RejectAuth
                            }
                        }
                    },
                    SlotState::AwaitingRequest => match socks::parse_request(&slot.inbound) {
                        Ok(Parsed::Incomplete) => Handshake::Wait,
                        Err(e) => Handshake::Protocol(e),
                        Ok(Parsed::Complete { value, consumed }) => {
                            slot.inbound.drain(..consumed);
                            if value.cmd != socks::CMD_CONNECT {
                                Handshake::RejectCommand
                            } else if matches!(value.target, TargetAddr::Ip(SocketAddr::V6(_))) {
                                Handshake::RejectTarget
                            } else {
                                Handshake::Connect(value.target)
                            }
                        }
                    },
                    _ => Handshake::Wait,
                }
            };
            match step {
                Handshake::Wait => return self.flush_slot(id),
                Handshake::Again => {}
                Handshake::RejectAuth => {
                    debug!(stream = id, "no acceptable auth method");
                    return self
                        .reply_and_close(id, &socks::method_reply(socks::METHOD_NO_ACCEPTABLE));
                }
                Handshake::RejectCommand => {
                    debug!(stream = id, "unsupported socks command");
                    return self
                        .reply_and_close(id, &socks::reply(socks::REPLY_COMMAND_NOT_SUPPORTED));
                }
                Handshake::RejectTarget => {
                    debug!(stream = id, "ipv6 targets are not relayed");
                    return self.close_slot(id, false);
                }
                Handshake::Protocol(e) => {
                    debug!(stream = id, error = %SlotError::Protocol(e), "handshake rejected");
                    return self.close_slot(id, false);
                }
                Handshake::Connect(target) => return self.open_stream(id, &target),
            }
        }
    }

    /// Announce the stream to the peer, promise success to the client, and
    /// start relaying.
    fn open_stream(&mut self, id: u16, target: &TargetAddr) -> Result<(), FatalError> {
        let mut preamble = Vec::with_capacity(32);
        target.encode_into(&mut preamble);
        self.transport.send(id, &preamble)?;
        self.transport.update_interest(self.poll.registry()).map_err(FatalError::Transport)?;

        let pipelined = {
            let Some(slot) = self.table.get_mut(id) else {
                return Ok(());
            };
            slot.state = SlotState::Open;
            slot.announced = true;
            slot.queue_outbound(&socks::reply(socks::REPLY_SUCCEEDED));
            std::mem::take(&mut slot.inbound)
        };
        info!(stream = id, %target, "stream opened");
        self.flush_slot(id)?;

        // Clients may pipeline payload straight behind the request.
        if !pipelined.is_empty() && self.table.state(id) == Some(SlotState::Open) {
            for chunk in pipelined.chunks(self.limits.frame_cap) {
                self.transport.send(id, chunk)?;
            }
            self.transport.update_interest(self.poll.registry()).map_err(FatalError::Transport)?;
        }
        Ok(())
    }

    /// Relay client bytes into payload frames, one frame per read, until
    /// the socket blocks or the transport backlog tells us to pause.
    fn client_payload(&mut self, id: u16) -> Result<(), FatalError> {
        loop {
            if self.transport.backlog_bytes() >= self.limits.high_water() {
                if let Some(slot) = self.table.get_mut(id) {
                    trace!(stream = id, "transport backlog high, deferring client read");
                    slot.read_deferred = true;
                }
                return Ok(());
            }
            enum Step {
                Forward(usize),
                Eof,
                Done,
                Failed(io::Error),
            }
            let step = {
                let Self { table, scratch, limits, .. } = self;
                let Some(slot) = table.get_mut(id) else {
                    return Ok(());
                };
                if slot.state != SlotState::Open {
                    return Ok(());
                }
                let Some(socket) = slot.socket.as_mut() else {
                    return Ok(());
                };
                loop {
                    match socket.read(&mut scratch[..limits.frame_cap]) {
                        Ok(0) => break Step::Eof,
                        Ok(n) => break Step::Forward(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Step::Done,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => break Step::Failed(e),
                    }
                }
            };
            match step {
                Step::Forward(n) => {
                    self.transport.send(id, &self.scratch[..n])?;
                    self.transport
                        .update_interest(self.poll.registry())
                        .map_err(FatalError::Transport)?;
                }
                Step::Eof => {
                    debug!(stream = id, "client closed");
                    return self.close_slot(id, true);
                }
                Step::Failed(e) => {
                    debug!(stream = id, error = %SlotError::SocketIo(e), "client read");
                    return self.close_slot(id, true);
                }
                Step::Done => return Ok(()),
            }
        }
    }

    /// Read the transport and route every complete frame, unless a stalled
    /// stream has paused the reader.
    fn drain_transport(&mut self) -> Result<(), FatalError> {
        if self.stalled_on.is_some() {
            self.transport_read_deferred = true;
            return Ok(());
        }
        self.transport_read_deferred = false;
        if self.transport.fill()? == ReadState::Closed {
            self.transport_eof = true;
        }
        self.route_frames()
    }

    fn route_frames(&mut self) -> Result<(), FatalError> {
        let mut closes: Vec<(u16, bool)> = Vec::new();
        {
            let Self { transport, table, poll, limits, stalled_on, .. } = self;
            let registry = poll.registry();
            while stalled_on.is_none() {
                let Some((sid, payload)) = transport.next_frame()? else {
                    break;
                };
                if usize::from(sid) >= table.capacity() {
                    return Err(FatalError::SlotOutOfRange {
                        slot: sid,
                        capacity: table.capacity(),
                    });
                }
                let Some(slot) = table.get_mut(sid) else {
                    break;
                };
                match slot.state {
                    SlotState::Free => {
                        trace!(stream = sid, "frame for idle stream discarded");
                    }
                    SlotState::Negotiating | SlotState::AwaitingRequest | SlotState::Connecting => {
                        trace!(stream = sid, "frame for unannounced stream discarded");
                    }
                    SlotState::Closing => {}
                    SlotState::Open if payload.is_empty() => {
                        debug!(stream = sid, "peer closed stream");
                        slot.state = SlotState::Closing;
                        if !slot.has_outbound() {
                            closes.push((sid, false));
                        }
                    }
                    SlotState::Open => {
                        if let Err(e) = slot
                            .deliver(payload)
                            .and_then(|()| slot.update_interest(registry, slot_token(sid)))
                        {
                            debug!(stream = sid, error = %SlotError::SocketIo(e), "client socket");
                            slot.state = SlotState::Closing;
                            closes.push((sid, true));
                        } else if slot.outbound_bytes >= limits.high_water() {
                            trace!(stream = sid, "socket backlog high, pausing transport");
                            *stalled_on = Some(sid);
                        }
                    }
                }
            }
        }
        for (id, notify) in closes {
            self.close_slot(id, notify)?;
        }
        Ok(())
    }

    /// Flush queued client bytes and retune interest; socket failures end
    /// the stream.
    fn flush_slot(&mut self, id: u16) -> Result<(), FatalError> {
        let result = {
            let registry = self.poll.registry();
            let Some(slot) = self.table.get_mut(id) else {
                return Ok(());
            };
            slot.flush_outbound().and_then(|()| slot.update_interest(registry, slot_token(id)))
        };
        if let Err(e) = result {
            debug!(stream = id, error = %SlotError::SocketIo(e), "client socket");
            return self.close_slot(id, true);
        }
        Ok(())
    }

    /// Deliver a terminal reply, then close once it has drained. The slot
    /// was never announced on these paths, so no frame goes out.
    fn reply_and_close(&mut self, id: u16, reply: &[u8]) -> Result<(), FatalError> {
        let finished = {
            let registry = self.poll.registry();
            let Some(slot) = self.table.get_mut(id) else {
                return Ok(());
            };
            if let Err(e) = slot.deliver(reply) {
                debug!(stream = id, error = %SlotError::SocketIo(e), "reply write");
                true
            } else if slot.has_outbound() {
                slot.state = SlotState::Closing;
                slot.update_interest(registry, slot_token(id)).is_err()
            } else {
                true
            }
        };
        if finished { self.close_slot(id, false) } else { Ok(()) }
    }

    /// Free the slot; `notify` sends the zero-length close frame when the
    /// peer knows about this stream. Closing the stream that stalled the
    /// transport resumes it.
    fn close_slot(&mut self, id: u16, notify: bool) -> Result<(), FatalError> {
        let announced = self.table.get(id).is_some_and(|slot| slot.announced);
        if !self.table.close(id, self.poll.registry()) {
            return Ok(());
        }
        debug!(stream = id, "stream closed");
        if notify && announced {
            self.transport.send(id, &[])?;
            self.transport.update_interest(self.poll.registry()).map_err(FatalError::Transport)?;
        }
        if self.stalled_on == Some(id) {
            self.stalled_on = None;
            self.drain_transport()?;
        }
        Ok(())
    }

    /// Re-run deferred client reads once the transport backlog has drained.
    fn resume_deferred_reads(&mut self) -> Result<(), FatalError> {
        if self.transport.backlog_bytes() >= self.limits.high_water() {
            return Ok(());
        }
        for id in self.table.deferred_ids() {
            if let Some(slot) = self.table.get_mut(id) {
                slot.read_deferred = false;
            }
            if self.table.state(id) == Some(SlotState::Open) {
                self.client_payload(id)?;
            }
        }
        Ok(())
    }
}
