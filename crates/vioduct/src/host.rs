//! The host-side proxy: TCP egress for the streams the guest multiplexes.
//!
//! The loop owns the transport and every upstream socket. The first frame
//! for a free slot carries the connect preamble: the target is resolved,
//! a non-blocking connect starts, and the slot sits in `Connecting` until
//! the socket reports writable — frames arriving meanwhile queue on the
//! slot. From `Open` on, payload frames become upstream bytes and upstream
//! bytes become payload frames.
//!
//! Failures to resolve or connect, and upstream EOF, are all signalled to
//! the guest with a zero-length frame on the slot. Frames addressed past
//! the table kill the transport: the guest never invents slot ids.

use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use vioduct_wire::TargetAddr;

use crate::config::Limits;
use crate::endpoint::Endpoint;
use crate::error::{FatalError, SetupError, SlotError};
use crate::table::{SlotState, SlotTable};
use crate::transport::{LoopState, ReadState, Transport};

const TRANSPORT: Token = Token(0);
const SLOT_BASE: usize = 1;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const fn slot_token(id: u16) -> Token {
    Token(SLOT_BASE + id as usize)
}

fn token_slot(token: Token) -> u16 {
    (token.0 - SLOT_BASE) as u16
}

/// Synchronous name resolution. Prefers an IPv4 address when the name has
/// both families; slow lookups block the loop, which is the accepted
/// trade-off at this deployment size.
fn resolve(target: &TargetAddr) -> io::Result<SocketAddr> {
    match target {
        TargetAddr::Ip(addr) => Ok(*addr),
        TargetAddr::Domain(name, port) => {
            let addrs: Vec<SocketAddr> = (name.as_str(), *port).to_socket_addrs()?.collect();
            addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "name resolved to no addresses")
                })
        }
    }
}

pub struct HostProxy {
    poll: Poll,
    events: Events,
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

impl HostProxy {
    pub fn new(endpoint: Endpoint, limits: Limits) -> Result<Self, SetupError> {
        let poll = Poll::new().map_err(SetupError::Poll)?;
        let mut transport = Transport::new(endpoint, limits.frame_cap);
        transport.register(poll.registry(), TRANSPORT).map_err(SetupError::Poll)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            transport,
            table: SlotTable::new(limits.max_streams),
            limits,
            scratch: vec![0; limits.frame_cap],
            stalled_on: None,
            transport_read_deferred: false,
            transport_eof: false,
        })
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
                    self.slot_event(token_slot(token), event.is_readable(), event.is_writable())?;
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

    fn slot_event(&mut self, id: u16, readable: bool, writable: bool) -> Result<(), FatalError> {
        // A connect in flight resolves on the first readiness of any kind.
        if self.table.state(id) == Some(SlotState::Connecting) {
            self.connect_ready(id)?;
        }
        if writable {
            self.slot_writable(id)?;
        }
        if readable && self.table.state(id) == Some(SlotState::Open) {
            self.upstream_payload(id)?;
        }
        Ok(())
    }

    /// Decide what a readiness event on a `Connecting` socket means: the
    /// connect finished, failed, or is still in flight.
    fn connect_ready(&mut self, id: u16) -> Result<(), FatalError> {
        enum Connect {
            Ready,
            Pending,
            Failed(io::Error),
        }
        let outcome = {
            let Some(slot) = self.table.get_mut(id) else {
                return Ok(());
            };
            let Some(socket) = slot.socket.as_mut() else {
                return Ok(());
            };
            match socket.take_error() {
                Ok(Some(e)) | Err(e) => Connect::Failed(e),
                Ok(None) => match socket.peer_addr() {
                    Ok(_) => Connect::Ready,
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.kind() == io::ErrorKind::WouldBlock =>
                    {
                        Connect::Pending
                    }
                    Err(e) => Connect::Failed(e),
                },
            }
        };
        match outcome {
            Connect::Pending => Ok(()),
            Connect::Failed(e) => {
                debug!(stream = id, error = %SlotError::Upstream(e), "upstream connect failed");
                self.close_slot(id, true)
            }
            Connect::Ready => {
                if let Some(slot) = self.table.get_mut(id) {
                    slot.state = SlotState::Open;
                }
                debug!(stream = id, "upstream connected");
                self.flush_slot(id)?;
                let below_high_water = self
                    .table
                    .get(id)
                    .is_none_or(|slot| slot.outbound_bytes < self.limits.high_water());
                if below_high_water && self.stalled_on == Some(id) {
                    self.stalled_on = None;
                    self.drain_transport()?;
                }
                Ok(())
            }
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
            if matches!(slot.state, SlotState::Free | SlotState::Connecting) {
                return Ok(());
            }
            let after = match slot
                .flush_outbound()
                .and_then(|()| slot.update_interest(registry, slot_token(id)))
            {
                Err(e) => {
                    debug!(stream = id, error = %SlotError::SocketIo(e), "upstream socket flush");
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

    /// Relay upstream bytes into payload frames, one frame per read, until
    /// the socket blocks or the transport backlog tells us to pause.
    fn upstream_payload(&mut self, id: u16) -> Result<(), FatalError> {
        loop {
            if self.transport.backlog_bytes() >= self.limits.high_water() {
                if let Some(slot) = self.table.get_mut(id) {
                    trace!(stream = id, "transport backlog high, deferring upstream read");
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
                    debug!(stream = id, "upstream closed");
                    return self.close_slot(id, true);
                }
                Step::Failed(e) => {
                    debug!(stream = id, error = %SlotError::SocketIo(e), "upstream read");
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
        let mut refusals: Vec<u16> = Vec::new();
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
                    // A close for a stream that is already gone.
                    SlotState::Free if payload.is_empty() => {
                        trace!(stream = sid, "close for idle stream ignored");
                    }
                    // First frame for a fresh stream: the connect preamble.
                    SlotState::Free => match TargetAddr::parse(payload) {
                        Err(e) => {
                            debug!(stream = sid, error = %e, "bad connect preamble");
                            refusals.push(sid);
                        }
                        Ok(target) => match resolve(&target).and_then(|addr| {
                            TcpStream::connect(addr).map(|socket| (addr, socket))
                        }) {
                            Err(e) => {
                                debug!(
                                    stream = sid, %target,
                                    error = %SlotError::Upstream(e),
                                    "upstream unreachable"
                                );
                                refusals.push(sid);
                            }
                            Ok((addr, mut socket)) => {
                                if let Err(e) = registry.register(
                                    &mut socket,
                                    slot_token(sid),
                                    Interest::READABLE | Interest::WRITABLE,
                                ) {
                                    warn!(stream = sid, error = %e, "register upstream socket");
                                    refusals.push(sid);
                                } else {
                                    debug!(stream = sid, %target, %addr, "connecting upstream");
                                    slot.state = SlotState::Connecting;
                                    slot.socket = Some(socket);
                                    slot.writable_armed = true;
                                    slot.announced = true;
                                }
                            }
                        },
                    },
                    // The guest gave up while the connect was in flight.
                    SlotState::Connecting if payload.is_empty() => {
                        debug!(stream = sid, "peer closed stream during connect");
                        slot.state = SlotState::Closing;
                        closes.push((sid, false));
                    }
                    // Early payload: hold it until the connect completes.
                    SlotState::Connecting => {
                        slot.queue_outbound(payload);
                        if slot.outbound_bytes >= limits.high_water() {
                            trace!(stream = sid, "connect backlog high, pausing transport");
                            *stalled_on = Some(sid);
                        }
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
                            debug!(stream = sid, error = %SlotError::SocketIo(e), "upstream socket");
                            slot.state = SlotState::Closing;
                            closes.push((sid, true));
                        } else if slot.outbound_bytes >= limits.high_water() {
                            trace!(stream = sid, "socket backlog high, pausing transport");
                            *stalled_on = Some(sid);
                        }
                    }
                    SlotState::Negotiating | SlotState::AwaitingRequest => {
                        trace!(stream = sid, "frame for unexpected state discarded");
                    }
                }
            }
        }
        for (id, notify) in closes {
            self.close_slot(id, notify)?;
        }
        // Refused streams were never claimed; just tell the guest.
        for id in refusals {
            self.transport.send(id, &[])?;
        }
        self.transport.update_interest(self.poll.registry()).map_err(FatalError::Transport)?;
        Ok(())
    }

    /// Flush queued upstream bytes and retune interest; socket failures end
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
            debug!(stream = id, error = %SlotError::SocketIo(e), "upstream socket");
            return self.close_slot(id, true);
        }
        Ok(())
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

    /// Re-run deferred upstream reads once the transport backlog has
    /// drained.
    fn resume_deferred_reads(&mut self) -> Result<(), FatalError> {
        if self.transport.backlog_bytes() >= self.limits.high_water() {
            return Ok(());
        }
        for id in self.table.deferred_ids() {
            if let Some(slot) = self.table.get_mut(id) {
                slot.read_deferred = false;
            }
            if self.table.state(id) == Some(SlotState::Open) {
                self.upstream_payload(id)?;
            }
        }
        Ok(())
    }
}
