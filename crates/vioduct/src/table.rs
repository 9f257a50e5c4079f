//! The fixed-capacity stream table.
//!
//! Every multiplexed stream occupies one slot, addressed by the id carried
//! in the frame header. The guest owns allocation (lowest free id); the
//! host only ever claims ids the guest named. Both peers free a slot at
//! most once per lifetime and never reuse an id while it is live.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::Shutdown;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::trace;

/// Lifecycle of one stream. The guest walks
/// `Free → Negotiating → AwaitingRequest → Open`, the host
/// `Free → Connecting → Open`; both end with `Closing → Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Negotiating,
    AwaitingRequest,
    Connecting,
    Open,
    Closing,
}

/// One stream bound to one slot id.
pub struct Slot {
    pub state: SlotState,
    pub socket: Option<TcpStream>,
    /// Bytes read off the socket ahead of a state transition — the guest's
    /// handshake accumulator.
    pub inbound: Vec<u8>,
    /// Payload chunks awaiting socket write; the front chunk may be
    /// partially written.
    outbound: VecDeque<Vec<u8>>,
    pub outbound_bytes: usize,
    /// Readiness observed while reads were deferred by backpressure.
    pub read_deferred: bool,
    /// The peer has been told about this stream, so a local close must be
    /// signalled with a zero-length frame.
    pub announced: bool,
    pub writable_armed: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            socket: None,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            read_deferred: false,
            announced: false,
            writable_armed: false,
        }
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Queue bytes for the socket without touching it.
    pub fn queue_outbound(&mut self, bytes: &[u8]) {
        self.outbound_bytes += bytes.len();
        self.outbound.push_back(bytes.to_vec());
    }

    /// Hand bytes to the socket, queueing whatever does not go through.
    /// Anything already queued keeps its place; ordering is per-socket
    /// FIFO.
    pub fn deliver(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.outbound.is_empty() {
            if let Some(socket) = self.socket.as_mut() {
                let mut offset = 0;
                while offset < bytes.len() {
                    match socket.write(&bytes[offset..]) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => offset += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
                if offset < bytes.len() {
                    self.queue_outbound(&bytes[offset..]);
                }
                return Ok(());
            }
        }
        self.queue_outbound(bytes);
        self.flush_outbound()
    }

    /// Write queued chunks until the socket blocks or the queue empties.
    pub fn flush_outbound(&mut self) -> io::Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        while let Some(front) = self.outbound.front_mut() {
            match socket.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound_bytes -= n;
                    if n == front.len() {
                        self.outbound.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Keep WRITABLE interest in sync with what the slot is waiting for:
    /// queued bytes, or connect completion.
    pub fn update_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(());
        };
        let want_write = !self.outbound.is_empty() || self.state == SlotState::Connecting;
        if want_write != self.writable_armed {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            registry.reregister(socket, token, interest)?;
            self.writable_armed = want_write;
        }
        Ok(())
    }
}

pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self { slots: (0..capacity).map(|_| Slot::new()).collect() }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserve the lowest free id for a fresh guest-side stream. Scanning
    /// from zero keeps allocation deterministic for a given arrival order.
    pub fn allocate(&mut self) -> Option<u16> {
        let id = self.slots.iter().position(|slot| slot.state == SlotState::Free)?;
        self.slots[id].state = SlotState::Negotiating;
        Some(id as u16)
    }

    /// Attach the accepted socket to a just-allocated slot.
    pub fn attach(&mut self, id: u16, socket: TcpStream) {
        if let Some(slot) = self.slots.get_mut(usize::from(id)) {
            slot.socket = Some(socket);
        }
    }

    pub fn get(&self, id: u16) -> Option<&Slot> {
        self.slots.get(usize::from(id))
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Slot> {
        self.slots.get_mut(usize::from(id))
    }

    pub fn state(&self, id: u16) -> Option<SlotState> {
        self.get(id).map(|slot| slot.state)
    }

    /// Tear down `id`: deregister and shut the socket, discard buffered
    /// work, return the slot to `Free`. Safe to call repeatedly — only the
    /// first call does anything, and it reports `true`.
    pub fn close(&mut self, id: u16, registry: &Registry) -> bool {
        let Some(slot) = self.slots.get_mut(usize::from(id)) else {
            return false;
        };
        if slot.state == SlotState::Free {
            return false;
        }
        if let Some(mut socket) = slot.socket.take() {
            let _ = registry.deregister(&mut socket);
            let _ = socket.shutdown(Shutdown::Both);
        }
        *slot = Slot::new();
        trace!(stream = id, "slot freed");
        true
    }

    pub fn close_all(&mut self, registry: &Registry) {
        for id in 0..self.slots.len() {
            self.close(id as u16, registry);
        }
    }

    /// Ids whose reads were deferred by backpressure.
    pub fn deferred_ids(&self) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.read_deferred)
            .map(|(id, _)| id as u16)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use mio::Poll;

    use super::*;

    #[test]
    fn allocates_lowest_free_id_in_order() {
        let mut table = SlotTable::new(4);
        assert_eq!(table.allocate(), Some(0));
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.allocate(), Some(2));
        assert_eq!(table.state(1), Some(SlotState::Negotiating));
    }

    #[test]
    fn allocation_exhausts_at_capacity() {
        let mut table = SlotTable::new(3);
        for expected in 0..3 {
            assert_eq!(table.allocate(), Some(expected));
        }
        assert_eq!(table.allocate(), None);
    }

    #[test]
    fn freed_id_is_reused_lowest_first() {
        let poll = Poll::new().unwrap();
        let mut table = SlotTable::new(4);
        for _ in 0..4 {
            table.allocate();
        }
        table.close(1, poll.registry());
        table.close(3, poll.registry());
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.allocate(), Some(3));
        assert_eq!(table.allocate(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let poll = Poll::new().unwrap();
        let mut table = SlotTable::new(2);
        table.allocate();
        assert!(table.close(0, poll.registry()));
        assert!(!table.close(0, poll.registry()));
        assert_eq!(table.state(0), Some(SlotState::Free));
    }

    #[test]
    fn close_on_free_slot_is_a_noop() {
        let poll = Poll::new().unwrap();
        let mut table = SlotTable::new(2);
        assert!(!table.close(1, poll.registry()));
        assert!(!table.close(5, poll.registry()));
    }

    #[test]
    fn close_discards_buffered_work() {
        let poll = Poll::new().unwrap();
        let mut table = SlotTable::new(1);
        table.allocate();
        let slot = table.get_mut(0).unwrap();
        slot.queue_outbound(b"left over");
        slot.announced = true;

        table.close(0, poll.registry());
        let slot = table.get(0).unwrap();
        assert!(!slot.has_outbound());
        assert_eq!(slot.outbound_bytes, 0);
        assert!(!slot.announced);
    }

    #[test]
    fn lookup_rejects_out_of_range_ids() {
        let table = SlotTable::new(64);
        assert!(table.get(63).is_some());
        assert!(table.get(64).is_none());
        assert!(table.get(u16::MAX).is_none());
    }
}
