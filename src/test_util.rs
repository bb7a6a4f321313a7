//! Runnable fixtures for exercising the transport without real I/O or real time: an
//!  in-memory packet network with fault-injection hooks, a hand-cranked clock, and a
//!  driver that just records what it is told to send.

use crate::clock::Clock;
use crate::driver::{Driver, ReceivedPacket};
use crate::packet_header::FragmentHeader;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

/// Clock that only moves when the test says so.
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn new() -> Rc<ManualClock> {
        Rc::new(ManualClock { now: Cell::new(0) })
    }

    pub fn advance(&self, millis: u64) {
        self.now.set(self.now.get() + millis);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.get()
    }
}

/// The shared medium between [`SimDriver`]s: one delivery queue per address, a log of
///  every transmitted header, and an optional per-packet drop hook.
#[derive(Default)]
pub struct SimNet {
    pub queues: FxHashMap<SocketAddr, VecDeque<ReceivedPacket>>,
    /// Every header that made it onto the "wire", in transmission order.
    pub log: Vec<FragmentHeader>,
    /// Return true to make the network eat the packet.
    pub drop_fn: Option<Box<dyn FnMut(&FragmentHeader) -> bool>>,
}

impl SimNet {
    pub fn new() -> Rc<RefCell<SimNet>> {
        Rc::new(RefCell::new(SimNet::default()))
    }
}

/// Driver backed by a [`SimNet`]. Several drivers on the same net form a network;
///  a single transport whose driver sends to its own address talks to itself (the
///  direction bit keeps the client and server halves apart).
pub struct SimDriver {
    net: Rc<RefCell<SimNet>>,
    local_addr: SocketAddr,
    max_payload: usize,
}

impl SimDriver {
    pub fn new(net: Rc<RefCell<SimNet>>, local_addr: SocketAddr, max_payload: usize) -> SimDriver {
        SimDriver {
            net,
            local_addr,
            max_payload,
        }
    }
}

impl Driver for SimDriver {
    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn send_packet(&mut self, to: SocketAddr, packet: &[u8]) {
        let mut net = self.net.borrow_mut();
        if let Ok(header) = FragmentHeader::deser(&mut &packet[..]) {
            if let Some(drop_fn) = &mut net.drop_fn {
                if drop_fn(&header) {
                    return;
                }
            }
            net.log.push(header);
        }
        net.queues.entry(to).or_default().push_back(ReceivedPacket {
            addr: self.local_addr,
            data: Bytes::copy_from_slice(packet),
        });
    }

    fn try_recv_packet(&mut self) -> Option<ReceivedPacket> {
        self.net
            .borrow_mut()
            .queues
            .get_mut(&self.local_addr)?
            .pop_front()
    }
}

/// Driver that records outgoing packets and never receives anything. For unit tests
///  that assert exactly what a component put on the wire.
pub struct RecordingDriver {
    pub max_payload: usize,
    pub sent: Vec<(SocketAddr, Bytes)>,
}

impl RecordingDriver {
    pub fn new(max_payload: usize) -> RecordingDriver {
        RecordingDriver {
            max_payload,
            sent: Vec::new(),
        }
    }
}

impl Driver for RecordingDriver {
    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    fn send_packet(&mut self, to: SocketAddr, packet: &[u8]) {
        self.sent.push((to, Bytes::copy_from_slice(packet)));
    }

    fn try_recv_packet(&mut self) -> Option<ReceivedPacket> {
        None
    }
}

/// Split a raw packet back into header and payload.
pub fn decode_packet(packet: &Bytes) -> (FragmentHeader, &[u8]) {
    let mut slice: &[u8] = packet;
    let header = FragmentHeader::deser(&mut slice).expect("packet with undecodable header");
    (header, slice)
}

#[cfg(test)]
pub(crate) use io_parts::{test_io, TestIoParts};
