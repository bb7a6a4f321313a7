use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// A packet handed out by the driver. The payload is a refcounted slice of the
///  driver's receive buffer: slicing fragments out of it ("stealing" them into the
///  staging ring or the destination buffer) keeps the backing storage alive, and the
///  storage returns to the allocator when the last slice is dropped. That makes
///  "release exactly once" a property of ownership rather than of discipline.
#[derive(Clone, Debug)]
pub struct ReceivedPacket {
    pub addr: SocketAddr,
    pub data: Bytes,
}

/// The unreliable datagram driver underneath the transport.
///
/// The driver delivers and sends fixed-size packets with best-effort semantics: loss,
///  reordering and duplication are all permitted. It must never block - `try_recv_packet`
///  returns `None` when nothing is pending so the poll loop can fire timers.
///
/// This is an abstraction seam introduced to keep the I/O (and, in tests, the simulated
///  network) out of the protocol engine.
#[cfg_attr(test, automock)]
pub trait Driver {
    /// Fixed maximum packet size for this driver, header included.
    fn max_payload_size(&self) -> usize;

    /// Best-effort send of a fully assembled packet (header followed by payload).
    ///  Errors are the driver's to log; the transport's retransmission logic recovers
    ///  from silently lost sends the same way it recovers from lost packets.
    fn send_packet(&mut self, to: SocketAddr, packet: &[u8]);

    /// Non-blocking receive.
    fn try_recv_packet(&mut self) -> Option<ReceivedPacket>;
}
