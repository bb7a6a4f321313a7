use crate::control_messages::AckPayload;
use crate::driver::Driver;
use crate::packet_header::{FragmentHeader, PayloadKind};
use crate::ring::Ring;
use crate::timer::{TimerKey, TimerOutcome, TimerRegistry};
use crate::transport::Io;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tracing::{debug, trace};

/// One message being received: fragments are appended to the assembly buffer in
///  order, out-of-order arrivals wait in the staging ring.
///
/// Staging slot `i` holds fragment `first_missing_frag + 1 + i` - the first missing
///  fragment itself never has a slot, it goes straight into the assembly buffer when
///  it arrives and then drains whatever prefix of the ring has become contiguous.
pub(crate) struct InboundMessage {
    total_frags: u32,
    first_missing_frag: u32,
    staging: Ring<Option<Bytes>>,
    /// `None` while inactive. Stolen fragment payloads are appended here; the driver's
    ///  receive buffers are released as the refcounted slices are dropped.
    assembly: Option<BytesMut>,
    timeouts: u32,
    timer_key: Option<TimerKey>,
}

impl InboundMessage {
    pub fn new(staging_len: usize, timer_key: Option<TimerKey>) -> InboundMessage {
        InboundMessage {
            total_frags: 0,
            first_missing_frag: 0,
            staging: Ring::new(staging_len),
            assembly: None,
            timeouts: 0,
            timer_key,
        }
    }

    pub fn is_active(&self) -> bool {
        self.assembly.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.first_missing_frag == self.total_frags
    }

    /// Prepare to receive a message of `total_frags` fragments, discarding any prior
    ///  state. Arms the inactivity timer if this message has one.
    pub fn init(&mut self, total_frags: u32, timers: &mut TimerRegistry, now: u64, timeout: u64) {
        self.clear(timers);
        self.total_frags = total_frags;
        self.assembly = Some(BytesMut::new());
        if let Some(key) = self.timer_key {
            timers.add(key, now + timeout);
        }
    }

    /// Incorporate one DATA fragment. Returns whether the message is now complete.
    ///
    /// A fragment whose header disagrees with the initialized total is dropped - the
    ///  peer is confused and nothing useful can be done with the bytes. Duplicates and
    ///  fragments beyond the staging horizon are dropped too; the sender's window
    ///  bound means the latter only happens with a severely delayed packet.
    pub fn process_received_data<D: Driver>(
        &mut self,
        header: &FragmentHeader,
        payload: Bytes,
        to: SocketAddr,
        proto: &FragmentHeader,
        io: &mut Io<'_, D>,
    ) -> bool {
        if header.total_frags as u32 != self.total_frags {
            debug!(
                "fragment claims {} total fragments, message was initialized with {} - dropping",
                header.total_frags, self.total_frags
            );
            return self.is_complete();
        }
        if self.assembly.is_none() {
            return self.is_complete();
        }

        self.timeouts = 0;
        let frag_number = header.frag_number as u32;

        if frag_number == self.first_missing_frag {
            self.append(payload);
            // drain the now-contiguous prefix of the staging ring; the slot of the
            //  (new) first missing fragment is popped empty as part of the same walk
            loop {
                let staged = self.staging.take(0);
                self.staging.advance(1);
                match staged {
                    Some(staged) => self.append(staged),
                    None => break,
                }
            }
        }
        else if frag_number > self.first_missing_frag {
            if frag_number - self.first_missing_frag > self.staging.len() as u32 {
                debug!("fragment {} too far past the gap at {} - dropping", frag_number, self.first_missing_frag);
            }
            else {
                let i = (frag_number - self.first_missing_frag - 1) as usize;
                if self.staging.get(i).is_none() {
                    trace!("staging fragment {} at slot {}", frag_number, i);
                    self.staging.set(i, Some(payload));
                }
                else {
                    debug!("duplicate fragment {} - dropping", frag_number);
                }
            }
        }
        else {
            // already delivered, the ack got lost - the ack request below covers it
            trace!("stale fragment {} below the gap at {}", frag_number, self.first_missing_frag);
        }

        if header.request_ack {
            self.send_ack(to, proto, io);
        }
        if let Some(key) = self.timer_key {
            io.timers.add(key, io.now + io.config.retransmit_timeout_millis);
        }

        self.is_complete()
    }

    /// Tell the sender where the gap is and what is already staged past it.
    pub fn send_ack<D: Driver>(&self, to: SocketAddr, proto: &FragmentHeader, io: &mut Io<'_, D>) {
        let mut staging_vector = 0u32;
        for (i, slot) in self.staging.iter().enumerate() {
            if slot.is_some() {
                staging_vector |= 1 << i;
            }
        }
        let ack = AckPayload {
            first_missing_frag: self.first_missing_frag,
            staging_vector,
        };
        trace!("sending ack: {:?}", ack);

        let mut header = proto.clone();
        header.payload_kind = PayloadKind::Ack;

        let mut payload = BytesMut::with_capacity(AckPayload::SERIALIZED_LEN);
        ack.ser(&mut payload);
        io.send_packet(to, &header, &payload);
    }

    /// Inactivity timer expired: nothing arrived for a full timeout. Re-send the ack
    ///  so the sender learns what is missing, unless the budget is gone.
    pub fn on_timer<D: Driver>(
        &mut self,
        to: SocketAddr,
        proto: &FragmentHeader,
        io: &mut Io<'_, D>,
    ) -> TimerOutcome {
        self.timeouts += 1;
        if self.timeouts >= io.config.max_retransmit_timeouts {
            debug!("inbound message exhausted its inactivity budget");
            return TimerOutcome::SessionDead;
        }
        self.send_ack(to, proto, io);
        if let Some(key) = self.timer_key {
            io.timers.add(key, io.now + io.config.retransmit_timeout_millis);
        }
        TimerOutcome::Retrying
    }

    /// Hand over the reassembled message. Only valid once, after completion.
    pub fn take_assembled(&mut self) -> Bytes {
        assert!(self.is_complete(), "taking an incomplete message");
        self.assembly
            .take()
            .expect("reassembled message already taken")
            .freeze()
    }

    /// Drop all state, releasing staged payloads, and disarm the timer.
    pub fn clear(&mut self, timers: &mut TimerRegistry) {
        self.total_frags = 0;
        self.first_missing_frag = 0;
        self.staging.clear();
        self.assembly = None;
        self.timeouts = 0;
        if let Some(key) = self.timer_key {
            timers.remove(key);
        }
    }

    fn append(&mut self, payload: Bytes) {
        self.assembly
            .as_mut()
            .expect("appending to an inactive message")
            .extend_from_slice(&payload);
        self.first_missing_frag += 1;
    }
}
