use crate::control_messages::AckPayload;
use crate::driver::Driver;
use crate::packet_header::{FragmentHeader, PayloadKind};
use crate::ring::Ring;
use crate::timer::{TimerKey, TimerOutcome, TimerRegistry};
use crate::transport::Io;
use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Send state of one fragment, relative to the window start.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) enum SentTime {
    #[default]
    NotSent,
    Sent(u64),
    Acked,
}

/// One message being transmitted: window-limited fragment sends, selective-ack
///  processing, retransmission on timeout.
///
/// The `sent_times` ring covers fragments `first_missing_frag ..` - slot 0 is the
///  first unacknowledged fragment. Its length is `max_staging_fragments + 1` because
///  the receiver can hold at most that many fragments beyond (and including) its first
///  gap, so no fragment further out is ever in flight.
pub(crate) struct OutboundMessage {
    send_buffer: Option<Bytes>,
    total_frags: u32,
    first_missing_frag: u32,
    /// Total count of acknowledged fragments, including those acknowledged out of
    ///  order via the staging vector. Bounds the window together with `window_size`.
    num_acked: u32,
    packets_since_ack_req: u32,
    sent_times: Ring<SentTime>,
    timeouts: u32,
    timer_key: Option<TimerKey>,
}

impl OutboundMessage {
    pub fn new(ring_len: usize, timer_key: Option<TimerKey>) -> OutboundMessage {
        OutboundMessage {
            send_buffer: None,
            total_frags: 0,
            first_missing_frag: 0,
            num_acked: 0,
            packets_since_ack_req: 0,
            sent_times: Ring::new(ring_len),
            timeouts: 0,
            timer_key,
        }
    }

    pub fn is_active(&self) -> bool {
        self.send_buffer.is_some()
    }

    /// Start transmitting `buf`. The message must be inactive (freshly constructed or
    ///  `clear()`ed). An empty message still occupies one fragment so the receiver has
    ///  something to acknowledge.
    pub fn begin_sending<D: Driver>(
        &mut self,
        buf: Bytes,
        to: SocketAddr,
        proto: &FragmentHeader,
        io: &mut Io<'_, D>,
    ) {
        assert!(self.send_buffer.is_none(), "begin_sending on an active message");

        let per_frag = io.data_per_fragment();
        self.total_frags = (buf.len().div_ceil(per_frag) as u32).max(1);
        self.send_buffer = Some(buf);
        self.send(to, proto, io);
    }

    /// Transmit whatever the window currently allows.
    ///
    /// If a fragment is retransmitted it carries an ack request and the scan stops -
    ///  one timeout must not stampede the whole window onto an already struggling
    ///  path. Fresh fragments carry an ack request every `req_ack_after` packets,
    ///  except on the final fragment (completion is acknowledged through the RPC state
    ///  machine instead).
    pub fn send<D: Driver>(&mut self, to: SocketAddr, proto: &FragmentHeader, io: &mut Io<'_, D>) {
        let Some(send_buffer) = self.send_buffer.clone() else {
            return;
        };
        let now = io.now;
        let timeout = io.config.retransmit_timeout_millis;

        // Upper bound of the candidate range: the end of the message, the ack window,
        //  and what the receiver is currently willing to stage.
        let mut stop = self.total_frags;
        stop = stop.min(self.num_acked + io.config.window_size);
        stop = stop.min(self.first_missing_frag + io.config.max_staging_fragments + 1);

        for i in 0..(stop - self.first_missing_frag) as usize {
            let sent_time = *self.sent_times.get(i);
            match sent_time {
                SentTime::Acked => continue,
                SentTime::Sent(at) if at + timeout >= now => continue,
                _ => {}
            }
            let is_retransmit = matches!(sent_time, SentTime::Sent(_));
            let frag_number = self.first_missing_frag + i as u32;
            let request_ack = is_retransmit
                || (self.packets_since_ack_req == io.config.req_ack_after - 1
                    && frag_number != self.total_frags - 1);

            if is_retransmit {
                debug!("retransmitting fragment {} of {}", frag_number, self.total_frags);
            }
            self.send_one_data(&send_buffer, frag_number, request_ack, to, proto, io);
            self.sent_times.set(i, SentTime::Sent(now));
            if is_retransmit {
                break;
            }
        }

        // Re-arm to just after the earliest outstanding fragment times out.
        if let Some(key) = self.timer_key {
            let mut oldest = None;
            for i in 0..(stop - self.first_missing_frag) as usize {
                match *self.sent_times.get(i) {
                    // once we reach a not-sent slot the rest are not-sent
                    SentTime::NotSent => break,
                    SentTime::Acked => continue,
                    SentTime::Sent(at) => {
                        oldest = Some(oldest.map_or(at, |o: u64| o.min(at)));
                    }
                }
            }
            if let Some(oldest) = oldest {
                io.timers.add(key, oldest + timeout);
            }
        }
    }

    /// Incorporate a selective ack, then top the window back up.
    ///
    /// Stale acks (behind the window), impossible acks (past the end of the message)
    ///  and acks that advance further than the ring can represent are dropped whole.
    ///  Processing the same ack twice is a no-op for the window state. Returns whether
    ///  the message is now fully delivered.
    pub fn process_received_ack<D: Driver>(
        &mut self,
        ack: &AckPayload,
        to: SocketAddr,
        proto: &FragmentHeader,
        io: &mut Io<'_, D>,
    ) -> bool {
        if self.send_buffer.is_none() {
            return false;
        }

        if ack.first_missing_frag < self.first_missing_frag {
            debug!("dropped stale ack ({} < {})", ack.first_missing_frag, self.first_missing_frag);
        }
        else if ack.first_missing_frag > self.total_frags {
            debug!("dropped ack past the end of the message");
        }
        else if ack.first_missing_frag > self.first_missing_frag + self.sent_times.len() as u32 {
            debug!("dropped ack that advanced further than the send ring");
        }
        else {
            if ack.first_missing_frag > self.first_missing_frag {
                self.timeouts = 0;
            }
            self.sent_times
                .advance((ack.first_missing_frag - self.first_missing_frag) as usize);
            self.first_missing_frag = ack.first_missing_frag;
            self.num_acked = ack.first_missing_frag;
            for i in 0..self.sent_times.len() - 1 {
                if (ack.staging_vector >> i) & 1 == 1 {
                    self.sent_times.set(i + 1, SentTime::Acked);
                    self.num_acked += 1;
                }
            }
            trace!(
                "ack advanced window to {} ({} of {} acked)",
                self.first_missing_frag, self.num_acked, self.total_frags
            );
        }

        self.send(to, proto, io);
        self.first_missing_frag == self.total_frags
    }

    /// Retransmit timer expired.
    pub fn on_timer<D: Driver>(
        &mut self,
        to: SocketAddr,
        proto: &FragmentHeader,
        io: &mut Io<'_, D>,
    ) -> TimerOutcome {
        self.timeouts += 1;
        if self.timeouts >= io.config.max_retransmit_timeouts {
            debug!("outbound message exhausted its retransmit budget");
            return TimerOutcome::SessionDead;
        }
        self.send(to, proto, io);
        TimerOutcome::Retrying
    }

    pub fn clear(&mut self, timers: &mut TimerRegistry) {
        self.send_buffer = None;
        self.total_frags = 0;
        self.first_missing_frag = 0;
        self.num_acked = 0;
        self.packets_since_ack_req = 0;
        self.sent_times.clear();
        self.timeouts = 0;
        if let Some(key) = self.timer_key {
            timers.remove(key);
        }
    }

    fn send_one_data<D: Driver>(
        &mut self,
        send_buffer: &Bytes,
        frag_number: u32,
        request_ack: bool,
        to: SocketAddr,
        proto: &FragmentHeader,
        io: &mut Io<'_, D>,
    ) {
        let per_frag = io.data_per_fragment();
        let start = (frag_number as usize * per_frag).min(send_buffer.len());
        let end = (start + per_frag).min(send_buffer.len());

        let mut header = proto.clone();
        header.payload_kind = PayloadKind::Data;
        header.frag_number = frag_number as u16;
        header.total_frags = self
            .total_frags
            .try_into()
            .expect("fragment count exceeds the wire format - message size must be validated upstream");
        header.request_ack = request_ack;

        io.send_packet(to, &header, &send_buffer[start..end]);

        if request_ack {
            self.packets_since_ack_req = 0;
        }
        else {
            self.packets_since_ack_req += 1;
        }
    }
}
