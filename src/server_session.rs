use crate::control_messages::{AckPayload, SessionOpenPayload};
use crate::driver::Driver;
use crate::inbound::InboundMessage;
use crate::outbound::OutboundMessage;
use crate::packet_header::{Direction, FragmentHeader, PayloadKind, NO_HINT};
use crate::rpc::TransportError;
use crate::session_table::{TableEntry, NO_NEXT_FREE};
use crate::timer::TimerRegistry;
use crate::transport::{Io, ReadyRpc};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ServerChannelState {
    Idle,
    Receiving,
    Processing,
    SendingWaiting,
}

/// Server channels carry no timers: the client's retransmits drive request recovery
///  and its inactivity acks drive response recovery.
pub(crate) struct ServerChannel {
    state: ServerChannelState,
    /// Starts one below zero (wrapping) so the first RPC on the channel, id 0, is
    ///  accepted as "current + 1".
    rpc_id: u32,
    outbound: OutboundMessage,
    inbound: InboundMessage,
}

impl ServerChannel {
    fn new(max_staging_fragments: u32) -> ServerChannel {
        ServerChannel {
            state: ServerChannelState::Idle,
            rpc_id: u32::MAX,
            outbound: OutboundMessage::new(max_staging_fragments as usize + 1, None),
            inbound: InboundMessage::new(max_staging_fragments as usize, None),
        }
    }
}

/// Server half of a session: a fixed array of channels, the peer's address and hint,
///  and the token that authenticates the peer's packets.
pub(crate) struct ServerSession {
    id: u32,
    next_free: u32,
    token: Option<u64>,
    client_addr: Option<SocketAddr>,
    client_session_hint: u32,
    last_activity_time: u64,
    channels: Vec<ServerChannel>,
}

impl ServerSession {
    pub fn new(id: u32, num_channels: u32, max_staging_fragments: u32) -> ServerSession {
        ServerSession {
            id,
            next_free: NO_NEXT_FREE,
            token: None,
            client_addr: None,
            client_session_hint: NO_HINT,
            last_activity_time: 0,
            channels: (0..num_channels)
                .map(|_| ServerChannel::new(max_staging_fragments))
                .collect(),
        }
    }

    pub fn token(&self) -> Option<u64> {
        self.token
    }

    /// Bind this slot to a new client and answer its SESSION_OPEN. The token is built
    ///  from two independent 32-bit draws; it has to be unpredictable enough that a
    ///  stale client cannot stumble into someone else's session, nothing more.
    pub fn start_session<D: Driver>(
        &mut self,
        client_addr: SocketAddr,
        client_session_hint: u32,
        io: &mut Io<'_, D>,
    ) {
        self.client_addr = Some(client_addr);
        self.client_session_hint = client_session_hint;
        let token = (u64::from(rand::random::<u32>()) << 32) | u64::from(rand::random::<u32>());
        self.token = Some(token);

        let header = FragmentHeader {
            session_token: token,
            rpc_id: 0,
            client_session_hint,
            server_session_hint: self.id,
            frag_number: 0,
            total_frags: 0,
            channel_id: 0,
            direction: Direction::ServerToClient,
            payload_kind: PayloadKind::SessionOpen,
            request_ack: false,
            please_drop: false,
        };
        let payload = SessionOpenPayload {
            max_channel_id: (self.channels.len() - 1) as u8,
        };
        let mut payload_buf = BytesMut::with_capacity(1);
        payload.ser(&mut payload_buf);

        debug!("server session {}: opened for {:?}", self.id, client_addr);
        io.send_packet(client_addr, &header, &payload_buf);
        self.last_activity_time = io.now;
    }

    pub fn process_inbound_packet<D: Driver>(
        &mut self,
        header: &FragmentHeader,
        payload: Bytes,
        io: &mut Io<'_, D>,
        ready: &mut VecDeque<ReadyRpc>,
    ) {
        self.last_activity_time = io.now;

        let channel_id = header.channel_id as usize;
        if channel_id >= self.channels.len() {
            debug!("server session {}: channel {} out of range - dropping", self.id, channel_id);
            return;
        }

        let channel = &self.channels[channel_id];
        if channel.rpc_id == header.rpc_id {
            match header.payload_kind {
                PayloadKind::Data => {
                    self.process_received_data(channel_id, header, payload, io, ready)
                }
                PayloadKind::Ack => self.process_received_ack(channel_id, payload, io),
                _ => debug!(
                    "server session {}: unexpected payload kind for current rpc - dropping",
                    self.id
                ),
            }
        }
        else if channel.rpc_id.wrapping_add(1) == header.rpc_id {
            // the next rpc on this channel begins; whatever the previous one left
            //  behind is done with
            if header.payload_kind == PayloadKind::Data {
                trace!("server session {}: starting rpc {} on channel {}", self.id, header.rpc_id, channel_id);
                let channel = &mut self.channels[channel_id];
                channel.state = ServerChannelState::Receiving;
                channel.rpc_id = header.rpc_id;
                channel.inbound.clear(io.timers);
                channel.outbound.clear(io.timers);
                channel.inbound.init(
                    header.total_frags as u32,
                    io.timers,
                    io.now,
                    io.config.retransmit_timeout_millis,
                );
                self.process_received_data(channel_id, header, payload, io, ready);
            }
            else {
                debug!("server session {}: new rpc id with non-data payload - dropping", self.id);
            }
        }
        else {
            debug!(
                "server session {}: dropping packet for rpc {} (channel is at {})",
                self.id, header.rpc_id, channel.rpc_id
            );
        }
    }

    /// PROCESSING -> SENDING_WAITING: the service layer produced the reply, stream it.
    pub fn begin_sending<D: Driver>(
        &mut self,
        channel_id: u8,
        rpc_id: u32,
        reply: Bytes,
        io: &mut Io<'_, D>,
    ) -> Result<(), TransportError> {
        let channel_id = channel_id as usize;
        let current = self
            .channels
            .get(channel_id)
            .ok_or(TransportError::StaleRpc)?;
        if current.state != ServerChannelState::Processing || current.rpc_id != rpc_id {
            return Err(TransportError::StaleRpc);
        }

        let to = self.client_addr.expect("processing channel without a client address");
        let proto = self.fill_header(channel_id);
        let channel = &mut self.channels[channel_id];
        channel.state = ServerChannelState::SendingWaiting;
        channel.outbound.begin_sending(reply, to, &proto, io);
        self.last_activity_time = io.now;
        Ok(())
    }

    /// Detach the reassembled request for a ready-queue entry, if the channel still
    ///  holds it.
    pub fn take_ready_request(&mut self, channel_id: u8, rpc_id: u32) -> Option<Bytes> {
        let channel = self.channels.get_mut(channel_id as usize)?;
        if channel.state != ServerChannelState::Processing
            || channel.rpc_id != rpc_id
            || !channel.inbound.is_active()
            || !channel.inbound.is_complete()
        {
            return None;
        }
        Some(channel.inbound.take_assembled())
    }

    fn process_received_data<D: Driver>(
        &mut self,
        channel_id: usize,
        header: &FragmentHeader,
        payload: Bytes,
        io: &mut Io<'_, D>,
        ready: &mut VecDeque<ReadyRpc>,
    ) {
        let to = self.client_addr.expect("session without a client address");
        let proto = self.fill_header(channel_id);

        match self.channels[channel_id].state {
            ServerChannelState::Idle => {}
            ServerChannelState::Receiving => {
                let channel = &mut self.channels[channel_id];
                if channel.inbound.process_received_data(header, payload, to, &proto, io) {
                    trace!(
                        "server session {}: request {} complete on channel {}",
                        self.id, channel.rpc_id, channel_id
                    );
                    ready.push_back(ReadyRpc {
                        session: self.id,
                        channel: channel_id as u8,
                        rpc_id: channel.rpc_id,
                    });
                    channel.state = ServerChannelState::Processing;
                }
            }
            ServerChannelState::Processing => {
                // the client has not heard our acks - reassure it the request arrived
                if header.request_ack {
                    self.channels[channel_id].inbound.send_ack(to, &proto, io);
                }
            }
            ServerChannelState::SendingWaiting => {
                warn!(
                    "server session {}: extraneous data packet while sending reply on channel {}",
                    self.id, channel_id
                );
                io.stats.spurious_send_waiting_data += 1;
                self.channels[channel_id].outbound.send(to, &proto, io);
            }
        }
    }

    fn process_received_ack<D: Driver>(&mut self, channel_id: usize, payload: Bytes, io: &mut Io<'_, D>) {
        if self.channels[channel_id].state != ServerChannelState::SendingWaiting {
            return;
        }
        let ack = match AckPayload::deser(&mut payload.as_ref()) {
            Ok(ack) => ack,
            Err(_) => {
                debug!("server session {}: undecodable ack - dropping", self.id);
                return;
            }
        };
        let to = self.client_addr.expect("sending channel without a client address");
        let proto = self.fill_header(channel_id);
        // a fully acked reply leaves the channel in SENDING_WAITING; the next rpc id
        //  on this channel retires it
        self.channels[channel_id].outbound.process_received_ack(&ack, to, &proto, io);
    }

    fn fill_header(&self, channel_id: usize) -> FragmentHeader {
        FragmentHeader {
            session_token: self.token.unwrap_or(0),
            rpc_id: self.channels[channel_id].rpc_id,
            client_session_hint: self.client_session_hint,
            server_session_hint: self.id,
            frag_number: 0,
            total_frags: 0,
            channel_id: channel_id as u8,
            direction: Direction::ServerToClient,
            payload_kind: PayloadKind::Data,
            request_ack: false,
            please_drop: false,
        }
    }
}

impl TableEntry for ServerSession {
    fn next_free(&self) -> u32 {
        self.next_free
    }

    fn set_next_free(&mut self, next: u32) {
        self.next_free = next;
    }

    fn last_activity_time(&self) -> u64 {
        self.last_activity_time
    }

    fn try_expire(&mut self, timers: &mut TimerRegistry) -> bool {
        if self.last_activity_time == 0 {
            return true;
        }
        // a request the service layer is still working on pins the session
        if self
            .channels
            .iter()
            .any(|c| c.state == ServerChannelState::Processing)
        {
            return false;
        }

        for channel in &mut self.channels {
            if channel.state == ServerChannelState::Idle {
                continue;
            }
            channel.state = ServerChannelState::Idle;
            channel.rpc_id = u32::MAX;
            channel.inbound.clear(timers);
            channel.outbound.clear(timers);
        }
        self.token = None;
        self.client_session_hint = NO_HINT;
        self.client_addr = None;
        self.last_activity_time = 0;
        true
    }
}
