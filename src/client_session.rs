use crate::control_messages::{AckPayload, SessionOpenPayload};
use crate::driver::Driver;
use crate::inbound::InboundMessage;
use crate::outbound::OutboundMessage;
use crate::packet_header::{Direction, FragmentHeader, PayloadKind, NO_HINT};
use crate::rpc::ClientRpc;
use crate::session_table::{TableEntry, NO_NEXT_FREE};
use crate::timer::{TimerKey, TimerOutcome, TimerRegistry};
use crate::transport::Io;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ClientChannelState {
    Idle,
    Sending,
    Receiving,
}

pub(crate) struct ClientChannel {
    state: ClientChannelState,
    rpc_id: u32,
    current_rpc: Option<ClientRpc>,
    outbound: OutboundMessage,
    inbound: InboundMessage,
}

impl ClientChannel {
    fn new(session: u32, channel: u8, max_staging_fragments: u32) -> ClientChannel {
        ClientChannel {
            state: ClientChannelState::Idle,
            rpc_id: 0,
            current_rpc: None,
            outbound: OutboundMessage::new(
                max_staging_fragments as usize + 1,
                Some(TimerKey::ClientOutbound { session, channel }),
            ),
            inbound: InboundMessage::new(
                max_staging_fragments as usize,
                Some(TimerKey::ClientInbound { session, channel }),
            ),
        }
    }
}

/// Client half of a session: up to `max_channels_per_session` channels once the server
///  has answered the SESSION_OPEN, plus a FIFO of RPCs waiting for a free channel.
pub(crate) struct ClientSession {
    id: u32,
    next_free: u32,
    token: Option<u64>,
    server_addr: Option<SocketAddr>,
    server_session_hint: u32,
    last_activity_time: u64,
    channels: Vec<ClientChannel>,
    channel_queue: VecDeque<ClientRpc>,
}

impl ClientSession {
    pub fn new(id: u32) -> ClientSession {
        ClientSession {
            id,
            next_free: NO_NEXT_FREE,
            token: None,
            server_addr: None,
            server_session_hint: NO_HINT,
            last_activity_time: 0,
            channels: Vec::new(),
            channel_queue: VecDeque::new(),
        }
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Connected means the SESSION_OPEN handshake completed and channels exist.
    pub fn is_connected(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Transmit a SESSION_OPEN to the server. `server_addr` is `None` on a reconnect,
    ///  which reuses the stored address.
    pub fn connect<D: Driver>(&mut self, server_addr: Option<SocketAddr>, io: &mut Io<'_, D>) {
        if let Some(addr) = server_addr {
            self.server_addr = Some(addr);
        }
        let to = self
            .server_addr
            .expect("connect without a server address");

        let header = FragmentHeader {
            session_token: self.token.unwrap_or(0),
            rpc_id: 0,
            client_session_hint: self.id,
            server_session_hint: self.server_session_hint,
            frag_number: 0,
            total_frags: 0,
            channel_id: 0,
            direction: Direction::ClientToServer,
            payload_kind: PayloadKind::SessionOpen,
            request_ack: false,
            please_drop: false,
        };
        debug!("session {}: sending SESSION_OPEN to {:?}", self.id, to);
        io.send_packet(to, &header, &[]);
        self.last_activity_time = io.now;
    }

    /// Run `rpc` on an idle channel, or queue it if none is free (or the session is
    ///  not connected yet).
    pub fn start_rpc<D: Driver>(&mut self, rpc: ClientRpc, io: &mut Io<'_, D>) {
        self.last_activity_time = io.now;
        match self
            .channels
            .iter()
            .position(|c| c.state == ClientChannelState::Idle)
        {
            None => {
                debug!("session {}: no idle channel, queueing rpc", self.id);
                self.channel_queue.push_back(rpc);
            }
            Some(i) => self.bind_rpc_to_channel(i, rpc, io),
        }
    }

    pub fn process_inbound_packet<D: Driver>(
        &mut self,
        header: &FragmentHeader,
        payload: Bytes,
        io: &mut Io<'_, D>,
    ) {
        self.last_activity_time = io.now;

        let channel_id = header.channel_id as usize;
        if channel_id >= self.channels.len() {
            if header.payload_kind == PayloadKind::SessionOpen {
                self.process_session_open_response(header, payload, io);
            }
            else {
                debug!("session {}: packet for channel {} out of range - dropping", self.id, channel_id);
            }
            return;
        }

        // the SESSION_OPEN response delivered the token; everything after it must
        //  carry it back
        if self.token != Some(header.session_token) {
            debug!("session {}: token mismatch - dropping", self.id);
            return;
        }

        if self.channels[channel_id].rpc_id == header.rpc_id {
            match header.payload_kind {
                PayloadKind::Data => self.process_received_data(channel_id, header, payload, io),
                PayloadKind::Ack => self.process_received_ack(channel_id, payload, io),
                PayloadKind::BadSession => {
                    debug!("session {}: server reports BAD_SESSION - reconnecting", self.id);
                    self.handle_bad_session(io);
                }
                PayloadKind::SessionOpen => {
                    debug!("session {}: unexpected payload kind for current rpc - dropping", self.id);
                }
            }
        }
        else if header.payload_kind == PayloadKind::Data && header.request_ack {
            // data for a retired rpc asking for an ack: the peer will retransmit with
            //  the current rpc id or the session will expire
            io.stats.stale_rpc_acks += 1;
            debug!("session {}: stale rpc {} requests an ack - ignoring", self.id, header.rpc_id);
        }
        else {
            debug!("session {}: dropping packet for old rpc {}", self.id, header.rpc_id);
        }
    }

    /// Abort every in-flight and queued RPC and reset the session to its
    ///  unconnected state.
    pub fn close(&mut self, timers: &mut TimerRegistry) {
        debug!("closing session {}", self.id);
        for channel in &mut self.channels {
            if let Some(rpc) = channel.current_rpc.take() {
                rpc.aborted();
            }
        }
        while let Some(rpc) = self.channel_queue.pop_front() {
            rpc.aborted();
        }
        self.clear_channels(timers);
        self.server_session_hint = NO_HINT;
        self.token = None;
    }

    pub fn on_outbound_timer<D: Driver>(&mut self, channel_id: u8, io: &mut Io<'_, D>) {
        let channel_id = channel_id as usize;
        if channel_id >= self.channels.len() || !self.channels[channel_id].outbound.is_active() {
            return;
        }
        let to = self.server_addr.expect("active channel without a server address");
        let proto = self.fill_header(channel_id);

        if self.channels[channel_id].outbound.on_timer(to, &proto, io) == TimerOutcome::SessionDead {
            warn!("session {}: request retransmit budget exhausted - aborting", self.id);
            self.close(io.timers);
        }
    }

    pub fn on_inbound_timer<D: Driver>(&mut self, channel_id: u8, io: &mut Io<'_, D>) {
        let channel_id = channel_id as usize;
        if channel_id >= self.channels.len() || !self.channels[channel_id].inbound.is_active() {
            return;
        }
        let to = self.server_addr.expect("active channel without a server address");
        let proto = self.fill_header(channel_id);

        if self.channels[channel_id].inbound.on_timer(to, &proto, io) == TimerOutcome::SessionDead {
            warn!("session {}: response stalled past the inactivity budget - aborting", self.id);
            self.close(io.timers);
        }
    }

    fn process_received_data<D: Driver>(
        &mut self,
        channel_id: usize,
        header: &FragmentHeader,
        payload: Bytes,
        io: &mut Io<'_, D>,
    ) {
        if self.channels[channel_id].state == ClientChannelState::Idle {
            return;
        }

        // first response fragment: the request is over as far as we are concerned
        if self.channels[channel_id].state == ClientChannelState::Sending {
            let channel = &mut self.channels[channel_id];
            channel.outbound.clear(io.timers);
            channel.inbound.init(
                header.total_frags as u32,
                io.timers,
                io.now,
                io.config.retransmit_timeout_millis,
            );
            channel.state = ClientChannelState::Receiving;
        }

        let to = self.server_addr.expect("receiving channel without a server address");
        let proto = self.fill_header(channel_id);
        let complete =
            self.channels[channel_id].inbound.process_received_data(header, payload, to, &proto, io);
        if !complete {
            return;
        }

        let channel = &mut self.channels[channel_id];
        trace!("session {}: rpc {} completed on channel {}", self.id, channel.rpc_id, channel_id);
        let response = channel.inbound.take_assembled();
        if let Some(rpc) = channel.current_rpc.take() {
            rpc.completed(response);
        }
        channel.rpc_id += 1;
        channel.outbound.clear(io.timers);
        channel.inbound.clear(io.timers);

        match self.channel_queue.pop_front() {
            None => {
                let channel = &mut self.channels[channel_id];
                channel.state = ClientChannelState::Idle;
                channel.current_rpc = None;
            }
            Some(rpc) => self.bind_rpc_to_channel(channel_id, rpc, io),
        }
    }

    fn process_received_ack<D: Driver>(&mut self, channel_id: usize, payload: Bytes, io: &mut Io<'_, D>) {
        if self.channels[channel_id].state != ClientChannelState::Sending {
            debug!("session {}: ack outside of SENDING - dropping", self.id);
            return;
        }
        let ack = match AckPayload::deser(&mut payload.as_ref()) {
            Ok(ack) => ack,
            Err(_) => {
                debug!("session {}: undecodable ack - dropping", self.id);
                return;
            }
        };
        let to = self.server_addr.expect("sending channel without a server address");
        let proto = self.fill_header(channel_id);
        // a fully acked request does not change channel state - the response's first
        //  DATA fragment does that
        self.channels[channel_id].outbound.process_received_ack(&ack, to, &proto, io);
    }

    /// The server told us it does not know this session: requeue everything that was
    ///  running, tear the channels down and restart the handshake.
    fn handle_bad_session<D: Driver>(&mut self, io: &mut Io<'_, D>) {
        for channel in &mut self.channels {
            if let Some(rpc) = channel.current_rpc.take() {
                self.channel_queue.push_back(rpc);
            }
        }
        self.clear_channels(io.timers);
        self.server_session_hint = NO_HINT;
        self.token = None;
        self.connect(None, io);
    }

    fn process_session_open_response<D: Driver>(
        &mut self,
        header: &FragmentHeader,
        payload: Bytes,
        io: &mut Io<'_, D>,
    ) {
        if self.is_connected() {
            debug!("session {}: duplicate SESSION_OPEN response - dropping", self.id);
            return;
        }
        let response = match SessionOpenPayload::deser(&mut payload.as_ref()) {
            Ok(response) => response,
            Err(_) => {
                debug!("session {}: undecodable SESSION_OPEN response - dropping", self.id);
                return;
            }
        };

        self.server_session_hint = header.server_session_hint;
        self.token = Some(header.session_token);

        let num_channels =
            (response.max_channel_id as u32 + 1).min(io.config.max_channels_per_session);
        debug!("session {}: open with {} channels", self.id, num_channels);
        self.channels = (0..num_channels)
            .map(|i| ClientChannel::new(self.id, i as u8, io.config.max_staging_fragments))
            .collect();

        for i in 0..num_channels as usize {
            match self.channel_queue.pop_front() {
                None => break,
                Some(rpc) => {
                    trace!("session {}: assigning queued rpc to channel {}", self.id, i);
                    self.bind_rpc_to_channel(i, rpc, io);
                }
            }
        }
    }

    fn bind_rpc_to_channel<D: Driver>(&mut self, channel_id: usize, rpc: ClientRpc, io: &mut Io<'_, D>) {
        let to = self.server_addr.expect("starting an rpc without a server address");
        let proto = self.fill_header(channel_id);
        let channel = &mut self.channels[channel_id];
        channel.state = ClientChannelState::Sending;
        let request = rpc.request();
        channel.current_rpc = Some(rpc);
        channel.outbound.begin_sending(request, to, &proto, io);
    }

    fn clear_channels(&mut self, timers: &mut TimerRegistry) {
        for channel in &mut self.channels {
            channel.outbound.clear(timers);
            channel.inbound.clear(timers);
        }
        self.channels.clear();
    }

    fn fill_header(&self, channel_id: usize) -> FragmentHeader {
        FragmentHeader {
            session_token: self.token.unwrap_or(0),
            rpc_id: self.channels[channel_id].rpc_id,
            client_session_hint: self.id,
            server_session_hint: self.server_session_hint,
            frag_number: 0,
            total_frags: 0,
            channel_id: channel_id as u8,
            direction: Direction::ClientToServer,
            payload_kind: PayloadKind::Data,
            request_ack: false,
            please_drop: false,
        }
    }
}

impl TableEntry for ClientSession {
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
        if self.channels.iter().any(|c| c.current_rpc.is_some()) {
            return false;
        }
        if !self.channel_queue.is_empty() {
            return false;
        }
        self.close(timers);
        self.server_addr = None;
        self.last_activity_time = 0;
        true
    }
}
