use crate::buffer_pool::BufferPool;
use crate::client_session::ClientSession;
use crate::clock::{Clock, MonotonicClock};
use crate::config::TransportConfig;
use crate::driver::Driver;
use crate::packet_header::{Direction, FragmentHeader, PayloadKind};
use crate::rpc::{ClientRpc, RpcState, ServerRpc, TransportError};
use crate::server_session::ServerSession;
use crate::session_table::SessionTable;
use crate::timer::{TimerKey, TimerRegistry};
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Counters for conditions that are handled silently on the wire but worth watching.
#[derive(Clone, Debug, Default)]
pub struct TransportStats {
    /// Packets too short or otherwise undecodable.
    pub malformed_packets: u64,
    /// Packets discarded because the sender set the fault-injection bit.
    pub test_dropped_packets: u64,
    /// BAD_SESSION replies sent to clients we do not know.
    pub bad_session_replies: u64,
    /// DATA packets that arrived on a server channel already streaming its reply.
    pub spurious_send_waiting_data: u64,
    /// DATA for a retired rpc id that asked for an ack.
    pub stale_rpc_acks: u64,
}

/// A completed request waiting for `server_recv` to hand it to the service layer.
pub(crate) struct ReadyRpc {
    pub session: u32,
    pub channel: u8,
    pub rpc_id: u32,
}

/// Everything a session or message needs to act on the outside world, bundled so the
///  borrow of the transport splits cleanly along its fields.
pub(crate) struct Io<'a, D: Driver> {
    pub driver: &'a mut D,
    pub pool: &'a BufferPool,
    pub timers: &'a mut TimerRegistry,
    pub config: &'a TransportConfig,
    pub stats: &'a mut TransportStats,
    pub now: u64,
}

impl<D: Driver> Io<'_, D> {
    pub fn data_per_fragment(&self) -> usize {
        self.driver.max_payload_size() - FragmentHeader::SERIALIZED_LEN
    }

    /// Assemble header + payload into a pooled buffer and hand it to the driver,
    ///  applying the fault-injection knob.
    pub fn send_packet(&mut self, to: SocketAddr, header: &FragmentHeader, payload: &[u8]) {
        let mut header = header.clone();
        header.please_drop = self.config.packet_loss_percentage > 0
            && rand::random_range(0..100u8) < self.config.packet_loss_percentage;

        let mut buf = self.pool.get_from_pool();
        header.ser(&mut buf);
        buf.put_slice(payload);
        self.driver.send_packet(to, &buf);
        self.pool.return_to_pool(buf);
    }
}

/// The transport engine. Single-threaded and cooperative: every state transition
///  happens inside [`poll`](Transport::poll), which the blocking calls
///  ([`get_reply`](Transport::get_reply), [`server_recv`](Transport::server_recv))
///  drive in a loop. Run several transports for parallelism, each with its own
///  driver.
pub struct Transport<D: Driver> {
    driver: D,
    clock: Rc<dyn Clock>,
    config: TransportConfig,
    pool: BufferPool,
    timers: TimerRegistry,
    client_sessions: SessionTable<ClientSession>,
    server_sessions: SessionTable<ServerSession>,
    server_ready_queue: VecDeque<ReadyRpc>,
    /// Which client session talks to which server, so RPCs to the same peer share a
    ///  session.
    sessions_by_addr: FxHashMap<SocketAddr, u32>,
    stats: TransportStats,
}

impl<D: Driver> Transport<D> {
    pub fn new(driver: D, config: TransportConfig) -> anyhow::Result<Transport<D>> {
        Self::with_clock(driver, config, Rc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        driver: D,
        config: TransportConfig,
        clock: Rc<dyn Clock>,
    ) -> anyhow::Result<Transport<D>> {
        config.validate()?;
        if driver.max_payload_size() <= FragmentHeader::SERIALIZED_LEN {
            bail!(
                "driver payload size {} cannot even fit the fragment header",
                driver.max_payload_size()
            );
        }

        let pool = BufferPool::new(driver.max_payload_size(), config.buffer_pool_size);
        Ok(Transport {
            driver,
            clock,
            pool,
            timers: TimerRegistry::new(),
            client_sessions: SessionTable::new(config.max_client_sessions),
            server_sessions: SessionTable::new(config.max_server_sessions),
            server_ready_queue: VecDeque::new(),
            sessions_by_addr: FxHashMap::default(),
            stats: TransportStats::default(),
            config,
        })
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Submit a request to the server at `server_addr`. Reuses the session already
    ///  talking to that server, or opens one. The returned handle completes (or
    ///  aborts) during later `poll`s; see [`get_reply`](Transport::get_reply).
    pub fn client_send(
        &mut self,
        server_addr: SocketAddr,
        request: Bytes,
    ) -> Result<ClientRpc, TransportError> {
        if self.num_frags(request.len()) > u16::MAX as u64 {
            return Err(TransportError::MessageTooLarge);
        }
        let rpc = ClientRpc::new(request);
        rpc.started();

        let cached = self
            .sessions_by_addr
            .get(&server_addr)
            .copied()
            .filter(|&id| {
                self.client_sessions
                    .get(id)
                    .is_some_and(|s| s.server_addr() == Some(server_addr))
            });
        let session_id = match cached {
            Some(id) => id,
            None => {
                let now = self.clock.now_millis();
                self.client_sessions.expire(
                    now,
                    self.config.session_timeout_millis,
                    self.config.sessions_to_check_per_expire,
                    &mut self.timers,
                );
                let (id, _) = self
                    .client_sessions
                    .acquire(ClientSession::new)
                    .ok_or(TransportError::SessionsExhausted)?;
                self.sessions_by_addr.insert(server_addr, id);
                id
            }
        };
        debug!("using client session {} for {:?}", session_id, server_addr);

        let now = self.clock.now_millis();
        let Self {
            driver,
            pool,
            timers,
            config,
            client_sessions,
            stats,
            ..
        } = self;
        let mut io = Io { driver, pool, timers, config, stats, now };
        let session = client_sessions
            .get_mut(session_id)
            .expect("session id resolved above");
        if !session.is_connected() {
            session.connect(Some(server_addr), &mut io);
        }
        session.start_rpc(rpc.clone(), &mut io);
        Ok(rpc)
    }

    /// Block (by polling) until `rpc` leaves IN_PROGRESS, then yield the response.
    pub fn get_reply(&mut self, rpc: &ClientRpc) -> Result<Bytes, TransportError> {
        loop {
            match rpc.state() {
                RpcState::Completed => {
                    return rpc.take_response().ok_or(TransportError::StaleRpc);
                }
                RpcState::Aborted => return Err(TransportError::Aborted),
                RpcState::Idle | RpcState::InProgress => self.poll(),
            }
        }
    }

    /// Block (by polling) until a request is ready for the service layer.
    pub fn server_recv(&mut self) -> ServerRpc {
        loop {
            if let Some(rpc) = self.server_try_recv() {
                return rpc;
            }
        }
    }

    /// One non-blocking step of [`server_recv`](Transport::server_recv): poll, then
    ///  pop a ready request if there is one.
    pub fn server_try_recv(&mut self) -> Option<ServerRpc> {
        self.poll();
        loop {
            let ready = self.server_ready_queue.pop_front()?;
            let Some(session) = self.server_sessions.get_mut(ready.session) else {
                continue;
            };
            match session.take_ready_request(ready.channel, ready.rpc_id) {
                Some(recv_payload) => {
                    return Some(ServerRpc {
                        recv_payload,
                        reply_payload: BytesMut::new(),
                        session: ready.session,
                        channel: ready.channel,
                        rpc_id: ready.rpc_id,
                    });
                }
                // the channel has moved on underneath the queue entry
                None => debug!("dropping stale ready-queue entry"),
            }
        }
    }

    /// Stream `rpc.reply_payload` back to the client that sent the request.
    pub fn send_reply(&mut self, rpc: ServerRpc) -> Result<(), TransportError> {
        if self.num_frags(rpc.reply_payload.len()) > u16::MAX as u64 {
            return Err(TransportError::MessageTooLarge);
        }

        let now = self.clock.now_millis();
        let Self {
            driver,
            pool,
            timers,
            config,
            server_sessions,
            stats,
            ..
        } = self;
        let mut io = Io { driver, pool, timers, config, stats, now };
        let session = server_sessions
            .get_mut(rpc.session)
            .ok_or(TransportError::StaleRpc)?;
        session.begin_sending(rpc.channel, rpc.rpc_id, rpc.reply_payload.freeze(), &mut io)
    }

    /// Non-blocking progress step: drain the driver, firing due timers between
    ///  packets and once more after the driver runs dry.
    pub fn poll(&mut self) {
        while self.try_process_packet() {
            self.fire_timers();
        }
        self.fire_timers();
    }

    fn try_process_packet(&mut self) -> bool {
        let Some(packet) = self.driver.try_recv_packet() else {
            trace!("no packet ready");
            return false;
        };

        let mut slice: &[u8] = &packet.data;
        let header = match FragmentHeader::deser(&mut slice) {
            Ok(header) => header,
            Err(_) => {
                debug!("undecodable packet from {:?} - dropping", packet.addr);
                self.stats.malformed_packets += 1;
                return true;
            }
        };
        if header.please_drop {
            trace!("dropping packet flagged by the fault-injection knob");
            self.stats.test_dropped_packets += 1;
            return true;
        }

        let payload = packet.data.slice(FragmentHeader::SERIALIZED_LEN..);
        match header.direction {
            Direction::ClientToServer => self.process_server_bound(header, payload, packet.addr),
            Direction::ServerToClient => self.process_client_bound(header, payload),
        }
        true
    }

    fn process_server_bound(&mut self, header: FragmentHeader, payload: Bytes, from: SocketAddr) {
        let now = self.clock.now_millis();
        let Self {
            driver,
            pool,
            timers,
            config,
            server_sessions,
            server_ready_queue,
            stats,
            ..
        } = self;

        // fast path: the hint names a session and the token proves membership
        if let Some(session) = server_sessions.get_mut(header.server_session_hint) {
            if session.token() == Some(header.session_token) {
                let mut io = Io { driver, pool, timers, config, stats, now };
                session.process_inbound_packet(&header, payload, &mut io, server_ready_queue);
                return;
            }
            debug!("bad token for server session hint {}", header.server_session_hint);
        }

        match header.payload_kind {
            PayloadKind::SessionOpen => {
                server_sessions.expire(
                    now,
                    config.session_timeout_millis,
                    config.sessions_to_check_per_expire,
                    timers,
                );
                match server_sessions.acquire(|id| {
                    ServerSession::new(id, config.num_channels_per_session, config.max_staging_fragments)
                }) {
                    Some((_, session)) => {
                        let mut io = Io { driver, pool, timers, config, stats, now };
                        session.start_session(from, header.client_session_hint, &mut io);
                    }
                    None => warn!("server session table full - dropping session open from {:?}", from),
                }
            }
            _ => {
                debug!("unknown session for packet from {:?} - replying BAD_SESSION", from);
                let reply = FragmentHeader {
                    session_token: header.session_token,
                    rpc_id: header.rpc_id,
                    client_session_hint: header.client_session_hint,
                    server_session_hint: header.server_session_hint,
                    frag_number: 0,
                    total_frags: 0,
                    channel_id: header.channel_id,
                    direction: Direction::ServerToClient,
                    payload_kind: PayloadKind::BadSession,
                    request_ack: false,
                    please_drop: false,
                };
                let mut io = Io { driver, pool, timers, config, stats, now };
                io.send_packet(from, &reply, &[]);
                io.stats.bad_session_replies += 1;
            }
        }
    }

    fn process_client_bound(&mut self, header: FragmentHeader, payload: Bytes) {
        let now = self.clock.now_millis();
        let Self {
            driver,
            pool,
            timers,
            config,
            client_sessions,
            stats,
            ..
        } = self;

        match client_sessions.get_mut(header.client_session_hint) {
            Some(session) => {
                trace!("client session {} processing packet", header.client_session_hint);
                let mut io = Io { driver, pool, timers, config, stats, now };
                session.process_inbound_packet(&header, payload, &mut io);
            }
            None => debug!("bad client session hint {} - dropping", header.client_session_hint),
        }
    }

    fn fire_timers(&mut self) {
        let now = self.clock.now_millis();
        let due = self.timers.fire_due(now);
        if due.is_empty() {
            return;
        }

        let Self {
            driver,
            pool,
            timers,
            config,
            client_sessions,
            stats,
            ..
        } = self;
        let mut io = Io { driver, pool, timers, config, stats, now };

        for key in due {
            match key {
                TimerKey::ClientOutbound { session, channel } => {
                    if let Some(session) = client_sessions.get_mut(session) {
                        session.on_outbound_timer(channel, &mut io);
                    }
                }
                TimerKey::ClientInbound { session, channel } => {
                    if let Some(session) = client_sessions.get_mut(session) {
                        session.on_inbound_timer(channel, &mut io);
                    }
                }
            }
        }
    }

    fn num_frags(&self, message_len: usize) -> u64 {
        let per_frag = (self.driver.max_payload_size() - FragmentHeader::SERIALIZED_LEN) as u64;
        (message_len as u64).div_ceil(per_frag).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ManualClock, SimDriver, SimNet};
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};

    const MAX_PAYLOAD: usize = FragmentHeader::SERIALIZED_LEN + 100;
    const PER_FRAG: usize = 100;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            retransmit_timeout_millis: 10,
            ..TransportConfig::default()
        }
    }

    fn pattern(len: usize, seed: u8) -> Bytes {
        Bytes::from(
            (0..len)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect::<Vec<_>>(),
        )
    }

    /// One transport talking to itself: the direction bit keeps the client and server
    ///  halves apart, and the blocking calls drive both.
    fn loopback(
        config: TransportConfig,
    ) -> (Transport<SimDriver>, Rc<ManualClock>, Rc<RefCell<SimNet>>) {
        let net = SimNet::new();
        let clock = ManualClock::new();
        let driver = SimDriver::new(net.clone(), addr(1), MAX_PAYLOAD);
        let transport = Transport::with_clock(driver, config, clock.clone()).unwrap();
        (transport, clock, net)
    }

    fn peer(
        net: &Rc<RefCell<SimNet>>,
        clock: &Rc<ManualClock>,
        local: SocketAddr,
        config: &TransportConfig,
    ) -> Transport<SimDriver> {
        let driver = SimDriver::new(net.clone(), local, MAX_PAYLOAD);
        Transport::with_clock(driver, config.clone(), clock.clone()).unwrap()
    }

    #[test]
    fn test_single_fragment_round_trip() {
        let (mut t, _clock, net) = loopback(test_config());
        let request = pattern(PER_FRAG - 1, 1);

        let rpc = t.client_send(addr(1), request.clone()).unwrap();
        let mut server_rpc = t.server_recv();
        assert_eq!(server_rpc.recv_payload, request);

        server_rpc.reply_payload.put_slice(b"the reply");
        t.send_reply(server_rpc).unwrap();

        let response = t.get_reply(&rpc).unwrap();
        assert_eq!(response.as_ref(), b"the reply");

        // exactly one request fragment, no retransmissions
        let request_packets = net
            .borrow()
            .log
            .iter()
            .filter(|h| {
                h.payload_kind == PayloadKind::Data && h.direction == Direction::ClientToServer
            })
            .count();
        assert_eq!(request_packets, 1);
        let response_packets = net
            .borrow()
            .log
            .iter()
            .filter(|h| {
                h.payload_kind == PayloadKind::Data && h.direction == Direction::ServerToClient
            })
            .count();
        assert_eq!(response_packets, 1);
    }

    #[test]
    fn test_empty_request_round_trip() {
        let (mut t, _clock, _net) = loopback(test_config());

        let rpc = t.client_send(addr(1), Bytes::new()).unwrap();
        let mut server_rpc = t.server_recv();
        assert!(server_rpc.recv_payload.is_empty());

        server_rpc.reply_payload.put_slice(b"empty is fine");
        t.send_reply(server_rpc).unwrap();
        assert_eq!(t.get_reply(&rpc).unwrap().as_ref(), b"empty is fine");
    }

    #[test]
    fn test_multi_fragment_with_loss() {
        let (mut t, clock, net) = loopback(test_config());
        let request = pattern(3 * PER_FRAG, 2);

        let mut dropped = false;
        net.borrow_mut().drop_fn = Some(Box::new(move |h| {
            if !dropped
                && h.payload_kind == PayloadKind::Data
                && h.direction == Direction::ClientToServer
                && h.frag_number == 1
            {
                dropped = true;
                return true;
            }
            false
        }));

        let rpc = t.client_send(addr(1), request.clone()).unwrap();
        assert!(t.server_try_recv().is_none(), "fragment 1 is missing");

        clock.advance(11);
        t.poll(); // the retransmit timer fires and fragment 1 goes out again
        let mut server_rpc = t
            .server_try_recv()
            .expect("request completes after the retransmit");
        assert_eq!(server_rpc.recv_payload, request);

        server_rpc.reply_payload.put_slice(b"done");
        t.send_reply(server_rpc).unwrap();
        assert_eq!(t.get_reply(&rpc).unwrap().as_ref(), b"done");

        // the dropped copy never reached the wire log; fragment 1 shows up exactly
        //  once (the retransmit), fragments 0 and 2 exactly once
        let sent_per_frag = |frag: u16| {
            net.borrow()
                .log
                .iter()
                .filter(|h| {
                    h.payload_kind == PayloadKind::Data
                        && h.direction == Direction::ClientToServer
                        && h.frag_number == frag
                })
                .count()
        };
        assert_eq!(sent_per_frag(0), 1);
        assert_eq!(sent_per_frag(1), 1);
        assert_eq!(sent_per_frag(2), 1);
    }

    #[test]
    fn test_out_of_order_request_reassembly() {
        let config = test_config();
        let net = SimNet::new();
        let clock = ManualClock::new();
        let mut client = peer(&net, &clock, addr(10), &config);
        let mut server = peer(&net, &clock, addr(20), &config);

        let request = pattern(4 * PER_FRAG, 3);
        let rpc = client.client_send(addr(20), request.clone()).unwrap();
        server.poll(); // session open
        client.poll(); // open response; transmits the 4 request fragments

        {
            let mut net = net.borrow_mut();
            let queue = net.queues.get_mut(&addr(20)).unwrap();
            assert_eq!(queue.len(), 4);
            queue.swap(1, 2); // the server sees [0, 2, 1, 3]
        }

        let mut server_rpc = server.server_try_recv().expect("all fragments delivered");
        assert_eq!(server_rpc.recv_payload, request);

        server_rpc.reply_payload.put_slice(b"ok");
        server.send_reply(server_rpc).unwrap();
        client.poll();
        assert_eq!(rpc.state(), RpcState::Completed);
        assert_eq!(client.get_reply(&rpc).unwrap().as_ref(), b"ok");
    }

    #[test]
    fn test_bad_session_recovery() {
        let config = test_config();
        let net = SimNet::new();
        let clock = ManualClock::new();
        let mut client = peer(&net, &clock, addr(10), &config);

        {
            let mut server = peer(&net, &clock, addr(20), &config);
            let rpc = client.client_send(addr(20), pattern(30, 1)).unwrap();
            server.poll();
            client.poll();
            let mut server_rpc = server.server_try_recv().unwrap();
            server_rpc.reply_payload.put_slice(b"first");
            server.send_reply(server_rpc).unwrap();
            client.poll();
            assert_eq!(client.get_reply(&rpc).unwrap().as_ref(), b"first");
        }

        // the server restarts with empty tables; the client still believes its
        //  session is good
        let mut server = peer(&net, &clock, addr(20), &config);

        let request = pattern(50, 9);
        let rpc = client.client_send(addr(20), request.clone()).unwrap();
        server.poll(); // unknown hint/token -> BAD_SESSION
        assert_eq!(server.stats().bad_session_replies, 1);
        client.poll(); // requeue the rpc, reconnect
        server.poll(); // fresh session open
        client.poll(); // open response, request goes out again

        let mut server_rpc = server.server_try_recv().expect("rpc survives the reconnect");
        assert_eq!(server_rpc.recv_payload, request);
        server_rpc.reply_payload.put_slice(b"second");
        server.send_reply(server_rpc).unwrap();
        client.poll();

        assert_eq!(client.get_reply(&rpc).unwrap().as_ref(), b"second");
        assert_eq!(server.stats().bad_session_replies, 1);
    }

    #[test]
    fn test_channel_queueing() {
        let mut config = test_config();
        config.num_channels_per_session = 2;
        config.max_channels_per_session = 2;
        let (mut t, _clock, _net) = loopback(config);

        let requests: Vec<Bytes> = (0..4).map(|i| pattern(40, i as u8)).collect();
        let rpcs: Vec<ClientRpc> = requests
            .iter()
            .map(|r| t.client_send(addr(1), r.clone()).unwrap())
            .collect();

        // two channels, so exactly two requests reach the server
        let first = t.server_try_recv().expect("request on channel 0");
        let second = t.server_try_recv().expect("request on channel 1");
        assert!(t.server_try_recv().is_none());
        assert_eq!(first.recv_payload, requests[0]);
        assert_eq!(second.recv_payload, requests[1]);

        // completing the first rpc dequeues the third
        let mut reply = first;
        reply.reply_payload.put_slice(b"r0");
        t.send_reply(reply).unwrap();
        assert_eq!(t.get_reply(&rpcs[0]).unwrap().as_ref(), b"r0");

        let third = t.server_try_recv().expect("queued rpc follows a completion");
        assert_eq!(third.recv_payload, requests[2]);
        assert!(t.server_try_recv().is_none());

        // and the second completion dequeues the fourth
        let mut reply = second;
        reply.reply_payload.put_slice(b"r1");
        t.send_reply(reply).unwrap();
        assert_eq!(t.get_reply(&rpcs[1]).unwrap().as_ref(), b"r1");

        let fourth = t.server_try_recv().expect("last queued rpc");
        assert_eq!(fourth.recv_payload, requests[3]);

        for rpc in [third, fourth] {
            let mut reply = rpc;
            reply.reply_payload.put_slice(b"tail");
            t.send_reply(reply).unwrap();
        }
        assert_eq!(t.get_reply(&rpcs[2]).unwrap().as_ref(), b"tail");
        assert_eq!(t.get_reply(&rpcs[3]).unwrap().as_ref(), b"tail");
    }

    #[test]
    fn test_sequential_rpcs_reuse_the_channel() {
        let (mut t, _clock, net) = loopback(test_config());

        for i in 0..3u8 {
            let request = pattern(150, i);
            let rpc = t.client_send(addr(1), request.clone()).unwrap();
            let mut server_rpc = t.server_recv();
            assert_eq!(server_rpc.recv_payload, request);
            server_rpc.reply_payload.put_slice(&[i; 8]);
            t.send_reply(server_rpc).unwrap();
            assert_eq!(t.get_reply(&rpc).unwrap().as_ref(), &[i; 8]);
        }

        // one session, rpc ids 0..=2 on one channel
        let max_rpc_id = net
            .borrow()
            .log
            .iter()
            .filter(|h| h.payload_kind == PayloadKind::Data)
            .map(|h| h.rpc_id)
            .max();
        assert_eq!(max_rpc_id, Some(2));
        let opens = net
            .borrow()
            .log
            .iter()
            .filter(|h| {
                h.payload_kind == PayloadKind::SessionOpen
                    && h.direction == Direction::ClientToServer
            })
            .count();
        assert_eq!(opens, 1);
    }

    #[test]
    fn test_large_messages_span_many_windows() {
        let (mut t, _clock, _net) = loopback(test_config());
        let request = pattern(25 * PER_FRAG, 5);
        let reply_bytes = pattern(25 * PER_FRAG, 6);

        let rpc = t.client_send(addr(1), request.clone()).unwrap();
        let mut server_rpc = t.server_recv();
        assert_eq!(server_rpc.recv_payload, request);

        server_rpc.reply_payload.put_slice(&reply_bytes);
        t.send_reply(server_rpc).unwrap();
        assert_eq!(t.get_reply(&rpc).unwrap(), reply_bytes);
    }

    #[test]
    fn test_deterministic_loss_pattern_eventual_delivery() {
        let (mut t, clock, net) = loopback(test_config());

        // the network eats every 4th data/ack packet
        let mut count = 0u32;
        net.borrow_mut().drop_fn = Some(Box::new(move |h| {
            if matches!(h.payload_kind, PayloadKind::Data | PayloadKind::Ack) {
                count += 1;
                count % 4 == 0
            }
            else {
                false
            }
        }));

        let request = pattern(8 * PER_FRAG, 11);
        let rpc = t.client_send(addr(1), request.clone()).unwrap();

        let mut server_rpc = None;
        for _ in 0..200 {
            if let Some(r) = t.server_try_recv() {
                server_rpc = Some(r);
                break;
            }
            clock.advance(11);
        }
        let mut server_rpc = server_rpc.expect("request survives the loss pattern");
        assert_eq!(server_rpc.recv_payload, request);

        server_rpc.reply_payload.put_slice(&pattern(8 * PER_FRAG, 12));
        t.send_reply(server_rpc).unwrap();
        for _ in 0..200 {
            if rpc.state() == RpcState::Completed {
                break;
            }
            t.poll();
            clock.advance(11);
        }
        assert_eq!(t.get_reply(&rpc).unwrap(), pattern(8 * PER_FRAG, 12));
    }

    #[test]
    fn test_fault_injection_knob_marks_packets() {
        let mut config = test_config();
        config.packet_loss_percentage = 100;
        let (mut t, _clock, _net) = loopback(config);

        // every packet is flagged, so the session open is discarded on arrival and
        //  nothing ever completes
        let rpc = t.client_send(addr(1), pattern(10, 0)).unwrap();
        t.poll();

        assert_eq!(rpc.state(), RpcState::InProgress);
        assert!(t.stats().test_dropped_packets > 0);
    }

    #[test]
    fn test_rpc_aborts_when_server_disappears() {
        let mut config = test_config();
        config.max_retransmit_timeouts = 3;
        let net = SimNet::new();
        let clock = ManualClock::new();
        let mut client = peer(&net, &clock, addr(10), &config);

        {
            let mut server = peer(&net, &clock, addr(20), &config);
            let rpc = client.client_send(addr(20), pattern(20, 1)).unwrap();
            server.poll();
            client.poll();
            let mut server_rpc = server.server_try_recv().unwrap();
            server_rpc.reply_payload.put_slice(b"ok");
            server.send_reply(server_rpc).unwrap();
            client.get_reply(&rpc).unwrap();
        }

        // the server is gone; the next request retransmits into the void until the
        //  budget runs out
        let rpc = client.client_send(addr(20), pattern(300, 2)).unwrap();
        for _ in 0..10 {
            clock.advance(11);
            client.poll();
        }

        assert_eq!(rpc.state(), RpcState::Aborted);
        assert!(matches!(client.get_reply(&rpc), Err(TransportError::Aborted)));
    }

    #[test]
    fn test_unknown_session_gets_bad_session_reply() {
        use crate::driver::MockDriver;
        use crate::driver::ReceivedPacket;

        let mut driver = MockDriver::new();
        driver.expect_max_payload_size().return_const(MAX_PAYLOAD);

        let offending = FragmentHeader {
            session_token: 7,
            rpc_id: 3,
            client_session_hint: 5,
            server_session_hint: 2,
            frag_number: 0,
            total_frags: 1,
            channel_id: 4,
            direction: Direction::ClientToServer,
            payload_kind: PayloadKind::Data,
            request_ack: false,
            please_drop: false,
        };
        let mut packet = BytesMut::new();
        offending.ser(&mut packet);
        let mut pending = VecDeque::from([ReceivedPacket {
            addr: addr(9),
            data: packet.freeze(),
        }]);
        driver
            .expect_try_recv_packet()
            .returning(move || pending.pop_front());

        driver
            .expect_send_packet()
            .once()
            .withf(|to, packet| {
                let header = FragmentHeader::deser(&mut &packet[..]).unwrap();
                *to == addr(9)
                    && header.payload_kind == PayloadKind::BadSession
                    && header.direction == Direction::ServerToClient
                    && header.session_token == 7
                    && header.rpc_id == 3
                    && header.client_session_hint == 5
                    && header.server_session_hint == 2
                    && header.channel_id == 4
            })
            .return_const(());

        let mut t = Transport::new(driver, test_config()).unwrap();
        t.poll();
        assert_eq!(t.stats().bad_session_replies, 1);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let net = SimNet::new();
        let clock = ManualClock::new();
        // 1 byte of data per fragment: anything over u16::MAX bytes cannot be framed
        let driver = SimDriver::new(net, addr(1), FragmentHeader::SERIALIZED_LEN + 1);
        let mut t = Transport::with_clock(driver, test_config(), clock).unwrap();

        let request = Bytes::from(vec![0u8; u16::MAX as usize + 1]);
        assert!(matches!(
            t.client_send(addr(1), request),
            Err(TransportError::MessageTooLarge)
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let net = SimNet::new();
        let driver = SimDriver::new(net, addr(1), MAX_PAYLOAD);
        let config = TransportConfig {
            max_staging_fragments: 64,
            ..TransportConfig::default()
        };
        assert!(Transport::new(driver, config).is_err());
    }

    #[test]
    fn test_undersized_driver_rejected() {
        let net = SimNet::new();
        let driver = SimDriver::new(net, addr(1), 8);
        assert!(Transport::new(driver, test_config()).is_err());
    }

    #[test]
    fn test_malformed_packet_counted_and_dropped() {
        let (mut t, _clock, net) = loopback(test_config());
        net.borrow_mut()
            .queues
            .entry(addr(1))
            .or_default()
            .push_back(crate::driver::ReceivedPacket {
                addr: addr(9),
                data: Bytes::from_static(&[1, 2, 3]),
            });

        t.poll();
        assert_eq!(t.stats().malformed_packets, 1);
    }

    #[test]
    fn test_spurious_data_during_reply_redrives_send() {
        let config = test_config();
        let net = SimNet::new();
        let clock = ManualClock::new();
        let mut client = peer(&net, &clock, addr(10), &config);
        let mut server = peer(&net, &clock, addr(20), &config);

        let request = pattern(20, 1);
        let rpc = client.client_send(addr(20), request.clone()).unwrap();
        server.poll();
        client.poll();
        let mut server_rpc = server.server_try_recv().unwrap();

        // duplicate the request fragment before the reply goes out: by the time it
        //  arrives the channel is SENDING_WAITING
        let duplicate = {
            let net_ref = net.borrow();
            net_ref
                .log
                .iter()
                .find(|h| h.payload_kind == PayloadKind::Data)
                .unwrap()
                .clone()
        };
        server_rpc.reply_payload.put_slice(b"reply");
        server.send_reply(server_rpc).unwrap();

        let mut packet = BytesMut::new();
        duplicate.ser(&mut packet);
        packet.put_slice(&request);
        net.borrow_mut()
            .queues
            .entry(addr(20))
            .or_default()
            .push_back(crate::driver::ReceivedPacket {
                addr: addr(10),
                data: packet.freeze(),
            });

        server.poll();
        assert_eq!(server.stats().spurious_send_waiting_data, 1);

        client.poll();
        assert_eq!(client.get_reply(&rpc).unwrap().as_ref(), b"reply");
    }
}
