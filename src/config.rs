use anyhow::bail;

/// Tunables for a [`crate::Transport`]. The defaults are sized for a low-latency
///  datacenter network; `validate()` should be called once at transport creation.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Maximum number of unacknowledged fragments in flight per outbound message.
    pub window_size: u32,

    /// Number of out-of-order fragments the receiver buffers past its first gap. The
    ///  sender never transmits further than this past the gap, and the ACK staging
    ///  vector is a u32 bitmask, so this is capped at 32.
    pub max_staging_fragments: u32,

    /// Ask the receiver for an ACK every this-many data packets (retransmits always
    ///  ask). The final fragment of a message never piggybacks the request - the
    ///  receiver acks completion through the RPC state machine instead.
    pub req_ack_after: u32,

    /// Retransmit timeout per fragment, and the inbound inactivity timeout.
    pub retransmit_timeout_millis: u64,

    /// A session untouched for this long is eligible for eviction during table sweeps.
    pub session_timeout_millis: u64,

    /// Number of back-to-back timer expiries on one message after which the session is
    ///  considered dead and its RPCs are aborted.
    pub max_retransmit_timeouts: u32,

    /// Channels the server allocates per session. Fixed on the server; announced to
    ///  the client in the SESSION_OPEN reply.
    pub num_channels_per_session: u32,

    /// Upper bound on channels the client will use regardless of what the server
    ///  announces.
    pub max_channels_per_session: u32,

    /// Bounds for the two session tables.
    pub max_client_sessions: u32,
    pub max_server_sessions: u32,

    /// How many table slots one `expire()` call inspects - the sweep is amortized
    ///  across calls.
    pub sessions_to_check_per_expire: u32,

    /// Number of send buffers kept pooled; buffers in excess of this are discarded
    ///  when returned.
    pub buffer_pool_size: usize,

    /// Fault injection: percentage of transmitted packets flagged for the receiver to
    ///  discard. Test knob, leave at 0 in production.
    pub packet_loss_percentage: u8,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            window_size: 10,
            max_staging_fragments: 32,
            req_ack_after: 10,
            retransmit_timeout_millis: 10,
            session_timeout_millis: 60_000,
            max_retransmit_timeouts: 500,
            num_channels_per_session: 8,
            max_channels_per_session: 8,
            max_client_sessions: 1024,
            max_server_sessions: 1024,
            sessions_to_check_per_expire: 5,
            buffer_pool_size: 1024,
            packet_loss_percentage: 0,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if self.max_staging_fragments == 0 || self.max_staging_fragments > 32 {
            bail!("staging fragments must be in 1..=32 (the staging vector is a u32)");
        }
        if self.req_ack_after < 2 {
            bail!("req_ack_after must be at least 2");
        }
        if self.retransmit_timeout_millis == 0 {
            bail!("retransmit timeout must be at least 1ms");
        }
        if self.session_timeout_millis < self.retransmit_timeout_millis {
            bail!("session timeout must not be shorter than the retransmit timeout");
        }
        if self.max_retransmit_timeouts == 0 {
            bail!("retransmit timeout budget must be at least 1");
        }
        if self.num_channels_per_session == 0 || self.num_channels_per_session > 256 {
            bail!("channels per session must be in 1..=256 (channel id is a u8)");
        }
        if self.max_channels_per_session == 0 || self.max_channels_per_session > 256 {
            bail!("max channels per session must be in 1..=256 (channel id is a u8)");
        }
        if self.max_client_sessions == 0 || self.max_server_sessions == 0 {
            bail!("session tables must allow at least one session");
        }
        if self.sessions_to_check_per_expire == 0 {
            bail!("expiry sweep must inspect at least one slot per call");
        }
        if self.packet_loss_percentage > 100 {
            bail!("packet loss percentage must be at most 100");
        }
        Ok(())
    }
}
