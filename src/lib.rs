//! A session-oriented RPC transport layered over an unreliable datagram driver.
//!
//! The driver (see [`driver::Driver`]) delivers fixed-size packets with best-effort
//!  semantics - packets may be lost, reordered or duplicated. This crate turns
//!  arbitrary-length request/response pairs into sequences of fragments, reassembles
//!  them reliably on the far side, and multiplexes many concurrent RPCs per pair of
//!  peers across a fixed number of per-session channels.
//!
//! ## Design goals
//!
//! * The abstraction is *RPCs* (a request buffer in, a response buffer out), not byte
//!   streams: each RPC is bound to one channel of one session and is retired as a unit
//! * Reliability is per-message: each in-flight message has its own sliding send window
//!   with selective acknowledgement and retransmission; there is no ordering between
//!   RPCs on different channels
//! * Sessions are cheap to look up: every packet carries peer-supplied table indices
//!   ("hints") for O(1) dispatch, always verified against a random 64-bit session token
//!   so a stale or hostile hint can never reach the wrong session
//! * Recovery is client-driven: the client retransmits request fragments on timeout and
//!   re-acks stalled responses, so the server keeps no per-channel timers at all
//! * Everything runs single-threaded inside [`Transport::poll`] - there are no locks,
//!   no internal threads, and the only blocking calls (`get_reply`, `server_recv`)
//!   block by polling
//!
//! ## Fragment header
//!
//! Every packet starts with the same fixed 26-byte header, all numbers in network
//!  byte order (BE):
//!
//! ```ascii
//! 0:  session token (u64) - random value issued by the server on session open;
//!      authenticates that the sender is a member of the session the hints point at
//! 8:  rpc id (u32) - monotonically increasing per channel; the server accepts
//!      rpc id N+1 on a channel as the start of the next RPC
//! 12: client session hint (u32) - index into the client's session table
//! 16: server session hint (u32) - index into the server's session table
//! 20: fragment number (u16) - zero-based index of this fragment within the message
//! 22: total fragments (u16) - number of fragments in the message
//! 24: channel id (u8) - channel within the session
//! 25: flags (u8):
//!     * bits 0-3: payload kind: 0 DATA, 1 ACK, 2 SESSION_OPEN, 3 BAD_SESSION
//!     * bit 4: direction (0 client-to-server, 1 server-to-client)
//!     * bit 5: request ack - receiver should emit an ACK after processing
//!     * bit 6: please drop - fault-injection knob, receiver discards the packet
//! ```
//!
//! A side that does not know a hint or token yet sends `u32::MAX` / `0`; an unknown
//!  hint fails the receiver's bounds check and a session without a token matches no
//!  wire value.
//!
//! ## Control payloads
//!
//! *ACK*
//!
//! Sent by the receiver of a message, either because a DATA packet requested it or
//!  from the inactivity timer. Selective: the staging vector describes out-of-order
//!  fragments already buffered past the first gap.
//!
//! ```ascii
//! 0: first missing fragment (u32) - everything below is delivered and done
//! 4: staging vector (u32) - bit i set means fragment `first missing + 1 + i` is staged
//! ```
//!
//! *SESSION_OPEN*
//!
//! Client-to-server with no payload: request to open a session. Server-to-client with
//!  the payload below: the open succeeded, the header carries the new token and the
//!  server's hint.
//!
//! ```ascii
//! 0: max channel id (u8) - one less than the number of channels the server allocated
//! ```
//!
//! *BAD_SESSION*
//!
//! Server-to-client, no payload, header echoes the offending packet. Tells the client
//!  its session is gone; the client requeues in-flight RPCs and reconnects.
//!
//! ## Flow control
//!
//! The sender transmits up to `window_size` unacknowledged fragments, but never runs
//!  further than `max_staging_fragments + 1` past the receiver's first gap - beyond
//!  that the receiver would have to drop the fragments anyway. Every
//!  `req_ack_after`-th packet asks for an ACK; retransmits always do. A retransmit
//!  stops the send scan so a single timeout cannot stampede the full window onto a
//!  congested path.

pub mod buffer_pool;
pub mod clock;
pub mod config;
pub mod control_messages;
pub mod driver;
pub mod packet_header;
pub mod ring;
pub mod rpc;
pub mod test_util;
pub mod timer;
pub mod transport;

mod client_session;
mod inbound;
mod outbound;
mod server_session;
mod session_table;

pub use config::TransportConfig;
pub use driver::{Driver, ReceivedPacket};
pub use rpc::{ClientRpc, RpcState, ServerRpc, TransportError};
pub use transport::{Transport, TransportStats};
