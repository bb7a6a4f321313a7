use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The RPC was aborted - the session died (retransmit budget exhausted) or was
    ///  closed underneath it.
    #[error("RPC aborted")]
    Aborted,
    /// The server RPC handle no longer matches the channel state, e.g. the reply was
    ///  already sent or the session was torn down.
    #[error("stale RPC handle")]
    StaleRpc,
    /// The client session table is full and no session could be expired.
    #[error("no client session available")]
    SessionsExhausted,
    /// The message does not fit the wire format's fragment count.
    #[error("message too large")]
    MessageTooLarge,
}

/// Lifecycle of a client RPC as visible through its handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RpcState {
    Idle,
    InProgress,
    Completed,
    Aborted,
}

struct RpcShared {
    state: RpcState,
    /// Kept for the lifetime of the RPC: a BAD_SESSION reply requeues the RPC and the
    ///  request is transmitted again on the new session.
    request: Bytes,
    response: Option<Bytes>,
}

/// Caller-visible handle to an in-flight client RPC. Cloning is cheap; the transport
///  keeps a clone on the channel (or queue) carrying the RPC.
#[derive(Clone)]
pub struct ClientRpc {
    shared: Rc<RefCell<RpcShared>>,
}

impl ClientRpc {
    pub(crate) fn new(request: Bytes) -> ClientRpc {
        ClientRpc {
            shared: Rc::new(RefCell::new(RpcShared {
                state: RpcState::Idle,
                request,
                response: None,
            })),
        }
    }

    pub fn state(&self) -> RpcState {
        self.shared.borrow().state
    }

    pub(crate) fn request(&self) -> Bytes {
        self.shared.borrow().request.clone()
    }

    pub(crate) fn started(&self) {
        self.shared.borrow_mut().state = RpcState::InProgress;
    }

    pub(crate) fn completed(&self, response: Bytes) {
        let mut shared = self.shared.borrow_mut();
        shared.response = Some(response);
        shared.state = RpcState::Completed;
    }

    pub(crate) fn aborted(&self) {
        self.shared.borrow_mut().state = RpcState::Aborted;
    }

    pub(crate) fn take_response(&self) -> Option<Bytes> {
        self.shared.borrow_mut().response.take()
    }
}

/// A fully received request, handed to the service layer by `server_recv`. The
///  application reads `recv_payload`, writes the response into `reply_payload` and
///  hands the whole thing back to `Transport::send_reply`.
pub struct ServerRpc {
    pub recv_payload: Bytes,
    pub reply_payload: BytesMut,
    pub(crate) session: u32,
    pub(crate) channel: u8,
    pub(crate) rpc_id: u32,
}
