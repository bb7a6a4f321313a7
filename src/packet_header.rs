use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

/// Hint value transmitted by a side that does not have a peer table index yet. It is
///  deliberately out of range for any session table, so the receiver's bounds check
///  rejects it.
pub const NO_HINT: u32 = u32::MAX;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// What follows the fragment header on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum PayloadKind {
    Data = 0,
    Ack = 1,
    SessionOpen = 2,
    BadSession = 3,
}

/// The fixed header transmitted at the start of every packet. See the crate
///  documentation for the byte layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FragmentHeader {
    pub session_token: u64,
    pub rpc_id: u32,
    pub client_session_hint: u32,
    pub server_session_hint: u32,
    pub frag_number: u16,
    pub total_frags: u16,
    pub channel_id: u8,
    pub direction: Direction,
    pub payload_kind: PayloadKind,
    pub request_ack: bool,
    pub please_drop: bool,
}

const FLAG_DIRECTION: u8 = 1 << 4;
const FLAG_REQUEST_ACK: u8 = 1 << 5;
const FLAG_PLEASE_DROP: u8 = 1 << 6;

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u64>() + 3 * size_of::<u32>()
        + 2 * size_of::<u16>() + 2 * size_of::<u8>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.session_token);
        buf.put_u32(self.rpc_id);
        buf.put_u32(self.client_session_hint);
        buf.put_u32(self.server_session_hint);
        buf.put_u16(self.frag_number);
        buf.put_u16(self.total_frags);
        buf.put_u8(self.channel_id);

        let mut flags = self.payload_kind as u8;
        if self.direction == Direction::ServerToClient {
            flags |= FLAG_DIRECTION;
        }
        if self.request_ack {
            flags |= FLAG_REQUEST_ACK;
        }
        if self.please_drop {
            flags |= FLAG_PLEASE_DROP;
        }
        buf.put_u8(flags);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        let session_token = buf.try_get_u64()?;
        let rpc_id = buf.try_get_u32()?;
        let client_session_hint = buf.try_get_u32()?;
        let server_session_hint = buf.try_get_u32()?;
        let frag_number = buf.try_get_u16()?;
        let total_frags = buf.try_get_u16()?;
        let channel_id = buf.try_get_u8()?;
        let flags = buf.try_get_u8()?;

        let payload_kind = PayloadKind::try_from(flags & 0x0f)?;
        let direction = if flags & FLAG_DIRECTION != 0 {
            Direction::ServerToClient
        }
        else {
            Direction::ClientToServer
        };

        Ok(FragmentHeader {
            session_token,
            rpc_id,
            client_session_hint,
            server_session_hint,
            frag_number,
            total_frags,
            channel_id,
            direction,
            payload_kind,
            request_ack: flags & FLAG_REQUEST_ACK != 0,
            please_drop: flags & FLAG_PLEASE_DROP != 0,
        })
    }
}
