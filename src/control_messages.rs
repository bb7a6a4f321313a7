use bytes::{Buf, BufMut, BytesMut};

/// Selective acknowledgement, sent by the receiver of a message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckPayload {
    /// All fragments below this index have been appended to the destination buffer and
    ///  will never be asked for again.
    pub first_missing_frag: u32,
    /// Bit `i` set means fragment `first_missing_frag + 1 + i` is staged on the
    ///  receiver - the sender must not retransmit it, but it does not advance the
    ///  window either until the gap before it is filled.
    pub staging_vector: u32,
}

impl AckPayload {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u32>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.first_missing_frag);
        buf.put_u32(self.staging_vector);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckPayload> {
        let first_missing_frag = buf.try_get_u32()?;
        let staging_vector = buf.try_get_u32()?;
        Ok(AckPayload {
            first_missing_frag,
            staging_vector,
        })
    }
}

/// Payload of the server's SESSION_OPEN reply. The token and the server's session hint
///  travel in the header; this only carries the channel count.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionOpenPayload {
    /// One less than the number of channels the server allocated for the session.
    pub max_channel_id: u8,
}

impl SessionOpenPayload {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.max_channel_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SessionOpenPayload> {
        let max_channel_id = buf.try_get_u8()?;
        Ok(SessionOpenPayload { max_channel_id })
    }
}
