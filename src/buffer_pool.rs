use bytes::BytesMut;
use std::cell::RefCell;
use tracing::{debug, trace};

/// Pool of send-side packet buffers so per-fragment header+payload assembly does not
///  allocate. Buffers are sized to the driver's packet size; a buffer that grew past
///  that (which would mean an oversized packet was assembled) is discarded on return.
pub struct BufferPool {
    buf_size: usize,
    buffers: RefCell<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferPool {
            buf_size,
            buffers: RefCell::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        if let Some(buffer) = self.buffers.borrow_mut().pop() {
            trace!("returning buffer from pool");
            return buffer;
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.buf_size {
            debug!("returned buffer has irregular capacity {}: discarding", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.borrow_mut();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
