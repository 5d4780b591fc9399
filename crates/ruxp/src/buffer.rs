use std::sync::Mutex;

/// How many spare buffers a pool keeps before letting returns drop.
const POOL_KEEP: usize = 64;

/// Reusable byte buffers for the datagram path. Every buffer handed out
/// is empty with at least `buf_capacity` of room, so the steady-state
/// send/receive/FEC paths stop allocating once the pool is warm.
pub(crate) struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_capacity: usize,
}

impl BufferPool {
    pub(crate) fn new(buf_capacity: usize) -> BufferPool {
        BufferPool {
            buffers: Mutex::new(Vec::new()),
            buf_capacity,
        }
    }

    pub(crate) fn get(&self) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap();
        match buffers.pop() {
            Some(buf) => buf,
            None => Vec::with_capacity(self.buf_capacity),
        }
    }

    pub(crate) fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < POOL_KEEP {
            buffers.push(buf);
        }
    }
}
