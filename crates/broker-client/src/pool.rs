use bytes::BytesMut;
use std::sync::{Arc, Mutex};

// Requests are encoded into pooled buffers so steady-state writes do not
// allocate. Buffers are returned on every exit path of the write, at the
// same scope that acquired them.
const INITIAL_CAPACITY: usize = 1024;
const MAX_POOLED: usize = 16;

#[derive(Clone)]
pub(crate) struct BufPool {
    free: Arc<Mutex<Vec<BytesMut>>>,
}

impl BufPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn get(&self) -> BytesMut {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_CAPACITY))
    }

    pub(crate) fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_round_trip() {
        let pool = BufPool::new();
        let mut b = pool.get();
        b.extend_from_slice(b"hello");
        pool.put(b);

        let b = pool.get();
        assert!(b.is_empty());
        assert!(b.capacity() >= 5);
    }
}
