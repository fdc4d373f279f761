use std::sync::{Arc, Mutex};

use verbs_utils::safe_assert;

/// A pool-allocated buffer handle.
///
/// Released back to its owning pool on `Drop`, so every error branch that
/// aborts a partially-prepared message automatically returns any segments
/// it had already claimed.
pub struct Segment {
    data: Vec<u8>,
    pool: Arc<Inner>,
}

impl Segment {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let reclaimed = std::mem::take(&mut self.data);
        self.pool.release(reclaimed);
    }
}

struct Inner {
    segment_len: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Inner {
    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.segment_len {
            return;
        }
        buf.clear();
        buf.resize(self.segment_len, 0);
        let mut free = self.free.lock().unwrap();
        free.push(buf);
    }
}

/// A fixed-size-segment buffer pool, shared across connections.
///
/// Its own synchronisation (a plain `Mutex`) is opaque to the datapath,
/// matching the "shared resource, opaque internal sync" collaborator
/// contract the datapath assumes of its mempool.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<Inner>,
}

impl Mempool {
    pub fn new(segment_len: usize, initial_segments: usize) -> Self {
        safe_assert!(segment_len > 0, "mempool segment_len must be non-zero");
        let free = (0..initial_segments).map(|_| vec![0u8; segment_len]).collect();
        Self { inner: Arc::new(Inner { segment_len, free: Mutex::new(free) }) }
    }

    pub fn segment_len(&self) -> usize {
        self.inner.segment_len
    }

    /// Allocates a segment able to hold `len` bytes. Returns `None` if `len`
    /// exceeds the pool's fixed segment size or the pool is exhausted (this
    /// crate never grows the pool on demand — callers see `NoBufs`).
    pub fn alloc(&self, len: usize) -> Option<Segment> {
        if len > self.inner.segment_len {
            return None;
        }
        let mut free = self.inner.free.lock().unwrap();
        let buf = free.pop()?;
        drop(free);
        Some(Segment { data: buf, pool: Arc::clone(&self.inner) })
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/// A single out-of-line data buffer backing one segment descriptor: either
/// supplied by the application (the moral equivalent of an RDMA MR, see
/// `SPEC_FULL.md` §3) or drawn from the shared [`Mempool`].
///
/// Unifies the two sources the inbound/outbound pipelines need to treat
/// identically once a buffer is chosen: a place to copy/recv bytes into, and
/// something whose lifetime releases cleanly on every error branch.
pub enum DataBuf {
    Owned(Vec<u8>),
    Pooled(Segment),
}

impl DataBuf {
    pub fn len(&self) -> usize {
        match self {
            DataBuf::Owned(v) => v.len(),
            DataBuf::Pooled(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            DataBuf::Owned(v) => v.as_slice(),
            DataBuf::Pooled(s) => s.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            DataBuf::Owned(v) => v.as_mut_slice(),
            DataBuf::Pooled(s) => s.as_mut_slice(),
        }
    }

    /// Consumes this buffer, copying its bytes out. Used when flattening a
    /// completed out-of-line receive into the contiguous delivery buffer
    /// handed to the observer.
    pub fn into_vec(self) -> Vec<u8> {
        match self {
            DataBuf::Owned(v) => v,
            DataBuf::Pooled(s) => s.as_slice().to_vec(),
        }
    }
}

/// Total capacity across a sequence of destination buffers.
pub fn total_len(bufs: &[DataBuf]) -> usize {
    bufs.iter().map(DataBuf::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_release_round_trip() {
        let pool = Mempool::new(128, 2);
        assert_eq!(pool.available(), 2);
        let seg = pool.alloc(64).unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(seg.len(), 128);
        drop(seg);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn alloc_too_large_fails() {
        let pool = Mempool::new(128, 1);
        assert!(pool.alloc(256).is_none());
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = Mempool::new(64, 1);
        let _seg = pool.alloc(64).unwrap();
        assert!(pool.alloc(64).is_none());
    }
}
