use std::{
    collections::VecDeque,
    io::{self, IoSlice, IoSliceMut, Read, Write},
};

/// Outcome of a single send/recv attempt against a work descriptor.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// The descriptor's vector is now fully drained/filled.
    Done,
    /// `n` bytes progressed; more remain.
    Partial(usize),
    /// The underlying socket would block; no bytes progressed this call.
    WouldBlock,
    /// Peer closed the connection (recv read 0, or send hit a reset).
    Disconnected,
}

/// A scatter/gather work descriptor: an ordered sequence of owned buffers
/// plus a cursor tracking how much of the front buffer has already been
/// sent/filled.
///
/// Mirrors `xio_tcp_send_work`/`xio_tcp_recv_work`'s partial-I/O vector
/// rewriting: after a partial transfer of `n` bytes, fully-consumed entries
/// are dropped and the new front entry resumes at the correct offset — the
/// byte-conservation invariant this type exists to guarantee.
#[derive(Debug, Default)]
pub struct WorkDescriptor {
    entries: VecDeque<Vec<u8>>,
    head_offset: usize,
    total_remaining: usize,
}

impl WorkDescriptor {
    pub fn new(entries: Vec<Vec<u8>>) -> Self {
        let total_remaining = entries.iter().map(Vec::len).sum();
        Self { entries: entries.into(), head_offset: 0, total_remaining }
    }

    pub fn empty() -> Self {
        Self { entries: VecDeque::new(), head_offset: 0, total_remaining: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.total_remaining
    }

    pub fn is_done(&self) -> bool {
        self.total_remaining == 0
    }

    /// Drains the entry list out, leaving this descriptor empty. Used once a
    /// fixed-size staging recv (TLV prefix, transport header) completes, to
    /// hand the filled buffers back to the caller for parsing.
    pub fn take_entries(&mut self) -> Vec<Vec<u8>> {
        self.head_offset = 0;
        self.total_remaining = 0;
        self.entries.drain(..).collect()
    }

    /// Advances the cursor by `n` bytes, dropping fully-consumed entries and
    /// resuming the new front entry at the correct offset.
    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.entries.front() else { break };
            let front_remaining = front.len() - self.head_offset;
            if n < front_remaining {
                self.head_offset += n;
                self.total_remaining -= n;
                n = 0;
            } else {
                self.total_remaining -= front_remaining;
                n -= front_remaining;
                self.entries.pop_front();
                self.head_offset = 0;
            }
        }
    }

    pub fn send<W: Write>(&mut self, w: &mut W) -> io::Result<Progress> {
        if self.is_done() {
            return Ok(Progress::Done);
        }
        let slices: Vec<IoSlice<'_>> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| if i == 0 { IoSlice::new(&e[self.head_offset..]) } else { IoSlice::new(e) })
            .collect();

        match w.write_vectored(&slices) {
            Ok(0) => Ok(Progress::Disconnected),
            Ok(n) => {
                self.advance(n);
                Ok(if self.is_done() { Progress::Done } else { Progress::Partial(n) })
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Progress::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(Progress::Disconnected),
            Err(e) => Err(e),
        }
    }

    pub fn recv<R: Read>(&mut self, r: &mut R) -> io::Result<Progress> {
        if self.is_done() {
            return Ok(Progress::Done);
        }
        let head_offset = self.head_offset;
        let slice = self.entries.make_contiguous();
        let mut iov: Vec<IoSliceMut<'_>> = Vec::with_capacity(slice.len());
        if let Some((first, rest)) = slice.split_first_mut() {
            iov.push(IoSliceMut::new(&mut first[head_offset..]));
            for e in rest {
                iov.push(IoSliceMut::new(e));
            }
        }

        match r.read_vectored(&mut iov) {
            Ok(0) => Ok(Progress::Disconnected),
            Ok(n) => {
                self.advance(n);
                Ok(if self.is_done() { Progress::Done } else { Progress::Partial(n) })
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Progress::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(Progress::Disconnected),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake writer that accepts an exact byte count per call, used to
    /// exercise partial-progress accounting deterministically (a real
    /// socket's short-write behaviour isn't reliably reproducible in CI).
    struct CountingWriter {
        accept: usize,
    }

    impl Write for CountingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len().min(self.accept))
        }
        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let mut remaining = self.accept;
            let mut written = 0;
            for b in bufs {
                if remaining == 0 {
                    break;
                }
                let take = b.len().min(remaining);
                written += take;
                remaining -= take;
            }
            Ok(written)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn byte_conservation_on_partial_send() {
        let mut wd = WorkDescriptor::new(vec![vec![0u8; 4096]]);
        assert_eq!(wd.remaining(), 4096);
        let mut w = CountingWriter { accept: 1000 };
        let progress = wd.send(&mut w).unwrap();
        assert_eq!(progress, Progress::Partial(1000));
        assert_eq!(wd.remaining(), 3096);
    }

    #[test]
    fn multi_entry_drain_crosses_boundaries() {
        let mut wd = WorkDescriptor::new(vec![vec![1u8; 100], vec![2u8; 100], vec![3u8; 100]]);
        let mut w = CountingWriter { accept: 150 };
        let progress = wd.send(&mut w).unwrap();
        assert_eq!(progress, Progress::Partial(150));
        assert_eq!(wd.remaining(), 150);
        // second entry half-consumed: the new front (entry index 1) keeps the
        // remaining 50 bytes.
        let mut w2 = CountingWriter { accept: 1000 };
        let progress = wd.send(&mut w2).unwrap();
        assert_eq!(progress, Progress::Done);
        assert_eq!(wd.remaining(), 0);
    }

    #[test]
    fn empty_descriptor_is_done() {
        let wd = WorkDescriptor::empty();
        assert!(wd.is_done());
    }
}
