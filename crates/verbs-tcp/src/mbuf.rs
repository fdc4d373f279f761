use crate::tlv::{TlvHeader, TLV_LEN};

/// A single owned framing buffer carrying `[ TLV | transport header |
/// segment descriptors | ULP header | pad | inline payload ]`.
///
/// Mirrors the role of the teacher's `send_buf`/`rx_buf` staging buffers in
/// `stream.rs`, generalised to carry the TLV-framed transport header instead
/// of a bare length prefix.
#[derive(Debug, Default)]
pub struct Mbuf {
    buf: Vec<u8>,
}

impl Mbuf {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reserves room for the TLV prefix and returns the payload write
    /// position; call `finish_tlv` once the payload (header + body) has
    /// been appended to backfill the length.
    pub fn begin_tlv(&mut self) {
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; TLV_LEN]);
    }

    pub fn finish_tlv(&mut self, msg_type: crate::tlv::TlvType) {
        self.finish_tlv_with_len(msg_type, 0);
    }

    /// Like `finish_tlv`, but `trailing_len` additional bytes are declared as
    /// part of the TLV length without being copied into this buffer — used
    /// for inline (SEND-mode) payload carried as separate zero-copy vector
    /// entries after the framing buffer.
    pub fn finish_tlv_with_len(&mut self, msg_type: crate::tlv::TlvType, trailing_len: usize) {
        let len = (self.buf.len() - TLV_LEN + trailing_len) as u32;
        let header = TlvHeader { msg_type, len };
        let mut tlv_buf = [0u8; TLV_LEN];
        header.pack(&mut tlv_buf);
        self.buf[..TLV_LEN].copy_from_slice(&tlv_buf);
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
