use serde::{Deserialize, Serialize};

/// Negotiated-at-setup connection parameters, advertised by each side in
/// `SETUP_REQ`/`SETUP_RSP` (see `setup.rs`).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TcpOptions {
    /// Proposed shared buffer size; the negotiated value is
    /// `min(client.buffer_sz, server.buffer_sz)`.
    pub buffer_sz: u32,
    /// Maximum inbound segment count this side is willing to receive.
    pub max_in_iovsz: u16,
    /// Maximum outbound segment count this side will ever send.
    pub max_out_iovsz: u16,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self { buffer_sz: 64 * 1024, max_in_iovsz: 4, max_out_iovsz: 4 }
    }
}

/// Connection-level tunables not subject to setup negotiation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ConnTunables {
    /// Number of in-flight sends to accumulate before forcing a completion
    /// batch, bounding the worst-case notification latency.
    pub completion_batch_max: usize,
    /// Optional SO_SNDBUF/SO_RCVBUF override applied to every socket.
    pub socket_buf_size: Option<usize>,
}

impl Default for ConnTunables {
    fn default() -> Self {
        Self { completion_batch_max: 16, socket_buf_size: None }
    }
}
