use std::io;

/// In-band failure taxonomy for the verbs-over-TCP datapath.
///
/// `Io`/`Disconnected` are transport-level and always tear the connection
/// down; everything else is a per-message failure that aborts preparation
/// or reassembly of a single task without touching the connection state.
#[derive(thiserror::Error, Debug)]
pub enum DatapathError {
    #[error("message size {size} exceeds limit {limit}")]
    MsgSize { size: usize, limit: usize },

    #[error("malformed header: {reason}")]
    MsgInvalid { reason: &'static str },

    #[error("no buffers available in mempool")]
    NoBufs,

    #[error("caller-provided buffer too small: need {need}, have {have}")]
    UserBufOverflow { need: usize, have: usize },

    #[error("caller provided no destination buffer for response")]
    NoUserBufs,

    #[error("response delivered without data: no destination buffer")]
    PartialMsg,

    #[error("peer advertised iov cap {cap} exceeded by {requested} segments")]
    PeerIovCapExceeded { requested: usize, cap: usize },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("peer disconnected")]
    Disconnected,
}

impl DatapathError {
    /// True for failures that only abort the current message; false for
    /// failures that require tearing the connection down.
    pub fn is_per_message(&self) -> bool {
        !matches!(self, DatapathError::Io(_) | DatapathError::Disconnected)
    }
}

pub type Result<T> = std::result::Result<T, DatapathError>;
