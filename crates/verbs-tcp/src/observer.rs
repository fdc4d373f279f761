use crate::{error::DatapathError, flags::Status};

/// Application-facing buffer assignment returned from `assign_in_buf`.
pub enum InBufAssignment {
    /// The application claims the buffer; each length must be >= the
    /// peer-declared segment length or the task fails with
    /// `UserBufOverflow`.
    Assigned(Vec<Vec<u8>>),
    /// The application declines; the datapath falls back to the mempool.
    NotAssigned,
}

/// Collaborator contract the datapath notifies as tasks progress.
///
/// Grounded in the four observer events named by the wire design: delivery
/// of a fully reassembled message, send-completion, buffer assignment for
/// the inbound READ path, and transport-level errors.
pub trait Observer {
    /// A message (request or response) has been fully reassembled and is
    /// ready for the application. `ltid` identifies the task; on a response,
    /// `rtid` is the originating request's task id. `status` is
    /// `Status::Success` unless the response overran the caller's buffer
    /// (see `Status::MsgSize`) or arrived with no destination (`PartialMsg`).
    fn new_message(&mut self, ltid: u16, rtid: Option<u16>, status: Status, data: &[u8]);

    /// The task identified by `ltid` has had its outbound bytes fully
    /// handed to the socket and batched for completion.
    fn send_completion(&mut self, ltid: u16);

    /// Queried during inbound READ-path preparation to let the application
    /// supply destination buffers instead of the mempool. `segment_lens` are
    /// the peer-declared segment lengths the buffers must cover.
    fn assign_in_buf(&mut self, ltid: u16, segment_lens: &[u32]) -> InBufAssignment {
        let _ = (ltid, segment_lens);
        InBufAssignment::NotAssigned
    }

    /// A transport-level error occurred; the connection is being torn down.
    fn error(&mut self, err: &DatapathError) {
        let _ = err;
    }
}
