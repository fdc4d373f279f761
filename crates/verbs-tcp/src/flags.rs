use bitflags::bitflags;

bitflags! {
    /// Per-message outbound flags, carried in the transport header.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// More messages from this batch are coming; don't invoke the drain
        /// engine on enqueue, the caller will drive it once after the batch.
        const MORE_IN_BATCH    = 0b0000_0001;
        /// Request unbatched send-completion notification for this task.
        const IMM_SEND_COMP    = 0b0000_0010;
        /// Force the out-of-line (READ/WRITE) path even if the small-message
        /// path would fit, to avoid an extra copy at the application.
        const SMALL_ZERO_COPY  = 0b0000_0100;
        /// Task is cancelled: progress through the lists as usual but skip
        /// completion notification.
        const CANCEL           = 0b0000_1000;
        /// Task is internal control traffic (setup), not application data.
        const IS_CONTROL       = 0b0001_0000;
    }
}

/// Per-message placement mode, chosen during outbound preparation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TcpOp {
    /// Payload travels inline with the header.
    Send = 0,
    /// Payload is fetched by the peer out-of-line (request side).
    Read = 1,
    /// Payload is placed by the peer out-of-line (response side).
    Write = 2,
}

impl TcpOp {
    pub fn from_u8(v: u8) -> crate::error::Result<Self> {
        match v {
            0 => Ok(TcpOp::Send),
            1 => Ok(TcpOp::Read),
            2 => Ok(TcpOp::Write),
            _ => Err(crate::error::DatapathError::MsgInvalid { reason: "unknown opcode" }),
        }
    }
}

/// Status codes carried in a response header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    MsgSize = 1,
    MsgInvalid = 2,
    NoBufs = 3,
    UserBufOverflow = 4,
    NoUserBufs = 5,
    PartialMsg = 6,
    Invalid = 7,
}

impl Status {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Status::Success,
            1 => Status::MsgSize,
            2 => Status::MsgInvalid,
            3 => Status::NoBufs,
            4 => Status::UserBufOverflow,
            5 => Status::NoUserBufs,
            6 => Status::PartialMsg,
            _ => Status::Invalid,
        }
    }
}
