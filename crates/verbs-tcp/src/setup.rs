//! The first exchange on a connection, negotiating `buffer_sz` and the
//! iovsz caps before any application traffic (spec §4.7).

use crate::{
    error::{DatapathError, Result},
    options::TcpOptions,
};

/// Fixed wire layout shared by `SETUP_REQ`/`SETUP_RSP`: three `u32`-ish
/// fields, all network byte order. `buffer_sz` is a `u32`; the two iovsz caps
/// are carried as `u16` to match their use elsewhere as segment counts.
pub const SETUP_MSG_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupMsg {
    pub buffer_sz: u32,
    pub max_in_iovsz: u16,
    pub max_out_iovsz: u16,
}

impl SetupMsg {
    pub fn from_options(opts: &TcpOptions) -> Self {
        Self {
            buffer_sz: opts.buffer_sz,
            max_in_iovsz: opts.max_in_iovsz,
            max_out_iovsz: opts.max_out_iovsz,
        }
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.buffer_sz.to_be_bytes());
        out.extend_from_slice(&self.max_in_iovsz.to_be_bytes());
        out.extend_from_slice(&self.max_out_iovsz.to_be_bytes());
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < SETUP_MSG_LEN {
            return Err(DatapathError::MsgInvalid { reason: "setup message truncated" });
        }
        let buffer_sz = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let max_in_iovsz = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        let max_out_iovsz = u16::from_be_bytes(buf[6..8].try_into().unwrap());
        Ok(Self { buffer_sz, max_in_iovsz, max_out_iovsz })
    }

    /// Server-side negotiation: adopt the smaller of the two proposed buffer
    /// sizes, echo the iovsz caps back verbatim.
    pub fn negotiate_response(&self, local: &TcpOptions) -> Self {
        Self {
            buffer_sz: self.buffer_sz.min(local.buffer_sz),
            max_in_iovsz: self.max_in_iovsz,
            max_out_iovsz: self.max_out_iovsz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let m = SetupMsg { buffer_sz: 128 * 1024, max_in_iovsz: 4, max_out_iovsz: 4 };
        let mut buf = Vec::new();
        m.pack(&mut buf);
        assert_eq!(SetupMsg::unpack(&buf).unwrap(), m);
    }

    #[test]
    fn negotiation_picks_smaller_buffer() {
        let req = SetupMsg { buffer_sz: 128 * 1024, max_in_iovsz: 4, max_out_iovsz: 4 };
        let local = TcpOptions { buffer_sz: 64 * 1024, max_in_iovsz: 4, max_out_iovsz: 4 };
        let rsp = req.negotiate_response(&local);
        assert_eq!(rsp.buffer_sz, 64 * 1024);
        assert_eq!(rsp.max_in_iovsz, 4);
        assert_eq!(rsp.max_out_iovsz, 4);
    }

    #[test]
    fn truncated_is_invalid() {
        let buf = [0u8; 4];
        assert!(SetupMsg::unpack(&buf).is_err());
    }
}
