use crate::{
    error::{DatapathError, Result},
    sge::{ReqSge, ReqSgeVec, RspSge, RspSgeVec, MAX_SGE},
};

/// Fixed-field prefix length of a request header, before the SGE tail.
pub const REQ_HDR_FIXED_LEN: usize = 25;
/// Fixed-field prefix length of a response header, before the SGE tail.
pub const RSP_HDR_FIXED_LEN: usize = 25;
/// Bytes per request-side SGE descriptor on the wire: addr(8) + length(4) + stag(4).
const REQ_SGE_WIRE_LEN: usize = 16;
/// Bytes per response-side SGE descriptor on the wire: length(4).
const RSP_SGE_WIRE_LEN: usize = 4;

/// Request transport header: fixed fields plus segment descriptor tails for
/// recv, read and write segments, in that order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReqHeader {
    pub version: u8,
    pub flags: u8,
    pub tid: u16,
    pub opcode: u8,
    pub ulp_hdr_len: u16,
    pub ulp_pad_len: u16,
    pub ulp_imm_len: u64,
    pub recv_sge: ReqSgeVec,
    pub read_sge: ReqSgeVec,
    pub write_sge: ReqSgeVec,
}

impl ReqHeader {
    /// Total header length as written in `req_hdr_len`: fixed prefix plus
    /// every trailing segment descriptor.
    pub fn wire_len(&self) -> usize {
        REQ_HDR_FIXED_LEN
            + (self.recv_sge.len() + self.read_sge.len() + self.write_sge.len()) * REQ_SGE_WIRE_LEN
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        let req_hdr_len = self.wire_len() as u16;
        out.push(self.version);
        out.push(self.flags);
        out.extend_from_slice(&req_hdr_len.to_be_bytes());
        out.extend_from_slice(&self.tid.to_be_bytes());
        out.push(self.opcode);
        out.extend_from_slice(&(self.recv_sge.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.read_sge.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.write_sge.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.ulp_hdr_len.to_be_bytes());
        out.extend_from_slice(&self.ulp_pad_len.to_be_bytes());
        out.extend_from_slice(&self.ulp_imm_len.to_be_bytes());
        for sge in self.recv_sge.iter().chain(self.read_sge.iter()).chain(self.write_sge.iter()) {
            pack_req_sge(out, sge);
        }
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < REQ_HDR_FIXED_LEN {
            return Err(DatapathError::MsgInvalid { reason: "request header truncated" });
        }
        let version = buf[0];
        let flags = buf[1];
        let req_hdr_len = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let tid = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        let opcode = buf[6];
        let recv_num_sge = u16::from_be_bytes(buf[7..9].try_into().unwrap()) as usize;
        let read_num_sge = u16::from_be_bytes(buf[9..11].try_into().unwrap()) as usize;
        let write_num_sge = u16::from_be_bytes(buf[11..13].try_into().unwrap()) as usize;
        let ulp_hdr_len = u16::from_be_bytes(buf[13..15].try_into().unwrap());
        let ulp_pad_len = u16::from_be_bytes(buf[15..17].try_into().unwrap());
        let ulp_imm_len = u64::from_be_bytes(buf[17..25].try_into().unwrap());

        if recv_num_sge > MAX_SGE || read_num_sge > MAX_SGE || write_num_sge > MAX_SGE {
            return Err(DatapathError::MsgInvalid { reason: "request header sge count exceeds cap" });
        }

        let total_sge = recv_num_sge + read_num_sge + write_num_sge;
        let expected = REQ_HDR_FIXED_LEN + total_sge * REQ_SGE_WIRE_LEN;
        if usize::from(req_hdr_len) != expected || buf.len() < expected {
            return Err(DatapathError::MsgInvalid { reason: "request header length mismatch" });
        }

        let mut cursor = REQ_HDR_FIXED_LEN;
        let mut recv_sge = ReqSgeVec::new();
        let mut read_sge = ReqSgeVec::new();
        let mut write_sge = ReqSgeVec::new();
        for (n, dst) in [
            (recv_num_sge, &mut recv_sge),
            (read_num_sge, &mut read_sge),
            (write_num_sge, &mut write_sge),
        ] {
            for _ in 0..n {
                dst.push(unpack_req_sge(&buf[cursor..cursor + REQ_SGE_WIRE_LEN]));
                cursor += REQ_SGE_WIRE_LEN;
            }
        }

        Ok(Self {
            version,
            flags,
            tid,
            opcode,
            ulp_hdr_len,
            ulp_pad_len,
            ulp_imm_len,
            recv_sge,
            read_sge,
            write_sge,
        })
    }
}

/// Response transport header: fixed fields plus a write-segment-length tail
/// (response descriptors carry only `length`, no address/tag).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RspHeader {
    pub version: u8,
    pub flags: u8,
    pub tid: u16,
    pub opcode: u8,
    pub status: u32,
    pub ulp_hdr_len: u16,
    pub ulp_pad_len: u16,
    pub ulp_imm_len: u64,
    pub write_sge: RspSgeVec,
}

impl RspHeader {
    pub fn wire_len(&self) -> usize {
        RSP_HDR_FIXED_LEN + self.write_sge.len() * RSP_SGE_WIRE_LEN
    }

    pub fn pack(&self, out: &mut Vec<u8>) {
        let rsp_hdr_len = self.wire_len() as u16;
        out.push(self.version);
        out.push(self.flags);
        out.extend_from_slice(&rsp_hdr_len.to_be_bytes());
        out.extend_from_slice(&self.tid.to_be_bytes());
        out.push(self.opcode);
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&(self.write_sge.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.ulp_hdr_len.to_be_bytes());
        out.extend_from_slice(&self.ulp_pad_len.to_be_bytes());
        out.extend_from_slice(&self.ulp_imm_len.to_be_bytes());
        for sge in self.write_sge.iter() {
            out.extend_from_slice(&sge.length.to_be_bytes());
        }
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < RSP_HDR_FIXED_LEN {
            return Err(DatapathError::MsgInvalid { reason: "response header truncated" });
        }
        let version = buf[0];
        let flags = buf[1];
        let rsp_hdr_len = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let tid = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        let opcode = buf[6];
        let status = u32::from_be_bytes(buf[7..11].try_into().unwrap());
        let write_num_sge = u16::from_be_bytes(buf[11..13].try_into().unwrap()) as usize;
        let ulp_hdr_len = u16::from_be_bytes(buf[13..15].try_into().unwrap());
        let ulp_pad_len = u16::from_be_bytes(buf[15..17].try_into().unwrap());
        let ulp_imm_len = u64::from_be_bytes(buf[17..25].try_into().unwrap());

        if write_num_sge > MAX_SGE {
            return Err(DatapathError::MsgInvalid { reason: "response header sge count exceeds cap" });
        }

        let expected = RSP_HDR_FIXED_LEN + write_num_sge * RSP_SGE_WIRE_LEN;
        if usize::from(rsp_hdr_len) != expected || buf.len() < expected {
            return Err(DatapathError::MsgInvalid { reason: "response header length mismatch" });
        }

        let mut write_sge = RspSgeVec::new();
        let mut cursor = RSP_HDR_FIXED_LEN;
        for _ in 0..write_num_sge {
            let length = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap());
            write_sge.push(RspSge { length });
            cursor += RSP_SGE_WIRE_LEN;
        }

        Ok(Self {
            version,
            flags,
            tid,
            opcode,
            status,
            ulp_hdr_len,
            ulp_pad_len,
            ulp_imm_len,
            write_sge,
        })
    }
}

fn pack_req_sge(out: &mut Vec<u8>, sge: &ReqSge) {
    // addr is vestigial on the wire for a stream transport; always 0.
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&sge.length.to_be_bytes());
    out.extend_from_slice(&sge.stag.to_be_bytes());
}

fn unpack_req_sge(buf: &[u8]) -> ReqSge {
    let addr = u64::from_be_bytes(buf[0..8].try_into().unwrap());
    let length = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    let stag = u32::from_be_bytes(buf[12..16].try_into().unwrap());
    ReqSge { addr, length, stag }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_req(recv: usize, read: usize, write: usize) -> ReqHeader {
        let mut h = ReqHeader {
            version: 1,
            flags: 0,
            tid: 42,
            opcode: 0,
            ulp_hdr_len: 16,
            ulp_pad_len: 0,
            ulp_imm_len: 4096,
            ..Default::default()
        };
        for i in 0..recv {
            h.recv_sge.push(ReqSge { addr: 0, length: (i as u32 + 1) * 64, stag: 7 });
        }
        for i in 0..read {
            h.read_sge.push(ReqSge { addr: 0, length: (i as u32 + 1) * 128, stag: 9 });
        }
        for i in 0..write {
            h.write_sge.push(ReqSge { addr: 0, length: (i as u32 + 1) * 256, stag: 11 });
        }
        h
    }

    #[test]
    fn req_round_trip_no_sge() {
        let h = sample_req(0, 0, 0);
        let mut buf = Vec::new();
        h.pack(&mut buf);
        assert_eq!(ReqHeader::unpack(&buf).unwrap(), h);
    }

    #[test]
    fn req_round_trip_with_sge() {
        let h = sample_req(1, 2, 3);
        let mut buf = Vec::new();
        h.pack(&mut buf);
        assert_eq!(ReqHeader::unpack(&buf).unwrap(), h);
    }

    #[test]
    fn req_header_len_mismatch_is_invalid() {
        let h = sample_req(1, 0, 0);
        let mut buf = Vec::new();
        h.pack(&mut buf);
        // corrupt req_hdr_len field
        buf[2..4].copy_from_slice(&9u16.to_be_bytes());
        assert!(ReqHeader::unpack(&buf).is_err());
    }

    #[test]
    fn rsp_round_trip() {
        let h = RspHeader {
            version: 1,
            flags: 0,
            tid: 7,
            opcode: 0,
            status: 0,
            ulp_hdr_len: 8,
            ulp_pad_len: 0,
            ulp_imm_len: 1024,
            write_sge: {
                let mut v = RspSgeVec::new();
                v.push(RspSge { length: 512 });
                v.push(RspSge { length: 512 });
                v
            },
        };
        let mut buf = Vec::new();
        h.pack(&mut buf);
        assert_eq!(RspHeader::unpack(&buf).unwrap(), h);
    }
}
