//! Prepares outbound requests and responses: chooses between the inline
//! SEND path and the out-of-line READ/WRITE path, and assembles the work
//! descriptor handed to the drain engine (spec §4.3/§4.4).
//!
//! Grounded on `xio_tcp_prep_req_in_data`/`xio_tcp_prep_req_out_data` (request
//! side) and `xio_tcp_prep_rsp_wr_data`/`xio_tcp_send_rsp` (response side).

use crate::{
    error::{DatapathError, Result},
    flags::{Status, TcpOp},
    header::{ReqHeader, RspHeader, RSP_HDR_FIXED_LEN},
    mempool::{DataBuf, Mempool},
    sge::{self, ReqSge, ReqSgeVec, RspSge, RspSgeVec, MAX_SGE},
    task::Task,
    tlv::TlvType,
    work::WorkDescriptor,
};

/// Destination the caller wants ready for an eventual response, supplied
/// when posting a new request. Empty means no response body is expected.
pub enum RspBufferHint {
    /// Caller already owns a destination; used directly, no mempool
    /// allocation and no extra copy at delivery.
    Owned(Vec<u8>),
    /// Caller has no buffer ready; reserve `len` bytes from the mempool.
    Sized(usize),
}

impl RspBufferHint {
    fn len(&self) -> usize {
        match self {
            RspBufferHint::Owned(v) => v.len(),
            RspBufferHint::Sized(n) => *n,
        }
    }
}

/// Declares the response-side destination for a new outbound request and
/// reserves `task.data_dest` (`xio_tcp_prep_req_in_data`).
///
/// Chooses the small inline path (`recv_sge`) when the eventual response
/// would fit under `max_send_buf_sz`, otherwise the out-of-line path
/// (`read_sge`), subject to `peer_max_out_iovsz`. `hints` empty means the
/// request expects no response body; both sge lists are left empty and the
/// responder will see `declared_cap == 0` (`Status::PartialMsg` if it tries
/// to reply with data anyway).
pub fn prep_req_in_data(
    task: &mut Task,
    hints: Vec<RspBufferHint>,
    small_zero_copy: bool,
    max_send_buf_sz: u32,
    peer_max_out_iovsz: u16,
    mempool: Option<&Mempool>,
) -> Result<()> {
    task.recv_sge.clear();
    task.read_sge.clear();
    task.data_dest.clear();
    task.data_dest_progress = 0;

    if hints.is_empty() {
        return Ok(());
    }
    if hints.len() > MAX_SGE {
        return Err(DatapathError::MsgInvalid { reason: "too many response segments requested" });
    }

    let total_cap: u64 = hints.iter().map(|h| h.len() as u64).sum();
    let rsp_hdr_estimate = RSP_HDR_FIXED_LEN + hints.len() * 4;
    let fits_inline =
        !small_zero_copy && (rsp_hdr_estimate as u64 + total_cap) < u64::from(max_send_buf_sz);

    if fits_inline {
        for h in &hints {
            task.recv_sge.push(ReqSge { addr: 0, length: h.len() as u32, stag: 0 });
        }
    } else {
        if hints.len() > peer_max_out_iovsz as usize {
            return Err(DatapathError::PeerIovCapExceeded {
                requested: hints.len(),
                cap: peer_max_out_iovsz as usize,
            });
        }
        for h in &hints {
            task.read_sge.push(ReqSge { addr: 0, length: h.len() as u32, stag: 0 });
        }
    }

    let mut data_dest = Vec::with_capacity(hints.len());
    for h in hints {
        match h {
            RspBufferHint::Owned(v) => data_dest.push(DataBuf::Owned(v)),
            RspBufferHint::Sized(n) => {
                let seg = mempool.and_then(|p| p.alloc(n)).ok_or(DatapathError::NoBufs)?;
                data_dest.push(DataBuf::Pooled(seg));
            }
        }
    }
    task.data_dest = data_dest;
    Ok(())
}

/// Builds `task.txd` for a new outbound request (`xio_tcp_prep_req_out_data`):
/// chooses SEND (inline) vs READ (out-of-line, peer-fetched) for the
/// request's own body and packs the transport header.
///
/// `task.recv_sge`/`task.read_sge` must already be set by
/// [`prep_req_in_data`]; they describe the *response* destination and ride
/// along in the request header unchanged.
pub fn prep_req_out_data(
    task: &mut Task,
    ulp_hdr: &[u8],
    out_data: Vec<Vec<u8>>,
    max_send_buf_sz: u32,
    peer_max_in_iovsz: u16,
) -> Result<()> {
    if out_data.len() > MAX_SGE {
        return Err(DatapathError::MsgInvalid { reason: "too many outbound segments" });
    }

    let data_len: u64 = out_data.iter().map(|d| d.len() as u64).sum();
    let mut header = ReqHeader {
        version: 1,
        flags: task.flags.bits(),
        tid: task.ltid,
        opcode: TcpOp::Send as u8,
        ulp_hdr_len: ulp_hdr.len() as u16,
        ulp_pad_len: 0,
        ulp_imm_len: data_len,
        recv_sge: task.recv_sge.clone(),
        read_sge: task.read_sge.clone(),
        write_sge: ReqSgeVec::new(),
    };

    let fixed = header.wire_len() + ulp_hdr.len();
    let send_mode = (fixed as u64 + data_len) < u64::from(max_send_buf_sz);

    if !send_mode && out_data.len() > peer_max_in_iovsz as usize {
        return Err(DatapathError::PeerIovCapExceeded {
            requested: out_data.len(),
            cap: peer_max_in_iovsz as usize,
        });
    }

    task.mbuf.begin_tlv();
    let mut hdr_bytes = Vec::new();

    if send_mode {
        task.tcp_op = TcpOp::Send;
        header.opcode = TcpOp::Send as u8;
        header.pack(&mut hdr_bytes);
        task.mbuf.extend(&hdr_bytes);
        task.mbuf.extend(ulp_hdr);
        task.mbuf.finish_tlv_with_len(TlvType::Req, data_len as usize);
    } else {
        task.tcp_op = TcpOp::Read;
        header.opcode = TcpOp::Read as u8;
        header.write_sge = out_data.iter().map(|d| ReqSge { addr: 0, length: d.len() as u32, stag: 0 }).collect();
        header.pack(&mut hdr_bytes);
        task.mbuf.extend(&hdr_bytes);
        task.mbuf.extend(ulp_hdr);
        task.mbuf.finish_tlv(TlvType::Req);
    }

    let mut entries = Vec::with_capacity(1 + out_data.len());
    entries.push(task.mbuf.as_slice().to_vec());
    entries.extend(out_data);

    task.req_header = Some(header);
    task.txd = WorkDescriptor::new(entries);
    Ok(())
}

/// Builds `task.txd` for a response (`xio_tcp_prep_rsp_wr_data`/
/// `xio_tcp_send_rsp`): follows whichever destination the requester already
/// declared (`req_read_sge` non-empty means WRITE-mode placement, otherwise
/// `req_recv_sge` means inline SEND), clips against its declared capacity
/// and sets `task.status` accordingly.
///
/// A response that doesn't fit (`Status::MsgSize`) or has no declared
/// destination at all (`Status::PartialMsg`) is sent as a bare status-only
/// header with no body — the caller's data is dropped, matching S5/S6.
pub fn prep_rsp_out_data(
    task: &mut Task,
    req_recv_sge: &ReqSgeVec,
    req_read_sge: &ReqSgeVec,
    ulp_hdr: &[u8],
    out_data: Vec<Vec<u8>>,
    max_send_buf_sz: u32,
) -> Result<()> {
    if out_data.len() > MAX_SGE {
        return Err(DatapathError::MsgInvalid { reason: "too many response segments" });
    }

    let data_len: u64 = out_data.iter().map(|d| d.len() as u64).sum();

    let (mode, declared_cap) = if !req_read_sge.is_empty() {
        (TcpOp::Write, sge::total_len(req_read_sge))
    } else if !req_recv_sge.is_empty() {
        (TcpOp::Send, sge::total_len(req_recv_sge))
    } else {
        (TcpOp::Send, 0)
    };

    let status = if data_len == 0 {
        Status::Success
    } else if declared_cap == 0 {
        Status::PartialMsg
    } else if data_len > declared_cap {
        Status::MsgSize
    } else {
        Status::Success
    };
    task.status = status;

    let deliverable = matches!(status, Status::Success);
    let actual_op = if deliverable { mode } else { TcpOp::Send };
    let body = if deliverable { out_data } else { Vec::new() };
    let body_len: u64 = if deliverable { data_len } else { 0 };

    let header = RspHeader {
        version: 1,
        flags: task.flags.bits(),
        tid: task.rtid.unwrap_or(task.ltid),
        opcode: actual_op as u8,
        status: status as u32,
        ulp_hdr_len: ulp_hdr.len() as u16,
        ulp_pad_len: 0,
        ulp_imm_len: body_len,
        write_sge: if deliverable && matches!(actual_op, TcpOp::Write) {
            clip_write_sge_across_requester_segments(body_len, req_read_sge)
        } else {
            RspSgeVec::new()
        },
    };
    task.rsp_write_sge = header.write_sge.clone();

    task.mbuf.begin_tlv();
    let mut hdr_bytes = Vec::new();
    header.pack(&mut hdr_bytes);
    task.mbuf.extend(&hdr_bytes);
    task.mbuf.extend(ulp_hdr);

    match actual_op {
        TcpOp::Send => task.mbuf.finish_tlv_with_len(TlvType::Rsp, body_len as usize),
        _ => task.mbuf.finish_tlv(TlvType::Rsp),
    }

    let mut entries = Vec::with_capacity(1 + body.len());
    entries.push(task.mbuf.as_slice().to_vec());
    entries.extend(body);

    let _ = max_send_buf_sz; // header-vs-body split is dictated by the requester's declared mode, not re-evaluated here
    task.tcp_op = actual_op;
    task.rsp_header = Some(header);
    task.txd = WorkDescriptor::new(entries);
    Ok(())
}

/// Splits `total_local_len` bytes across the requester's declared
/// `req_read_sge` segments in order, each local write segment taking
/// `min(remaining_local, requester_segment_length)` — the wire
/// segmentation a WRITE-mode response must expose, independent of however
/// the local `out_data` buffers happened to be chunked (`xio_tcp_prep_rsp_wr_data`).
fn clip_write_sge_across_requester_segments(total_local_len: u64, req_read_sge: &ReqSgeVec) -> RspSgeVec {
    let mut remaining = total_local_len;
    let mut write_sge = RspSgeVec::new();
    for seg in req_read_sge.iter() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(u64::from(seg.length));
        write_sge.push(RspSge { length: take as u32 });
        remaining -= take;
    }
    write_sge
}
