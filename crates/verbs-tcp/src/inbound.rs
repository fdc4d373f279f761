//! Per-task receive reassembly: TLV -> HEADER -> optional out-of-line
//! IO_DATA stage (spec §4.6). Grounded on `xio_tcp_rx_handler`.
//!
//! These functions are deliberately task-local (no list/pool mutation,
//! mirroring `outbound.rs`'s split between pure preparation and the list
//! choreography `Connection` owns). Cross-task work — matching a response to
//! its originator, moving a task between lists — lives in `connection.rs`.

use crate::{
    error::{DatapathError, Result},
    flags::{Status, TcpOp},
    header::{ReqHeader, RspHeader},
    mempool::{DataBuf, Mempool},
    observer::{InBufAssignment, Observer},
    task::{RxStage, Task},
    tlv::{TlvHeader, TlvType, TLV_LEN},
    work::WorkDescriptor,
};

/// What the HEADER stage determined should happen next (spec §4.6 HEADER).
pub enum HeaderOutcome {
    /// `tlv_type` was `SETUP_REQ`/`SETUP_RSP`; dispatch to `setup.rs`.
    Setup { tlv_type: TlvType, payload: Vec<u8> },
    /// An application request. `needs_io_data` is true for the READ opcode
    /// (out-of-line body still to be received via [`rd_req_header`] then a
    /// second recv phase); false for SEND, whose body already landed in
    /// `task.data`.
    Request { needs_io_data: bool },
    /// An application response identifying its local originator by `rtid`.
    /// `body` is the fully assembled response payload when the responder
    /// used the inline SEND path (and `Status::Success`); `None` when a
    /// second out-of-line recv phase is still needed (WRITE opcode) or the
    /// responder sent no body at all (non-success status).
    Response { rtid: u16, body: Option<Vec<u8>> },
}

/// Arms the TLV stage: read the fixed-size TLV prefix into a staging buffer.
pub fn start_tlv_read(task: &mut Task) {
    task.rxd = WorkDescriptor::new(vec![vec![0u8; TLV_LEN]]);
    task.stage = RxStage::Tlv;
}

/// Consumes the just-completed TLV read and arms the HEADER stage.
pub fn finish_tlv_read(task: &mut Task) -> Result<()> {
    let entries = task.rxd.take_entries();
    let raw = entries.into_iter().next().unwrap_or_default();
    let buf: [u8; TLV_LEN] =
        raw.as_slice().try_into().map_err(|_| DatapathError::MsgInvalid { reason: "short tlv read" })?;
    let tlv = TlvHeader::unpack(&buf)?;
    task.tlv_type = Some(tlv.msg_type);
    task.rxd = WorkDescriptor::new(vec![vec![0u8; tlv.len as usize]]);
    task.stage = RxStage::Header;
    Ok(())
}

/// Consumes the just-completed HEADER read and classifies the message,
/// storing header fields and the parsed ULP header onto `task`.
///
/// `peer_max_in_iovsz` bounds the number of out-of-line segments an inbound
/// request may declare (the stricter, always-enforced variant of the
/// length-check the original left commented out, see `SPEC_FULL.md` §9).
pub fn finish_header_read(task: &mut Task, peer_max_in_iovsz: u16) -> Result<HeaderOutcome> {
    let entries = task.rxd.take_entries();
    let buf = entries.into_iter().next().unwrap_or_default();
    let tlv_type = task
        .tlv_type
        .ok_or(DatapathError::MsgInvalid { reason: "header stage entered without a tlv type" })?;

    match tlv_type {
        TlvType::SetupReq | TlvType::SetupRsp => Ok(HeaderOutcome::Setup { tlv_type, payload: buf }),
        TlvType::Req => classify_request(task, &buf, peer_max_in_iovsz),
        TlvType::Rsp => classify_response(task, &buf),
    }
}

fn classify_request(task: &mut Task, buf: &[u8], peer_max_in_iovsz: u16) -> Result<HeaderOutcome> {
    let header = ReqHeader::unpack(buf)?;
    if header.write_sge.len() > peer_max_in_iovsz as usize {
        return Err(DatapathError::MsgSize {
            size: header.write_sge.len(),
            limit: peer_max_in_iovsz as usize,
        });
    }

    let op = TcpOp::from_u8(header.opcode)?;
    if op == TcpOp::Write {
        return Err(DatapathError::MsgInvalid { reason: "request cannot carry a WRITE opcode" });
    }

    let ulp_off = header.wire_len();
    task.ulp_hdr = slice_or_empty(buf, ulp_off, header.ulp_hdr_len as usize);
    let inline_off = ulp_off + header.ulp_hdr_len as usize + header.ulp_pad_len as usize;

    task.rtid = None;
    task.recv_sge = header.recv_sge.clone();
    task.read_sge = header.read_sge.clone();
    task.write_sge = header.write_sge.clone();
    task.tcp_op = op;
    let needs_io_data = op == TcpOp::Read;
    if !needs_io_data {
        task.data = buf.get(inline_off..).unwrap_or_default().to_vec();
        task.stage = RxStage::IoData;
    }
    task.req_header = Some(header);
    Ok(HeaderOutcome::Request { needs_io_data })
}

fn classify_response(task: &mut Task, buf: &[u8]) -> Result<HeaderOutcome> {
    let header = RspHeader::unpack(buf)?;
    let op = TcpOp::from_u8(header.opcode)?;
    let rtid = header.tid;

    let ulp_off = header.wire_len();
    task.ulp_hdr = slice_or_empty(buf, ulp_off, header.ulp_hdr_len as usize);
    let inline_off = ulp_off + header.ulp_hdr_len as usize + header.ulp_pad_len as usize;

    task.rtid = Some(rtid);
    task.tcp_op = op;
    task.status = Status::from_u32(header.status);
    task.write_sge.clear();

    let body = match (task.status, op) {
        (Status::Success, TcpOp::Send) => {
            let inline = buf.get(inline_off..).unwrap_or_default().to_vec();
            task.stage = RxStage::IoData;
            Some(inline)
        }
        (Status::Success, TcpOp::Write) => None,
        _ => {
            task.stage = RxStage::IoData;
            Some(Vec::new())
        }
    };

    task.rsp_header = Some(header);
    Ok(HeaderOutcome::Response { rtid, body })
}

fn slice_or_empty(buf: &[u8], off: usize, len: usize) -> Vec<u8> {
    buf.get(off..off + len).unwrap_or_default().to_vec()
}

/// Arms the second recv phase for an inbound READ-mode request
/// (`xio_tcp_rd_req_header`): queries the observer for application-owned
/// destination buffers, falling back to the mempool.
pub fn rd_req_header(task: &mut Task, observer: &mut dyn Observer, mempool: Option<&Mempool>) -> Result<()> {
    let lens: Vec<u32> = task.write_sge.iter().map(|s| s.length).collect();
    task.data_dest = acquire_dest_bufs(task.ltid, &lens, observer, mempool)?;
    task.rxd = WorkDescriptor::new(lens.iter().map(|l| vec![0u8; *l as usize]).collect());
    task.stage = RxStage::IoData;
    Ok(())
}

/// Arms the second recv phase for a WRITE-mode response landing directly
/// into the originating request's pre-posted destination
/// (`write_sge` here is the responder's own split of the data, which may use
/// fewer segments than the originator declared if its data was shorter).
pub fn begin_response_write(task: &mut Task, write_sge_lens: &[u32]) {
    task.rxd = WorkDescriptor::new(write_sge_lens.iter().map(|l| vec![0u8; *l as usize]).collect());
}

/// Consumes the just-completed IO_DATA recv, returning the flattened bytes.
pub fn finish_io_data(task: &mut Task) -> Vec<u8> {
    task.rxd.take_entries().concat()
}

fn acquire_dest_bufs(
    ltid: u16,
    lens: &[u32],
    observer: &mut dyn Observer,
    mempool: Option<&Mempool>,
) -> Result<Vec<DataBuf>> {
    match observer.assign_in_buf(ltid, lens) {
        InBufAssignment::Assigned(bufs) => {
            if bufs.len() != lens.len() || bufs.iter().zip(lens).any(|(b, l)| (b.len() as u32) < *l) {
                return Err(DatapathError::UserBufOverflow {
                    need: lens.iter().map(|l| *l as usize).sum(),
                    have: bufs.iter().map(Vec::len).sum(),
                });
            }
            Ok(bufs.into_iter().map(DataBuf::Owned).collect())
        }
        InBufAssignment::NotAssigned => {
            let pool = mempool.ok_or(DatapathError::NoBufs)?;
            let mut out = Vec::with_capacity(lens.len());
            for len in lens {
                out.push(DataBuf::Pooled(pool.alloc(*len as usize).ok_or(DatapathError::NoBufs)?));
            }
            Ok(out)
        }
    }
}

/// Copies `bytes` across `dest` in order, each buffer taking up to its own
/// capacity, mirroring how the responder clipped its own output across the
/// requester's declared segments (spec §4.4). Used both for an inline
/// (SEND) response body and a reassembled out-of-line (WRITE) one, since by
/// the time the bytes are in hand the landing logic is identical.
pub fn distribute(bytes: &[u8], dest: &mut [DataBuf]) -> Result<()> {
    let cap: usize = dest.iter().map(DataBuf::len).sum();
    if bytes.len() > cap {
        return Err(DatapathError::UserBufOverflow { need: bytes.len(), have: cap });
    }
    let mut off = 0;
    for d in dest.iter_mut() {
        let take = (bytes.len() - off).min(d.len());
        d.as_mut_slice()[..take].copy_from_slice(&bytes[off..off + take]);
        off += take;
        if off == bytes.len() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mempool::DataBuf,
        sge::ReqSge,
        task::{TaskList, TaskPool, TaskRole},
        tlv::TlvType,
    };

    fn new_task() -> (TaskPool, u16) {
        let mut pool = TaskPool::new();
        let ltid = pool.alloc(TaskRole::Request, TaskList::Rx);
        (pool, ltid)
    }

    #[test]
    fn tlv_then_header_for_send_request() {
        let (mut pool, ltid) = new_task();
        let task = pool.get_mut(ltid).unwrap();

        let mut header = ReqHeader {
            version: 1,
            flags: 0,
            tid: 5,
            opcode: TcpOp::Send as u8,
            ulp_hdr_len: 3,
            ulp_pad_len: 0,
            ulp_imm_len: 5,
            ..Default::default()
        };
        header.recv_sge.push(ReqSge { addr: 0, length: 64, stag: 0 });
        let mut hdr_bytes = Vec::new();
        header.pack(&mut hdr_bytes);
        let mut full = hdr_bytes.clone();
        full.extend_from_slice(b"hdr");
        full.extend_from_slice(b"hello");

        task.tlv_type = Some(TlvType::Req);
        task.rxd = WorkDescriptor::new(vec![full]);
        let outcome = finish_header_read(task, 8).unwrap();
        assert!(matches!(outcome, HeaderOutcome::Request { needs_io_data: false }));
        assert_eq!(task.data, b"hello");
        assert_eq!(task.ulp_hdr, b"hdr");
        assert_eq!(task.recv_sge.len(), 1);
    }

    #[test]
    fn read_request_exceeding_peer_cap_fails() {
        let (mut pool, ltid) = new_task();
        let task = pool.get_mut(ltid).unwrap();
        let mut header = ReqHeader {
            version: 1,
            opcode: TcpOp::Read as u8,
            ulp_imm_len: 100,
            ..Default::default()
        };
        for i in 0..3 {
            header.write_sge.push(ReqSge { addr: 0, length: (i + 1) * 32, stag: 0 });
        }
        let mut buf = Vec::new();
        header.pack(&mut buf);
        task.tlv_type = Some(TlvType::Req);
        task.rxd = WorkDescriptor::new(vec![buf]);
        let err = finish_header_read(task, 2).unwrap_err();
        assert!(matches!(err, DatapathError::MsgSize { .. }));
    }

    #[test]
    fn response_send_success_carries_inline_body() {
        let (mut pool, ltid) = new_task();
        let task = pool.get_mut(ltid).unwrap();
        let header = RspHeader {
            version: 1,
            tid: 9,
            opcode: TcpOp::Send as u8,
            status: Status::Success as u32,
            ulp_imm_len: 4,
            ..Default::default()
        };
        let mut buf = Vec::new();
        header.pack(&mut buf);
        buf.extend_from_slice(b"data");
        task.tlv_type = Some(TlvType::Rsp);
        task.rxd = WorkDescriptor::new(vec![buf]);
        let outcome = finish_header_read(task, 8).unwrap();
        match outcome {
            HeaderOutcome::Response { rtid, body } => {
                assert_eq!(rtid, 9);
                assert_eq!(body.unwrap(), b"data");
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn response_partial_msg_carries_no_body() {
        let (mut pool, ltid) = new_task();
        let task = pool.get_mut(ltid).unwrap();
        let header = RspHeader {
            version: 1,
            tid: 9,
            opcode: TcpOp::Send as u8,
            status: Status::PartialMsg as u32,
            ulp_imm_len: 0,
            ..Default::default()
        };
        let mut buf = Vec::new();
        header.pack(&mut buf);
        task.tlv_type = Some(TlvType::Rsp);
        task.rxd = WorkDescriptor::new(vec![buf]);
        let outcome = finish_header_read(task, 8).unwrap();
        match outcome {
            HeaderOutcome::Response { body, .. } => assert_eq!(body.unwrap(), Vec::<u8>::new()),
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn distribute_splits_across_destinations_in_order() {
        let mut dest = vec![DataBuf::Owned(vec![0u8; 4]), DataBuf::Owned(vec![0u8; 4])];
        distribute(b"abcdefg", &mut dest).unwrap();
        assert_eq!(dest[0].as_slice(), b"abcd");
        assert_eq!(dest[1].as_slice()[..3], b"efg"[..]);
    }

    #[test]
    fn distribute_over_capacity_fails() {
        let mut dest = vec![DataBuf::Owned(vec![0u8; 2])];
        assert!(distribute(b"abc", &mut dest).is_err());
    }

    #[test]
    fn rd_req_header_falls_back_to_mempool() {
        struct NoOpObserver;
        impl Observer for NoOpObserver {
            fn new_message(&mut self, _: u16, _: Option<u16>, _: Status, _: &[u8]) {}
            fn send_completion(&mut self, _: u16) {}
        }
        let (mut pool, ltid) = new_task();
        let task = pool.get_mut(ltid).unwrap();
        task.write_sge.push(ReqSge { addr: 0, length: 16, stag: 0 });
        let mempool = Mempool::new(64, 2);
        let mut observer = NoOpObserver;
        rd_req_header(task, &mut observer, Some(&mempool)).unwrap();
        assert_eq!(task.data_dest.len(), 1);
        assert_eq!(task.stage, RxStage::IoData);
    }
}
