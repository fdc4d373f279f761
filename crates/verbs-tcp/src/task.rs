use std::collections::VecDeque;
use std::time::Instant;

use verbs_utils::safe_assert;

use crate::{
    flags::{MsgFlags, Status, TcpOp},
    header::{ReqHeader, RspHeader},
    mbuf::Mbuf,
    mempool::DataBuf,
    sge::{ReqSgeVec, RspSgeVec},
    tlv::TlvType,
    work::WorkDescriptor,
};

/// Which end of the exchange a task represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskRole {
    Request,
    Response,
}

/// Inbound reassembly stage (see `inbound.rs`). Only meaningful for tasks
/// currently on the rx list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RxStage {
    #[default]
    Start,
    Tlv,
    Header,
    IoData,
}

/// Which of the five per-connection lists a task currently belongs to.
///
/// Every task belongs to exactly one list at a time; `Connection` is the
/// only code allowed to move a task between lists, and does so by updating
/// this field in lock-step with the list it mutates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskList {
    Rx,
    TxReady,
    InFlight,
    TxComp,
    Io,
}

/// A single in-flight verbs operation, either side of the exchange.
///
/// Identified locally by `ltid`; `rtid` on a response task equals the `tid`
/// field carried by the originating request, and is how a received response
/// is paired back to its local requester (`Connection::lookup_by_rtid`).
pub struct Task {
    pub ltid: u16,
    pub rtid: Option<u16>,
    pub role: TaskRole,
    pub list: TaskList,
    pub flags: MsgFlags,
    pub tcp_op: TcpOp,

    pub mbuf: Mbuf,
    pub txd: WorkDescriptor,
    pub rxd: WorkDescriptor,
    pub stage: RxStage,

    pub req_header: Option<ReqHeader>,
    pub rsp_header: Option<RspHeader>,

    /// TLV type parsed at the TLV stage, remembered for dispatch once the
    /// HEADER stage completes.
    pub tlv_type: Option<TlvType>,
    /// Application-level header bytes, parsed out of the HEADER-stage buffer
    /// alongside the transport header; prefixed to `data` at delivery.
    pub ulp_hdr: Vec<u8>,

    pub recv_sge: ReqSgeVec,
    pub read_sge: ReqSgeVec,
    pub write_sge: ReqSgeVec,
    pub rsp_write_sge: RspSgeVec,

    /// Final contiguous delivery payload, flattened from either the inline
    /// mbuf body (SEND) or `data_dest` (READ/WRITE) at delivery time. This is
    /// what the observer's `new_message` sees.
    pub data: Vec<u8>,

    /// Pre-posted out-of-line destination buffers: for a request task this
    /// is where the HEADER stage's declared read-segments land during
    /// IO_DATA; for a task representing our own outbound request, this is
    /// where the eventual response's payload is expected (used for both the
    /// small inline path's overflow check and the large WRITE path's
    /// landing).
    pub data_dest: Vec<DataBuf>,
    /// Bytes already received into `data_dest` across possibly multiple
    /// `WouldBlock`-interrupted IO_DATA attempts.
    pub data_dest_progress: usize,

    /// Status carried with delivery: `Success` unless the response exceeded
    /// the caller's destination capacity (`MsgSize`) or no destination was
    /// available for the responder (`PartialMsg`).
    pub status: Status,
    /// Control traffic (setup) bypasses normal completion batching rules.
    pub is_control: bool,
    /// Set once `Observer::send_completion` has fired for this task. Only
    /// meaningful for an outbound request task: it lingers in `InFlight`
    /// (see `lookup_by_rtid`) long after its bytes are sent, so completion
    /// batching must not re-notify it on every later batch.
    pub tx_completed: bool,

    /// Set when this rx task enters `RxStage::Start`, i.e. when its TLV
    /// frame begins arriving. Consumed at delivery to report latency via
    /// `Telemetry::on_message_assembled`; `None` for tasks that never sit on
    /// the rx list (outbound request/response bookkeeping).
    pub rx_start: Option<Instant>,
}

impl Task {
    fn new(ltid: u16, role: TaskRole, list: TaskList) -> Self {
        Self {
            ltid,
            rtid: None,
            role,
            list,
            flags: MsgFlags::empty(),
            tcp_op: TcpOp::Send,
            mbuf: Mbuf::new(),
            txd: WorkDescriptor::empty(),
            rxd: WorkDescriptor::empty(),
            stage: RxStage::default(),
            req_header: None,
            rsp_header: None,
            tlv_type: None,
            ulp_hdr: Vec::new(),
            recv_sge: ReqSgeVec::new(),
            read_sge: ReqSgeVec::new(),
            write_sge: ReqSgeVec::new(),
            rsp_write_sge: RspSgeVec::new(),
            data: Vec::new(),
            data_dest: Vec::new(),
            data_dest_progress: 0,
            status: Status::Success,
            is_control: false,
            tx_completed: false,
            rx_start: None,
        }
    }
}

/// Per-connection task slab.
///
/// Tasks are addressed by `ltid`, a slot index reused via a free list once
/// released. No sharing across connections — unlike the mempool, a task
/// pool belongs to exactly one connection.
#[derive(Default)]
pub struct TaskPool {
    slots: Vec<Option<Task>>,
    free: VecDeque<u16>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, role: TaskRole, list: TaskList) -> u16 {
        if let Some(ltid) = self.free.pop_front() {
            self.slots[ltid as usize] = Some(Task::new(ltid, role, list));
            ltid
        } else {
            let ltid = self.slots.len() as u16;
            self.slots.push(Some(Task::new(ltid, role, list)));
            ltid
        }
    }

    pub fn get(&self, ltid: u16) -> Option<&Task> {
        self.slots.get(ltid as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, ltid: u16) -> Option<&mut Task> {
        self.slots.get_mut(ltid as usize).and_then(|s| s.as_mut())
    }

    pub fn release(&mut self, ltid: u16) {
        if let Some(slot) = self.slots.get_mut(ltid as usize) {
            if slot.take().is_some() {
                self.free.push_back(ltid);
            } else {
                safe_assert!(false, "released an already-empty task slot {ltid}");
            }
        }
    }

    /// Finds the locally-originated request awaiting the response carrying
    /// `rtid`. Restricted to `InFlight` so a same-numbered *inbound* request
    /// task (one we're about to answer, drawn from the same slab and hence
    /// possibly sharing a numeric `ltid` with some unrelated peer-assigned
    /// `rtid`) can never be mistaken for the real originator: an outbound
    /// request sits in `InFlight` from the moment it's drained until its
    /// response arrives, while a received request we're responding to never
    /// enters that list.
    pub fn lookup_by_rtid(&self, rtid: u16) -> Option<&Task> {
        self.slots
            .iter()
            .flatten()
            .find(|t| t.role == TaskRole::Request && t.list == TaskList::InFlight && t.ltid == rtid)
    }

    pub fn lookup_by_rtid_mut(&mut self, rtid: u16) -> Option<&mut Task> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|t| t.role == TaskRole::Request && t.list == TaskList::InFlight && t.ltid == rtid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_released_slots() {
        let mut pool = TaskPool::new();
        let a = pool.alloc(TaskRole::Request, TaskList::TxReady);
        pool.release(a);
        let b = pool.alloc(TaskRole::Request, TaskList::TxReady);
        assert_eq!(a, b);
    }

    #[test]
    fn lookup_by_rtid_finds_request_task() {
        let mut pool = TaskPool::new();
        let req = pool.alloc(TaskRole::Request, TaskList::InFlight);
        assert!(pool.lookup_by_rtid(req).is_some());
        let rsp = pool.alloc(TaskRole::Response, TaskList::Rx);
        assert!(pool.lookup_by_rtid(rsp).is_none());
    }
}
