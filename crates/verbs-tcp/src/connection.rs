//! Per-socket datapath state machine (spec §4): the five task lists, the
//! drain/completion engine, the receive reassembly loop and the setup
//! handshake, all driven against a generic stream so unit tests can swap in
//! an in-memory duplex instead of a real socket. `connector.rs` supplies the
//! `mio`-driven event loop around this.
//!
//! Grounded on `flux_network::tcp::stream::TcpStream`'s `poll_with`/
//! `write_or_enqueue_with` split between "drive what's ready" and "queue
//! what isn't", generalised from its single send_buf/backlog to the five
//! disjoint task lists `xio_tcp` keeps per connection.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Instant;

use tracing::warn;

use crate::{
    error::{DatapathError, Result},
    flags::MsgFlags,
    inbound::{self, HeaderOutcome},
    mempool::Mempool,
    observer::Observer,
    options::{ConnTunables, TcpOptions},
    outbound::{self, RspBufferHint},
    setup::SetupMsg,
    task::{RxStage, TaskList, TaskPool, TaskRole},
    telemetry::{NoTelemetry, Telemetry},
    tlv::TlvType,
    work::Progress,
};

/// Which end of the setup handshake this connection plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnRole {
    /// Initiates `SETUP_REQ` once the socket is writable.
    Client,
    /// Answers an inbound `SETUP_REQ` with `SETUP_RSP`.
    Server,
}

/// Connection lifecycle (spec §4 data model).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No socket yet; unused by `Connection` itself (always constructed
    /// around an already-established stream) but kept for the state
    /// machine's documentation value and for `connector.rs`'s own
    /// bookkeeping of not-yet-dialed outbound slots.
    Init,
    /// Socket established, setup handshake not yet complete.
    Connecting,
    /// Setup negotiated; application traffic may flow.
    Connected,
    /// Torn down after a transport-level error or peer disconnect.
    Disconnected,
}

/// Per-connection datapath state: the five task lists (spec §3), negotiated
/// parameters, and the observer callback the application implements.
pub struct Connection<S, O> {
    stream: S,
    role: ConnRole,
    state: ConnState,

    tasks: TaskPool,
    rx_list: VecDeque<u16>,
    tx_ready_list: VecDeque<u16>,
    in_flight_list: VecDeque<u16>,
    tx_comp_list: VecDeque<u16>,
    io_list: VecDeque<u16>,
    tx_ready_tasks_num: usize,
    tx_comp_cnt: usize,
    pending_completion: bool,

    local_options: TcpOptions,
    tunables: ConnTunables,
    max_send_buf_sz: u32,
    peer_max_in_iovsz: u16,
    peer_max_out_iovsz: u16,

    mempool: Option<Mempool>,
    observer: O,
    telemetry: Box<dyn Telemetry>,
}

impl<S: Read + Write, O: Observer> Connection<S, O> {
    pub fn new(
        stream: S,
        role: ConnRole,
        local_options: TcpOptions,
        tunables: ConnTunables,
        mempool: Option<Mempool>,
        observer: O,
    ) -> Self {
        let mut tasks = TaskPool::new();
        let bootstrap = tasks.alloc(TaskRole::Request, TaskList::Rx);
        let mut rx_list = VecDeque::new();
        rx_list.push_back(bootstrap);
        inbound::start_tlv_read(tasks.get_mut(bootstrap).expect("just allocated"));

        Self {
            stream,
            role,
            state: ConnState::Connecting,
            tasks,
            rx_list,
            tx_ready_list: VecDeque::new(),
            in_flight_list: VecDeque::new(),
            tx_comp_list: VecDeque::new(),
            io_list: VecDeque::new(),
            tx_ready_tasks_num: 0,
            tx_comp_cnt: 0,
            pending_completion: false,
            max_send_buf_sz: local_options.buffer_sz,
            local_options,
            tunables,
            peer_max_in_iovsz: 0,
            peer_max_out_iovsz: 0,
            mempool,
            observer,
            telemetry: Box::new(NoTelemetry),
        }
    }

    /// Attaches a telemetry sink, replacing the default no-op. Mirrors the
    /// teacher's `TcpConnector::with_telemetry` builder.
    pub fn with_telemetry(mut self, telemetry: impl Telemetry + 'static) -> Self {
        self.telemetry = Box::new(telemetry);
        self
    }

    /// As [`Self::with_telemetry`], for a connector that already boxed its
    /// telemetry sink (one instance shared across several connections).
    pub fn with_telemetry_boxed(mut self, telemetry: Box<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn role(&self) -> ConnRole {
        self.role
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Negotiated max outbound message size, `local_options.buffer_sz` until
    /// the setup handshake completes.
    pub fn max_send_buf_sz(&self) -> u32 {
        self.max_send_buf_sz
    }

    /// Unwraps the connection, handing its socket back to the caller — used
    /// by the connector to deregister a torn-down connection's socket from
    /// `mio::Poll` before dropping it.
    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Sends `SETUP_REQ`. The client side of the handshake; called once the
    /// connector sees the freshly-connected socket become writable.
    pub fn initiate_setup(&mut self) -> Result<()> {
        let msg = SetupMsg::from_options(&self.local_options);
        self.send_setup_msg(TlvType::SetupReq, &msg)
    }

    fn send_setup_msg(&mut self, tlv_type: TlvType, msg: &SetupMsg) -> Result<()> {
        let ltid = self.tasks.alloc(TaskRole::Request, TaskList::TxReady);
        let task = self.tasks.get_mut(ltid).expect("just allocated");
        task.is_control = true;
        task.flags = MsgFlags::IS_CONTROL;
        task.mbuf.begin_tlv();
        let mut body = Vec::new();
        msg.pack(&mut body);
        task.mbuf.extend(&body);
        task.mbuf.finish_tlv(tlv_type);
        task.txd = crate::work::WorkDescriptor::new(vec![task.mbuf.as_slice().to_vec()]);
        self.tx_ready_list.push_back(ltid);
        self.tx_ready_tasks_num += 1;
        self.drain()
    }

    fn handle_setup(&mut self, tlv_type: TlvType, payload: Vec<u8>) -> Result<()> {
        let msg = SetupMsg::unpack(&payload)?;
        match tlv_type {
            TlvType::SetupReq => {
                if self.role != ConnRole::Server {
                    return Err(DatapathError::MsgInvalid { reason: "unexpected setup request" });
                }
                let rsp = msg.negotiate_response(&self.local_options);
                self.adopt_negotiated(&rsp);
                self.send_setup_msg(TlvType::SetupRsp, &rsp)?;
                self.state = ConnState::Connected;
                self.observer.new_message(0, None, crate::flags::Status::Success, &[]);
            }
            TlvType::SetupRsp => {
                if self.role != ConnRole::Client {
                    return Err(DatapathError::MsgInvalid { reason: "unexpected setup response" });
                }
                self.adopt_negotiated(&msg);
                self.state = ConnState::Connected;
                self.observer.new_message(0, None, crate::flags::Status::Success, &[]);
            }
            _ => unreachable!("handle_setup only dispatched for setup tlv types"),
        }
        Ok(())
    }

    /// Both sides adopt the same negotiated iovsz caps symmetrically: the
    /// client's originally proposed `max_in_iovsz`/`max_out_iovsz` become the
    /// single pair both ends enforce, since `SetupMsg::negotiate_response`
    /// only ever echoes the request's own values back (see `DESIGN.md`).
    fn adopt_negotiated(&mut self, negotiated: &SetupMsg) {
        self.max_send_buf_sz = negotiated.buffer_sz;
        self.peer_max_in_iovsz = negotiated.max_in_iovsz;
        self.peer_max_out_iovsz = negotiated.max_out_iovsz;
    }

    /// Posts a new outbound request. `rsp_hints` describes where the
    /// eventual response should land; empty means no response body is
    /// expected. Returns the local task id, which doubles as the
    /// application-visible request handle (`rtid` on the matching
    /// `new_message` delivery).
    pub fn post_request(
        &mut self,
        ulp_hdr: &[u8],
        out_data: Vec<Vec<u8>>,
        rsp_hints: Vec<RspBufferHint>,
        flags: MsgFlags,
    ) -> Result<u16> {
        if self.state != ConnState::Connected {
            return Err(DatapathError::Disconnected);
        }
        let ltid = self.tasks.alloc(TaskRole::Request, TaskList::TxReady);
        let small_zero_copy = flags.contains(MsgFlags::SMALL_ZERO_COPY);

        let prep = (|| {
            let task = self.tasks.get_mut(ltid).expect("just allocated");
            task.flags = flags;
            outbound::prep_req_in_data(
                task,
                rsp_hints,
                small_zero_copy,
                self.max_send_buf_sz,
                self.peer_max_out_iovsz,
                self.mempool.as_ref(),
            )?;
            let task = self.tasks.get_mut(ltid).expect("still allocated");
            outbound::prep_req_out_data(task, ulp_hdr, out_data, self.max_send_buf_sz, self.peer_max_in_iovsz)
        })();

        if let Err(e) = prep {
            self.tasks.release(ltid);
            return Err(e);
        }

        self.tx_ready_list.push_back(ltid);
        self.tx_ready_tasks_num += 1;
        if !flags.contains(MsgFlags::MORE_IN_BATCH) {
            self.drain()?;
        }
        Ok(ltid)
    }

    /// Posts the response to a request previously delivered via
    /// `Observer::new_message` with `rtid == None`. `req_ltid` is that
    /// delivery's `ltid`; the task is reused to carry the outbound response.
    pub fn post_response(
        &mut self,
        req_ltid: u16,
        ulp_hdr: &[u8],
        out_data: Vec<Vec<u8>>,
        flags: MsgFlags,
    ) -> Result<()> {
        if self.state != ConnState::Connected {
            return Err(DatapathError::Disconnected);
        }
        let (recv_sge, read_sge, echo_tid) = {
            let task = self
                .tasks
                .get(req_ltid)
                .ok_or(DatapathError::MsgInvalid { reason: "unknown request task" })?;
            let echo_tid = task.req_header.as_ref().map(|h| h.tid).unwrap_or(task.ltid);
            (task.recv_sge.clone(), task.read_sge.clone(), echo_tid)
        };

        let task = self.tasks.get_mut(req_ltid).expect("checked above");
        task.role = TaskRole::Response;
        task.rtid = Some(echo_tid);
        task.flags = flags;
        outbound::prep_rsp_out_data(task, &recv_sge, &read_sge, ulp_hdr, out_data, self.max_send_buf_sz)?;

        Self::remove_from_list(&mut self.io_list, req_ltid);
        let task = self.tasks.get_mut(req_ltid).expect("still allocated");
        task.list = TaskList::TxReady;
        self.tx_ready_list.push_back(req_ltid);
        self.tx_ready_tasks_num += 1;
        self.drain()
    }

    /// Releases a task delivered via `Observer::new_message` once the
    /// application is done with it. Required for received requests (after
    /// `post_response`, if the app chooses not to reply) and for delivered
    /// responses, both of which otherwise sit in `io_list` indefinitely.
    pub fn release(&mut self, ltid: u16) {
        Self::remove_from_list(&mut self.io_list, ltid);
        self.tasks.release(ltid);
    }

    // ---- drain / completion engine (spec §4.5) ----

    pub fn drain(&mut self) -> Result<()> {
        loop {
            if let Err(err) = self.drain_once() {
                self.teardown(err);
                return Err(DatapathError::Disconnected);
            }
            if !std::mem::take(&mut self.pending_completion) {
                return Ok(());
            }
            self.run_completion_handler();
            if self.tx_ready_tasks_num == 0 {
                return Ok(());
            }
        }
    }

    fn drain_once(&mut self) -> Result<()> {
        loop {
            let Some(&ltid) = self.tx_ready_list.front() else { return Ok(()) };
            let task = self.tasks.get_mut(ltid).expect("tx_ready entries reference live tasks");
            match task.txd.send(&mut self.stream)? {
                Progress::Done => {
                    let is_control = task.is_control;
                    let imm = task.flags.contains(MsgFlags::IMM_SEND_COMP);
                    task.list = TaskList::InFlight;
                    self.tx_ready_list.pop_front();
                    self.tx_ready_tasks_num -= 1;
                    self.in_flight_list.push_back(ltid);
                    self.tx_comp_cnt += 1;
                    if self.tx_comp_cnt >= self.tunables.completion_batch_max || is_control || imm {
                        self.pending_completion = true;
                    }
                }
                Progress::Partial(_) => continue,
                Progress::WouldBlock => return Ok(()),
                Progress::Disconnected => return Err(DatapathError::Disconnected),
            }
        }
    }

    /// Walks `in_flight_list`, notifying send-completion and retiring every
    /// task that doesn't need to linger for a response. An outbound request
    /// (not control traffic) stays parked in `InFlight` — still reachable via
    /// `lookup_by_rtid` — until its response arrives; everything else
    /// (control traffic, and our own outbound copy of a sent response) is
    /// done the moment the bytes are on the wire and releases immediately.
    fn run_completion_handler(&mut self) {
        let snapshot: Vec<u16> = self.in_flight_list.drain(..).collect();
        let mut still_in_flight = Vec::with_capacity(snapshot.len());
        for ltid in snapshot {
            let Some(task) = self.tasks.get_mut(ltid) else { continue };
            let cancelled = task.flags.contains(MsgFlags::CANCEL);

            if task.role == TaskRole::Request && !task.is_control {
                if !task.tx_completed {
                    task.tx_completed = true;
                    if !cancelled {
                        self.observer.send_completion(ltid);
                    }
                }
                still_in_flight.push(ltid);
                continue;
            }

            task.list = TaskList::TxComp;
            if !cancelled {
                self.observer.send_completion(ltid);
            }
            self.tasks.release(ltid);
        }
        self.in_flight_list.extend(still_in_flight);
        self.tx_comp_cnt = 0;
    }

    // ---- receive reassembly loop (spec §4.6) ----

    pub fn rx_handler(&mut self) -> Result<()> {
        loop {
            let Some(&ltid) = self.rx_list.front() else { return Ok(()) };
            match self.advance_rx_task(ltid) {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(e) if !e.is_per_message() => {
                    self.teardown(e);
                    return Err(DatapathError::Disconnected);
                }
                Err(e) => {
                    warn!(error = %e, "inbound message aborted");
                    self.observer.error(&e);
                    self.drop_rx_task(ltid);
                }
            }
        }
    }

    /// Drives one stage forward for `ltid`. Returns `Ok(true)` if the caller
    /// should immediately re-peek `rx_list` (stage changed, or a fresh
    /// bootstrap task needs its own turn), `Ok(false)` if the socket would
    /// block and there's nothing more to do until the next readiness event.
    fn advance_rx_task(&mut self, ltid: u16) -> Result<bool> {
        let stage = self.tasks.get(ltid).map(|t| t.stage).unwrap_or_default();
        match stage {
            RxStage::Start => {
                if self.state == ConnState::Connected {
                    let fresh = self.tasks.alloc(TaskRole::Request, TaskList::Rx);
                    self.rx_list.push_back(fresh);
                }
                let task = self.tasks.get_mut(ltid).expect("rx_list entries reference live tasks");
                task.rx_start = Some(Instant::now());
                inbound::start_tlv_read(task);
                Ok(true)
            }
            RxStage::Tlv => match self.drive_recv(ltid)? {
                Progress::Done => {
                    let task = self.tasks.get_mut(ltid).expect("still allocated");
                    inbound::finish_tlv_read(task)?;
                    Ok(true)
                }
                _ => Ok(false),
            },
            RxStage::Header => match self.drive_recv(ltid)? {
                Progress::Done => {
                    let peer_max_in = self.peer_max_in_iovsz;
                    let task = self.tasks.get_mut(ltid).expect("still allocated");
                    let outcome = inbound::finish_header_read(task, peer_max_in)?;
                    self.dispatch_header_outcome(ltid, outcome)
                }
                _ => Ok(false),
            },
            RxStage::IoData => self.drive_io_data(ltid),
        }
    }

    fn drive_recv(&mut self, ltid: u16) -> Result<Progress> {
        loop {
            let task = self.tasks.get_mut(ltid).expect("rx task missing mid-stage");
            match task.rxd.recv(&mut self.stream)? {
                Progress::Partial(_) => continue,
                other => return Ok(other),
            }
        }
    }

    fn dispatch_header_outcome(&mut self, ltid: u16, outcome: HeaderOutcome) -> Result<bool> {
        match outcome {
            HeaderOutcome::Setup { tlv_type, payload } => {
                self.handle_setup(tlv_type, payload)?;
                let task = self.tasks.get_mut(ltid).expect("setup task vanished");
                task.stage = RxStage::Start;
                Ok(true)
            }
            HeaderOutcome::Request { needs_io_data } => {
                if needs_io_data {
                    let mempool = self.mempool.clone();
                    let task = self.tasks.get_mut(ltid).expect("request task vanished");
                    inbound::rd_req_header(task, &mut self.observer, mempool.as_ref())?;
                } else {
                    self.deliver(ltid, None)?;
                }
                Ok(true)
            }
            HeaderOutcome::Response { rtid, body } => {
                match body {
                    Some(bytes) => match self.tasks.lookup_by_rtid(rtid).map(|t| t.ltid) {
                        Some(originator) => self.finish_response(ltid, originator, bytes)?,
                        None => {
                            warn!(rtid, "response with no matching local request; dropping");
                            self.drop_rx_task(ltid);
                        }
                    },
                    None => {
                        let lens: Vec<u32> = self
                            .tasks
                            .get(ltid)
                            .expect("response task vanished")
                            .rsp_header
                            .as_ref()
                            .expect("header parsed for this outcome")
                            .write_sge
                            .iter()
                            .map(|s| s.length)
                            .collect();
                        let task = self.tasks.get_mut(ltid).expect("still allocated");
                        inbound::begin_response_write(task, &lens);
                        task.stage = RxStage::IoData;
                    }
                }
                Ok(true)
            }
        }
    }

    fn drive_io_data(&mut self, ltid: u16) -> Result<bool> {
        match self.drive_recv(ltid)? {
            Progress::Done => {}
            _ => return Ok(false),
        }
        let bytes = {
            let task = self.tasks.get_mut(ltid).expect("io_data task vanished");
            inbound::finish_io_data(task)
        };
        let tlv_type = self.tasks.get(ltid).and_then(|t| t.tlv_type);
        match tlv_type {
            Some(TlvType::Req) => {
                {
                    let task = self.tasks.get_mut(ltid).expect("request task vanished");
                    inbound::distribute(&bytes, &mut task.data_dest)?;
                    task.data = bytes;
                }
                self.deliver(ltid, None)?;
            }
            Some(TlvType::Rsp) => {
                let rtid = self.tasks.get(ltid).and_then(|t| t.rtid).expect("response task carries rtid");
                match self.tasks.lookup_by_rtid(rtid).map(|t| t.ltid) {
                    Some(originator) => self.finish_response(ltid, originator, bytes)?,
                    None => {
                        warn!(rtid, "response io_data completed with no matching local request");
                        self.drop_rx_task(ltid);
                    }
                }
            }
            _ => {
                verbs_utils::safe_panic!("io_data stage reached without a classified tlv type");
                self.drop_rx_task(ltid);
            }
        }
        Ok(true)
    }

    /// Lands `bytes` into the originator's pre-posted destination, releases
    /// the originator (its wait for a response is over), and delivers the
    /// response task itself to the application.
    fn finish_response(&mut self, ltid: u16, originator_ltid: u16, bytes: Vec<u8>) -> Result<()> {
        if !bytes.is_empty() {
            let originator = self.tasks.get_mut(originator_ltid).expect("matched rtid originator vanished");
            inbound::distribute(&bytes, &mut originator.data_dest)?;
        }
        Self::remove_from_list(&mut self.in_flight_list, originator_ltid);
        let originator = self.tasks.get_mut(originator_ltid).expect("matched rtid originator vanished");
        if !originator.tx_completed {
            originator.tx_completed = true;
            if !originator.flags.contains(MsgFlags::CANCEL) {
                self.observer.send_completion(originator_ltid);
            }
        }
        self.tasks.release(originator_ltid);

        let task = self.tasks.get_mut(ltid).expect("response task vanished");
        task.data = bytes;
        self.deliver(ltid, Some(originator_ltid))
    }

    fn deliver(&mut self, ltid: u16, rtid: Option<u16>) -> Result<()> {
        Self::remove_from_list(&mut self.rx_list, ltid);
        let task = self.tasks.get_mut(ltid).expect("delivered task vanished");
        task.list = TaskList::Io;
        let status = task.status;
        let data = std::mem::take(&mut task.data);
        let rx_start = task.rx_start.take();
        self.io_list.push_back(ltid);
        if let Some(start) = rx_start {
            self.telemetry.on_message_assembled(start.elapsed());
        }
        self.observer.new_message(ltid, rtid, status, &data);
        if let Some(task) = self.tasks.get_mut(ltid) {
            task.data = data;
        }
        if self.tx_ready_tasks_num > 0 {
            self.drain()?;
        }
        Ok(())
    }

    fn drop_rx_task(&mut self, ltid: u16) {
        Self::remove_from_list(&mut self.rx_list, ltid);
        self.tasks.release(ltid);
    }

    fn remove_from_list(list: &mut VecDeque<u16>, ltid: u16) {
        if let Some(pos) = list.iter().position(|&x| x == ltid) {
            list.remove(pos);
        }
    }

    fn teardown(&mut self, err: DatapathError) {
        self.state = ConnState::Disconnected;
        self.observer.error(&err);
        while let Some(ltid) = self.rx_list.pop_front() {
            self.tasks.release(ltid);
        }
        while let Some(ltid) = self.tx_ready_list.pop_front() {
            self.tasks.release(ltid);
        }
        while let Some(ltid) = self.in_flight_list.pop_front() {
            self.tasks.release(ltid);
        }
        while let Some(ltid) = self.tx_comp_list.pop_front() {
            self.tasks.release(ltid);
        }
        while let Some(ltid) = self.io_list.pop_front() {
            self.tasks.release(ltid);
        }
        self.tx_ready_tasks_num = 0;
        self.tx_comp_cnt = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque as Deque;
    use std::io;

    use super::*;
    use crate::flags::Status;

    /// An in-memory duplex: everything written to it is immediately
    /// available to read back, so a client and server `Connection` can be
    /// driven against each other's `Duplex` without a real socket.
    #[derive(Default)]
    struct Duplex {
        inbox: Deque<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbox.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.inbox.len());
            for b in buf[..n].iter_mut() {
                *b = self.inbox.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inbox.extend(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        messages: Vec<(u16, Option<u16>, Status, Vec<u8>)>,
        completions: Vec<u16>,
        errors: usize,
    }

    impl Observer for RecordingObserver {
        fn new_message(&mut self, ltid: u16, rtid: Option<u16>, status: Status, data: &[u8]) {
            self.messages.push((ltid, rtid, status, data.to_vec()));
        }
        fn send_completion(&mut self, ltid: u16) {
            self.completions.push(ltid);
        }
        fn error(&mut self, _err: &DatapathError) {
            self.errors += 1;
        }
    }

    /// Pipes bytes written by `from` into `to`'s inbound queue — stands in
    /// for an actual wire between two `Duplex`-backed connections in tests.
    fn splice(from: &mut Duplex, to: &mut Duplex) {
        to.inbox.extend(from.inbox.drain(..));
    }

    #[test]
    fn setup_handshake_negotiates_and_connects_both_sides() {
        let mut client = Connection::new(
            Duplex::default(),
            ConnRole::Client,
            TcpOptions::default(),
            ConnTunables::default(),
            None,
            RecordingObserver::default(),
        );
        let mut server = Connection::new(
            Duplex::default(),
            ConnRole::Server,
            TcpOptions::default(),
            ConnTunables::default(),
            None,
            RecordingObserver::default(),
        );

        client.initiate_setup().unwrap();
        splice(&mut client.stream, &mut server.stream);
        server.rx_handler().unwrap();
        assert_eq!(server.state(), ConnState::Connected);

        splice(&mut server.stream, &mut client.stream);
        client.rx_handler().unwrap();
        assert_eq!(client.state(), ConnState::Connected);

        assert_eq!(client.observer().messages.len(), 1);
        assert_eq!(server.observer().messages.len(), 1);
    }

    fn connected_pair() -> (Connection<Duplex, RecordingObserver>, Connection<Duplex, RecordingObserver>) {
        connected_pair_with_mempool(Mempool::new(2_000_000, 4))
    }

    fn connected_pair_with_mempool(
        pool: Mempool,
    ) -> (Connection<Duplex, RecordingObserver>, Connection<Duplex, RecordingObserver>) {
        let mut client = Connection::new(
            Duplex::default(),
            ConnRole::Client,
            TcpOptions::default(),
            ConnTunables::default(),
            Some(pool.clone()),
            RecordingObserver::default(),
        );
        let mut server = Connection::new(
            Duplex::default(),
            ConnRole::Server,
            TcpOptions::default(),
            ConnTunables::default(),
            Some(pool),
            RecordingObserver::default(),
        );
        client.initiate_setup().unwrap();
        splice(&mut client.stream, &mut server.stream);
        server.rx_handler().unwrap();
        splice(&mut server.stream, &mut client.stream);
        client.rx_handler().unwrap();
        (client, server)
    }

    #[test]
    fn small_request_response_round_trip() {
        let (mut client, mut server) = connected_pair();

        let ltid = client
            .post_request(b"hdr", vec![b"ping".to_vec()], vec![RspBufferHint::Sized(16)], MsgFlags::empty())
            .unwrap();

        splice(&mut client.stream, &mut server.stream);
        server.rx_handler().unwrap();
        assert_eq!(server.observer().messages.len(), 2); // setup notice + request
        let (server_ltid, rtid, _status, data) = server.observer().messages[1].clone();
        assert_eq!(rtid, None);
        assert_eq!(data, b"ping");

        server.post_response(server_ltid, b"", vec![b"pong".to_vec()], MsgFlags::empty()).unwrap();

        splice(&mut server.stream, &mut client.stream);
        client.rx_handler().unwrap();
        assert_eq!(client.observer().messages.len(), 2); // setup notice + response
        let (_ltid, rtid, status, data) = client.observer().messages[1].clone();
        assert_eq!(rtid, Some(ltid));
        assert_eq!(status, Status::Success);
        assert_eq!(data, b"pong");
    }

    #[derive(Clone, Default)]
    struct CountingTelemetry(std::rc::Rc<std::cell::RefCell<usize>>);

    impl crate::telemetry::Telemetry for CountingTelemetry {
        fn on_message_assembled(&mut self, _latency: std::time::Duration) {
            *self.0.borrow_mut() += 1;
        }
    }

    #[test]
    fn telemetry_hook_fires_once_per_delivered_message() {
        let counter = CountingTelemetry::default();
        let mut server = Connection::new(
            Duplex::default(),
            ConnRole::Server,
            TcpOptions::default(),
            ConnTunables::default(),
            Some(Mempool::new(2_000_000, 4)),
            RecordingObserver::default(),
        )
        .with_telemetry(counter.clone());
        let mut client = Connection::new(
            Duplex::default(),
            ConnRole::Client,
            TcpOptions::default(),
            ConnTunables::default(),
            Some(Mempool::new(2_000_000, 4)),
            RecordingObserver::default(),
        );

        client.initiate_setup().unwrap();
        splice(&mut client.stream, &mut server.stream);
        server.rx_handler().unwrap();
        // Setup handshake bypasses `deliver()` (it notifies the observer
        // directly from `handle_setup`), so it never reports telemetry.
        assert_eq!(*counter.0.borrow(), 0);

        splice(&mut server.stream, &mut client.stream);
        client.rx_handler().unwrap();

        client
            .post_request(b"hdr", vec![b"ping".to_vec()], vec![RspBufferHint::Sized(16)], MsgFlags::empty())
            .unwrap();
        splice(&mut client.stream, &mut server.stream);
        server.rx_handler().unwrap();
        assert_eq!(*counter.0.borrow(), 1); // application request delivered
    }

    #[test]
    fn large_request_uses_read_mode_round_trip() {
        let (mut client, mut server) = connected_pair();
        let big_request = vec![7u8; 1_000_000];

        let ltid = client
            .post_request(b"hdr", vec![big_request.clone()], vec![RspBufferHint::Sized(8)], MsgFlags::empty())
            .unwrap();

        // drive the handshake between client and server until the server has
        // fully reassembled the out-of-line request body.
        for _ in 0..64 {
            splice(&mut client.stream, &mut server.stream);
            server.rx_handler().unwrap();
            splice(&mut server.stream, &mut client.stream);
            client.rx_handler().unwrap();
            if server.observer().messages.len() == 2 {
                break;
            }
        }

        let (_server_ltid, rtid, _status, data) = server.observer().messages[1].clone();
        assert_eq!(rtid, None);
        assert_eq!(data, big_request);
        let _ = ltid;
    }

    #[test]
    fn peer_disconnect_tears_down_and_notifies_observer() {
        let mut server = Connection::new(
            Duplex::default(),
            ConnRole::Server,
            TcpOptions::default(),
            ConnTunables::default(),
            None,
            RecordingObserver::default(),
        );
        // simulate EOF: nothing ever gets written to server.stream, so force
        // a read-zero by draining then marking it closed isn't expressible
        // with `Duplex` directly; instead exercise `teardown` through a
        // malformed frame, which rx_handler treats as fatal via `Io`/non
        // per-message errors only — a TLV version mismatch is per-message
        // and must NOT tear down, so assert that distinction here too.
        server.stream.write_all(&[0xffu8; 6]).unwrap();
        let err = server.rx_handler();
        assert!(err.is_ok(), "malformed tlv type is a per-message error, not fatal");
        assert_eq!(server.observer().errors, 1);
        assert_eq!(server.state(), ConnState::Connecting);
    }
}
