use verbs_utils::ArrayVec;

/// Maximum scatter/gather entries carried by a single request or response.
/// A verbs operation realistically carries a handful of segments; bounding
/// this lets the descriptor arrays live on the stack instead of the heap.
pub const MAX_SGE: usize = 8;

/// A request-side segment descriptor: {address, length, memory-region tag}.
///
/// `addr`/`stag` are wire-format fields kept for layout fidelity with a real
/// RDMA transport; this crate never dereferences a peer-supplied `addr` and
/// always encodes it as `0` (see `SPEC_FULL.md` §3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReqSge {
    pub addr: u64,
    pub length: u32,
    pub stag: u32,
}

/// A response-side segment descriptor: length only (no address/tag tail).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RspSge {
    pub length: u32,
}

pub type ReqSgeVec = ArrayVec<ReqSge, MAX_SGE>;
pub type RspSgeVec = ArrayVec<RspSge, MAX_SGE>;

/// Sum of `length` across a request-side SGE vector.
pub fn total_len(v: &ReqSgeVec) -> u64 {
    v.iter().map(|s| u64::from(s.length)).sum()
}

/// Sum of `length` across a response-side SGE vector.
pub fn total_rsp_len(v: &RspSgeVec) -> u64 {
    v.iter().map(|s| u64::from(s.length)).sum()
}
