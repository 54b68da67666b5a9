//! In-process collective fabric.
//!
//! Communicators created from the same unique id rendezvous here: each
//! participant deposits its contribution under a per-communicator sequence
//! number and blocks until every rank has arrived, the way device kernels
//! block until their peers join the collective. Aborting a communicator
//! wakes every blocked participant with an error and poisons the group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::store::lock;
use crate::types::{DataType, ReduceOp, UniqueId};

use super::reduce::reduce_slice;

/// Registry connecting the ranks of an in-process cluster.
///
/// Every [`HostBackend`](super::HostBackend) that should be able to talk to
/// another one must be constructed over a clone of the same fabric.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    groups: Mutex<HashMap<String, Arc<FabricGroup>>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner {
                groups: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Join (or create) the group for `id`, checking world-size agreement.
    pub(crate) fn join(&self, id: &UniqueId, nranks: usize) -> Result<Arc<FabricGroup>, String> {
        let mut groups = lock(&self.inner.groups);
        let group = groups
            .entry(id.hex())
            .or_insert_with(|| Arc::new(FabricGroup::new(nranks)));
        if group.nranks != nranks {
            return Err(format!(
                "communicator world size mismatch: group has {}, caller brings {nranks}",
                group.nranks
            ));
        }
        Ok(Arc::clone(group))
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct FabricGroup {
    nranks: usize,
    state: Mutex<GroupState>,
    cv: Condvar,
}

struct GroupState {
    aborted: bool,
    collectives: HashMap<u64, CollectiveSlot>,
    mailboxes: HashMap<(usize, usize, u64), Vec<u8>>,
}

struct CollectiveSlot {
    contributions: Vec<Option<Vec<u8>>>,
    taken: usize,
}

const ABORTED: &str = "communicator was aborted";

impl FabricGroup {
    fn new(nranks: usize) -> Self {
        Self {
            nranks,
            state: Mutex::new(GroupState {
                aborted: false,
                collectives: HashMap::new(),
                mailboxes: HashMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    pub fn nranks(&self) -> usize {
        self.nranks
    }

    /// Poison the group and wake every blocked participant.
    pub fn abort(&self) {
        let mut state = lock(&self.state);
        state.aborted = true;
        self.cv.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.state).aborted
    }

    /// Deposit `bytes` as `rank`'s contribution to collective `seq` and
    /// block until every rank has contributed. Returns all contributions in
    /// rank order. The last rank to pick the result up retires the slot.
    fn deposit_and_wait_all(
        &self,
        seq: u64,
        rank: usize,
        bytes: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>, String> {
        let mut state = lock(&self.state);
        if state.aborted {
            return Err(ABORTED.to_string());
        }
        let nranks = self.nranks;
        let slot = state
            .collectives
            .entry(seq)
            .or_insert_with(|| CollectiveSlot {
                contributions: vec![None; nranks],
                taken: 0,
            });
        slot.contributions[rank] = Some(bytes);
        self.cv.notify_all();

        loop {
            if state.aborted {
                return Err(ABORTED.to_string());
            }
            let complete = state
                .collectives
                .get(&seq)
                .map(|s| s.contributions.iter().all(Option::is_some))
                .unwrap_or(false);
            if complete {
                break;
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(state, std::time::Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }

        let slot = state
            .collectives
            .get_mut(&seq)
            .expect("collective slot disappeared before all takers arrived");
        let all: Vec<Vec<u8>> = slot
            .contributions
            .iter()
            .map(|c| c.clone().expect("contribution missing after completion"))
            .collect();
        slot.taken += 1;
        if slot.taken == self.nranks {
            state.collectives.remove(&seq);
        }
        Ok(all)
    }

    pub fn run_all_reduce(
        &self,
        rank: usize,
        seq: u64,
        input: Vec<u8>,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<Vec<u8>, String> {
        let all = self.deposit_and_wait_all(seq, rank, input)?;
        let mut acc = all[0].clone();
        for contribution in &all[1..] {
            reduce_slice(&mut acc, contribution, dtype, op);
        }
        Ok(acc)
    }

    /// `bytes` carries the payload on the root rank and is empty elsewhere.
    pub fn run_broadcast(
        &self,
        rank: usize,
        root: usize,
        seq: u64,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, String> {
        if root >= self.nranks {
            return Err(format!("broadcast root {root} out of range"));
        }
        let all = self.deposit_and_wait_all(seq, rank, bytes)?;
        Ok(all[root].clone())
    }

    /// Returns the reduced payload on the root rank, `None` elsewhere.
    pub fn run_reduce(
        &self,
        rank: usize,
        root: usize,
        seq: u64,
        input: Vec<u8>,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<Option<Vec<u8>>, String> {
        if root >= self.nranks {
            return Err(format!("reduce root {root} out of range"));
        }
        let all = self.deposit_and_wait_all(seq, rank, input)?;
        if rank != root {
            return Ok(None);
        }
        let mut acc = all[0].clone();
        for contribution in &all[1..] {
            reduce_slice(&mut acc, contribution, dtype, op);
        }
        Ok(Some(acc))
    }

    /// Returns the rank-ordered concatenation of every contribution.
    pub fn run_all_gather(&self, rank: usize, seq: u64, input: Vec<u8>) -> Result<Vec<u8>, String> {
        let all = self.deposit_and_wait_all(seq, rank, input)?;
        let mut out = Vec::with_capacity(all.iter().map(Vec::len).sum());
        for contribution in &all {
            out.extend_from_slice(contribution);
        }
        Ok(out)
    }

    /// Each rank contributes the full flat input and receives its own slice
    /// of the element-wise reduction.
    pub fn run_reduce_scatter(
        &self,
        rank: usize,
        seq: u64,
        input: Vec<u8>,
        dtype: DataType,
        op: ReduceOp,
        chunk_bytes: usize,
    ) -> Result<Vec<u8>, String> {
        if input.len() != chunk_bytes * self.nranks {
            return Err(format!(
                "reduce_scatter input holds {} bytes, expected {}",
                input.len(),
                chunk_bytes * self.nranks
            ));
        }
        let all = self.deposit_and_wait_all(seq, rank, input)?;
        let lo = rank * chunk_bytes;
        let hi = lo + chunk_bytes;
        let mut acc = all[0][lo..hi].to_vec();
        for contribution in &all[1..] {
            reduce_slice(&mut acc, &contribution[lo..hi], dtype, op);
        }
        Ok(acc)
    }

    /// Deposit a point-to-point payload. Sends never block.
    pub fn send(&self, src: usize, dst: usize, seq: u64, bytes: Vec<u8>) -> Result<(), String> {
        let mut state = lock(&self.state);
        if state.aborted {
            return Err(ABORTED.to_string());
        }
        state.mailboxes.insert((src, dst, seq), bytes);
        self.cv.notify_all();
        Ok(())
    }

    /// Block until the matching send arrives and take its payload.
    pub fn recv(&self, src: usize, dst: usize, seq: u64) -> Result<Vec<u8>, String> {
        let mut state = lock(&self.state);
        loop {
            if state.aborted {
                return Err(ABORTED.to_string());
            }
            if let Some(bytes) = state.mailboxes.remove(&(src, dst, seq)) {
                return Ok(bytes);
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(state, std::time::Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }
}

/// Host communicator: one process's membership in a fabric group.
#[derive(Clone)]
pub struct HostComm {
    inner: Arc<HostCommInner>,
}

struct HostCommInner {
    group: Arc<FabricGroup>,
    rank: usize,
    nranks: usize,
    coll_seq: AtomicU64,
    send_seq: Mutex<HashMap<usize, u64>>,
    recv_seq: Mutex<HashMap<usize, u64>>,
    aborted: AtomicBool,
    async_error: Mutex<Option<String>>,
}

impl HostComm {
    pub(crate) fn new(group: Arc<FabricGroup>, rank: usize, nranks: usize) -> Self {
        Self {
            inner: Arc::new(HostCommInner {
                group,
                rank,
                nranks,
                coll_seq: AtomicU64::new(0),
                send_seq: Mutex::new(HashMap::new()),
                recv_seq: Mutex::new(HashMap::new()),
                aborted: AtomicBool::new(false),
                async_error: Mutex::new(None),
            }),
        }
    }

    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    pub fn nranks(&self) -> usize {
        self.inner.nranks
    }

    pub(crate) fn group(&self) -> &Arc<FabricGroup> {
        &self.inner.group
    }

    /// Sequence number for the next collective this communicator submits.
    /// All ranks submit collectives in the same order, so local counters
    /// agree across the group.
    pub(crate) fn next_coll_seq(&self) -> u64 {
        self.inner.coll_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_send_seq(&self, peer: usize) -> u64 {
        let mut map = lock(&self.inner.send_seq);
        let seq = map.entry(peer).or_insert(0);
        let out = *seq;
        *seq += 1;
        out
    }

    pub(crate) fn next_recv_seq(&self, peer: usize) -> u64 {
        let mut map = lock(&self.inner.recv_seq);
        let seq = map.entry(peer).or_insert(0);
        let out = *seq;
        *seq += 1;
        out
    }

    pub(crate) fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
        self.inner.group.abort();
    }

    pub(crate) fn set_async_error(&self, message: String) {
        let mut slot = lock(&self.inner.async_error);
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    /// Asynchronous error state: a captured operation failure, a local
    /// abort, or a group poisoned by some peer's abort.
    pub(crate) fn async_error(&self) -> Option<String> {
        if let Some(message) = lock(&self.inner.async_error).clone() {
            return Some(message);
        }
        if self.inner.aborted.load(Ordering::Acquire) || self.inner.group.is_aborted() {
            return Some(ABORTED.to_string());
        }
        None
    }
}
