//! Communicator cache and distributed rendezvous.
//!
//! Communicators are created lazily, once per ordered device set. Rank 0
//! mints a unique id and publishes it through the store under a
//! monotonically increasing counter key; every rank fetches the same id and
//! constructs its communicators inside one grouped scope. All ranks must
//! request the same device keys in the same order, or the rendezvous
//! deadlocks; that is a caller contract.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::error::Result;
use crate::store::{lock, Store};
use crate::tensor::Tensor;
use crate::types::{DeviceIndex, UniqueId, UNIQUE_ID_BYTES};

/// Store key prefix for communicator abort markers.
pub const ABORTED_COMM_STORE_KEY: &str = "NCCLABORTEDCOMM";

/// Store key for the abort marker of the communicator with hex id `id_hex`.
pub fn aborted_comm_store_key(id_hex: &str) -> String {
    format!("{ABORTED_COMM_STORE_KEY}:{id_hex}")
}

/// Canonical cache key for an ordered device set, e.g. `"0,1,3"`.
///
/// Order is the caller's order: two orderings are two cache entries.
pub fn device_key(devices: &[DeviceIndex]) -> String {
    let mut key = String::new();
    for (i, d) in devices.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(&d.to_string());
    }
    key
}

/// Devices of a tensor batch, in batch order.
pub fn device_list<B: Backend>(tensors: &[Tensor<B>]) -> Vec<DeviceIndex> {
    tensors.iter().map(|t| t.device()).collect()
}

/// One process's membership in a communicator, shared between the cache and
/// every [`Work`](crate::work::Work) that ran on it.
pub struct Comm<B: Backend> {
    raw: B::Comm,
    unique_id: UniqueId,
    aborted: AtomicBool,
}

impl<B: Backend> Comm<B> {
    pub(crate) fn new(raw: B::Comm, unique_id: UniqueId) -> Self {
        Self {
            raw,
            unique_id,
            aborted: AtomicBool::new(false),
        }
    }

    pub fn raw(&self) -> &B::Comm {
        &self.raw
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub fn id_hex(&self) -> String {
        self.unique_id.hex()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Abort the vendor communicator. Sticky and idempotent.
    pub fn abort(&self, backend: &B) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            backend.comm_abort(&self.raw);
        }
    }

    /// Asynchronous error reported by the vendor communicator, if any.
    pub fn async_error(&self, backend: &B) -> Option<String> {
        backend.comm_async_error(&self.raw)
    }
}

/// Everything guarded by the single cache mutex.
pub(crate) struct CommState<B: Backend> {
    /// DeviceKey → communicator group.
    pub comms_by_key: HashMap<String, Vec<Arc<Comm<B>>>>,
    /// DeviceKey → collective streams, same length as the comm group.
    pub streams_by_key: HashMap<String, Vec<B::Stream>>,
    /// DeviceKey → per-submission sync events, same length again.
    pub sync_events_by_key: HashMap<String, Vec<B::Event>>,
    /// UniqueIdHex → communicator group; the watchdog's reverse index.
    pub comms_by_id: HashMap<String, Vec<Arc<Comm<B>>>>,
    /// UniqueIdHex of communicators this process has aborted.
    pub aborted_ids: HashSet<String>,
    /// Every device index a collective has ever touched; drives barrier's
    /// device selection.
    pub used_devices: BTreeSet<DeviceIndex>,
}

impl<B: Backend> Default for CommState<B> {
    fn default() -> Self {
        Self {
            comms_by_key: HashMap::new(),
            streams_by_key: HashMap::new(),
            sync_events_by_key: HashMap::new(),
            comms_by_id: HashMap::new(),
            aborted_ids: HashSet::new(),
            used_devices: BTreeSet::new(),
        }
    }
}

/// Communicator group plus its parallel stream and sync-event groups,
/// cloned out of the cache for one submission.
pub(crate) struct CommGroup<B: Backend> {
    pub comms: Vec<Arc<Comm<B>>>,
    pub streams: Vec<B::Stream>,
    pub sync_events: Vec<B::Event>,
}

pub(crate) struct CommCache<B: Backend> {
    pub(crate) state: Mutex<CommState<B>>,
    /// Rendezvous sequence number shared across every communicator creation
    /// of this process group instance.
    comm_counter: AtomicU64,
}

impl<B: Backend> CommCache<B> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CommState::default()),
            comm_counter: AtomicU64::new(0),
        }
    }

    /// Return the cached group for `devices`, creating it with a
    /// store-mediated rendezvous on first use.
    pub fn get_or_create(
        &self,
        backend: &B,
        store: &dyn Store,
        rank: usize,
        size: usize,
        devices: &[DeviceIndex],
    ) -> Result<CommGroup<B>> {
        let key = device_key(devices);

        {
            let mut state = lock(&self.state);
            state.used_devices.extend(devices.iter().copied());
            if let Some(group) = clone_group(&state, &key) {
                return Ok(group);
            }
        }

        // Cache miss: rendezvous and construct outside the mutex. The
        // caller contract (same keys, same order, no concurrent submitters
        // per key) is what prevents a duplicate create here.
        let unique_id = self.exchange_unique_id(backend, store, rank)?;
        tracing::debug!(key = %key, id = ?unique_id, "creating communicator group");

        let mut comms = Vec::with_capacity(devices.len());
        let mut streams = Vec::with_capacity(devices.len());

        backend.group_start()?;
        let create_result: Result<()> = (|| {
            for (i, &device) in devices.iter().enumerate() {
                backend.set_device(device)?;
                let nranks = size * devices.len();
                let global_rank = rank * devices.len() + i;
                let raw = backend.comm_create(nranks, global_rank, &unique_id)?;
                comms.push(Arc::new(Comm::new(raw, unique_id)));
                streams.push(backend.stream_from_pool(device));
            }
            Ok(())
        })();
        let end_result = backend.group_end();
        create_result?;
        end_result?;

        let sync_events = devices
            .iter()
            .map(|&d| backend.create_event(d))
            .collect::<Result<Vec<_>>>()?;

        let mut state = lock(&self.state);
        state
            .comms_by_id
            .insert(unique_id.hex(), comms.clone());
        state.comms_by_key.insert(key.clone(), comms.clone());
        state.streams_by_key.insert(key.clone(), streams.clone());
        state.sync_events_by_key.insert(key, sync_events.clone());

        Ok(CommGroup {
            comms,
            streams,
            sync_events,
        })
    }

    /// Rank 0 mints a fresh unique id and publishes it under the next
    /// counter key; everyone else fetches and width-checks it.
    fn exchange_unique_id(&self, backend: &B, store: &dyn Store, rank: usize) -> Result<UniqueId> {
        let store_key = self.comm_counter.fetch_add(1, Ordering::SeqCst).to_string();
        if rank == 0 {
            let id = backend.unique_id()?;
            store.set(&store_key, id.as_bytes())?;
            Ok(id)
        } else {
            let bytes = store.get(&store_key)?;
            debug_assert_eq!(bytes.len(), UNIQUE_ID_BYTES);
            UniqueId::from_bytes(&bytes)
        }
    }
}

fn clone_group<B: Backend>(state: &CommState<B>, key: &str) -> Option<CommGroup<B>> {
    let comms = state.comms_by_key.get(key)?.clone();
    let streams = state.streams_by_key.get(key)?.clone();
    let sync_events = state.sync_events_by_key.get(key)?.clone();
    Some(CommGroup {
        comms,
        streams,
        sync_events,
    })
}
