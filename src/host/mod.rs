//! Reference backend over host memory.
//!
//! Implements the full [`Backend`] contract with virtual devices: every
//! stream is a FIFO worker thread, events mark stream timelines, the
//! allocator's `record_stream` genuinely defers release, and communicators
//! rendezvous through an in-process [`Fabric`]. Ranks living in one process
//! (threads in tests, or a single-machine deployment) get real multi-rank
//! collective semantics without any device.

mod fabric;
mod reduce;
mod stream;

pub use fabric::{Fabric, HostComm};
pub use reduce::{Element, F16};
pub use stream::{HostEvent, HostStream};

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng as _;

use crate::backend::{region_bytes, Backend};
use crate::error::{MusterError, Result};
use crate::store::lock;
use crate::tensor::Tensor;
use crate::types::{DeviceIndex, ReduceOp, UniqueId, UNIQUE_ID_BYTES};

/// Collective streams kept per device.
const STREAM_POOL_SIZE: usize = 4;

/// One allocation produced by the host caching allocator.
pub struct HostStorage {
    id: u64,
    device: DeviceIndex,
    len: usize,
    data: UnsafeCell<Box<[u8]>>,
}

// Safety: the bytes are only touched through `Region` accessors from stream
// workers, and the process group's event discipline serializes conflicting
// accesses, the same exclusion a device memory model provides.
unsafe impl Send for HostStorage {}
unsafe impl Sync for HostStorage {}

impl HostStorage {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }
}

/// Byte extent of a contiguous tensor, cloneable into stream closures.
#[derive(Clone)]
struct Region {
    storage: Arc<HostStorage>,
    byte_offset: usize,
    byte_len: usize,
}

impl Region {
    fn of(tensor: &Tensor<HostBackend>) -> Result<Self> {
        if !tensor.is_contiguous() {
            return Err(MusterError::invalid(
                "collective operands must be contiguous",
            ));
        }
        let byte_offset = tensor.storage_offset() * tensor.dtype().size_in_bytes();
        let byte_len = region_bytes(tensor.dtype(), tensor.numel());
        let storage = Arc::clone(tensor.storage());
        if byte_offset + byte_len > storage.len {
            return Err(MusterError::invalid(format!(
                "tensor extent {}..{} exceeds storage of {} bytes",
                byte_offset,
                byte_offset + byte_len,
                storage.len
            )));
        }
        Ok(Self {
            storage,
            byte_offset,
            byte_len,
        })
    }

    fn read(&self) -> Vec<u8> {
        // Safety: see `HostStorage`; callers run on the owning stream.
        unsafe {
            let data = &*self.storage.data.get();
            data[self.byte_offset..self.byte_offset + self.byte_len].to_vec()
        }
    }

    fn write(&self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.byte_len);
        // Safety: see `HostStorage`; callers run on the owning stream.
        unsafe {
            let data = &mut *self.storage.data.get();
            data[self.byte_offset..self.byte_offset + self.byte_len].copy_from_slice(bytes);
        }
    }
}

/// Write a collective result into `region`, downgrading a length mismatch
/// (a cross-rank shape disagreement) to an asynchronous error instead of
/// poisoning the stream worker.
fn write_result(region: &Region, bytes: &[u8], comm: &HostComm) {
    if bytes.len() == region.byte_len {
        region.write(bytes);
    } else {
        comm.set_async_error(format!(
            "collective result holds {} bytes, expected {}",
            bytes.len(),
            region.byte_len
        ));
    }
}

struct DeviceState {
    compute: HostStream,
    pool: Vec<HostStream>,
    next_pool: AtomicUsize,
}

pub struct HostBackend {
    devices: Vec<DeviceState>,
    fabric: Fabric,
    free_mutex: Mutex<()>,
    current_device: AtomicUsize,
    group_depth: AtomicUsize,
    next_storage_id: AtomicU64,
    /// (storage id, stream id) pairs in registration order; lets tests
    /// assert the record-before-submit discipline.
    record_log: Mutex<Vec<(u64, u64)>>,
}

impl HostBackend {
    /// Backend over a private fabric; fine for single-rank use.
    pub fn new(device_count: usize) -> Self {
        Self::with_fabric(device_count, Fabric::new())
    }

    /// Backend whose communicators can reach every other backend built
    /// over a clone of `fabric`.
    pub fn with_fabric(device_count: usize, fabric: Fabric) -> Self {
        assert!(device_count > 0, "host backend needs at least one device");
        let mut next_stream_id = 0u64;
        let mut stream = |device| {
            next_stream_id += 1;
            HostStream::spawn(next_stream_id, device)
        };
        let devices = (0..device_count)
            .map(|d| DeviceState {
                compute: stream(d),
                pool: (0..STREAM_POOL_SIZE).map(|_| stream(d)).collect(),
                next_pool: AtomicUsize::new(0),
            })
            .collect();
        Self {
            devices,
            fabric,
            free_mutex: Mutex::new(()),
            current_device: AtomicUsize::new(0),
            group_depth: AtomicUsize::new(0),
            next_storage_id: AtomicU64::new(1),
            record_log: Mutex::new(Vec::new()),
        }
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    fn device(&self, device: DeviceIndex) -> Result<&DeviceState> {
        self.devices.get(device).ok_or_else(|| {
            MusterError::driver(format!(
                "device {device} out of range ({} available)",
                self.devices.len()
            ))
        })
    }

    /// Snapshot of every `record_stream` registration so far.
    pub fn record_stream_log(&self) -> Vec<(u64, u64)> {
        lock(&self.record_log).clone()
    }

    /// Build a tensor on `device` holding `data` reshaped to `shape`.
    pub fn tensor_from_slice<T: Element>(
        &self,
        data: &[T],
        shape: &[usize],
        device: DeviceIndex,
    ) -> Result<Tensor<HostBackend>> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(MusterError::invalid(format!(
                "shape {shape:?} holds {numel} elements but {} were provided",
                data.len()
            )));
        }
        let tensor = Tensor::empty(self, shape, T::DTYPE, device)?;
        let region = Region::of(&tensor)?;
        let sz = T::DTYPE.size_in_bytes();
        let mut bytes = vec![0u8; data.len() * sz];
        for (v, chunk) in data.iter().zip(bytes.chunks_exact_mut(sz)) {
            v.write_le(chunk);
        }
        // Fresh allocation, no stream has seen it yet: direct write is safe.
        region.write(&bytes);
        Ok(tensor)
    }

    /// Read a tensor back after draining the device's streams.
    pub fn tensor_to_vec<T: Element>(&self, tensor: &Tensor<HostBackend>) -> Result<Vec<T>> {
        if tensor.dtype() != T::DTYPE {
            return Err(MusterError::invalid(format!(
                "tensor holds {}, requested {}",
                tensor.dtype(),
                T::DTYPE
            )));
        }
        self.synchronize_device(tensor.device())?;
        let region = Region::of(tensor)?;
        let bytes = region.read();
        Ok(bytes
            .chunks_exact(T::DTYPE.size_in_bytes())
            .map(T::read_le)
            .collect())
    }
}

impl Backend for HostBackend {
    type Stream = HostStream;
    type Event = HostEvent;
    type Comm = HostComm;
    type Storage = HostStorage;

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn set_device(&self, device: DeviceIndex) -> Result<()> {
        self.device(device)?;
        self.current_device.store(device, Ordering::SeqCst);
        Ok(())
    }

    fn synchronize_device(&self, device: DeviceIndex) -> Result<()> {
        let state = self.device(device)?;
        state.compute.synchronize();
        for s in &state.pool {
            s.synchronize();
        }
        Ok(())
    }

    fn current_stream(&self, device: DeviceIndex) -> HostStream {
        self.devices[device].compute.clone()
    }

    fn stream_from_pool(&self, device: DeviceIndex) -> HostStream {
        let state = &self.devices[device];
        let idx = state.next_pool.fetch_add(1, Ordering::SeqCst) % state.pool.len();
        state.pool[idx].clone()
    }

    fn create_event(&self, device: DeviceIndex) -> Result<HostEvent> {
        self.device(device)?;
        Ok(HostEvent::new(device))
    }

    fn record_event(&self, event: &HostEvent, stream: &HostStream) -> Result<()> {
        event.record(stream);
        Ok(())
    }

    fn stream_wait_event(&self, stream: &HostStream, event: &HostEvent) -> Result<()> {
        event.block_stream(stream);
        Ok(())
    }

    fn query_event(&self, event: &HostEvent) -> Result<bool> {
        Ok(event.query())
    }

    fn alloc(&self, device: DeviceIndex, len_bytes: usize) -> Result<Arc<HostStorage>> {
        self.device(device)?;
        Ok(Arc::new(HostStorage {
            id: self.next_storage_id.fetch_add(1, Ordering::SeqCst),
            device,
            len: len_bytes,
            data: UnsafeCell::new(vec![0u8; len_bytes].into_boxed_slice()),
        }))
    }

    fn record_stream(&self, storage: &Arc<HostStorage>, stream: &HostStream) {
        lock(&self.record_log).push((storage.id, stream.id()));
        // Holding the clone inside the queue keeps the allocation alive
        // until the stream passes this point, which is the whole contract.
        let keep_alive = Arc::clone(storage);
        stream.submit(move || drop(keep_alive));
    }

    fn free_mutex(&self) -> &Mutex<()> {
        &self.free_mutex
    }

    fn copy_on_stream(
        &self,
        dst: &Tensor<HostBackend>,
        src: &Tensor<HostBackend>,
        stream: &HostStream,
    ) -> Result<()> {
        if dst.numel() != src.numel() || dst.dtype() != src.dtype() {
            return Err(MusterError::invalid(
                "copy operands must agree in numel and dtype",
            ));
        }
        let dst = Region::of(dst)?;
        let src = Region::of(src)?;
        if Arc::ptr_eq(&dst.storage, &src.storage) && dst.byte_offset == src.byte_offset {
            return Ok(());
        }
        stream.submit(move || {
            let bytes = src.read();
            dst.write(&bytes);
        });
        Ok(())
    }

    fn unique_id(&self) -> Result<UniqueId> {
        let mut bytes = [0u8; UNIQUE_ID_BYTES];
        rand::thread_rng().fill(&mut bytes[..]);
        Ok(UniqueId::from_array(bytes))
    }

    fn comm_create(&self, nranks: usize, rank: usize, id: &UniqueId) -> Result<HostComm> {
        if rank >= nranks {
            return Err(MusterError::VendorSubmission(format!(
                "rank {rank} out of range for communicator of {nranks}"
            )));
        }
        let group = self
            .fabric
            .join(id, nranks)
            .map_err(MusterError::VendorSubmission)?;
        Ok(HostComm::new(group, rank, nranks))
    }

    fn comm_abort(&self, comm: &HostComm) {
        comm.abort();
    }

    fn comm_async_error(&self, comm: &HostComm) -> Option<String> {
        comm.async_error()
    }

    fn group_start(&self) -> Result<()> {
        self.group_depth.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn group_end(&self) -> Result<()> {
        let prev = self.group_depth.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            self.group_depth.store(0, Ordering::SeqCst);
            return Err(MusterError::VendorSubmission(
                "group end without matching group start".into(),
            ));
        }
        Ok(())
    }

    fn all_reduce(
        &self,
        input: &Tensor<HostBackend>,
        output: &Tensor<HostBackend>,
        op: ReduceOp,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        let seq = comm.next_coll_seq();
        let dtype = input.dtype();
        let src = Region::of(input)?;
        let dst = Region::of(output)?;
        let comm = comm.clone();
        stream.submit(move || {
            let bytes = src.read();
            match comm.group().run_all_reduce(comm.rank(), seq, bytes, dtype, op) {
                Ok(result) => write_result(&dst, &result, &comm),
                Err(message) => comm.set_async_error(message),
            }
        });
        Ok(())
    }

    fn broadcast(
        &self,
        tensor: &Tensor<HostBackend>,
        root: usize,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        let seq = comm.next_coll_seq();
        let region = Region::of(tensor)?;
        let comm = comm.clone();
        stream.submit(move || {
            let payload = if comm.rank() == root {
                region.read()
            } else {
                Vec::new()
            };
            match comm.group().run_broadcast(comm.rank(), root, seq, payload) {
                Ok(result) => write_result(&region, &result, &comm),
                Err(message) => comm.set_async_error(message),
            }
        });
        Ok(())
    }

    fn reduce(
        &self,
        input: &Tensor<HostBackend>,
        output: &Tensor<HostBackend>,
        op: ReduceOp,
        root: usize,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        let seq = comm.next_coll_seq();
        let dtype = input.dtype();
        let src = Region::of(input)?;
        let dst = Region::of(output)?;
        let comm = comm.clone();
        stream.submit(move || {
            let bytes = src.read();
            match comm
                .group()
                .run_reduce(comm.rank(), root, seq, bytes, dtype, op)
            {
                Ok(Some(result)) => write_result(&dst, &result, &comm),
                Ok(None) => {}
                Err(message) => comm.set_async_error(message),
            }
        });
        Ok(())
    }

    fn all_gather(
        &self,
        input: &Tensor<HostBackend>,
        output: &Tensor<HostBackend>,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        if output.numel() != input.numel() * comm.nranks() {
            return Err(MusterError::VendorSubmission(format!(
                "all_gather output holds {} elements, expected {}",
                output.numel(),
                input.numel() * comm.nranks()
            )));
        }
        let seq = comm.next_coll_seq();
        let src = Region::of(input)?;
        let dst = Region::of(output)?;
        let comm = comm.clone();
        stream.submit(move || {
            let bytes = src.read();
            match comm.group().run_all_gather(comm.rank(), seq, bytes) {
                Ok(result) => write_result(&dst, &result, &comm),
                Err(message) => comm.set_async_error(message),
            }
        });
        Ok(())
    }

    fn reduce_scatter(
        &self,
        input: &Tensor<HostBackend>,
        output: &Tensor<HostBackend>,
        op: ReduceOp,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        if input.numel() != output.numel() * comm.nranks() {
            return Err(MusterError::VendorSubmission(format!(
                "reduce_scatter input holds {} elements, expected {}",
                input.numel(),
                output.numel() * comm.nranks()
            )));
        }
        let seq = comm.next_coll_seq();
        let dtype = input.dtype();
        let chunk_bytes = output.numel() * dtype.size_in_bytes();
        let src = Region::of(input)?;
        let dst = Region::of(output)?;
        let comm = comm.clone();
        stream.submit(move || {
            let bytes = src.read();
            match comm
                .group()
                .run_reduce_scatter(comm.rank(), seq, bytes, dtype, op, chunk_bytes)
            {
                Ok(result) => write_result(&dst, &result, &comm),
                Err(message) => comm.set_async_error(message),
            }
        });
        Ok(())
    }

    fn send(
        &self,
        tensor: &Tensor<HostBackend>,
        peer: usize,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        let seq = comm.next_send_seq(peer);
        let region = Region::of(tensor)?;
        let comm = comm.clone();
        stream.submit(move || {
            let bytes = region.read();
            if let Err(message) = comm.group().send(comm.rank(), peer, seq, bytes) {
                comm.set_async_error(message);
            }
        });
        Ok(())
    }

    fn recv(
        &self,
        tensor: &Tensor<HostBackend>,
        peer: usize,
        comm: &HostComm,
        stream: &HostStream,
    ) -> Result<()> {
        let seq = comm.next_recv_seq(peer);
        let region = Region::of(tensor)?;
        let comm = comm.clone();
        stream.submit(move || {
            match comm.group().recv(peer, comm.rank(), seq) {
                Ok(bytes) => {
                    if bytes.len() == region.byte_len {
                        region.write(&bytes);
                    } else {
                        comm.set_async_error(format!(
                            "recv size mismatch: got {} bytes, expected {}",
                            bytes.len(),
                            region.byte_len
                        ));
                    }
                }
                Err(message) => comm.set_async_error(message),
            }
        });
        Ok(())
    }
}
