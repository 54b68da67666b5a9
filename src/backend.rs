//! Device and vendor-library contract.
//!
//! The process group core is generic over a [`Backend`] that bundles the
//! three device-side collaborators: the driver (streams, events, device
//! guard), the caching allocator, and the vendor collective library
//! (communicator handles and collective primitives). Handles are cheap
//! copyable values the way driver handles are; ownership of the underlying
//! resources lives inside the backend.
//!
//! The crate ships one complete implementation, [`crate::host::HostBackend`],
//! which runs collectives over host memory so multi-rank behavior is
//! exercisable without devices.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::tensor::Tensor;
use crate::types::{DataType, DeviceIndex, ReduceOp, UniqueId};

pub trait Backend: Send + Sync + Sized + 'static {
    /// Execution queue on one device. Clones alias the same queue.
    type Stream: Clone + Send + Sync + 'static;
    /// Marker in a stream's timeline. Clones alias the same event.
    type Event: Clone + Send + Sync + 'static;
    /// Vendor communicator handle.
    type Comm: Send + Sync + 'static;
    /// Device allocation produced by the caching allocator.
    type Storage: Send + Sync + 'static;

    // ── Device guard ─────────────────────────────────────────────────

    /// Number of local devices visible to this process.
    fn device_count(&self) -> usize;

    /// Make `device` current for subsequent driver calls on this thread.
    fn set_device(&self, device: DeviceIndex) -> Result<()>;

    /// Block the host until all streams of `device` have drained.
    fn synchronize_device(&self, device: DeviceIndex) -> Result<()>;

    // ── Streams and events ───────────────────────────────────────────

    /// The compute stream the caller's work is ordered on.
    fn current_stream(&self, device: DeviceIndex) -> Self::Stream;

    /// A collective stream from the device's stream pool, distinct from
    /// the compute stream.
    fn stream_from_pool(&self, device: DeviceIndex) -> Self::Stream;

    /// Create an event on `device` with timing disabled.
    fn create_event(&self, device: DeviceIndex) -> Result<Self::Event>;

    /// Capture `stream`'s current position into `event`.
    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> Result<()>;

    /// Make `stream` wait (device-side, no host block) until the work
    /// captured by `event` completes. A never-recorded event is a no-op.
    fn stream_wait_event(&self, stream: &Self::Stream, event: &Self::Event) -> Result<()>;

    /// Whether the work captured by `event` has completed. Not-ready maps
    /// to `false`; any other driver failure is an error. A never-recorded
    /// event reports ready.
    fn query_event(&self, event: &Self::Event) -> Result<bool>;

    // ── Caching allocator ────────────────────────────────────────────

    /// Allocate `len_bytes` of device memory on `device`.
    fn alloc(&self, device: DeviceIndex, len_bytes: usize) -> Result<Arc<Self::Storage>>;

    /// Register `storage` as in use by `stream`: if the host drops the
    /// last tensor over it, the allocator defers physical reuse until
    /// `stream` has passed this point.
    fn record_stream(&self, storage: &Arc<Self::Storage>, stream: &Self::Stream);

    /// The allocator's free mutex. Held across a grouped submission so no
    /// device-free is observed between group open and group close.
    fn free_mutex(&self) -> &Mutex<()>;

    /// Asynchronous device-to-device copy of `src` into `dst` on `stream`.
    /// Both tensors must be contiguous with equal numel and dtype.
    fn copy_on_stream(
        &self,
        dst: &Tensor<Self>,
        src: &Tensor<Self>,
        stream: &Self::Stream,
    ) -> Result<()>;

    // ── Vendor collective library ────────────────────────────────────

    /// Mint a fresh communicator unique id. Called on rank 0 only.
    fn unique_id(&self) -> Result<UniqueId>;

    /// Join the communicator identified by `id` as global rank `rank` of
    /// `nranks`.
    fn comm_create(&self, nranks: usize, rank: usize, id: &UniqueId) -> Result<Self::Comm>;

    /// Tear the communicator down without waiting for in-flight work.
    fn comm_abort(&self, comm: &Self::Comm);

    /// Asynchronous error reported by the communicator, if any.
    fn comm_async_error(&self, comm: &Self::Comm) -> Option<String>;

    /// Open a grouped submission scope.
    fn group_start(&self) -> Result<()>;

    /// Close a grouped submission scope, launching the batched work.
    fn group_end(&self) -> Result<()>;

    // ── Collective primitives ────────────────────────────────────────

    fn all_reduce(
        &self,
        input: &Tensor<Self>,
        output: &Tensor<Self>,
        op: ReduceOp,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// In-place broadcast from global rank `root`.
    fn broadcast(
        &self,
        tensor: &Tensor<Self>,
        root: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Reduce into `output` on global rank `root`.
    fn reduce(
        &self,
        input: &Tensor<Self>,
        output: &Tensor<Self>,
        op: ReduceOp,
        root: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Gather `input` from every rank into the flat `output`
    /// (`output.numel() == nranks * input.numel()`).
    fn all_gather(
        &self,
        input: &Tensor<Self>,
        output: &Tensor<Self>,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Reduce the flat `input` (`input.numel() == nranks * output.numel()`)
    /// and scatter one slice per rank into `output`.
    fn reduce_scatter(
        &self,
        input: &Tensor<Self>,
        output: &Tensor<Self>,
        op: ReduceOp,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Point-to-point send of `tensor` to global rank `peer`. Only issued
    /// inside a grouped scope, paired with a matching `recv`.
    fn send(
        &self,
        tensor: &Tensor<Self>,
        peer: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Point-to-point receive into `tensor` from global rank `peer`.
    fn recv(
        &self,
        tensor: &Tensor<Self>,
        peer: usize,
        comm: &Self::Comm,
        stream: &Self::Stream,
    ) -> Result<()>;
}

/// Byte extent of a contiguous tensor region, used by backends when
/// translating tensors into raw transfers.
pub fn region_bytes(dtype: DataType, numel: usize) -> usize {
    numel * dtype.size_in_bytes()
}
