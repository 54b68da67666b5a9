//! # muster
//!
//! A GPU collective-communication process group: the machinery that sits
//! around thin vendor collective calls and makes them usable from a
//! distributed training job.
//!
//! - **Lazy communicator rendezvous**: communicators are created on first
//!   use per ordered device set; rank 0 mints a unique id and publishes it
//!   through a shared key-value [`Store`].
//! - **Asynchronous work tracking**: every collective returns a [`Work`]
//!   that bridges host-side completion queries with device-side events,
//!   with optional blocking wait and abort-on-timeout.
//! - **Cross-rank abort watchdog**: a background thread detects
//!   asynchronous communicator errors, aborts locally and propagates the
//!   abort to peers through store markers.
//! - **Stream discipline**: collective streams wait on the callers'
//!   compute streams, and operand storages are registered with the caching
//!   allocator so device memory is never reused while a collective is in
//!   flight.
//!
//! The core is generic over a [`Backend`] (device driver + caching
//! allocator + vendor collective library). The built-in
//! [`host::HostBackend`] implements the whole contract over host memory, so
//! multi-rank clusters can run as threads in one process:
//!
//! ```
//! use std::sync::Arc;
//! use muster::{
//!     AllreduceOptions, Fabric, HashStore, HostBackend, ProcessGroup, ProcessGroupOptions, Store,
//! };
//!
//! let fabric = Fabric::new();
//! let store: Arc<dyn Store> = Arc::new(HashStore::new());
//!
//! let handles: Vec<_> = (0..2usize)
//!     .map(|rank| {
//!         let fabric = fabric.clone();
//!         let store = Arc::clone(&store);
//!         std::thread::spawn(move || {
//!             let backend = Arc::new(HostBackend::with_fabric(1, fabric));
//!             let pg = ProcessGroup::new(
//!                 Arc::clone(&backend),
//!                 store,
//!                 rank,
//!                 2,
//!                 ProcessGroupOptions::default(),
//!             )
//!             .unwrap();
//!             let t = backend
//!                 .tensor_from_slice(&[rank as f32 + 1.0; 3], &[3], 0)
//!                 .unwrap();
//!             let work = pg
//!                 .allreduce(std::slice::from_ref(&t), AllreduceOptions::default())
//!                 .unwrap();
//!             work.wait().unwrap();
//!             assert_eq!(backend.tensor_to_vec::<f32>(&t).unwrap(), vec![3.0; 3]);
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     h.join().unwrap();
//! }
//! ```

pub mod backend;
pub mod comm;
pub mod config;
pub mod error;
pub mod flatten;
pub mod host;
pub mod process_group;
pub mod store;
pub mod tensor;
pub mod types;
pub mod validate;
#[cfg(feature = "error-checking")]
mod watchdog;
pub mod work;

pub use backend::Backend;
pub use comm::{aborted_comm_store_key, device_key, Comm, ABORTED_COMM_STORE_KEY};
pub use config::{ProcessGroupOptions, DEFAULT_OP_TIMEOUT, NCCL_BLOCKING_WAIT};
pub use error::{MusterError, Result};
pub use flatten::flatten_for_scatter_gather;
pub use host::{Fabric, HostBackend};
pub use process_group::ProcessGroup;
pub use store::{HashStore, Store};
pub use tensor::Tensor;
pub use types::{
    AllgatherOptions, AllreduceOptions, BroadcastOptions, DataType, DeviceIndex, ReduceOp,
    ReduceOptions, ReduceScatterOptions, UniqueId, UNIQUE_ID_BYTES,
};
pub use work::Work;
