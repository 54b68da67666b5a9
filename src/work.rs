//! Asynchronous handle for one submitted collective.
//!
//! A [`Work`] is a future over device events rather than a promise runtime:
//! it owns one completion event per device, references the communicators the
//! collective ran on, and carries the blocking/timeout policy captured at
//! submission. Completion is a host-side query against the events plus the
//! communicators' asynchronous error state.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::comm::{aborted_comm_store_key, Comm};
use crate::error::{MusterError, Result};
use crate::store::{lock, Store};
use crate::tensor::Tensor;
use crate::types::DeviceIndex;

/// Granularity of the blocking-wait busy loop.
pub(crate) const SYNCHRONIZE_BUSY_WAIT: Duration = Duration::from_millis(10);

pub struct Work<B: Backend> {
    backend: Arc<B>,
    store: Arc<dyn Store>,
    devices: Vec<DeviceIndex>,
    /// Completion events, recorded on the collective streams at submission.
    events: Vec<B::Event>,
    comms: Vec<Arc<Comm<B>>>,
    started_at: Instant,
    op_timeout: Duration,
    blocking_wait: bool,
    /// Captured asynchronous error. Sticky once set.
    error: Mutex<Option<MusterError>>,
    /// Placeholder tensors kept alive when this work backs a barrier;
    /// non-empty also switches `synchronize` to a full device sync.
    barrier_tensors: Vec<Tensor<B>>,
}

impl<B: Backend> Work<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<B>,
        store: Arc<dyn Store>,
        devices: Vec<DeviceIndex>,
        events: Vec<B::Event>,
        comms: Vec<Arc<Comm<B>>>,
        started_at: Instant,
        op_timeout: Duration,
        blocking_wait: bool,
    ) -> Self {
        Self {
            backend,
            store,
            devices,
            events,
            comms,
            started_at,
            op_timeout,
            blocking_wait,
            error: Mutex::new(None),
            barrier_tensors: Vec::new(),
        }
    }

    pub(crate) fn set_barrier_tensors(&mut self, tensors: Vec<Tensor<B>>) {
        self.barrier_tensors = tensors;
    }

    /// Devices this collective ran on, in submission order.
    pub fn devices(&self) -> &[DeviceIndex] {
        &self.devices
    }

    /// Whether the collective has finished, successfully or not.
    ///
    /// Captures any fresh asynchronous communicator error as a side effect;
    /// an errored work counts as completed.
    pub fn is_completed(&self) -> Result<bool> {
        self.check_and_set_error();
        if lock(&self.error).is_some() {
            return Ok(true);
        }
        self.finished_device_execution()
    }

    /// Whether the collective finished with no captured or fresh error.
    pub fn is_success(&self) -> Result<bool> {
        if lock(&self.error).is_some() {
            return Ok(false);
        }
        if self.query_comms_error().is_some() {
            return Ok(false);
        }
        self.finished_device_execution()
    }

    /// Whether every per-device completion event reports ready.
    pub fn finished_device_execution(&self) -> Result<bool> {
        for event in &self.events {
            if !self.backend.query_event(event)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Order the caller's streams after this collective.
    ///
    /// For each device, the current compute stream waits on the completion
    /// event; barrier works additionally synchronize the whole device. In
    /// blocking-wait mode this then busy-waits until completion, aborting
    /// every held communicator and publishing abort markers if `op_timeout`
    /// elapses first.
    pub fn synchronize(&self) -> Result<()> {
        for (i, &device) in self.devices.iter().enumerate() {
            let current = self.backend.current_stream(device);
            self.backend.stream_wait_event(&current, &self.events[i])?;
            if !self.barrier_tensors.is_empty() {
                self.backend.set_device(device)?;
                self.backend.synchronize_device(device)?;
            }
        }

        if self.blocking_wait {
            while !self.is_completed()? {
                if self.started_at.elapsed() > self.op_timeout {
                    // Timeouts the vendor library cannot detect (a hung
                    // peer) leave the device streams blocked; abort frees
                    // them and tells the other ranks to follow.
                    for comm in &self.comms {
                        comm.abort(&self.backend);
                        let store_key = aborted_comm_store_key(&comm.id_hex());
                        self.store.set(&store_key, &[])?;
                        tracing::info!(key = %store_key, "wrote aborted communicator id to store");
                    }
                    return Err(MusterError::Timeout {
                        timeout_ms: self.op_timeout.as_millis() as u64,
                    });
                }
                self.check_and_raise()?;
                std::thread::sleep(SYNCHRONIZE_BUSY_WAIT);
            }
            self.check_and_raise()?;
        }
        Ok(())
    }

    /// Same as [`Work::synchronize`].
    pub fn wait(&self) -> Result<()> {
        self.synchronize()
    }

    /// Host-side abort of in-flight work is not supported; drop the work
    /// and rely on the watchdog or the blocking-wait timeout.
    pub fn abort(&self) -> Result<()> {
        Err(MusterError::Unsupported { op: "abort" })
    }

    /// Capture a fresh asynchronous error into the error slot, if the slot
    /// is still empty.
    fn check_and_set_error(&self) {
        let mut slot = lock(&self.error);
        if slot.is_some() {
            return;
        }
        if let Some(msg) = self.query_comms_error() {
            *slot = Some(MusterError::VendorAsync(msg));
        }
    }

    /// Re-raise the captured error, capturing a fresh one first.
    fn check_and_raise(&self) -> Result<()> {
        self.check_and_set_error();
        match lock(&self.error).as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn query_comms_error(&self) -> Option<String> {
        self.comms
            .iter()
            .find_map(|c| c.async_error(&self.backend))
    }
}

impl<B: Backend> std::fmt::Debug for Work<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("devices", &self.devices)
            .field("blocking_wait", &self.blocking_wait)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}
