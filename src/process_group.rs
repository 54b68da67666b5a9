//! The process group facade and the generic collective driver.
//!
//! Every collective entry point validates its tensors, obtains the cached
//! communicator group for the ordered device set, lets the collective
//! streams wait on the callers' compute streams, registers the operand
//! storages with the caching allocator, submits the vendor calls inside one
//! grouped scope (with the allocator's free mutex held), records one
//! completion event per device and hands the caller a [`Work`].

use std::sync::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::Backend;
use crate::comm::{device_list, Comm, CommCache};
use crate::config::ProcessGroupOptions;
use crate::error::{MusterError, Result};
use crate::flatten::flatten_for_scatter_gather;
use crate::store::{lock, Store};
use crate::tensor::Tensor;
use crate::types::{
    AllgatherOptions, AllreduceOptions, BroadcastOptions, DataType, DeviceIndex, ReduceOptions,
    ReduceScatterOptions,
};
use crate::validate::{check_device_tensors, check_split_sizes};
#[cfg(feature = "error-checking")]
use crate::watchdog;
use crate::work::Work;

/// State shared between the caller-facing facade and the watchdog thread.
pub(crate) struct Shared<B: Backend> {
    pub backend: Arc<B>,
    pub store: Arc<dyn Store>,
    pub rank: usize,
    pub size: usize,
    pub options: ProcessGroupOptions,
    pub cache: CommCache<B>,
    pub terminate: Mutex<bool>,
    pub terminate_cv: Condvar,
}

pub struct ProcessGroup<B: Backend> {
    shared: Arc<Shared<B>>,
    watchdog: Option<std::thread::JoinHandle<()>>,
}

impl<B: Backend> ProcessGroup<B> {
    /// Create the process group for `rank` of `size` over `backend` and the
    /// shared rendezvous `store`.
    ///
    /// With the `error-checking` feature (default) this starts the
    /// watchdog thread; it is joined when the group is dropped.
    pub fn new(
        backend: Arc<B>,
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        options: ProcessGroupOptions,
    ) -> Result<Self> {
        if size == 0 {
            return Err(MusterError::invalid("process group size must be positive"));
        }
        if rank >= size {
            return Err(MusterError::invalid(format!(
                "rank {rank} out of range for process group of size {size}"
            )));
        }
        let shared = Arc::new(Shared {
            backend,
            store,
            rank,
            size,
            options,
            cache: CommCache::new(),
            terminate: Mutex::new(false),
            terminate_cv: Condvar::new(),
        });

        #[cfg(feature = "error-checking")]
        let watchdog = Some(watchdog::spawn(Arc::clone(&shared)));
        #[cfg(not(feature = "error-checking"))]
        let watchdog = None;

        Ok(Self { shared, watchdog })
    }

    pub fn rank(&self) -> usize {
        self.shared.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    // ── Collective entry points ──────────────────────────────────────

    /// In-place all-reduce over one tensor per local device.
    pub fn allreduce(&self, tensors: &[Tensor<B>], opts: AllreduceOptions) -> Result<Work<B>> {
        check_device_tensors(&*self.shared.backend, tensors, false)?;
        let backend = Arc::clone(&self.shared.backend);
        self.collective(tensors, tensors, move |input, output, comm, stream| {
            backend.all_reduce(input, output, opts.reduce_op, comm.raw(), stream)
        })
    }

    /// In-place broadcast from `root_rank`'s `root_tensor`.
    pub fn broadcast(&self, tensors: &[Tensor<B>], opts: BroadcastOptions) -> Result<Work<B>> {
        check_device_tensors(&*self.shared.backend, tensors, false)?;
        let backend = Arc::clone(&self.shared.backend);
        let num_devices = tensors.len();
        self.collective(tensors, tensors, move |input, _output, comm, stream| {
            let root = opts.root_rank * num_devices + opts.root_tensor;
            backend.broadcast(input, root, comm.raw(), stream)
        })
    }

    /// In-place reduce onto `root_rank`'s `root_tensor`.
    pub fn reduce(&self, tensors: &[Tensor<B>], opts: ReduceOptions) -> Result<Work<B>> {
        check_device_tensors(&*self.shared.backend, tensors, false)?;
        let backend = Arc::clone(&self.shared.backend);
        let num_devices = tensors.len();
        self.collective(tensors, tensors, move |input, output, comm, stream| {
            let root = opts.root_rank * num_devices + opts.root_tensor;
            backend.reduce(input, output, opts.reduce_op, root, comm.raw(), stream)
        })
    }

    /// Gather every rank's input into per-rank output lists.
    ///
    /// The collective writes one flat staging tensor per device; the
    /// post-hook fans slices back into the caller's tensors on the
    /// collective stream, skipped entirely when the output list already
    /// aliases the flat staging buffer (`no_copy`).
    pub fn allgather(
        &self,
        output_lists: &[Vec<Tensor<B>>],
        inputs: &[Tensor<B>],
        opts: AllgatherOptions,
    ) -> Result<Work<B>> {
        check_device_tensors(&*self.shared.backend, inputs, false)?;
        let flat = flatten_for_scatter_gather(
            &*self.shared.backend,
            output_lists,
            inputs,
            self.shared.size,
            self.shared.rank,
            opts.no_copy,
        )?;
        check_device_tensors(&*self.shared.backend, &flat, false)?;

        let backend = Arc::clone(&self.shared.backend);
        let backend_post = Arc::clone(&self.shared.backend);
        let flat_ref = &flat;
        self.collective_with_hooks(
            inputs,
            &flat,
            move |input, output, comm, stream| {
                backend.record_stream(output.storage(), stream);
                backend.all_gather(input, output, comm.raw(), stream)
            },
            |_streams| Ok(()),
            move |streams| {
                for (i, list) in output_lists.iter().enumerate() {
                    for (j, dst) in list.iter().enumerate() {
                        // An output list that is already the flat buffer
                        // needs no fan-out at all.
                        if dst.same_storage(&flat_ref[i])
                            && dst.storage_offset()
                                == list[0].storage_offset() + j * dst.numel()
                        {
                            break;
                        }
                        let src = flat_ref[i].narrow(j * dst.numel(), dst.numel())?;
                        backend_post.record_stream(dst.storage(), &streams[i]);
                        backend_post.copy_on_stream(dst, &src, &streams[i])?;
                    }
                }
                Ok(())
            },
        )
    }

    /// Reduce per-rank input lists and scatter one slice per rank.
    ///
    /// Mirror of [`ProcessGroup::allgather`]: the pre-hook copies the
    /// caller's inputs into flat staging on the collective stream unless
    /// the input list already aliases it (`no_copy`).
    pub fn reduce_scatter(
        &self,
        outputs: &[Tensor<B>],
        input_lists: &[Vec<Tensor<B>>],
        opts: ReduceScatterOptions,
    ) -> Result<Work<B>> {
        check_device_tensors(&*self.shared.backend, outputs, false)?;
        let flat = flatten_for_scatter_gather(
            &*self.shared.backend,
            input_lists,
            outputs,
            self.shared.size,
            self.shared.rank,
            opts.no_copy,
        )?;
        check_device_tensors(&*self.shared.backend, &flat, false)?;

        let backend = Arc::clone(&self.shared.backend);
        let backend_pre = Arc::clone(&self.shared.backend);
        let flat_ref = &flat;
        self.collective_with_hooks(
            &flat,
            outputs,
            move |input, output, comm, stream| {
                backend.record_stream(output.storage(), stream);
                backend.reduce_scatter(input, output, opts.reduce_op, comm.raw(), stream)
            },
            move |streams| {
                for (i, list) in input_lists.iter().enumerate() {
                    for (j, src) in list.iter().enumerate() {
                        if src.same_storage(&flat_ref[i])
                            && src.storage_offset()
                                == list[0].storage_offset() + j * src.numel()
                        {
                            break;
                        }
                        let dst = flat_ref[i].narrow(j * src.numel(), src.numel())?;
                        backend_pre.record_stream(src.storage(), &streams[i]);
                        backend_pre.copy_on_stream(&dst, src, &streams[i])?;
                    }
                }
                Ok(())
            },
            |_streams| Ok(()),
        )
    }

    /// Synchronize every rank via an all-reduce over one placeholder byte
    /// per active device.
    ///
    /// Devices: every device this group has ever used, or `rank %
    /// device_count` before the first collective. The placeholders are
    /// attached to the returned [`Work`], whose `synchronize` then also
    /// device-synchronizes.
    pub fn barrier(&self) -> Result<Work<B>> {
        let devices: Vec<DeviceIndex> = {
            let state = lock(&self.shared.cache.state);
            if state.used_devices.is_empty() {
                vec![self.shared.rank % self.shared.backend.device_count()]
            } else {
                state.used_devices.iter().copied().collect()
            }
        };

        let mut barrier_tensors = Vec::with_capacity(devices.len());
        for &device in &devices {
            self.shared.backend.set_device(device)?;
            barrier_tensors.push(Tensor::empty(
                &*self.shared.backend,
                &[1],
                DataType::U8,
                device,
            )?);
        }

        let mut work = self.allreduce(&barrier_tensors, AllreduceOptions::default())?;
        work.set_barrier_tensors(barrier_tensors);
        Ok(work)
    }

    /// Exchange contiguous per-peer slices of one tensor, split evenly or
    /// by explicit row counts.
    pub fn alltoall_base(
        &self,
        output: &Tensor<B>,
        input: &Tensor<B>,
        output_split_sizes: &[usize],
        input_split_sizes: &[usize],
    ) -> Result<Work<B>> {
        let inputs = [input.clone()];
        let outputs = [output.clone()];
        check_device_tensors(&*self.shared.backend, &inputs, false)?;
        check_device_tensors(&*self.shared.backend, &outputs, false)?;

        let size = self.shared.size;
        let mut sends = Vec::with_capacity(size);
        let mut recvs = Vec::with_capacity(size);

        if output_split_sizes.is_empty() && input_split_sizes.is_empty() {
            if output.numel() != input.numel() || output.dtype() != input.dtype() {
                return Err(MusterError::invalid(
                    "tensors are not equal in size or data type",
                ));
            }
            if output.size(0)? % size != 0 {
                return Err(MusterError::invalid(
                    "tensor's dimension 0 does not divide equally across group size",
                ));
            }
            let len = input.numel() / size;
            let in_flat = input.flat_view()?;
            let out_flat = output.flat_view()?;
            for peer in 0..size {
                sends.push(in_flat.narrow(peer * len, len)?);
                recvs.push(out_flat.narrow(peer * len, len)?);
            }
        } else {
            check_split_sizes(input_split_sizes, input, size)?;
            check_split_sizes(output_split_sizes, output, size)?;

            let in_dim0 = input.size(0)?;
            let out_dim0 = output.size(0)?;
            let row_size = if in_dim0 == 0 { 0 } else { input.numel() / in_dim0 };
            let in_flat = input.flat_view()?;
            let out_flat = output.flat_view()?;

            let mut input_row = 0usize;
            let mut output_row = 0usize;
            for peer in 0..size {
                let send_rows = split_rows(input_split_sizes, peer, in_dim0, size);
                let recv_rows = split_rows(output_split_sizes, peer, out_dim0, size);
                sends.push(in_flat.narrow(input_row * row_size, send_rows * row_size)?);
                recvs.push(out_flat.narrow(output_row * row_size, recv_rows * row_size)?);
                input_row += send_rows;
                output_row += recv_rows;
            }
        }

        self.batched_p2p(&sends, &recvs, &inputs, &outputs)
    }

    /// Exchange one tensor per peer rank.
    pub fn alltoall(&self, outputs: &[Tensor<B>], inputs: &[Tensor<B>]) -> Result<Work<B>> {
        if inputs.len() != self.shared.size || outputs.len() != self.shared.size {
            return Err(MusterError::invalid(
                "number of input or output tensors are not equal to group size",
            ));
        }
        check_device_tensors(&*self.shared.backend, inputs, true)?;
        check_device_tensors(&*self.shared.backend, outputs, true)?;

        let sends = inputs
            .iter()
            .map(Tensor::flat_view)
            .collect::<Result<Vec<_>>>()?;
        let recvs = outputs
            .iter()
            .map(Tensor::flat_view)
            .collect::<Result<Vec<_>>>()?;
        let input0 = [inputs[0].clone()];
        let output0 = [outputs[0].clone()];
        self.batched_p2p(&sends, &recvs, &input0, &output0)
    }

    // ── Unsupported surface ──────────────────────────────────────────

    pub fn allreduce_coalesced(
        &self,
        _tensors: &[Tensor<B>],
        _opts: AllreduceOptions,
    ) -> Result<Work<B>> {
        Err(MusterError::Unsupported {
            op: "allreduce_coalesced",
        })
    }

    pub fn allgather_coalesced(
        &self,
        _output_lists: &[Vec<Tensor<B>>],
        _inputs: &[Tensor<B>],
    ) -> Result<Work<B>> {
        Err(MusterError::Unsupported {
            op: "allgather_coalesced",
        })
    }

    pub fn allgather_base(&self, _output: &Tensor<B>, _input: &Tensor<B>) -> Result<Work<B>> {
        Err(MusterError::Unsupported {
            op: "allgather_base",
        })
    }

    pub fn gather(
        &self,
        _output_lists: &[Vec<Tensor<B>>],
        _inputs: &[Tensor<B>],
        _root_rank: usize,
    ) -> Result<Work<B>> {
        Err(MusterError::Unsupported { op: "gather" })
    }

    pub fn scatter(
        &self,
        _outputs: &[Tensor<B>],
        _input_lists: &[Vec<Tensor<B>>],
        _root_rank: usize,
    ) -> Result<Work<B>> {
        Err(MusterError::Unsupported { op: "scatter" })
    }

    pub fn send(&self, _tensors: &[Tensor<B>], _dst_rank: usize, _tag: usize) -> Result<Work<B>> {
        Err(MusterError::Unsupported { op: "send" })
    }

    pub fn recv(&self, _tensors: &[Tensor<B>], _src_rank: usize, _tag: usize) -> Result<Work<B>> {
        Err(MusterError::Unsupported { op: "recv" })
    }

    pub fn recv_any_source(&self, _tensors: &[Tensor<B>], _tag: usize) -> Result<Work<B>> {
        Err(MusterError::Unsupported {
            op: "recv_any_source",
        })
    }

    // ── Generic driver ───────────────────────────────────────────────

    fn collective<F>(&self, inputs: &[Tensor<B>], outputs: &[Tensor<B>], f: F) -> Result<Work<B>>
    where
        F: FnMut(&Tensor<B>, &Tensor<B>, &Arc<Comm<B>>, &B::Stream) -> Result<()>,
    {
        self.collective_with_hooks(inputs, outputs, f, |_| Ok(()), |_| Ok(()))
    }

    fn collective_with_hooks<F, Pre, Post>(
        &self,
        inputs: &[Tensor<B>],
        outputs: &[Tensor<B>],
        mut f: F,
        pre: Pre,
        post: Post,
    ) -> Result<Work<B>>
    where
        F: FnMut(&Tensor<B>, &Tensor<B>, &Arc<Comm<B>>, &B::Stream) -> Result<()>,
        Pre: FnOnce(&[B::Stream]) -> Result<()>,
        Post: FnOnce(&[B::Stream]) -> Result<()>,
    {
        let backend = &*self.shared.backend;
        let devices = device_list(inputs);
        let group = self.shared.cache.get_or_create(
            backend,
            &*self.shared.store,
            self.shared.rank,
            self.shared.size,
            &devices,
        )?;

        sync_streams(backend, &devices, &group.sync_events, &group.streams)?;
        let started_at = Instant::now();
        let events = devices
            .iter()
            .map(|&d| backend.create_event(d))
            .collect::<Result<Vec<_>>>()?;

        pre(&group.streams)?;

        // Inputs live on compute streams but are consumed on collective
        // streams; registration keeps their storage from being reused if
        // the caller drops them early. Outputs that differ from inputs are
        // registered inside `f`.
        for (input, stream) in inputs.iter().zip(&group.streams) {
            backend.record_stream(input.storage(), stream);
        }

        {
            let _free_guard = lock(backend.free_mutex());
            backend.group_start()?;
            let submitted: Result<()> = (|| {
                for i in 0..inputs.len() {
                    backend.set_device(devices[i])?;
                    f(&inputs[i], &outputs[i], &group.comms[i], &group.streams[i])?;
                }
                Ok(())
            })();
            let ended = backend.group_end();
            submitted?;
            ended?;
        }

        post(&group.streams)?;

        for (event, stream) in events.iter().zip(&group.streams) {
            backend.record_event(event, stream)?;
        }

        Ok(Work::new(
            Arc::clone(&self.shared.backend),
            Arc::clone(&self.shared.store),
            devices,
            events,
            group.comms,
            started_at,
            self.shared.options.op_timeout,
            self.shared.options.blocking_wait,
        ))
    }

    /// Batched paired send/recv, one pair per peer rank, all inside one
    /// grouped scope on collective stream 0.
    fn batched_p2p(
        &self,
        sends: &[Tensor<B>],
        recvs: &[Tensor<B>],
        inputs: &[Tensor<B>],
        outputs: &[Tensor<B>],
    ) -> Result<Work<B>> {
        let backend = &*self.shared.backend;
        let devices = device_list(inputs);
        let group = self.shared.cache.get_or_create(
            backend,
            &*self.shared.store,
            self.shared.rank,
            self.shared.size,
            &devices,
        )?;

        sync_streams(backend, &devices, &group.sync_events, &group.streams)?;
        let started_at = Instant::now();
        let events = devices
            .iter()
            .map(|&d| backend.create_event(d))
            .collect::<Result<Vec<_>>>()?;

        for (input, stream) in inputs.iter().zip(&group.streams) {
            backend.record_stream(input.storage(), stream);
        }

        {
            let _free_guard = lock(backend.free_mutex());
            backend.group_start()?;
            let submitted: Result<()> = (|| {
                backend.set_device(devices[0])?;
                let comm = &group.comms[0];
                let stream = &group.streams[0];
                for peer in 0..self.shared.size {
                    backend.send(&sends[peer], peer, comm.raw(), stream)?;
                    backend.recv(&recvs[peer], peer, comm.raw(), stream)?;
                }
                Ok(())
            })();
            let ended = backend.group_end();
            submitted?;
            ended?;
        }

        for (output, stream) in outputs.iter().zip(&group.streams) {
            backend.record_stream(output.storage(), stream);
        }

        for (event, stream) in events.iter().zip(&group.streams) {
            backend.record_event(event, stream)?;
        }

        Ok(Work::new(
            Arc::clone(&self.shared.backend),
            Arc::clone(&self.shared.store),
            devices,
            events,
            group.comms,
            started_at,
            self.shared.options.op_timeout,
            self.shared.options.blocking_wait,
        ))
    }
}

impl<B: Backend> Drop for ProcessGroup<B> {
    fn drop(&mut self) {
        *lock(&self.shared.terminate) = true;
        self.shared.terminate_cv.notify_all();
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}

/// Make each collective stream wait for the caller's pending work: record
/// the per-device sync event on the device's current compute stream, then
/// have collective stream `i` wait on event `i`.
fn sync_streams<B: Backend>(
    backend: &B,
    devices: &[DeviceIndex],
    sync_events: &[B::Event],
    streams: &[B::Stream],
) -> Result<()> {
    for i in 0..devices.len() {
        let current = backend.current_stream(devices[i]);
        backend.record_event(&sync_events[i], &current)?;
        backend.stream_wait_event(&streams[i], &sync_events[i])?;
    }
    Ok(())
}

/// Rows peer `peer` contributes under `splits`, with empty splits meaning
/// an even division.
fn split_rows(splits: &[usize], peer: usize, dim0: usize, size: usize) -> usize {
    if splits.is_empty() {
        dim0 / size
    } else {
        splits[peer]
    }
}
