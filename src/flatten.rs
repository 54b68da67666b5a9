//! Layout flattening for the gather/scatter collective family.
//!
//! All-gather and reduce-scatter exchange one flat buffer per device while
//! the caller holds one tensor per rank. This module builds the staging
//! tensors, with an opt-in fast path that aliases caller storage when the
//! per-rank tensors already form one contiguous flat layout.

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{MusterError, Result};
use crate::tensor::Tensor;

/// Build one flat staging tensor per device for a gather or scatter.
///
/// `tensor_lists[i]` holds one tensor per global participant on device `i`
/// and `other[i]` the matching single tensor (all-gather input /
/// reduce-scatter output). The result has one `other[i].numel()`-sized
/// chunk per participant.
///
/// With `no_copy`, the staging tensor is a view over `tensor_lists[i][0]`'s
/// storage iff every list entry is the consecutive slice of that storage and
/// `other[i]`, when it shares the storage, sits at this rank's slice. When
/// any predicate fails the fast path is dropped silently and a fresh
/// allocation is returned.
pub fn flatten_for_scatter_gather<B: Backend>(
    backend: &B,
    tensor_lists: &[Vec<Tensor<B>>],
    other: &[Tensor<B>],
    world_size: usize,
    rank: usize,
    no_copy: bool,
) -> Result<Vec<Tensor<B>>> {
    if tensor_lists.len() != other.len() {
        return Err(MusterError::invalid(
            "tensor list operands to scatter/gather must have the same length",
        ));
    }
    let num_devices = tensor_lists.len();
    let mut flattened = Vec::with_capacity(num_devices);

    for (list, other_t) in tensor_lists.iter().zip(other) {
        if list.len() != world_size * num_devices {
            return Err(MusterError::invalid(
                "tensor list input to scatter/gather must match number of collective participants",
            ));
        }
        for t in list {
            if t.device() != other_t.device() {
                return Err(MusterError::invalid(
                    "corresponding input/output tensors to scatter/gather must all reside on the same device",
                ));
            }
            if t.numel() != other_t.numel() {
                return Err(MusterError::invalid(
                    "all tensor operands to scatter/gather must have the same size",
                ));
            }
        }

        let chunk = list[0].numel();
        let flat_len = list.len() * other_t.numel();

        let mut aliases = no_copy;
        if aliases {
            // Every entry must be the j-th consecutive slice of entry 0's
            // storage.
            for (j, t) in list.iter().enumerate() {
                if !t.same_storage(&list[0])
                    || t.storage_offset() != list[0].storage_offset() + j * chunk
                {
                    aliases = false;
                    break;
                }
            }
            // `other` may share the storage only at this rank's slice.
            if other_t.same_storage(&list[0])
                && other_t.storage_offset() != list[0].storage_offset() + rank * chunk
            {
                aliases = false;
            }
        }

        if aliases {
            flattened.push(Tensor::from_storage(
                Arc::clone(list[0].storage()),
                list[0].storage_offset(),
                vec![flat_len],
                other_t.dtype(),
                other_t.device(),
            ));
        } else {
            flattened.push(Tensor::empty(
                backend,
                &[flat_len],
                other_t.dtype(),
                other_t.device(),
            )?);
        }
    }
    Ok(flattened)
}
