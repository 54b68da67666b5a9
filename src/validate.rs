//! Argument validation for the collective surface.
//!
//! All failures are invalid-argument errors with no side effects.

use std::collections::HashSet;

use crate::backend::Backend;
use crate::error::{MusterError, Result};
use crate::tensor::Tensor;

/// Check that `tensors` form a valid per-device batch: nonempty, one dtype,
/// contiguous, and in strict mode one identically-shaped tensor per
/// distinct local device, at most one per device.
///
/// `allow_unequal_and_same_device` is the permissive mode used by
/// all-to-all, where sizes differ per peer and every entry lives on the
/// same device.
pub fn check_device_tensors<B: Backend>(
    backend: &B,
    tensors: &[Tensor<B>],
    allow_unequal_and_same_device: bool,
) -> Result<()> {
    if tensors.is_empty() {
        return Err(MusterError::invalid("tensor list must be nonempty"));
    }
    if !allow_unequal_and_same_device && tensors.len() > backend.device_count() {
        return Err(MusterError::invalid(
            "tensor list mustn't be larger than the number of available devices",
        ));
    }

    let first = &tensors[0];
    let mut used_devices = HashSet::with_capacity(tensors.len());

    for t in tensors {
        if t.dtype() != first.dtype() {
            return Err(MusterError::invalid("tensors must have identical type"));
        }
        if !allow_unequal_and_same_device && t.shape() != first.shape() {
            return Err(MusterError::invalid("tensors must have identical size"));
        }
        if !t.is_contiguous() {
            return Err(MusterError::invalid("tensors must be contiguous"));
        }
        if !allow_unequal_and_same_device && !used_devices.insert(t.device()) {
            return Err(MusterError::invalid(
                "tensors must be on distinct devices",
            ));
        }
    }
    Ok(())
}

/// Check split sizes against dimension 0 of `tensor`: empty splits require
/// even divisibility by `group_size`, explicit splits must have one entry
/// per rank and sum to the full extent.
pub fn check_split_sizes<B: Backend>(
    split_sizes: &[usize],
    tensor: &Tensor<B>,
    group_size: usize,
) -> Result<()> {
    let dim0 = tensor.size(0)?;
    if split_sizes.is_empty() {
        if dim0 % group_size != 0 {
            return Err(MusterError::invalid(
                "tensor's dimension 0 does not divide equally across group size",
            ));
        }
    } else {
        if split_sizes.len() != group_size {
            return Err(MusterError::invalid(
                "number of tensor splits not equal to group size",
            ));
        }
        let sum: usize = split_sizes.iter().sum();
        if sum != dim0 {
            return Err(MusterError::invalid(
                "split sizes don't match total dimension 0 size",
            ));
        }
    }
    Ok(())
}
