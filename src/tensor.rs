//! The tensor view the collective surface consumes.
//!
//! A [`Tensor`] is a typed window into a backend storage allocation:
//! shared storage handle, element offset, shape and strides. The type makes
//! device residency and density static guarantees; the dynamic properties a
//! collective cares about (dtype, shape, contiguity, device distinctness)
//! are checked by the validator at call time.

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{MusterError, Result};
use crate::types::{DataType, DeviceIndex};

pub struct Tensor<B: Backend> {
    storage: Arc<B::Storage>,
    /// Offset into storage, in elements.
    storage_offset: usize,
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DataType,
    device: DeviceIndex,
}

// Manual impl: `B` itself need not be `Clone`.
impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            storage_offset: self.storage_offset,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            dtype: self.dtype,
            device: self.device,
        }
    }
}

impl<B: Backend> Tensor<B> {
    /// Allocate an uninitialized contiguous tensor through the backend's
    /// caching allocator.
    pub fn empty(backend: &B, shape: &[usize], dtype: DataType, device: DeviceIndex) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let storage = backend.alloc(device, numel * dtype.size_in_bytes())?;
        Ok(Self {
            storage,
            storage_offset: 0,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            dtype,
            device,
        })
    }

    /// View over existing storage with contiguous strides.
    pub fn from_storage(
        storage: Arc<B::Storage>,
        storage_offset: usize,
        shape: Vec<usize>,
        dtype: DataType,
        device: DeviceIndex,
    ) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            storage,
            storage_offset,
            shape,
            strides,
            dtype,
            device,
        }
    }

    pub fn storage(&self) -> &Arc<B::Storage> {
        &self.storage
    }

    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Extent of dimension `dim`.
    pub fn size(&self, dim: usize) -> Result<usize> {
        self.shape.get(dim).copied().ok_or_else(|| {
            MusterError::invalid(format!(
                "dimension {dim} out of range for shape {:?}",
                self.shape
            ))
        })
    }

    /// Row-major contiguity. Tensors with zero or one element are always
    /// contiguous.
    pub fn is_contiguous(&self) -> bool {
        if self.numel() <= 1 {
            return true;
        }
        self.strides == contiguous_strides(&self.shape)
    }

    /// Whether `self` and `other` share the same storage allocation.
    pub fn same_storage(&self, other: &Tensor<B>) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// One-dimensional view of a contiguous tensor.
    pub fn flat_view(&self) -> Result<Tensor<B>> {
        if !self.is_contiguous() {
            return Err(MusterError::invalid(
                "flat view requires a contiguous tensor",
            ));
        }
        Ok(Tensor::from_storage(
            Arc::clone(&self.storage),
            self.storage_offset,
            vec![self.numel()],
            self.dtype,
            self.device,
        ))
    }

    /// Contiguous sub-range `[start, start + len)` along dimension 0.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Tensor<B>> {
        let dim0 = self.size(0)?;
        if start + len > dim0 {
            return Err(MusterError::invalid(format!(
                "narrow range {start}..{} out of bounds for dimension 0 of size {dim0}",
                start + len
            )));
        }
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(Self {
            storage: Arc::clone(&self.storage),
            storage_offset: self.storage_offset + start * self.strides[0],
            shape,
            strides: self.strides.clone(),
            dtype: self.dtype,
            device: self.device,
        })
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("storage_offset", &self.storage_offset)
            .finish()
    }
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
