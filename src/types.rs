use crate::error::{MusterError, Result};

/// Index of a local device participating in a collective call.
pub type DeviceIndex = usize;

/// Data types accepted by the collective surface.
///
/// This mirrors the fixed dtype table of the vendor library: 8-bit ints,
/// 16-bit float, 32/64-bit ints and floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    I8 = 0,
    U8 = 1,
    F16 = 2,
    F32 = 3,
    F64 = 4,
    I32 = 5,
    I64 = 6,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::F16 => 2,
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::F16 => "f16",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Width of a communicator unique id, fixed by the vendor library.
pub const UNIQUE_ID_BYTES: usize = 128;

/// Opaque identifier shared by all ranks of one communicator.
///
/// Rank 0 mints one per communicator creation and publishes it through the
/// store; every rank constructs its communicator from the same id. The hex
/// serialization is the stable identity used in store keys and in the
/// watchdog's reverse index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId([u8; UNIQUE_ID_BYTES]);

impl UniqueId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != UNIQUE_ID_BYTES {
            return Err(MusterError::invalid(format!(
                "unique id must be {UNIQUE_ID_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        let mut id = [0u8; UNIQUE_ID_BYTES];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub(crate) fn from_array(bytes: [u8; UNIQUE_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lower-case hex serialization: each byte rendered with `{:x}` and
    /// concatenated in order, no separators, no `0x` prefix. Bytes below
    /// 0x10 render as a single digit; this matches the wire format peers
    /// expect in store keys.
    pub fn hex(&self) -> String {
        use std::fmt::Write as _;
        let mut s = String::with_capacity(UNIQUE_ID_BYTES * 2);
        for b in &self.0 {
            let _ = write!(s, "{b:x}");
        }
        s
    }
}

impl std::fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full 128-byte dumps drown log lines; the first few bytes identify.
        write!(
            f,
            "UniqueId({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

// ── Per-operation options ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct AllreduceOptions {
    pub reduce_op: ReduceOp,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOptions {
    /// Rank of the process holding the source tensor.
    pub root_rank: usize,
    /// Index of the source tensor within the root's tensor list.
    pub root_tensor: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReduceOptions {
    pub reduce_op: ReduceOp,
    pub root_rank: usize,
    pub root_tensor: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllgatherOptions {
    /// Skip the device-to-device fan-out copy when the output list is
    /// already laid out as one contiguous flat buffer.
    pub no_copy: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReduceScatterOptions {
    pub reduce_op: ReduceOp,
    /// Skip the device-to-device copy-in when the input list is already
    /// laid out as one contiguous flat buffer.
    pub no_copy: bool,
}

impl Default for ReduceOp {
    fn default() -> Self {
        ReduceOp::Sum
    }
}
