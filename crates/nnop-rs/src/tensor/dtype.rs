//! Enumerates the scalar element types a tensor descriptor can carry.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared between descriptors, tables, and buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 16-bit floating point (fp16).
    F16,
    /// Signed 8-bit integer, the storage type of affine-quantized activations and weights.
    I8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 4-bit integer, stored two values per byte (low nibble first).
    I4,
    /// 32-bit signed integer, used for quantized bias and accumulators.
    I32,
    /// Boolean stored as one byte per element.
    Bool,
}

impl DType {
    /// All dtypes, in tag order.
    pub const ALL: [DType; 7] = [
        DType::F32,
        DType::F16,
        DType::I8,
        DType::U8,
        DType::I4,
        DType::I32,
        DType::Bool,
    ];

    /// Storage width of one element in bits.
    pub fn bit_width(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 32,
            DType::F16 => 16,
            DType::I8 | DType::U8 | DType::Bool => 8,
            DType::I4 => 4,
        }
    }

    /// Bytes needed to store `count` elements, rounding sub-byte types up.
    pub fn storage_bytes(self, count: usize) -> usize {
        (count * self.bit_width()).div_ceil(8)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }

    /// Returns `true` for dtypes that are normally accompanied by quantization records.
    pub fn is_quantized_storage(self) -> bool {
        matches!(self, DType::I8 | DType::U8 | DType::I4)
    }

    /// Inclusive representable range for integer dtypes, used by saturation.
    pub fn int_range(self) -> Option<(i32, i32)> {
        match self {
            DType::I8 => Some((i8::MIN as i32, i8::MAX as i32)),
            DType::U8 => Some((0, u8::MAX as i32)),
            DType::I4 => Some((-8, 7)),
            DType::I32 => Some((i32::MIN, i32::MAX)),
            DType::Bool => Some((0, 1)),
            DType::F32 | DType::F16 => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I4 => "i4",
            DType::I32 => "i32",
            DType::Bool => "bool",
        }
    }

    /// Produces a stable tag used when dtypes cross a serialization boundary.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::I8 => 2,
            DType::U8 => 3,
            DType::I4 => 4,
            DType::I32 => 5,
            DType::Bool => 6,
        }
    }

    /// Reconstructs a `DType` from its serialized tag representation.
    pub fn from_tag(tag: u32) -> Option<Self> {
        DType::ALL.get(tag as usize).copied()
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
