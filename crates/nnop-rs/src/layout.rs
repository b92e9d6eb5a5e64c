//! Memory layouts and the channel-packing converter.
//!
//! Vector kernels consume activations in a channel-packed layout: the channel axis of a
//! channel-first tensor `[N, C, X...]` is regrouped into `ceil(C/P)` groups of `P` lanes,
//! giving `[N, ceil(C/P), X..., P]`. `P` is the backend's pack factor for the dtype.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::backend::spec::{KernelError, KernelResult};
use crate::tensor::{DType, Shape, Tensor, TensorData, TensorDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// `NC`, `NCW`, `NCHW`, `NCDHW`; also `OIHW` for convolution weights.
    ChannelFirst,
    /// `NHWC`.
    ChannelLast,
    /// `NC1[X]C0`: `channels` logical channels packed `factor` lanes at a time.
    Packed { factor: usize, channels: usize },
}

impl Layout {
    pub fn is_packed(self) -> bool {
        matches!(self, Layout::Packed { .. })
    }

    pub fn pack_factor(self) -> Option<usize> {
        match self {
            Layout::Packed { factor, .. } => Some(factor),
            _ => None,
        }
    }

    /// `true` when packing the canonical tensor at `factor` under `policy` yields this layout.
    pub fn is_packed_as(self, factor: usize, policy: RemainderPolicy) -> bool {
        match self {
            Layout::Packed { factor: current, channels } => {
                current == effective_factor(channels, factor, policy)
            }
            _ => false,
        }
    }

    /// Canonical dimensions for a buffer stored with this layout.
    pub fn logical_dims(self, stored: &[usize]) -> SmallVec<[usize; 6]> {
        match self {
            Layout::Packed { channels, .. } if stored.len() >= 3 => {
                let mut dims = SmallVec::new();
                dims.push(stored[0]);
                dims.push(channels);
                dims.extend_from_slice(&stored[2..stored.len() - 1]);
                dims
            }
            _ => SmallVec::from_slice(stored),
        }
    }

    /// Flat offset of `(n, c, s)` where `s` indexes the flattened spatial axes.
    ///
    /// `logical` are canonical channel-first dims. Channel-last is not addressable this way.
    #[inline]
    pub fn offset(self, logical: &[usize], n: usize, c: usize, s: usize) -> usize {
        let channels = logical[1];
        let spatial: usize = logical[2..].iter().product();
        match self {
            Layout::Packed { factor, .. } => {
                let groups = channels.div_ceil(factor);
                ((n * groups + c / factor) * spatial + s) * factor + c % factor
            }
            Layout::ChannelFirst | Layout::ChannelLast => (n * channels + c) * spatial + s,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layout::ChannelFirst => "nchw",
            Layout::ChannelLast => "nhwc",
            Layout::Packed { .. } => "nc1hwc0",
        }
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layout::Packed { factor, .. } => write!(f, "nc1hwc0[{factor}]"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What happens to the last channel group when `C` is not a multiple of `P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// Pad the last group with zero lanes.
    #[default]
    ZeroPad,
    /// Keep the tensor at pack factor 1.
    PackOne,
}

/// Channel lanes per vector register of `vlen_bits` for `dtype`.
///
/// Int8 kernels accumulate through 16-bit widening, so they get half the raw byte lanes.
/// Sub-byte dtypes are not packable and report 1.
pub fn pack_factor(vlen_bits: usize, dtype: DType) -> usize {
    let lane_bits = match dtype {
        DType::I8 | DType::U8 => 16,
        DType::I4 => return 1,
        other => other.bit_width(),
    };
    (vlen_bits / lane_bits).max(1)
}

/// Factor actually used for `channels` under `policy`.
pub fn effective_factor(channels: usize, factor: usize, policy: RemainderPolicy) -> usize {
    match policy {
        RemainderPolicy::PackOne if channels % factor != 0 => 1,
        _ => factor,
    }
}

/// Descriptor `to_packed` produces for `desc`.
pub fn packed_desc(desc: &TensorDesc, factor: usize, policy: RemainderPolicy) -> KernelResult<TensorDesc> {
    if desc.layout != Layout::ChannelFirst {
        return Err(KernelError::unsupported_layout(format!(
            "packing expects a channel-first tensor, found {}",
            desc.layout
        )));
    }
    let dims = desc.shape.dims();
    if dims.len() < 2 {
        return Err(KernelError::shape_mismatch(format!(
            "packing needs a channel axis, found rank {}",
            dims.len()
        )));
    }
    if factor == 0 {
        return Err(KernelError::failure("pack factor must be positive"));
    }
    let channels = dims[1];
    let factor = effective_factor(channels, factor, policy);
    let mut packed: SmallVec<[usize; 6]> = SmallVec::with_capacity(dims.len() + 1);
    packed.push(dims[0]);
    packed.push(channels.div_ceil(factor));
    packed.extend_from_slice(&dims[2..]);
    packed.push(factor);
    let shape = Shape::try_new(&packed)
        .ok_or_else(|| KernelError::shape_mismatch("packed rank exceeds the maximum rank"))?;
    Ok(TensorDesc {
        dtype: desc.dtype,
        shape,
        layout: Layout::Packed { factor, channels },
        quant: desc.quant.clone(),
    })
}

macro_rules! with_matching_data {
    ($src:expr, $dst:expr, |$s:ident, $d:ident| $body:expr) => {
        match ($src, $dst) {
            (TensorData::F32($s), TensorData::F32($d)) => $body,
            (TensorData::F16($s), TensorData::F16($d)) => $body,
            (TensorData::I8($s), TensorData::I8($d)) => $body,
            (TensorData::U8($s), TensorData::U8($d)) => $body,
            (TensorData::I32($s), TensorData::I32($d)) => $body,
            (TensorData::Bool($s), TensorData::Bool($d)) => $body,
            (src, _) => {
                return Err(KernelError::unsupported_dtype(format!(
                    "layout conversion does not support {} buffers",
                    src.dtype()
                )))
            }
        }
    };
}

fn pack_lanes<T: Copy + Default>(src: &[T], dst: &mut [T], batch: usize, channels: usize, spatial: usize, factor: usize) {
    let groups = channels.div_ceil(factor);
    dst.fill(T::default());
    for n in 0..batch {
        for c in 0..channels {
            let src_base = (n * channels + c) * spatial;
            let dst_base = (n * groups + c / factor) * spatial * factor + c % factor;
            for s in 0..spatial {
                dst[dst_base + s * factor] = src[src_base + s];
            }
        }
    }
}

fn unpack_lanes<T: Copy>(src: &[T], dst: &mut [T], batch: usize, channels: usize, spatial: usize, factor: usize) {
    let groups = channels.div_ceil(factor);
    for n in 0..batch {
        for c in 0..channels {
            let src_base = (n * groups + c / factor) * spatial * factor + c % factor;
            let dst_base = (n * channels + c) * spatial;
            for s in 0..spatial {
                dst[dst_base + s] = src[src_base + s * factor];
            }
        }
    }
}

fn check_scratch(scratch: &Tensor, expected: &TensorDesc) -> KernelResult<()> {
    if scratch.dtype() != expected.dtype || scratch.desc().storage_elements() != expected.storage_elements() {
        return Err(KernelError::shape_mismatch(format!(
            "scratch buffer holds {} {} elements, conversion needs {} {}",
            scratch.desc().storage_elements(),
            scratch.dtype(),
            expected.storage_elements(),
            expected.dtype
        )));
    }
    Ok(())
}

/// Packs `src` into `scratch`, which must already hold exactly the packed element count.
pub fn to_packed_into(src: &Tensor, factor: usize, policy: RemainderPolicy, scratch: &mut Tensor) -> KernelResult<()> {
    let desc = packed_desc(src.desc(), factor, policy)?;
    check_scratch(scratch, &desc)?;
    let dims = src.shape().dims();
    let (batch, channels, spatial) = (dims[0], dims[1], src.shape().inner_size(1));
    let lanes = desc.layout.pack_factor().unwrap_or(1);
    with_matching_data!(src.data(), scratch.data_mut(), |s, d| pack_lanes(
        s, d, batch, channels, spatial, lanes
    ));
    scratch.set_desc(desc);
    Ok(())
}

/// Packs a channel-first tensor, allocating the destination.
///
/// A tensor already packed with the requested factor is returned unchanged.
pub fn to_packed(src: &Tensor, factor: usize, policy: RemainderPolicy) -> KernelResult<Tensor> {
    if src.layout().is_packed() {
        if src.layout().is_packed_as(factor, policy) {
            return Ok(src.clone());
        }
        let canonical = from_packed(src)?;
        return to_packed(&canonical, factor, policy);
    }
    let desc = packed_desc(src.desc(), factor, policy)?;
    let mut out = Tensor::zeros(desc);
    to_packed_into(src, factor, policy, &mut out)?;
    Ok(out)
}

/// Unpacks `src` into `scratch`, which must hold exactly the canonical element count.
pub fn from_packed_into(src: &Tensor, scratch: &mut Tensor) -> KernelResult<()> {
    let Layout::Packed { factor, channels } = src.layout() else {
        return Err(KernelError::unsupported_layout(format!(
            "unpacking expects a packed tensor, found {}",
            src.layout()
        )));
    };
    let desc = src.desc().canonical();
    check_scratch(scratch, &desc)?;
    let dims = desc.shape.dims();
    let (batch, spatial) = (dims[0], desc.shape.inner_size(1));
    with_matching_data!(src.data(), scratch.data_mut(), |s, d| unpack_lanes(
        s, d, batch, channels, spatial, factor
    ));
    scratch.set_desc(desc);
    Ok(())
}

/// Restores the canonical channel-first tensor, dropping padded lanes.
pub fn from_packed(src: &Tensor) -> KernelResult<Tensor> {
    let mut out = Tensor::zeros(src.desc().canonical());
    from_packed_into(src, &mut out)?;
    Ok(out)
}

fn permute4<T: Copy + Default>(src: &[T], dims: [usize; 4], perm: [usize; 4]) -> Vec<T> {
    let out_dims = perm.map(|axis| dims[axis]);
    let mut strides = [0usize; 4];
    let mut acc = 1;
    for axis in (0..4).rev() {
        strides[axis] = acc;
        acc *= dims[axis];
    }
    let mut out = vec![T::default(); src.len()];
    let mut idx = 0;
    for a in 0..out_dims[0] {
        for b in 0..out_dims[1] {
            for c in 0..out_dims[2] {
                for d in 0..out_dims[3] {
                    let offset = a * strides[perm[0]]
                        + b * strides[perm[1]]
                        + c * strides[perm[2]]
                        + d * strides[perm[3]];
                    out[idx] = src[offset];
                    idx += 1;
                }
            }
        }
    }
    out
}

fn permute_tensor(src: &Tensor, from: Layout, to: Layout, perm: [usize; 4]) -> KernelResult<Tensor> {
    if src.layout() != from {
        return Err(KernelError::unsupported_layout(format!(
            "expected {from} input, found {}",
            src.layout()
        ))
        .with_layout(src.layout()));
    }
    let stored = src.shape().dims();
    let dims: [usize; 4] = stored
        .try_into()
        .map_err(|_| KernelError::shape_mismatch(format!("{from} -> {to} needs rank 4, found {stored:?}")))?;
    let data = match src.data() {
        TensorData::F32(v) => TensorData::F32(permute4(v, dims, perm)),
        TensorData::F16(v) => TensorData::F16(permute4(v, dims, perm)),
        TensorData::I8(v) => TensorData::I8(permute4(v, dims, perm)),
        TensorData::U8(v) => TensorData::U8(permute4(v, dims, perm)),
        TensorData::I32(v) => TensorData::I32(permute4(v, dims, perm)),
        TensorData::Bool(v) => TensorData::Bool(permute4(v, dims, perm)),
        TensorData::I4(_) => {
            return Err(KernelError::unsupported_dtype("i4 buffers cannot be permuted"))
        }
    };
    let desc = TensorDesc {
        dtype: src.dtype(),
        shape: Shape::new(perm.map(|axis| dims[axis])),
        layout: to,
        quant: src.quant().clone(),
    };
    Tensor::new(desc, data)
}

pub const PERM_NCHW_TO_NHWC: [usize; 4] = [0, 2, 3, 1];
pub const PERM_NHWC_TO_NCHW: [usize; 4] = [0, 3, 1, 2];

pub fn nchw_to_nhwc(src: &Tensor) -> KernelResult<Tensor> {
    permute_tensor(src, Layout::ChannelFirst, Layout::ChannelLast, PERM_NCHW_TO_NHWC)
}

pub fn nhwc_to_nchw(src: &Tensor) -> KernelResult<Tensor> {
    permute_tensor(src, Layout::ChannelLast, Layout::ChannelFirst, PERM_NHWC_TO_NCHW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_factor_follows_vector_width() {
        assert_eq!(pack_factor(128, DType::F32), 4);
        assert_eq!(pack_factor(128, DType::F16), 8);
        assert_eq!(pack_factor(128, DType::I8), 8);
        assert_eq!(pack_factor(64, DType::I8), 4);
        assert_eq!(pack_factor(16, DType::F32), 1);
        assert_eq!(pack_factor(128, DType::I4), 1);
    }

    #[test]
    fn packed_offset_matches_converter() {
        let values: Vec<f32> = (0..2 * 6 * 3).map(|v| v as f32).collect();
        let src = Tensor::from_f32([2, 6, 3], values.clone()).unwrap();
        let packed = to_packed(&src, 4, RemainderPolicy::ZeroPad).unwrap();
        assert_eq!(packed.shape().dims(), &[2, 2, 3, 4]);
        let stored = packed.as_f32().unwrap();
        let logical = [2, 6, 3];
        for n in 0..2 {
            for c in 0..6 {
                for s in 0..3 {
                    let canonical = Layout::ChannelFirst.offset(&logical, n, c, s);
                    let offset = packed.layout().offset(&logical, n, c, s);
                    assert_eq!(stored[offset], values[canonical]);
                }
            }
        }
    }

    #[test]
    fn pack_one_keeps_unit_factor() {
        let src = Tensor::from_f32([1, 3, 2], vec![1.0; 6]).unwrap();
        let packed = to_packed(&src, 4, RemainderPolicy::PackOne).unwrap();
        assert_eq!(packed.layout(), Layout::Packed { factor: 1, channels: 3 });
        assert_eq!(packed.shape().dims(), &[1, 3, 2, 1]);
    }

    #[test]
    fn wrong_scratch_size_is_a_shape_mismatch() {
        let src = Tensor::from_f32([1, 3, 2], vec![1.0; 6]).unwrap();
        let mut scratch = Tensor::zeros(TensorDesc::new(DType::F32, [6]));
        let err = to_packed_into(&src, 4, RemainderPolicy::ZeroPad, &mut scratch).unwrap_err();
        assert_eq!(err.status(), crate::backend::spec::Status::ShapeMismatch);
    }
}
