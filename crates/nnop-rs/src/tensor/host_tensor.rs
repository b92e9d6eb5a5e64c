//! Host-backed tensors and the descriptors kernels negotiate with.

use half::f16;
use smallvec::SmallVec;

use super::{dtype::DType, shape::Shape};
use crate::backend::spec::{KernelError, KernelResult};
use crate::layout::Layout;
use crate::quant::Quantization;

/// Static description of one operand: everything but the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub dtype: DType,
    /// Dimensions of the stored buffer. For packed layouts this is the packed shape
    /// `[N, ceil(C/P), ..., P]`; [`TensorDesc::logical_dims`] recovers `[N, C, ...]`.
    pub shape: Shape,
    pub layout: Layout,
    pub quant: Quantization,
}

impl TensorDesc {
    /// Canonical channel-first descriptor without quantization records.
    pub fn new(dtype: DType, shape: impl Into<Shape>) -> Self {
        TensorDesc {
            dtype,
            shape: shape.into(),
            layout: Layout::ChannelFirst,
            quant: Quantization::None,
        }
    }

    pub fn with_quant(mut self, quant: Quantization) -> Self {
        self.quant = quant;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Number of stored elements, including zero-padded lanes of packed layouts.
    pub fn storage_elements(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn byte_size(&self) -> usize {
        self.dtype.storage_bytes(self.storage_elements())
    }

    /// Dimensions in canonical order regardless of packing.
    pub fn logical_dims(&self) -> SmallVec<[usize; 6]> {
        self.layout.logical_dims(self.shape.dims())
    }

    pub fn logical_elements(&self) -> usize {
        self.logical_dims().iter().product()
    }

    /// The same logical tensor described in canonical channel-first layout.
    pub fn canonical(&self) -> TensorDesc {
        match self.layout {
            Layout::Packed { .. } => TensorDesc {
                dtype: self.dtype,
                shape: Shape::new(self.logical_dims()),
                layout: Layout::ChannelFirst,
                quant: self.quant.clone(),
            },
            _ => self.clone(),
        }
    }

    /// Quantization records must be one per tensor or one per leading-dimension slice.
    pub fn validate(&self) -> KernelResult<()> {
        let leading = self.shape.dims()[0];
        self.quant
            .validate(leading)
            .map_err(|reason| KernelError::shape_mismatch(reason).with_dtype(self.dtype))
    }
}

/// Owned element storage, one variant per dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    /// Two signed nibbles per byte, low nibble first.
    I4(Vec<u8>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
}

impl TensorData {
    /// Zero-filled storage for `count` elements of `dtype`.
    pub fn zeros(dtype: DType, count: usize) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; count]),
            DType::F16 => TensorData::F16(vec![f16::ZERO; count]),
            DType::I8 => TensorData::I8(vec![0; count]),
            DType::U8 => TensorData::U8(vec![0; count]),
            DType::I4 => TensorData::I4(vec![0; dtype.storage_bytes(count)]),
            DType::I32 => TensorData::I32(vec![0; count]),
            DType::Bool => TensorData::Bool(vec![false; count]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F16(_) => DType::F16,
            TensorData::I8(_) => DType::I8,
            TensorData::U8(_) => DType::U8,
            TensorData::I4(_) => DType::I4,
            TensorData::I32(_) => DType::I32,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    /// Length of the backing vector (bytes for `I4`, elements otherwise).
    fn raw_len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F16(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::U8(v) | TensorData::I4(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }
}

/// Host tensor: a descriptor plus the buffer it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    desc: TensorDesc,
    data: TensorData,
}

impl Tensor {
    /// Pairs a descriptor with storage, checking dtype and `byte_size` agreement.
    pub fn new(desc: TensorDesc, data: TensorData) -> KernelResult<Self> {
        if data.dtype() != desc.dtype {
            return Err(KernelError::unsupported_dtype(format!(
                "buffer holds {} but descriptor declares {}",
                data.dtype(),
                desc.dtype
            )));
        }
        let expected = match desc.dtype {
            DType::I4 => desc.byte_size(),
            _ => desc.storage_elements(),
        };
        if data.raw_len() != expected {
            return Err(KernelError::shape_mismatch(format!(
                "tensor data length ({}) does not match shape {:?}",
                data.raw_len(),
                desc.shape.dims()
            ))
            .with_dtype(desc.dtype));
        }
        desc.validate()?;
        Ok(Tensor { desc, data })
    }

    /// Constructs an `F32` tensor from raw values, validating the length against the shape.
    pub fn from_f32(shape: impl Into<Shape>, data: Vec<f32>) -> KernelResult<Self> {
        Tensor::new(TensorDesc::new(DType::F32, shape), TensorData::F32(data))
    }

    /// Constructs a quantized `I8` tensor.
    pub fn from_i8(shape: impl Into<Shape>, data: Vec<i8>, quant: Quantization) -> KernelResult<Self> {
        Tensor::new(
            TensorDesc::new(DType::I8, shape).with_quant(quant),
            TensorData::I8(data),
        )
    }

    /// Constructs an `I32` tensor, typically a quantized bias.
    pub fn from_i32(shape: impl Into<Shape>, data: Vec<i32>) -> KernelResult<Self> {
        Tensor::new(TensorDesc::new(DType::I32, shape), TensorData::I32(data))
    }

    /// Returns a zero-initialized tensor matching `desc`.
    pub fn zeros(desc: TensorDesc) -> Self {
        let data = TensorData::zeros(desc.dtype, desc.storage_elements());
        Tensor { desc, data }
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    pub fn layout(&self) -> Layout {
        self.desc.layout
    }

    pub fn quant(&self) -> &Quantization {
        &self.desc.quant
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    pub fn into_parts(self) -> (TensorDesc, TensorData) {
        (self.desc, self.data)
    }

    /// Replaces the descriptor of a tensor whose storage already matches it.
    pub(crate) fn set_desc(&mut self, desc: TensorDesc) {
        debug_assert_eq!(desc.dtype, self.data.dtype());
        self.desc = desc;
    }

    pub fn byte_size(&self) -> usize {
        self.desc.byte_size()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i8(&self) -> Option<&[i8]> {
        match &self.data {
            TensorData::I8(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::I32(values) => Some(values),
            _ => None,
        }
    }

    /// Typed view that reports the mismatch as a kernel error.
    pub fn f32_values(&self) -> KernelResult<&[f32]> {
        self.as_f32().ok_or_else(|| {
            KernelError::unsupported_dtype(format!("expected f32 buffer, found {}", self.dtype()))
        })
    }

    pub fn i8_values(&self) -> KernelResult<&[i8]> {
        self.as_i8().ok_or_else(|| {
            KernelError::unsupported_dtype(format!("expected i8 buffer, found {}", self.dtype()))
        })
    }

    pub fn i32_values(&self) -> KernelResult<&[i32]> {
        self.as_i32().ok_or_else(|| {
            KernelError::unsupported_dtype(format!("expected i32 buffer, found {}", self.dtype()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::QuantInfo;

    #[test]
    fn rejects_length_mismatch() {
        let err = Tensor::from_f32([2, 2], vec![1.0; 3]).unwrap_err();
        assert_eq!(err.status(), crate::backend::spec::Status::ShapeMismatch);
    }

    #[test]
    fn int4_counts_bytes() {
        let desc = TensorDesc::new(DType::I4, [1, 3]);
        assert_eq!(desc.byte_size(), 2);
        assert!(Tensor::new(desc, TensorData::I4(vec![0; 2])).is_ok());
    }

    #[test]
    fn rejects_bad_record_count() {
        let quant = Quantization::PerChannel(vec![QuantInfo::new(0.5, 0); 3]);
        assert!(Tensor::from_i8([2, 1], vec![0; 2], quant).is_err());
    }
}
