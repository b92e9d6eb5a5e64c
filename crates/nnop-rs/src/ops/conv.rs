//! Convolution parameters and the geometry every convolution kernel derives from them.

use serde::{Deserialize, Serialize};

use crate::backend::spec::{KernelError, KernelResult};
use crate::ops::OpKind;
use crate::tensor::TensorDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Conv2dParams {
    /// `[height, width]`.
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    /// `[top, bottom, left, right]`.
    pub padding: [usize; 4],
    pub group: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Conv2dParams {
            stride: [1, 1],
            dilation: [1, 1],
            padding: [0; 4],
            group: 1,
        }
    }
}

impl Conv2dParams {
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = [stride, stride];
        self
    }

    pub fn with_padding(mut self, pad: usize) -> Self {
        self.padding = [pad; 4];
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }
}

/// Resolved convolution shape: input `[N, C, H, W]`, weights `[O, C/group, KH, KW]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub padding: [usize; 4],
    pub group: usize,
}

fn output_extent(input: usize, pad: usize, kernel: usize, stride: usize, dilation: usize) -> Option<usize> {
    let effective = dilation.checked_mul(kernel.checked_sub(1)?)?.checked_add(1)?;
    let padded = input.checked_add(pad)?;
    if stride == 0 || padded < effective {
        return None;
    }
    Some((padded - effective) / stride + 1)
}

impl ConvGeometry {
    /// Geometry of a (possibly grouped) convolution.
    pub fn new(input: &TensorDesc, weight: &TensorDesc, params: &Conv2dParams) -> KernelResult<Self> {
        Self::build(OpKind::Conv2d, input, weight, params, params.group)
    }

    /// Geometry of a depthwise convolution: one filter per input channel.
    pub fn depthwise(input: &TensorDesc, weight: &TensorDesc, params: &Conv2dParams) -> KernelResult<Self> {
        let channels = input.logical_dims().get(1).copied().unwrap_or(0);
        let geometry = Self::build(OpKind::DepthwiseConv2d, input, weight, params, channels)?;
        if geometry.out_channels != channels {
            return Err(KernelError::shape_mismatch(format!(
                "depthwise convolution expects {channels} filters, found {}",
                geometry.out_channels
            ))
            .with_op(OpKind::DepthwiseConv2d));
        }
        Ok(geometry)
    }

    fn build(op: OpKind, input: &TensorDesc, weight: &TensorDesc, params: &Conv2dParams, group: usize) -> KernelResult<Self> {
        let dims = input.logical_dims();
        let wdims = weight.shape.dims();
        if dims.len() != 4 || wdims.len() != 4 {
            return Err(KernelError::shape_mismatch(format!(
                "convolution expects rank-4 input and weights, found {:?} and {wdims:?}",
                dims.as_slice()
            ))
            .with_op(op));
        }
        let (batch, in_channels, in_h, in_w) = (dims[0], dims[1], dims[2], dims[3]);
        let (out_channels, per_group, kernel_h, kernel_w) = (wdims[0], wdims[1], wdims[2], wdims[3]);
        if group == 0 || in_channels % group != 0 || out_channels % group != 0 {
            return Err(KernelError::shape_mismatch(format!(
                "group {group} does not divide {in_channels} input / {out_channels} output channels"
            ))
            .with_op(op));
        }
        if per_group != in_channels / group {
            return Err(KernelError::shape_mismatch(format!(
                "weights expect {per_group} channels per group, input provides {}",
                in_channels / group
            ))
            .with_op(op));
        }
        let [pt, pb, pl, pr] = params.padding;
        let out_h = output_extent(in_h, pt + pb, kernel_h, params.stride[0], params.dilation[0]);
        let out_w = output_extent(in_w, pl + pr, kernel_w, params.stride[1], params.dilation[1]);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            return Err(KernelError::shape_mismatch(format!(
                "kernel {kernel_h}x{kernel_w} does not fit input {in_h}x{in_w} with {params:?}"
            ))
            .with_op(op));
        };
        Ok(ConvGeometry {
            batch,
            in_channels,
            in_h,
            in_w,
            out_channels,
            kernel_h,
            kernel_w,
            out_h,
            out_w,
            stride: params.stride,
            dilation: params.dilation,
            padding: params.padding,
            group,
        })
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [self.batch, self.out_channels, self.out_h, self.out_w]
    }

    /// Reduction length of one output element: `C/group * KH * KW`.
    pub fn inner_size(&self) -> usize {
        self.in_channels / self.group * self.kernel_h * self.kernel_w
    }

    pub fn out_spatial(&self) -> usize {
        self.out_h * self.out_w
    }

    pub fn in_spatial(&self) -> usize {
        self.in_h * self.in_w
    }

    pub fn is_kernel(&self, h: usize, w: usize) -> bool {
        self.kernel_h == h && self.kernel_w == w
    }

    pub fn is_unit_stride(&self) -> bool {
        self.stride == [1, 1]
    }

    pub fn is_stride(&self, stride: usize) -> bool {
        self.stride == [stride, stride]
    }

    pub fn is_unit_dilation(&self) -> bool {
        self.dilation == [1, 1]
    }

    pub fn has_padding(&self) -> bool {
        self.padding.iter().any(|&p| p != 0)
    }

    /// 1x1 kernel, unit stride and dilation, no padding: a plain matrix product.
    pub fn is_pointwise_unpadded(&self) -> bool {
        self.is_kernel(1, 1) && self.is_unit_stride() && self.is_unit_dilation() && !self.has_padding()
    }

    pub fn channels_divisible_by(&self, factor: usize) -> bool {
        factor > 0 && self.in_channels % factor == 0 && self.out_channels % factor == 0
    }

    /// Input coordinate read by output row `oy` at kernel row `ky`, `None` inside padding.
    #[inline]
    pub fn input_y(&self, oy: usize, ky: usize) -> Option<usize> {
        (oy * self.stride[0] + ky * self.dilation[0])
            .checked_sub(self.padding[0])
            .filter(|&y| y < self.in_h)
    }

    #[inline]
    pub fn input_x(&self, ox: usize, kx: usize) -> Option<usize> {
        (ox * self.stride[1] + kx * self.dilation[1])
            .checked_sub(self.padding[2])
            .filter(|&x| x < self.in_w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn padded_strided_geometry() {
        let input = TensorDesc::new(DType::F32, [1, 3, 7, 7]);
        let weight = TensorDesc::new(DType::F32, [8, 3, 3, 3]);
        let params = Conv2dParams::default().with_stride(2).with_padding(1);
        let geometry = ConvGeometry::new(&input, &weight, &params).unwrap();
        assert_eq!(geometry.output_dims(), [1, 8, 4, 4]);
        assert_eq!(geometry.inner_size(), 27);
        assert_eq!(geometry.input_y(0, 0), None);
        assert_eq!(geometry.input_y(0, 1), Some(0));
    }

    #[test]
    fn grouped_weights_must_match() {
        let input = TensorDesc::new(DType::F32, [1, 4, 5, 5]);
        let weight = TensorDesc::new(DType::F32, [4, 4, 1, 1]);
        let params = Conv2dParams::default().with_group(2);
        assert!(ConvGeometry::new(&input, &weight, &params).is_err());
    }

    #[test]
    fn pointwise_predicate() {
        let input = TensorDesc::new(DType::I8, [1, 4, 2, 2]);
        let weight = TensorDesc::new(DType::I8, [4, 4, 1, 1]);
        let geometry = ConvGeometry::new(&input, &weight, &Conv2dParams::default()).unwrap();
        assert!(geometry.is_pointwise_unpadded());
        assert!(geometry.channels_divisible_by(4));
        assert!(!geometry.channels_divisible_by(8));
    }
}
