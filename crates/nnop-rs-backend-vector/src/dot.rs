//! Pointwise int8 convolution through four-lane dot products.
//!
//! Models cores with a 4x int8 -> int32 dot-product instruction: each output element is a
//! sum of `C/4` four-lane dots between a weight row and the input pixel's channel vector.

use std::sync::Arc;

use nnop_rs::backend::select::PathLadder;
use nnop_rs::backend::spec::{
    ExecContext, Executor, InitContext, Initializer, KernelError, KernelResult, LayoutReq,
};
use nnop_rs::ops::{self, ConvGeometry, OpKind};
use nnop_rs::quant::Requantizer;
use nnop_rs::tensor::{DType, Tensor, TensorData};

use crate::prepared::{reject_channel_last, PreparedProduct};
use crate::DOT_LANES;

#[inline]
fn dot4(lhs: &[i8], rhs: &[i8]) -> i32 {
    lhs.chunks_exact(DOT_LANES)
        .zip(rhs.chunks_exact(DOT_LANES))
        .fold(0i32, |acc, (a, b)| {
            let lanes = a[0] as i32 * b[0] as i32
                + a[1] as i32 * b[1] as i32
                + a[2] as i32 * b[2] as i32
                + a[3] as i32 * b[3] as i32;
            acc.wrapping_add(lanes)
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotPath {
    Dot4Conv1x1,
}

struct DotConv1x1 {
    geometry: ConvGeometry,
    weights: Vec<i8>,
    bias: Vec<i32>,
    requant: Requantizer,
}

impl Executor for DotConv1x1 {
    fn name(&self) -> &str {
        "dot4_conv1x1"
    }

    fn input_layout(&self, slot: usize) -> LayoutReq {
        if slot == 0 {
            LayoutReq::Canonical
        } else {
            LayoutReq::Any
        }
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let g = &self.geometry;
        let (channels, spatial) = (g.in_channels, g.in_spatial());
        let input = ctx.input(0)?.i8_values()?;
        let mut out = vec![0i8; g.batch * g.out_channels * spatial];
        // One pixel's channel vector, contiguous for the dot products.
        let mut pixel = vec![0i8; channels];
        for n in 0..g.batch {
            let image = &input[n * channels * spatial..(n + 1) * channels * spatial];
            let dst = &mut out[n * g.out_channels * spatial..(n + 1) * g.out_channels * spatial];
            for s in 0..spatial {
                for (c, lane) in pixel.iter_mut().enumerate() {
                    *lane = image[c * spatial + s];
                }
                for (oc, row) in self.weights.chunks_exact(channels).enumerate() {
                    let acc = self.bias[oc].wrapping_add(dot4(row, &pixel));
                    dst[oc * spatial + s] = self.requant.apply(acc, oc) as i8;
                }
            }
        }
        Ok(vec![Tensor::new(ctx.output(0)?.canonical(), TensorData::I8(out))?])
    }
}

/// Initializer for int8 `Conv2d`/`Conv2dRelu`; declines everything but unpadded pointwise
/// convolutions whose input channels fill whole dot lanes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotConvInitializer;

impl Initializer for DotConvInitializer {
    fn initialize(&self, ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
        reject_channel_last(ctx)?;
        let input = ctx.input(0)?;
        if input.dtype != DType::I8 {
            return Err(KernelError::unsupported_dtype("dot kernels are int8 only").with_dtype(input.dtype));
        }
        let geometry = ConvGeometry::new(input, ctx.input(1)?, ctx.params.conv2d()?)?;
        ops::check_output(ctx.op, ctx.output(0)?, &geometry.output_dims())?;
        PathLadder::new("conv2d_dot")
            .rule(
                DotPath::Dot4Conv1x1,
                geometry.group == 1
                    && geometry.is_pointwise_unpadded()
                    && geometry.in_channels % DOT_LANES == 0,
            )
            .select()
            .ok_or_else(|| {
                KernelError::unsupported_layout(format!(
                    "dot path needs an ungrouped 1x1 convolution over a multiple of {DOT_LANES} channels"
                ))
            })?;
        let product = PreparedProduct::new(
            ctx,
            geometry.out_channels,
            geometry.in_channels,
            ctx.op == OpKind::Conv2dRelu,
        )?;
        let PreparedProduct::I8 {
            weights,
            bias,
            requant,
            ..
        } = product
        else {
            return Err(KernelError::failure("int8 input prepared non-int8 weights"));
        };
        Ok(Arc::new(DotConv1x1 {
            geometry,
            weights,
            bias,
            requant,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_lane_dot_covers_every_lane() {
        let lhs = [1i8, 2, 3, 4, -1, -2, -3, -4];
        let rhs = [5i8, 6, 7, 8, 1, 1, 1, 1];
        assert_eq!(dot4(&lhs, &rhs), 5 + 12 + 21 + 32 - 10);
        assert_eq!(dot4(&lhs, &rhs), crate::gemm::dot_i8(&lhs, &rhs));
    }
}
