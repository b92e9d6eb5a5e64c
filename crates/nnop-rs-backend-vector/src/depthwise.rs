//! Depthwise 3x3 convolution over packed activations.

use std::sync::Arc;

use nnop_rs::backend::select::PathLadder;
use nnop_rs::backend::spec::{
    ExecContext, Executor, InitContext, Initializer, KernelError, KernelResult, LayoutReq,
};
use nnop_rs::layout::pack_factor;
use nnop_rs::ops::{self, ConvGeometry};
use nnop_rs::tensor::{Tensor, TensorData, TensorDesc};

use crate::prepared::{reject_channel_last, Activations, PreparedProduct};
use crate::VectorConfig;

const TAPS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthwisePath {
    Dwconv3x3,
}

pub fn select_depthwise_path(geometry: &ConvGeometry) -> Option<DepthwisePath> {
    PathLadder::new("depthwise_conv2d")
        .rule_with(DepthwisePath::Dwconv3x3, || {
            geometry.is_kernel(3, 3)
                && (geometry.is_stride(1) || geometry.is_stride(2))
                && geometry.is_unit_dilation()
        })
        .select()
}

struct Dwconv3x3 {
    geometry: ConvGeometry,
    activations: Activations,
    product: PreparedProduct,
}

impl Dwconv3x3 {
    /// Calls `emit(n, c, s, taps)` for every output element with the nine input values under
    /// the filter, `pad` where the filter overhangs the input.
    fn for_each_window<T: Copy>(&self, src: &[T], input: &TensorDesc, pad: T, mut emit: impl FnMut(usize, usize, usize, &[T; TAPS])) {
        let g = &self.geometry;
        let logical = input.logical_dims();
        let mut window = [pad; TAPS];
        for n in 0..g.batch {
            for c in 0..g.in_channels {
                for oy in 0..g.out_h {
                    for ox in 0..g.out_w {
                        for ky in 0..3 {
                            let iy = g.input_y(oy, ky);
                            for kx in 0..3 {
                                window[ky * 3 + kx] = match (iy, g.input_x(ox, kx)) {
                                    (Some(y), Some(x)) => src[input.layout.offset(&logical, n, c, y * g.in_w + x)],
                                    _ => pad,
                                };
                            }
                        }
                        emit(n, c, oy * g.out_w + ox, &window);
                    }
                }
            }
        }
    }
}

impl Executor for Dwconv3x3 {
    fn name(&self) -> &str {
        "dwconv3x3"
    }

    fn input_layout(&self, slot: usize) -> LayoutReq {
        self.activations.request(slot)
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let input = ctx.input(0)?;
        let out = self.activations.output_desc(ctx.output(0)?)?;
        let out_dims = out.logical_dims();
        let data = match &self.product {
            PreparedProduct::F32 { weights, bias, relu } => {
                let mut data = vec![0.0f32; out.storage_elements()];
                self.for_each_window(input.f32_values()?, input.desc(), 0.0, |n, c, s, window| {
                    let filter = &weights[c * TAPS..(c + 1) * TAPS];
                    let value = bias[c] + window.iter().zip(filter).map(|(x, w)| x * w).sum::<f32>();
                    data[out.layout.offset(&out_dims, n, c, s)] = if *relu { value.max(0.0) } else { value };
                });
                TensorData::F32(data)
            }
            PreparedProduct::I8 {
                weights,
                bias,
                input_zero_point,
                requant,
            } => {
                let mut data = vec![0i8; out.storage_elements()];
                self.for_each_window(input.i8_values()?, input.desc(), *input_zero_point, |n, c, s, window| {
                    let filter = &weights[c * TAPS..(c + 1) * TAPS];
                    let acc = bias[c].wrapping_add(crate::gemm::dot_i8(window, filter));
                    data[out.layout.offset(&out_dims, n, c, s)] = requant.apply(acc, c) as i8;
                });
                TensorData::I8(data)
            }
        };
        Ok(vec![Tensor::new(out, data)?])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DepthwiseInitializer {
    config: VectorConfig,
}

impl DepthwiseInitializer {
    pub fn new(config: VectorConfig) -> Self {
        DepthwiseInitializer { config }
    }
}

impl Initializer for DepthwiseInitializer {
    fn initialize(&self, ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
        reject_channel_last(ctx)?;
        let input = ctx.input(0)?;
        let geometry = ConvGeometry::depthwise(input, ctx.input(1)?, ctx.params.conv2d()?)?;
        ops::check_output(ctx.op, ctx.output(0)?, &geometry.output_dims())?;
        select_depthwise_path(&geometry).ok_or_else(|| {
            KernelError::unsupported_layout(format!(
                "no vector depthwise path for a {}x{} kernel at stride {:?}",
                geometry.kernel_h, geometry.kernel_w, geometry.stride
            ))
        })?;
        let product = PreparedProduct::new(ctx, geometry.in_channels, TAPS, false)?;
        let factor = pack_factor(self.config.vlen_bits, input.dtype);
        Ok(Arc::new(Dwconv3x3 {
            geometry,
            activations: Activations::packed(factor, ctx),
            product,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnop_rs::ops::Conv2dParams;
    use nnop_rs::tensor::DType;

    fn geometry(kernel: usize, params: Conv2dParams) -> ConvGeometry {
        let input = TensorDesc::new(DType::F32, [1, 4, 8, 8]);
        let weight = TensorDesc::new(DType::F32, [4, 1, kernel, kernel]);
        ConvGeometry::depthwise(&input, &weight, &params).unwrap()
    }

    #[test]
    fn only_small_strides_of_three_by_three() {
        for stride in [1, 2] {
            let g = geometry(3, Conv2dParams::default().with_stride(stride).with_padding(1));
            assert_eq!(select_depthwise_path(&g), Some(DepthwisePath::Dwconv3x3));
        }
        assert_eq!(select_depthwise_path(&geometry(3, Conv2dParams::default().with_stride(3))), None);
        assert_eq!(select_depthwise_path(&geometry(5, Conv2dParams::default())), None);
    }
}
