//! Dense convolution paths.
//!
//! Ungrouped convolutions are lowered to one matrix product per batch item:
//! `out[oc, s] = weights[oc, k] * columns[k, s]`, where `columns` is the im2col matrix of
//! the input (rows ordered `(c, ky, kx)` like OIHW weights). Packed paths read and write
//! channel-packed activations; the canonical path serves channel counts the pack factor does
//! not divide.

use std::sync::Arc;

use nnop_rs::backend::select::PathLadder;
use nnop_rs::backend::spec::{
    ExecContext, Executor, InitContext, Initializer, KernelError, KernelResult, LayoutReq,
};
use nnop_rs::layout::{pack_factor, Layout};
use nnop_rs::ops::{self, ConvGeometry, OpKind};
use nnop_rs::tensor::{Tensor, TensorData, TensorDesc};

use crate::gemm;
use crate::prepared::{reject_channel_last, Activations, PreparedProduct};
use crate::VectorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvPath {
    /// 1x1, unit stride and dilation, no padding, channels a multiple of the pack factor.
    Conv1x1s1PackN,
    /// Any kernel shape with channels a multiple of the pack factor.
    Im2colGemmPackN,
    /// Canonical-layout fallback.
    Im2colGemm,
}

impl ConvPath {
    pub fn name(self) -> &'static str {
        match self {
            ConvPath::Conv1x1s1PackN => "conv1x1s1_packn",
            ConvPath::Im2colGemmPackN => "im2col_gemm_packn",
            ConvPath::Im2colGemm => "im2col_gemm",
        }
    }

    pub fn is_packed(self) -> bool {
        !matches!(self, ConvPath::Im2colGemm)
    }
}

/// Most specific path for `geometry` at pack factor `factor`; `None` for grouped convolutions.
pub fn select_conv_path(geometry: &ConvGeometry, factor: usize) -> Option<ConvPath> {
    let ungrouped = geometry.group == 1;
    let packable = ungrouped && geometry.channels_divisible_by(factor);
    PathLadder::new("conv2d")
        .rule(ConvPath::Conv1x1s1PackN, packable && geometry.is_pointwise_unpadded())
        .rule(ConvPath::Im2colGemmPackN, packable)
        .rule(ConvPath::Im2colGemm, ungrouped)
        .select()
}

/// Copies the activations of batch item `n` into `columns` (`channels x spatial`) for a
/// pointwise convolution.
fn gather_pointwise<T: Copy>(src: &[T], layout: Layout, logical: &[usize], n: usize, columns: &mut [T]) {
    let spatial: usize = logical[2..].iter().product();
    for (c, row) in columns.chunks_exact_mut(spatial).enumerate() {
        for (s, value) in row.iter_mut().enumerate() {
            *value = src[layout.offset(logical, n, c, s)];
        }
    }
}

/// Fills `columns` (`inner x out_spatial`) with the im2col matrix of batch item `n`; taps in
/// the padding read `pad`.
fn im2col<T: Copy>(
    src: &[T],
    layout: Layout,
    logical: &[usize],
    g: &ConvGeometry,
    n: usize,
    pad: T,
    columns: &mut [T],
) {
    let spatial = g.out_spatial();
    let mut row = 0;
    for c in 0..g.in_channels {
        for ky in 0..g.kernel_h {
            for kx in 0..g.kernel_w {
                let dst = &mut columns[row * spatial..(row + 1) * spatial];
                for oy in 0..g.out_h {
                    let iy = g.input_y(oy, ky);
                    for ox in 0..g.out_w {
                        dst[oy * g.out_w + ox] = match (iy, g.input_x(ox, kx)) {
                            (Some(y), Some(x)) => src[layout.offset(logical, n, c, y * g.in_w + x)],
                            _ => pad,
                        };
                    }
                }
                row += 1;
            }
        }
    }
}

struct VectorConv {
    path: ConvPath,
    geometry: ConvGeometry,
    activations: Activations,
    product: PreparedProduct,
}

impl VectorConv {
    fn gather<T: Copy>(&self, src: &[T], input: &TensorDesc, n: usize, pad: T, columns: &mut [T]) {
        let logical = input.logical_dims();
        match self.path {
            ConvPath::Conv1x1s1PackN => gather_pointwise(src, input.layout, &logical, n, columns),
            ConvPath::Im2colGemmPackN | ConvPath::Im2colGemm => {
                im2col(src, input.layout, &logical, &self.geometry, n, pad, columns)
            }
        }
    }

    fn run_f32(&self, input: &Tensor, out: &TensorDesc, weights: &[f32], bias: &[f32], relu: bool) -> KernelResult<Vec<f32>> {
        let g = &self.geometry;
        let src = input.f32_values()?;
        let out_dims = out.logical_dims();
        let (rows, inner, spatial) = (g.out_channels, g.inner_size(), g.out_spatial());
        let mut data = vec![0.0f32; out.storage_elements()];
        let mut product = vec![0.0f32; rows * spatial];
        gemm::with_columns_f32(inner * spatial, |columns| {
            for n in 0..g.batch {
                self.gather(src, input.desc(), n, 0.0, columns);
                gemm::gemm_f32(weights, columns, &mut product, rows, inner, spatial);
                for (oc, row) in product.chunks_exact(spatial).enumerate() {
                    for (s, &value) in row.iter().enumerate() {
                        let value = value + bias[oc];
                        data[out.layout.offset(&out_dims, n, oc, s)] = if relu { value.max(0.0) } else { value };
                    }
                }
            }
        });
        Ok(data)
    }

    fn run_i8(&self, input: &Tensor, out: &TensorDesc, product: &PreparedProduct) -> KernelResult<Vec<i8>> {
        let PreparedProduct::I8 {
            weights,
            bias,
            input_zero_point,
            requant,
        } = product
        else {
            return Err(KernelError::failure("int8 convolution bound to f32 weights"));
        };
        let g = &self.geometry;
        let src = input.i8_values()?;
        let out_dims = out.logical_dims();
        let (rows, inner, spatial) = (g.out_channels, g.inner_size(), g.out_spatial());
        let mut data = vec![0i8; out.storage_elements()];
        let mut acc = vec![0i32; rows * spatial];
        gemm::with_columns_i8(inner * spatial, |columns| {
            for n in 0..g.batch {
                // Padding reads the input zero-point so the folded bias cancels it.
                self.gather(src, input.desc(), n, *input_zero_point, columns);
                for (row, &b) in acc.chunks_exact_mut(spatial).zip(bias) {
                    row.fill(b);
                }
                gemm::gemm_i8_accumulate(weights, columns, &mut acc, rows, inner, spatial);
                for (oc, row) in acc.chunks_exact(spatial).enumerate() {
                    for (s, &value) in row.iter().enumerate() {
                        data[out.layout.offset(&out_dims, n, oc, s)] = requant.apply(value, oc) as i8;
                    }
                }
            }
        });
        Ok(data)
    }
}

impl Executor for VectorConv {
    fn name(&self) -> &str {
        self.path.name()
    }

    fn input_layout(&self, slot: usize) -> LayoutReq {
        self.activations.request(slot)
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let input = ctx.input(0)?;
        let out = self.activations.output_desc(ctx.output(0)?)?;
        let data = match &self.product {
            PreparedProduct::F32 { weights, bias, relu } => {
                TensorData::F32(self.run_f32(input, &out, weights, bias, *relu)?)
            }
            int8 => TensorData::I8(self.run_i8(input, &out, int8)?),
        };
        Ok(vec![Tensor::new(out, data)?])
    }
}

/// Initializer for `Conv2d` and `Conv2dRelu` at both advertised dtypes.
#[derive(Debug, Clone, Copy)]
pub struct ConvInitializer {
    config: VectorConfig,
}

impl ConvInitializer {
    pub fn new(config: VectorConfig) -> Self {
        ConvInitializer { config }
    }
}

impl Initializer for ConvInitializer {
    fn initialize(&self, ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
        reject_channel_last(ctx)?;
        let input = ctx.input(0)?;
        let geometry = ConvGeometry::new(input, ctx.input(1)?, ctx.params.conv2d()?)?;
        ops::check_output(ctx.op, ctx.output(0)?, &geometry.output_dims())?;
        let factor = pack_factor(self.config.vlen_bits, input.dtype);
        let path = select_conv_path(&geometry, factor).ok_or_else(|| {
            KernelError::unsupported_layout(format!(
                "grouped convolution (group {}) has no vector path",
                geometry.group
            ))
        })?;
        let product = PreparedProduct::new(
            ctx,
            geometry.out_channels,
            geometry.inner_size(),
            ctx.op == OpKind::Conv2dRelu,
        )?;
        let activations = if path.is_packed() {
            Activations::packed(factor, ctx)
        } else {
            Activations::Canonical
        };
        Ok(Arc::new(VectorConv {
            path,
            geometry,
            activations,
            product,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnop_rs::layout::{to_packed, RemainderPolicy};
    use nnop_rs::ops::Conv2dParams;
    use nnop_rs::tensor::DType;

    fn geometry(channels: usize, out_channels: usize, kernel: usize, params: Conv2dParams) -> ConvGeometry {
        let input = TensorDesc::new(DType::I8, [1, channels, 6, 6]);
        let per_group = channels / params.group;
        let weight = TensorDesc::new(DType::I8, [out_channels, per_group, kernel, kernel]);
        ConvGeometry::new(&input, &weight, &params).unwrap()
    }

    #[test]
    fn ladder_prefers_pointwise_then_packed_then_canonical() {
        let pointwise = geometry(8, 8, 1, Conv2dParams::default());
        assert_eq!(select_conv_path(&pointwise, 4), Some(ConvPath::Conv1x1s1PackN));

        let padded = geometry(8, 8, 1, Conv2dParams::default().with_padding(1));
        assert_eq!(select_conv_path(&padded, 4), Some(ConvPath::Im2colGemmPackN));

        let three = geometry(8, 4, 3, Conv2dParams::default());
        assert_eq!(select_conv_path(&three, 4), Some(ConvPath::Im2colGemmPackN));

        let odd = geometry(6, 4, 1, Conv2dParams::default());
        assert_eq!(select_conv_path(&odd, 4), Some(ConvPath::Im2colGemm));
        assert_eq!(select_conv_path(&odd, 2), Some(ConvPath::Conv1x1s1PackN));
    }

    #[test]
    fn grouped_convolution_declines() {
        let grouped = geometry(8, 8, 3, Conv2dParams::default().with_group(2));
        assert_eq!(select_conv_path(&grouped, 4), None);
    }

    #[test]
    fn im2col_reads_packed_and_canonical_alike() {
        let values: Vec<f32> = (0..2 * 3 * 3).map(|v| v as f32 + 1.0).collect();
        let canonical = Tensor::from_f32([1, 2, 3, 3], values).unwrap();
        let packed = to_packed(&canonical, 4, RemainderPolicy::ZeroPad).unwrap();
        let input = TensorDesc::new(DType::F32, [1, 2, 3, 3]);
        let weight = TensorDesc::new(DType::F32, [1, 2, 3, 3]);
        let g = ConvGeometry::new(&input, &weight, &Conv2dParams::default().with_padding(1)).unwrap();

        let mut from_canonical = vec![0.0; g.inner_size() * g.out_spatial()];
        let mut from_packed = vec![0.0; g.inner_size() * g.out_spatial()];
        let logical = [1, 2, 3, 3];
        im2col(canonical.as_f32().unwrap(), canonical.layout(), &logical, &g, 0, -1.0, &mut from_canonical);
        im2col(packed.as_f32().unwrap(), packed.layout(), &logical, &g, 0, -1.0, &mut from_packed);
        assert_eq!(from_canonical, from_packed);
        // Row (c=0, ky=0, kx=0) at output (0, 0) falls into the top-left padding.
        assert_eq!(from_canonical[0], -1.0);
        // Row (c=0, ky=1, kx=1) is the identity tap.
        let center = 4 * g.out_spatial();
        assert_eq!(&from_canonical[center..center + 3], &[1.0, 2.0, 3.0]);
    }
}
