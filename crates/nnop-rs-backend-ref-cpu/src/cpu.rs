use std::sync::Arc;

use nnop_rs::backend::spec::{
    ExecContext, Executor, FnExecutor, InitContext, KernelError, KernelResult,
};
use nnop_rs::layout::Layout;
use nnop_rs::ops::{self, ConvGeometry, OpKind, Pool2dParams};
use nnop_rs::quant::{activation_quant, weight_zero_points, FixedMultiplier, QuantInfo, Requantizer, Rescale};
use nnop_rs::tensor::{DType, Tensor, TensorData, TensorDesc};

fn reject_channel_last(ctx: &InitContext<'_>) -> KernelResult<()> {
    match ctx.inputs.iter().find(|desc| desc.layout == Layout::ChannelLast) {
        Some(desc) => Err(KernelError::unsupported_layout(
            "reference kernels read channel-first operands",
        )
        .with_layout(desc.layout)),
        None => Ok(()),
    }
}

fn unsupported(dtype: DType) -> KernelError {
    KernelError::unsupported_dtype(format!("no reference kernel for {dtype}")).with_dtype(dtype)
}

fn output_tensor(desc: &TensorDesc, data: TensorData) -> KernelResult<Tensor> {
    Tensor::new(desc.canonical(), data)
}

fn optional_bias<'a, T>(
    ctx: &ExecContext<'a>,
    view: impl Fn(&'a Tensor) -> KernelResult<&'a [T]>,
    len: usize,
) -> KernelResult<Option<&'a [T]>> {
    let Some(&bias) = ctx.inputs.get(2) else {
        return Ok(None);
    };
    let values = view(bias)?;
    if values.len() != len {
        return Err(KernelError::shape_mismatch(format!(
            "bias has {} entries for {len} output channels",
            values.len()
        )));
    }
    Ok(Some(values))
}

/// Quantization state of an integer product kernel, resolved once at initialization.
struct IntProduct {
    input_zp: i32,
    weight_zps: Vec<i32>,
    requant: Requantizer,
}

impl IntProduct {
    fn new(ctx: &InitContext<'_>, out_channels: usize, relu: bool) -> KernelResult<Self> {
        let input = activation_quant(ctx.input(0)?, "input")?;
        let output = activation_quant(ctx.output(0)?, "output")?;
        let weights = &ctx.input(1)?.quant;
        if let Some(bias) = ctx.inputs.get(2) {
            if bias.dtype != DType::I32 {
                return Err(KernelError::unsupported_dtype(format!(
                    "int8 products take an i32 bias, found {}",
                    bias.dtype
                )));
            }
        }
        let requant = Requantizer::for_product(input, weights, output, out_channels, DType::I8)?;
        Ok(IntProduct {
            input_zp: input.zero_point,
            weight_zps: weight_zero_points(weights, out_channels),
            requant: if relu { requant.with_relu() } else { requant },
        })
    }
}

/// Visits `(input_index, weight_index)` for every tap of output element `(n, oc, oy, ox)`
/// that lands inside the input.
fn conv_taps(g: &ConvGeometry, n: usize, oc: usize, oy: usize, ox: usize, mut visit: impl FnMut(usize, usize)) {
    let per_group_in = g.in_channels / g.group;
    let per_group_out = g.out_channels / g.group;
    let first_ic = oc / per_group_out * per_group_in;
    for icg in 0..per_group_in {
        let ic = first_ic + icg;
        for ky in 0..g.kernel_h {
            let Some(iy) = g.input_y(oy, ky) else { continue };
            for kx in 0..g.kernel_w {
                let Some(ix) = g.input_x(ox, kx) else { continue };
                let input_idx = ((n * g.in_channels + ic) * g.in_h + iy) * g.in_w + ix;
                let weight_idx = ((oc * per_group_in + icg) * g.kernel_h + ky) * g.kernel_w + kx;
                visit(input_idx, weight_idx);
            }
        }
    }
}

struct DirectConv {
    geometry: ConvGeometry,
    relu: bool,
    int: Option<IntProduct>,
}

impl DirectConv {
    fn run_f32(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<f32>> {
        let g = &self.geometry;
        let input = ctx.input(0)?.f32_values()?;
        let weights = ctx.input(1)?.f32_values()?;
        let bias = optional_bias(ctx, Tensor::f32_values, g.out_channels)?;
        let mut out = Vec::with_capacity(g.batch * g.out_channels * g.out_spatial());
        for n in 0..g.batch {
            for oc in 0..g.out_channels {
                for oy in 0..g.out_h {
                    for ox in 0..g.out_w {
                        let mut acc = bias.map_or(0.0, |b| b[oc]);
                        conv_taps(g, n, oc, oy, ox, |i, w| acc += input[i] * weights[w]);
                        out.push(if self.relu { acc.max(0.0) } else { acc });
                    }
                }
            }
        }
        Ok(out)
    }

    fn run_i8(&self, int: &IntProduct, ctx: &ExecContext<'_>) -> KernelResult<Vec<i8>> {
        let g = &self.geometry;
        let input = ctx.input(0)?.i8_values()?;
        let weights = ctx.input(1)?.i8_values()?;
        let bias = optional_bias(ctx, Tensor::i32_values, g.out_channels)?;
        let mut out = Vec::with_capacity(g.batch * g.out_channels * g.out_spatial());
        for n in 0..g.batch {
            for oc in 0..g.out_channels {
                let weight_zp = int.weight_zps[oc];
                for oy in 0..g.out_h {
                    for ox in 0..g.out_w {
                        let mut acc = bias.map_or(0, |b| b[oc]);
                        conv_taps(g, n, oc, oy, ox, |i, w| {
                            let tap = (input[i] as i32 - int.input_zp) * (weights[w] as i32 - weight_zp);
                            acc = acc.wrapping_add(tap);
                        });
                        out.push(int.requant.apply(acc, oc) as i8);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Executor for DirectConv {
    fn name(&self) -> &str {
        "direct_conv"
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let data = match &self.int {
            None => TensorData::F32(self.run_f32(ctx)?),
            Some(int) => TensorData::I8(self.run_i8(int, ctx)?),
        };
        Ok(vec![output_tensor(ctx.output(0)?, data)?])
    }
}

pub(crate) fn init_conv(ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    reject_channel_last(ctx)?;
    let input = ctx.input(0)?;
    let weight = ctx.input(1)?;
    let params = ctx.params.conv2d()?;
    let geometry = match ctx.op {
        OpKind::DepthwiseConv2d => ConvGeometry::depthwise(input, weight, params)?,
        _ => ConvGeometry::new(input, weight, params)?,
    };
    ops::check_output(ctx.op, ctx.output(0)?, &geometry.output_dims())?;
    let relu = ctx.op == OpKind::Conv2dRelu;
    let int = match input.dtype {
        DType::F32 => None,
        DType::I8 => Some(IntProduct::new(ctx, geometry.out_channels, relu)?),
        other => return Err(unsupported(other)),
    };
    Ok(Arc::new(DirectConv { geometry, relu, int }))
}

struct DirectFc {
    batch: usize,
    inner: usize,
    out_features: usize,
    int: Option<IntProduct>,
}

impl Executor for DirectFc {
    fn name(&self) -> &str {
        "direct_fc"
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let (inner, out_features) = (self.inner, self.out_features);
        let data = match &self.int {
            None => {
                let input = ctx.input(0)?.f32_values()?;
                let weights = ctx.input(1)?.f32_values()?;
                let bias = optional_bias(ctx, Tensor::f32_values, out_features)?;
                let mut out = Vec::with_capacity(self.batch * out_features);
                for b in 0..self.batch {
                    let row = &input[b * inner..(b + 1) * inner];
                    for o in 0..out_features {
                        let filter = &weights[o * inner..(o + 1) * inner];
                        let dot: f32 = row.iter().zip(filter).map(|(x, w)| x * w).sum();
                        out.push(dot + bias.map_or(0.0, |bias| bias[o]));
                    }
                }
                TensorData::F32(out)
            }
            Some(int) => {
                let input = ctx.input(0)?.i8_values()?;
                let weights = ctx.input(1)?.i8_values()?;
                let bias = optional_bias(ctx, Tensor::i32_values, out_features)?;
                let mut out = Vec::with_capacity(self.batch * out_features);
                for b in 0..self.batch {
                    let row = &input[b * inner..(b + 1) * inner];
                    for o in 0..out_features {
                        let filter = &weights[o * inner..(o + 1) * inner];
                        let weight_zp = int.weight_zps[o];
                        let acc = row.iter().zip(filter).fold(bias.map_or(0, |bias| bias[o]), |acc, (&x, &w)| {
                            acc.wrapping_add((x as i32 - int.input_zp) * (w as i32 - weight_zp))
                        });
                        out.push(int.requant.apply(acc, o) as i8);
                    }
                }
                TensorData::I8(out)
            }
        };
        Ok(vec![output_tensor(ctx.output(0)?, data)?])
    }
}

pub(crate) fn init_fc(ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    reject_channel_last(ctx)?;
    let (batch, inner, out_features) = ops::fc_dims(ctx.input(0)?, ctx.input(1)?)?;
    ops::check_output(ctx.op, ctx.output(0)?, &[batch, out_features])?;
    let int = match ctx.input(0)?.dtype {
        DType::F32 => None,
        DType::I8 => Some(IntProduct::new(ctx, out_features, false)?),
        other => return Err(unsupported(other)),
    };
    Ok(Arc::new(DirectFc {
        batch,
        inner,
        out_features,
        int,
    }))
}

fn relu_f32(ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
    let out = ctx.input(0)?.f32_values()?.iter().map(|v| v.max(0.0)).collect();
    Ok(vec![output_tensor(ctx.output(0)?, TensorData::F32(out))?])
}

/// Int8 ReLU: `max(q - zp_in, 0)` re-expressed in the output record.
struct QuantizedRelu {
    rescale: Rescale,
}

impl Executor for QuantizedRelu {
    fn name(&self) -> &str {
        "relu_rescaled"
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let out = ctx
            .input(0)?
            .i8_values()?
            .iter()
            .map(|&q| self.rescale.apply(q as i32) as i8)
            .collect();
        Ok(vec![output_tensor(ctx.output(0)?, TensorData::I8(out))?])
    }
}

/// Rescaling from the int8 input record to the declared output record.
fn activation_rescale(ctx: &InitContext<'_>) -> KernelResult<Rescale> {
    let input = activation_quant(ctx.input(0)?, "input")?;
    let output = activation_quant(ctx.output(0)?, "output")?;
    Rescale::new(input, output, DType::I8)
}

pub(crate) fn init_relu(ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    reject_channel_last(ctx)?;
    let input = ctx.input(0)?;
    ops::check_output(ctx.op, ctx.output(0)?, &input.logical_dims())?;
    match input.dtype {
        DType::F32 => Ok(Arc::new(FnExecutor::new("relu", relu_f32))),
        DType::I8 => Ok(Arc::new(QuantizedRelu {
            rescale: activation_rescale(ctx)?.with_relu(),
        })),
        other => Err(unsupported(other)),
    }
}

/// Left shift applied to both addends before rescaling so the sum keeps 20 fractional bits.
const ADD_LEFT_SHIFT: i32 = 20;

struct AddOperand {
    zero_point: i32,
    scale: FixedMultiplier,
}

impl AddOperand {
    fn new(info: &QuantInfo, twice_max: f64) -> Self {
        AddOperand {
            zero_point: info.zero_point,
            scale: FixedMultiplier::from_real(info.scale as f64 / twice_max),
        }
    }

    #[inline]
    fn rescale(&self, q: i8) -> i32 {
        self.scale.apply((q as i32 - self.zero_point) << ADD_LEFT_SHIFT)
    }
}

struct QuantizedAdd {
    lhs: AddOperand,
    rhs: AddOperand,
    requant: Requantizer,
}

impl Executor for QuantizedAdd {
    fn name(&self) -> &str {
        "add_rescaled"
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let lhs = ctx.input(0)?.i8_values()?;
        let rhs = ctx.input(1)?.i8_values()?;
        let out = lhs
            .iter()
            .zip(rhs)
            .map(|(&a, &b)| self.requant.apply(self.lhs.rescale(a) + self.rhs.rescale(b), 0) as i8)
            .collect();
        Ok(vec![output_tensor(ctx.output(0)?, TensorData::I8(out))?])
    }
}

fn add_f32(ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
    let lhs = ctx.input(0)?.f32_values()?;
    let rhs = ctx.input(1)?.f32_values()?;
    let out = lhs.iter().zip(rhs).map(|(a, b)| a + b).collect();
    Ok(vec![output_tensor(ctx.output(0)?, TensorData::F32(out))?])
}

pub(crate) fn init_add(ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    reject_channel_last(ctx)?;
    let expected = ops::infer_outputs(ctx.op, ctx.params, ctx.inputs)?;
    ops::check_output(ctx.op, ctx.output(0)?, expected[0].shape.dims())?;
    match ctx.input(0)?.dtype {
        DType::F32 => Ok(Arc::new(FnExecutor::new("add", add_f32))),
        DType::I8 => {
            let lhs = activation_quant(ctx.input(0)?, "lhs")?;
            let rhs = activation_quant(ctx.input(1)?, "rhs")?;
            let output = activation_quant(ctx.output(0)?, "output")?;
            let twice_max = 2.0 * lhs.scale.max(rhs.scale) as f64;
            let out_scale = twice_max / ((1i64 << ADD_LEFT_SHIFT) as f64 * output.scale as f64);
            let requant = Requantizer::new(vec![FixedMultiplier::from_real(out_scale)], output, DType::I8)?;
            Ok(Arc::new(QuantizedAdd {
                lhs: AddOperand::new(lhs, twice_max),
                rhs: AddOperand::new(rhs, twice_max),
                requant,
            }))
        }
        other => Err(unsupported(other)),
    }
}

struct DirectMaxPool {
    params: Pool2dParams,
    input_dims: [usize; 4],
    output_dims: [usize; 4],
    /// Int8 output record differs from the input's only through this.
    rescale: Option<Rescale>,
}

impl DirectMaxPool {
    fn pool<T: Copy + PartialOrd>(&self, input: &[T], empty: T) -> Vec<T> {
        let [_, _, h, w] = self.input_dims;
        let [n, c, oh, ow] = self.output_dims;
        let [pt, _, pl, _] = self.params.padding;
        let mut out = Vec::with_capacity(n * c * oh * ow);
        for plane in 0..n * c {
            let base = plane * h * w;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best: Option<T> = None;
                    for ky in 0..self.params.window[0] {
                        let Some(iy) = (oy * self.params.stride[0] + ky).checked_sub(pt).filter(|&y| y < h) else {
                            continue;
                        };
                        for kx in 0..self.params.window[1] {
                            let Some(ix) = (ox * self.params.stride[1] + kx).checked_sub(pl).filter(|&x| x < w) else {
                                continue;
                            };
                            let v = input[base + iy * w + ix];
                            if best.map_or(true, |b| v > b) {
                                best = Some(v);
                            }
                        }
                    }
                    out.push(best.unwrap_or(empty));
                }
            }
        }
        out
    }
}

impl Executor for DirectMaxPool {
    fn name(&self) -> &str {
        "direct_max_pool"
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let input = ctx.input(0)?;
        let data = match input.data() {
            TensorData::F32(values) => TensorData::F32(self.pool(values, 0.0)),
            TensorData::I8(values) => {
                let rescale = self
                    .rescale
                    .as_ref()
                    .ok_or_else(|| KernelError::failure("int8 max pool bound without output record"))?;
                // An all-padding window yields real zero.
                let empty = rescale.input_zero(i8::MIN as i32, i8::MAX as i32) as i8;
                let pooled = self.pool(values, empty);
                TensorData::I8(pooled.into_iter().map(|q| rescale.apply(q as i32) as i8).collect())
            }
            other => return Err(unsupported(other.dtype())),
        };
        Ok(vec![output_tensor(ctx.output(0)?, data)?])
    }
}

pub(crate) fn init_max_pool(ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    reject_channel_last(ctx)?;
    let input = ctx.input(0)?;
    if !matches!(input.dtype, DType::F32 | DType::I8) {
        return Err(unsupported(input.dtype));
    }
    let params = *ctx.params.pool2d()?;
    let logical = input.logical_dims();
    let output_dims = params.output_dims(&logical)?;
    ops::check_output(ctx.op, ctx.output(0)?, &output_dims)?;
    let input_dims = [logical[0], logical[1], logical[2], logical[3]];
    let rescale = match input.dtype {
        DType::I8 => Some(activation_rescale(ctx)?),
        _ => None,
    };
    Ok(Arc::new(DirectMaxPool {
        params,
        input_dims,
        output_dims,
        rescale,
    }))
}
