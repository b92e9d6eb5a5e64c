//! Fully connected layers and the layout-agnostic ReLU.

use std::sync::Arc;

use nnop_rs::backend::spec::{ExecContext, Executor, InitContext, KernelError, KernelResult, LayoutReq};
use nnop_rs::ops;
use nnop_rs::quant::{activation_quant, Rescale};
use nnop_rs::tensor::{DType, Tensor, TensorData};

use crate::gemm;
use crate::prepared::{reject_channel_last, PreparedProduct};

struct VectorFc {
    batch: usize,
    inner: usize,
    out_features: usize,
    product: PreparedProduct,
}

impl Executor for VectorFc {
    fn name(&self) -> &str {
        match self.product {
            PreparedProduct::F32 { .. } => "fc_gemm",
            PreparedProduct::I8 { .. } => "fc_gemv_folded",
        }
    }

    fn input_layout(&self, slot: usize) -> LayoutReq {
        if slot == 0 {
            LayoutReq::Canonical
        } else {
            LayoutReq::Any
        }
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let (batch, inner, out_features) = (self.batch, self.inner, self.out_features);
        let input = ctx.input(0)?;
        let data = match &self.product {
            PreparedProduct::F32 { weights, bias, .. } => {
                let mut out = vec![0.0f32; batch * out_features];
                gemm::gemm_f32_nt(input.f32_values()?, weights, &mut out, batch, inner, out_features);
                for row in out.chunks_exact_mut(out_features.max(1)) {
                    for (value, b) in row.iter_mut().zip(bias) {
                        *value += b;
                    }
                }
                TensorData::F32(out)
            }
            PreparedProduct::I8 {
                weights,
                bias,
                requant,
                ..
            } => {
                let values = input.i8_values()?;
                let mut out = Vec::with_capacity(batch * out_features);
                for b in 0..batch {
                    let row = &values[b * inner..(b + 1) * inner];
                    for (o, filter) in weights.chunks_exact(inner.max(1)).enumerate().take(out_features) {
                        let acc = bias[o].wrapping_add(gemm::dot_i8(row, filter));
                        out.push(requant.apply(acc, o) as i8);
                    }
                }
                TensorData::I8(out)
            }
        };
        Ok(vec![Tensor::new(ctx.output(0)?.canonical(), data)?])
    }
}

pub fn init_fc(ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    reject_channel_last(ctx)?;
    let (batch, inner, out_features) = ops::fc_dims(ctx.input(0)?, ctx.input(1)?)?;
    ops::check_output(ctx.op, ctx.output(0)?, &[batch, out_features])?;
    let product = PreparedProduct::new(ctx, out_features, inner, false)?;
    Ok(Arc::new(VectorFc {
        batch,
        inner,
        out_features,
        product,
    }))
}

/// ReLU over whatever layout the producer left behind; packed tensors stay packed.
struct AnyLayoutRelu {
    /// Int8 only: `max(q - zp_in, 0)` re-expressed in the output record.
    rescale: Option<Rescale>,
}

impl Executor for AnyLayoutRelu {
    fn name(&self) -> &str {
        "relu_any_layout"
    }

    fn input_layout(&self, _slot: usize) -> LayoutReq {
        LayoutReq::Any
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        let input = ctx.input(0)?;
        let mut desc = input.desc().clone();
        desc.quant = ctx.output(0)?.quant.clone();
        let data = match (input.data(), &self.rescale) {
            (TensorData::F32(values), None) => TensorData::F32(values.iter().map(|v| v.max(0.0)).collect()),
            (TensorData::I8(values), Some(rescale)) => {
                TensorData::I8(values.iter().map(|&q| rescale.apply(q as i32) as i8).collect())
            }
            (other, _) => {
                return Err(KernelError::failure(format!(
                    "relu bound for a different dtype than {}",
                    other.dtype()
                )))
            }
        };
        Ok(vec![Tensor::new(desc, data)?])
    }
}

pub fn init_relu(ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    reject_channel_last(ctx)?;
    let input = ctx.input(0)?;
    ops::check_output(ctx.op, ctx.output(0)?, &input.logical_dims())?;
    let rescale = match input.dtype {
        DType::F32 => None,
        DType::I8 => {
            let in_q = activation_quant(input, "input")?;
            let out_q = activation_quant(ctx.output(0)?, "output")?;
            Some(Rescale::new(in_q, out_q, DType::I8)?.with_relu())
        }
        other => {
            return Err(KernelError::unsupported_dtype(format!("no vector relu for {other}")).with_dtype(other))
        }
    };
    Ok(Arc::new(AnyLayoutRelu { rescale }))
}
