//! Seeded operands and single-operator cases shared by the conformance suite.

use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use nnop_rs::backend::registry::KernelRegistry;
use nnop_rs::ops::{Conv2dParams, OpKind, OpParams, Pool2dParams};
use nnop_rs::quant::{dequantize_i8, QuantInfo, Quantization};
use nnop_rs::session::{BoundKernel, Session, SessionOptions};
use nnop_rs::tensor::{DType, Shape, Tensor, TensorDesc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_f32(rng: &mut StdRng, dims: &[usize]) -> Result<Tensor> {
    let count: usize = dims.iter().product();
    let values = (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Ok(Tensor::from_f32(Shape::new(dims), values)?)
}

/// Int8 tensor with uniformly random codes over the full range.
pub fn random_i8(rng: &mut StdRng, dims: &[usize], quant: Quantization) -> Result<Tensor> {
    let count: usize = dims.iter().product();
    let values = (0..count).map(|_| rng.gen_range(i8::MIN..=i8::MAX)).collect();
    Ok(Tensor::from_i8(Shape::new(dims), values, quant)?)
}

pub fn random_bias(rng: &mut StdRng, channels: usize) -> Result<Tensor> {
    let values = (0..channels).map(|_| rng.gen_range(-600..=600)).collect();
    Ok(Tensor::from_i32([channels], values)?)
}

/// Symmetric per-channel weight records with slightly different scales per channel.
pub fn per_channel_weights(channels: usize) -> Quantization {
    Quantization::PerChannel(
        (0..channels)
            .map(|c| QuantInfo::new(0.004 + 0.0005 * c as f32, 0))
            .collect(),
    )
}

pub fn activation(scale: f32, zero_point: i32) -> Quantization {
    Quantization::PerTensor(QuantInfo::new(scale, zero_point))
}

/// One operator applied to a graph input plus constant operands.
#[derive(Debug, Clone)]
pub struct OpCase {
    pub op: OpKind,
    pub params: OpParams,
    pub input: Tensor,
    /// Operands for slots `1..`, declared as graph constants.
    pub operands: Vec<Tensor>,
    pub output: TensorDesc,
}

impl OpCase {
    /// Builds a case whose output descriptor comes from shape inference.
    pub fn new(op: OpKind, params: OpParams, input: Tensor, operands: Vec<Tensor>) -> Result<Self> {
        let mut descs = vec![input.desc().clone()];
        descs.extend(operands.iter().map(|t| t.desc().clone()));
        let output = nnop_rs::ops::infer_outputs(op, &params, &descs)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{op} inferred no outputs"))?;
        Ok(OpCase {
            op,
            params,
            input,
            operands,
            output,
        })
    }

    pub fn dtype(&self) -> DType {
        self.input.dtype()
    }

    /// The same computation over real values: int8 operands are dequantized and an `i32`
    /// bias is scaled by `input_scale * weight_scale[oc]`.
    pub fn float_twin(&self) -> Result<OpCase> {
        if self.dtype() == DType::F32 {
            return Ok(self.clone());
        }
        let input_scale = self
            .input
            .quant()
            .per_tensor()
            .map(|q| q.scale)
            .ok_or_else(|| anyhow!("int8 case input has no per-tensor record"))?;
        let mut operands = Vec::with_capacity(self.operands.len());
        for (slot, operand) in self.operands.iter().enumerate() {
            let real = match operand.dtype() {
                DType::I8 => dequantize(operand)?,
                DType::I32 => {
                    let weights = self.operands.first().map(|w| w.quant().clone()).unwrap_or_default();
                    let broadcast = weights.count() <= 1;
                    let values = operand
                        .i32_values()?
                        .iter()
                        .enumerate()
                        .map(|(oc, &b)| {
                            let weight_scale = weights
                                .get(if broadcast { 0 } else { oc })
                                .map_or(1.0, |q| q.scale);
                            b as f32 * input_scale * weight_scale
                        })
                        .collect();
                    Tensor::from_f32(operand.shape().clone(), values)?
                }
                other => anyhow::bail!("operand {} has unexpected dtype {other}", slot + 1),
            };
            operands.push(real);
        }
        OpCase::new(self.op, self.params.clone(), dequantize(&self.input)?, operands)
    }

    /// Picks the int8 output record from the range of the float twin's result, which
    /// generally differs from the input's record even for shape-preserving ops.
    pub fn calibrate(mut self, reference: &Arc<KernelRegistry>) -> Result<Self> {
        if self.dtype() != DType::I8 {
            return Ok(self);
        }
        let expected = run_graph(reference, &self.float_twin()?)?.0;
        let values = expected.f32_values()?;
        let (min, max) = values
            .iter()
            .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let quant = Quantization::PerTensor(QuantInfo::from_min_max(min, max, DType::I8)?);
        self.output = self.output.with_quant(quant);
        Ok(self)
    }

    /// Replaces the int8 output record, for cases that must not share the input's.
    pub fn with_output_quant(mut self, info: QuantInfo) -> Self {
        self.output = self.output.with_quant(Quantization::PerTensor(info));
        self
    }

    /// Largest distance between the case's int8 result and its float twin, in output steps.
    pub fn steps_from_float(&self, registry: &Arc<KernelRegistry>, reference: &Arc<KernelRegistry>) -> Result<f32> {
        let (actual, _) = run_graph(registry, self)?;
        let (float, _) = run_graph(reference, &self.float_twin()?)?;
        let step = self
            .output
            .quant
            .per_tensor()
            .map(|q| q.scale)
            .ok_or_else(|| anyhow!("int8 output has no per-tensor record"))?;
        Ok(max_abs_diff(&dequantize(&actual)?, &float)? / step)
    }
}

pub fn dequantize(tensor: &Tensor) -> Result<Tensor> {
    let values = dequantize_i8(tensor.i8_values()?, tensor.shape().dims(), tensor.quant())?;
    Ok(Tensor::from_f32(tensor.shape().clone(), values)?)
}

/// Builds a one-operator graph, runs it once, and returns the output and the bound kernel.
pub fn run_graph(registry: &Arc<KernelRegistry>, case: &OpCase) -> Result<(Tensor, BoundKernel)> {
    let mut session = Session::new(Arc::clone(registry), SessionOptions::default())?;
    session.set_input_number(1)?;
    session.set_output_number(1)?;
    let mut inputs = vec![session.set_input(0, case.input.desc().clone())?];
    for operand in &case.operands {
        inputs.push(session.add_constant(operand.clone())?);
    }
    let outputs = session.declare(case.op, case.params.clone(), &inputs, vec![case.output.clone()])?;
    session.set_output(0, outputs[0])?;
    session
        .setup()
        .with_context(|| format!("setting up {} over {:?}", case.op, registry.backend_names()))?;
    session.update_input(0, case.input.clone())?;
    session.run()?;
    let bound = session
        .bound_kernels()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no operator was bound"))?;
    Ok((session.output(0)?, bound))
}

/// Executes the case immediately through a layer-mode session.
pub fn run_layer(registry: &Arc<KernelRegistry>, case: &OpCase) -> Result<(Tensor, BoundKernel)> {
    let mut session = Session::new(Arc::clone(registry), SessionOptions::layer())?;
    let mut inputs = vec![&case.input];
    inputs.extend(case.operands.iter());
    let output = session
        .run_operator(case.op, &case.params, &inputs, Some(std::slice::from_ref(&case.output)))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("{} produced no output", case.op))?;
    let bound = session
        .last_layer_kernel()
        .cloned()
        .ok_or_else(|| anyhow!("layer session recorded no kernel"))?;
    Ok((output, bound))
}

pub fn conv_case(
    rng: &mut StdRng,
    dtype: DType,
    op: OpKind,
    input_dims: [usize; 4],
    out_channels: usize,
    kernel: usize,
    params: Conv2dParams,
) -> Result<OpCase> {
    let per_group = match op {
        OpKind::DepthwiseConv2d => 1,
        _ => input_dims[1] / params.group,
    };
    let weight_dims = [out_channels, per_group, kernel, kernel];
    let (input, weights, bias) = match dtype {
        DType::F32 => (
            random_f32(rng, &input_dims)?,
            random_f32(rng, &weight_dims)?,
            random_f32(rng, &[out_channels])?,
        ),
        DType::I8 => (
            random_i8(rng, &input_dims, activation(0.05, 3))?,
            random_i8(rng, &weight_dims, per_channel_weights(out_channels))?,
            random_bias(rng, out_channels)?,
        ),
        other => anyhow::bail!("no conformance cases for {other}"),
    };
    OpCase::new(op, OpParams::Conv2d(params), input, vec![weights, bias])
}

pub fn fc_case(rng: &mut StdRng, dtype: DType, batch: usize, inner: usize, out_features: usize) -> Result<OpCase> {
    let (input, weights, bias) = match dtype {
        DType::F32 => (
            random_f32(rng, &[batch, inner])?,
            random_f32(rng, &[out_features, inner])?,
            random_f32(rng, &[out_features])?,
        ),
        DType::I8 => (
            random_i8(rng, &[batch, inner], activation(0.04, -5))?,
            random_i8(rng, &[out_features, inner], per_channel_weights(out_features))?,
            random_bias(rng, out_features)?,
        ),
        other => anyhow::bail!("no conformance cases for {other}"),
    };
    OpCase::new(OpKind::FullyConnected, OpParams::None, input, vec![weights, bias])
}

pub fn unary_case(rng: &mut StdRng, dtype: DType, op: OpKind, params: OpParams, dims: &[usize]) -> Result<OpCase> {
    let input = match dtype {
        DType::F32 => random_f32(rng, dims)?,
        DType::I8 => random_i8(rng, dims, activation(0.03, -10))?,
        other => anyhow::bail!("no conformance cases for {other}"),
    };
    OpCase::new(op, params, input, Vec::new())
}

pub fn add_case(rng: &mut StdRng, dtype: DType, dims: &[usize]) -> Result<OpCase> {
    let (lhs, rhs) = match dtype {
        DType::F32 => (random_f32(rng, dims)?, random_f32(rng, dims)?),
        DType::I8 => (
            random_i8(rng, dims, activation(0.05, 2))?,
            random_i8(rng, dims, activation(0.02, -4))?,
        ),
        other => anyhow::bail!("no conformance cases for {other}"),
    };
    OpCase::new(OpKind::Add, OpParams::None, lhs, vec![rhs])
}

/// A small representative case for any advertised pair.
pub fn default_case(rng: &mut StdRng, op: OpKind, dtype: DType) -> Result<OpCase> {
    match op {
        OpKind::Conv2d | OpKind::Conv2dRelu => conv_case(
            rng,
            dtype,
            op,
            [1, 8, 5, 5],
            8,
            3,
            Conv2dParams::default().with_padding(1),
        ),
        OpKind::DepthwiseConv2d => conv_case(
            rng,
            dtype,
            op,
            [1, 8, 6, 6],
            8,
            3,
            Conv2dParams::default().with_padding(1),
        ),
        OpKind::FullyConnected => fc_case(rng, dtype, 2, 12, 5),
        OpKind::Relu => unary_case(rng, dtype, op, OpParams::None, &[1, 4, 3, 3]),
        OpKind::MaxPool2d => unary_case(
            rng,
            dtype,
            op,
            OpParams::Pool2d(Pool2dParams::square(2, 2)),
            &[1, 4, 6, 6],
        ),
        OpKind::Add => add_case(rng, dtype, &[1, 4, 3, 3]),
    }
}

/// Largest absolute difference between two tensors of the same dtype and logical shape.
pub fn max_abs_diff(actual: &Tensor, expected: &Tensor) -> Result<f32> {
    ensure!(
        actual.dtype() == expected.dtype(),
        "dtype {} vs {}",
        actual.dtype(),
        expected.dtype()
    );
    ensure!(
        actual.desc().logical_dims() == expected.desc().logical_dims(),
        "shape {:?} vs {:?}",
        actual.desc().logical_dims().as_slice(),
        expected.desc().logical_dims().as_slice()
    );
    let diff = match actual.dtype() {
        DType::F32 => actual
            .f32_values()?
            .iter()
            .zip(expected.f32_values()?)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max),
        DType::I8 => actual
            .i8_values()?
            .iter()
            .zip(expected.i8_values()?)
            .map(|(&a, &b)| (a as i32 - b as i32).abs() as f32)
            .fold(0.0f32, f32::max),
        other => anyhow::bail!("cannot compare {other} tensors"),
    };
    Ok(diff)
}
