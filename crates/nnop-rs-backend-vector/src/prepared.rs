//! State shared by every product kernel in this crate: where activations live and the
//! weights an initializer copied out of the graph.

use nnop_rs::backend::spec::{InitContext, KernelError, KernelResult, LayoutReq};
use nnop_rs::layout::{self, Layout, RemainderPolicy};
use nnop_rs::quant::{activation_quant, fold_input_zero_point, Requantizer};
use nnop_rs::tensor::{DType, Tensor, TensorDesc};

/// Remainder policy of every packed tensor this crate produces.
pub const REMAINDER: RemainderPolicy = RemainderPolicy::ZeroPad;

pub(crate) fn reject_channel_last(ctx: &InitContext<'_>) -> KernelResult<()> {
    match ctx.inputs.iter().find(|desc| desc.layout == Layout::ChannelLast) {
        Some(desc) => Err(KernelError::unsupported_layout(
            "vector kernels read channel-first or packed activations",
        )
        .with_layout(desc.layout)),
        None => Ok(()),
    }
}

/// Layout of the activation an executor reads from slot 0 and writes to its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activations {
    Canonical,
    Packed {
        factor: usize,
        /// Slot 0 is a network input: read its canonical buffer instead of repacking it.
        canonical_input: bool,
    },
}

impl Activations {
    pub(crate) fn packed(factor: usize, ctx: &InitContext<'_>) -> Self {
        Activations::Packed {
            factor,
            canonical_input: ctx.reads_graph_input(0),
        }
    }

    pub(crate) fn request(self, slot: usize) -> LayoutReq {
        if slot > 0 {
            // Weights and bias are read from prepared copies.
            return LayoutReq::Any;
        }
        match self {
            Activations::Packed {
                factor,
                canonical_input: false,
            } => LayoutReq::Packed {
                factor,
                remainder: REMAINDER,
            },
            _ => LayoutReq::Canonical,
        }
    }

    /// Descriptor of the tensor this executor returns for the declared output.
    pub(crate) fn output_desc(self, declared: &TensorDesc) -> KernelResult<TensorDesc> {
        match self {
            Activations::Canonical => Ok(declared.canonical()),
            Activations::Packed { factor, .. } => layout::packed_desc(&declared.canonical(), factor, REMAINDER),
        }
    }
}

/// Weights and bias of one product kernel (`rows` outputs of `inner` taps each), copied out
/// of the graph constants at initialization.
#[derive(Debug, Clone)]
pub(crate) enum PreparedProduct {
    F32 {
        weights: Vec<f32>,
        bias: Vec<f32>,
        relu: bool,
    },
    I8 {
        weights: Vec<i8>,
        /// Bias with the input zero-point folded in.
        bias: Vec<i32>,
        /// Value that stands in for taps falling into padding.
        input_zero_point: i8,
        requant: Requantizer,
    },
}

fn bias_constant<'a>(ctx: &InitContext<'a>) -> KernelResult<Option<&'a Tensor>> {
    if ctx.inputs.len() > 2 {
        ctx.constant(2).map(Some)
    } else {
        Ok(None)
    }
}

fn check_len(what: &str, found: usize, expected: usize) -> KernelResult<()> {
    if found != expected {
        return Err(KernelError::shape_mismatch(format!(
            "{what} holds {found} values, kernel expects {expected}"
        )));
    }
    Ok(())
}

impl PreparedProduct {
    /// Declines with `UNSUPPORTED_LAYOUT` when weights or bias are not constants, and with
    /// `UNSUPPORTED_DTYPE` for int8 weights with a nonzero zero-point.
    pub(crate) fn new(ctx: &InitContext<'_>, rows: usize, inner: usize, relu: bool) -> KernelResult<Self> {
        let weight = ctx.constant(1)?;
        let bias = bias_constant(ctx)?;
        match ctx.input(0)?.dtype {
            DType::F32 => {
                let weights = weight.f32_values()?.to_vec();
                check_len("weight", weights.len(), rows * inner)?;
                let bias = match bias {
                    Some(bias) => bias.f32_values()?.to_vec(),
                    None => vec![0.0; rows],
                };
                check_len("bias", bias.len(), rows)?;
                Ok(PreparedProduct::F32 { weights, bias, relu })
            }
            DType::I8 => {
                if !weight.quant().zero_points_are_zero() {
                    return Err(KernelError::unsupported_dtype(
                        "folded int8 kernels need symmetric weights",
                    )
                    .with_dtype(DType::I8));
                }
                let weights = weight.i8_values()?.to_vec();
                check_len("weight", weights.len(), rows * inner)?;
                let bias = match bias {
                    Some(bias) => bias.i32_values()?.to_vec(),
                    None => vec![0; rows],
                };
                check_len("bias", bias.len(), rows)?;
                let input = activation_quant(ctx.input(0)?, "input")?;
                let output = activation_quant(ctx.output(0)?, "output")?;
                let requant = Requantizer::for_product(input, weight.quant(), output, rows, DType::I8)?;
                let input_zero_point = i8::try_from(input.zero_point).map_err(|_| {
                    KernelError::unsupported_dtype(format!(
                        "input zero-point {} is outside the int8 range",
                        input.zero_point
                    ))
                })?;
                Ok(PreparedProduct::I8 {
                    bias: fold_input_zero_point(&bias, &weights, inner, input.zero_point),
                    weights,
                    input_zero_point,
                    requant: if relu { requant.with_relu() } else { requant },
                })
            }
            other => Err(KernelError::unsupported_dtype(format!("no vector kernel for {other}")).with_dtype(other)),
        }
    }
}
