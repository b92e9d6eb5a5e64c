//! Operator kinds, their parameter blocks, and output shape inference.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::spec::{KernelError, KernelResult};
use crate::tensor::TensorDesc;

pub mod conv;
pub mod pool;

pub use conv::{Conv2dParams, ConvGeometry};
pub use pool::Pool2dParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Conv2d,
    /// Convolution with a fused ReLU on the output.
    Conv2dRelu,
    DepthwiseConv2d,
    FullyConnected,
    Relu,
    Add,
    MaxPool2d,
}

impl OpKind {
    pub const ALL: [OpKind; 7] = [
        OpKind::Conv2d,
        OpKind::Conv2dRelu,
        OpKind::DepthwiseConv2d,
        OpKind::FullyConnected,
        OpKind::Relu,
        OpKind::Add,
        OpKind::MaxPool2d,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Conv2d => "conv2d",
            OpKind::Conv2dRelu => "conv2d_relu",
            OpKind::DepthwiseConv2d => "depthwise_conv2d",
            OpKind::FullyConnected => "fully_connected",
            OpKind::Relu => "relu",
            OpKind::Add => "add",
            OpKind::MaxPool2d => "max_pool2d",
        }
    }

    /// Accepted input counts (inclusive) and the fixed output count.
    pub fn arity(self) -> (usize, usize, usize) {
        match self {
            OpKind::Conv2d | OpKind::Conv2dRelu | OpKind::DepthwiseConv2d | OpKind::FullyConnected => {
                (2, 3, 1)
            }
            OpKind::Relu | OpKind::MaxPool2d => (1, 1, 1),
            OpKind::Add => (2, 2, 1),
        }
    }

    /// Operators whose second and third inputs are weights and bias.
    pub fn has_weights(self) -> bool {
        matches!(
            self,
            OpKind::Conv2d | OpKind::Conv2dRelu | OpKind::DepthwiseConv2d | OpKind::FullyConnected
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter block attached to an operator node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpParams {
    #[default]
    None,
    Conv2d(Conv2dParams),
    Pool2d(Pool2dParams),
}

impl OpParams {
    pub fn conv2d(&self) -> KernelResult<&Conv2dParams> {
        match self {
            OpParams::Conv2d(params) => Ok(params),
            other => Err(KernelError::failure(format!(
                "expected convolution parameters, found {other:?}"
            ))),
        }
    }

    pub fn pool2d(&self) -> KernelResult<&Pool2dParams> {
        match self {
            OpParams::Pool2d(params) => Ok(params),
            other => Err(KernelError::failure(format!(
                "expected pooling parameters, found {other:?}"
            ))),
        }
    }

    /// Whether this block is the right shape for `op`.
    pub fn matches(&self, op: OpKind) -> bool {
        match op {
            OpKind::Conv2d | OpKind::Conv2dRelu | OpKind::DepthwiseConv2d => {
                matches!(self, OpParams::Conv2d(_))
            }
            OpKind::MaxPool2d => matches!(self, OpParams::Pool2d(_)),
            OpKind::FullyConnected | OpKind::Relu | OpKind::Add => matches!(self, OpParams::None),
        }
    }
}

/// Output descriptors for `op` applied to `inputs`.
///
/// Outputs are canonical. Integer outputs of rescaling operators carry no quantization records;
/// the caller decides the output scale. Shape-preserving operators inherit the input records.
pub fn infer_outputs(op: OpKind, params: &OpParams, inputs: &[TensorDesc]) -> KernelResult<Vec<TensorDesc>> {
    let (min_inputs, max_inputs, _) = op.arity();
    if inputs.len() < min_inputs || inputs.len() > max_inputs {
        return Err(KernelError::failure(format!(
            "{op} takes {min_inputs}..={max_inputs} inputs, got {}",
            inputs.len()
        ))
        .with_op(op));
    }
    let input = inputs[0].canonical();
    let out = match op {
        OpKind::Conv2d | OpKind::Conv2dRelu => {
            let geometry = ConvGeometry::new(&input, &inputs[1], params.conv2d()?)?;
            TensorDesc::new(input.dtype, geometry.output_dims())
        }
        OpKind::DepthwiseConv2d => {
            let geometry = ConvGeometry::depthwise(&input, &inputs[1], params.conv2d()?)?;
            TensorDesc::new(input.dtype, geometry.output_dims())
        }
        OpKind::FullyConnected => {
            let (batch, _, out_features) = fc_dims(&input, &inputs[1])?;
            TensorDesc::new(input.dtype, [batch, out_features])
        }
        OpKind::Relu => input,
        OpKind::Add => {
            let rhs = inputs[1].logical_dims();
            if input.shape.dims() != rhs.as_slice() || input.dtype != inputs[1].dtype {
                return Err(KernelError::shape_mismatch(format!(
                    "add operands disagree: {:?} {} vs {:?} {}",
                    input.shape.dims(),
                    input.dtype,
                    rhs.as_slice(),
                    inputs[1].dtype
                ))
                .with_op(op));
            }
            TensorDesc::new(input.dtype, input.shape.clone())
        }
        OpKind::MaxPool2d => {
            let dims = params.pool2d()?.output_dims(input.shape.dims())?;
            TensorDesc::new(input.dtype, dims).with_quant(input.quant.clone())
        }
    };
    Ok(vec![out])
}

/// `(batch, in_features, out_features)` for a fully connected layer.
///
/// The input is flattened after the batch axis; weights are `[out_features, in_features]`.
pub fn fc_dims(input: &TensorDesc, weight: &TensorDesc) -> KernelResult<(usize, usize, usize)> {
    let dims = input.logical_dims();
    let batch = dims[0];
    let in_features: usize = dims[1..].iter().product();
    let weight_dims = weight.shape.dims();
    if weight_dims.len() != 2 || weight_dims[1] != in_features {
        return Err(KernelError::shape_mismatch(format!(
            "fully connected weight {weight_dims:?} does not match {in_features} input features"
        ))
        .with_op(OpKind::FullyConnected));
    }
    Ok((batch, in_features, weight_dims[0]))
}

/// Declared output shape must equal the computed one.
pub fn check_output(op: OpKind, declared: &TensorDesc, computed: &[usize]) -> KernelResult<()> {
    let declared_dims = declared.logical_dims();
    if declared_dims.as_slice() != computed {
        return Err(KernelError::shape_mismatch(format!(
            "output dims do not match: declared {:?}, computed {computed:?}",
            declared_dims.as_slice()
        ))
        .with_op(op)
        .with_dtype(declared.dtype));
    }
    Ok(())
}
