//! Operator dispatch and execution-graph runtime for quantized and floating-point
//! neural-network kernels.
//!
//! Backends publish `(operator, dtype)` kernel tables; a [`KernelRegistry`] chains them from
//! the most specialized backend down to the portable reference backend. A [`Session`] owns an
//! execution graph, binds each operator to the first backend willing to serve it, and runs the
//! operators in declaration order.

pub mod backend;
pub mod env;
pub mod graph;
pub mod layout;
pub mod ops;
pub mod quant;
pub mod session;
pub mod tensor;

pub use backend::{KernelError, KernelRegistry, KernelResult, Status};
pub use graph::{Graph, GraphError, NodeId};
pub use layout::Layout;
pub use ops::{OpKind, OpParams};
pub use session::{BoundKernel, RunMode, Session, SessionOptions};
pub use tensor::{DType, Shape, Tensor, TensorDesc};
