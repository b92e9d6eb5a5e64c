//! Tensor descriptors and host storage.

pub mod dtype;
mod host_tensor;
pub mod shape;

pub use dtype::DType;
pub use host_tensor::{Tensor, TensorData, TensorDesc};
pub use shape::{Shape, MAX_RANK};
