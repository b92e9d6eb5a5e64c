//! Pooling parameters.

use serde::{Deserialize, Serialize};

use crate::backend::spec::{KernelError, KernelResult};
use crate::ops::OpKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pool2dParams {
    pub window: [usize; 2],
    pub stride: [usize; 2],
    /// `[top, bottom, left, right]`.
    #[serde(default)]
    pub padding: [usize; 4],
}

impl Pool2dParams {
    pub fn square(window: usize, stride: usize) -> Self {
        Pool2dParams {
            window: [window, window],
            stride: [stride, stride],
            padding: [0; 4],
        }
    }

    /// `[N, C, OH, OW]` for an `[N, C, H, W]` input.
    pub fn output_dims(&self, input: &[usize]) -> KernelResult<[usize; 4]> {
        let [n, c, h, w]: [usize; 4] = input.try_into().map_err(|_| {
            KernelError::shape_mismatch(format!("pooling expects rank 4, found {input:?}"))
                .with_op(OpKind::MaxPool2d)
        })?;
        let extent = |size: usize, pad: usize, window: usize, stride: usize| {
            let padded = size + pad;
            (stride > 0 && window > 0 && padded >= window).then(|| (padded - window) / stride + 1)
        };
        let [pt, pb, pl, pr] = self.padding;
        match (
            extent(h, pt + pb, self.window[0], self.stride[0]),
            extent(w, pl + pr, self.window[1], self.stride[1]),
        ) {
            (Some(oh), Some(ow)) => Ok([n, c, oh, ow]),
            _ => Err(KernelError::shape_mismatch(format!(
                "pooling window {:?} does not fit input {h}x{w}",
                self.window
            ))
            .with_op(OpKind::MaxPool2d)),
        }
    }
}
