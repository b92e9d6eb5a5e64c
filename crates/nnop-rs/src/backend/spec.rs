//! Kernel contract shared by every backend: status codes, errors, and the three entry points
//! of an implementation record.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::layout::{Layout, RemainderPolicy};
use crate::ops::{OpKind, OpParams};
use crate::tensor::{DType, Tensor, TensorDesc};

/// Closed status set returned by initializers, executors, and estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    UnsupportedLayout,
    UnsupportedDtype,
    ShapeMismatch,
    GenericFailure,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::UnsupportedLayout => "UNSUPPORTED_LAYOUT",
            Status::UnsupportedDtype => "UNSUPPORTED_DTYPE",
            Status::ShapeMismatch => "SHAPE_MISMATCH",
            Status::GenericFailure => "GENERIC_FAILURE",
        }
    }

    pub fn of<T>(result: &KernelResult<T>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(err) => err.status(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a kernel error happened. Fields are filled in as the error travels outward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelContext {
    pub backend: Option<String>,
    pub op: Option<OpKind>,
    pub dtype: Option<DType>,
    pub layout: Option<Layout>,
}

impl fmt::Display for KernelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(4);
        if let Some(backend) = &self.backend {
            parts.push(format!("backend={backend}"));
        }
        if let Some(op) = self.op {
            parts.push(format!("op={op}"));
        }
        if let Some(dtype) = self.dtype {
            parts.push(format!("dtype={dtype}"));
        }
        if let Some(layout) = self.layout {
            parts.push(format!("layout={layout}"));
        }
        if parts.is_empty() {
            f.write_str("kernel")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("[{ctx}] unsupported layout: {reason}")]
    UnsupportedLayout { ctx: KernelContext, reason: String },
    #[error("[{ctx}] unsupported dtype: {reason}")]
    UnsupportedDtype { ctx: KernelContext, reason: String },
    #[error("[{ctx}] shape mismatch: {reason}")]
    ShapeMismatch { ctx: KernelContext, reason: String },
    #[error("[{ctx}] kernel failure: {reason}")]
    GenericFailure { ctx: KernelContext, reason: String },
}

impl KernelError {
    pub fn unsupported_layout(reason: impl Into<String>) -> Self {
        KernelError::UnsupportedLayout {
            ctx: KernelContext::default(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_dtype(reason: impl Into<String>) -> Self {
        KernelError::UnsupportedDtype {
            ctx: KernelContext::default(),
            reason: reason.into(),
        }
    }

    pub fn shape_mismatch(reason: impl Into<String>) -> Self {
        KernelError::ShapeMismatch {
            ctx: KernelContext::default(),
            reason: reason.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        KernelError::GenericFailure {
            ctx: KernelContext::default(),
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            KernelError::UnsupportedLayout { .. } => Status::UnsupportedLayout,
            KernelError::UnsupportedDtype { .. } => Status::UnsupportedDtype,
            KernelError::ShapeMismatch { .. } => Status::ShapeMismatch,
            KernelError::GenericFailure { .. } => Status::GenericFailure,
        }
    }

    /// `true` for the two statuses that make the caller try the next backend.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            KernelError::UnsupportedLayout { .. } | KernelError::UnsupportedDtype { .. }
        )
    }

    pub fn context(&self) -> &KernelContext {
        match self {
            KernelError::UnsupportedLayout { ctx, .. }
            | KernelError::UnsupportedDtype { ctx, .. }
            | KernelError::ShapeMismatch { ctx, .. }
            | KernelError::GenericFailure { ctx, .. } => ctx,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            KernelError::UnsupportedLayout { reason, .. }
            | KernelError::UnsupportedDtype { reason, .. }
            | KernelError::ShapeMismatch { reason, .. }
            | KernelError::GenericFailure { reason, .. } => reason,
        }
    }

    fn context_mut(&mut self) -> &mut KernelContext {
        match self {
            KernelError::UnsupportedLayout { ctx, .. }
            | KernelError::UnsupportedDtype { ctx, .. }
            | KernelError::ShapeMismatch { ctx, .. }
            | KernelError::GenericFailure { ctx, .. } => ctx,
        }
    }

    /// Records the backend unless an inner frame already did.
    pub fn with_backend(mut self, backend: &str) -> Self {
        self.context_mut()
            .backend
            .get_or_insert_with(|| backend.to_string());
        self
    }

    pub fn with_op(mut self, op: OpKind) -> Self {
        self.context_mut().op.get_or_insert(op);
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.context_mut().dtype.get_or_insert(dtype);
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.context_mut().layout.get_or_insert(layout);
        self
    }
}

/// Convenience alias for results returned by kernel entry points.
pub type KernelResult<T> = Result<T, KernelError>;

/// Layout an executor wants for one input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutReq {
    /// Channel-first, unpacked.
    Canonical,
    Packed {
        factor: usize,
        remainder: RemainderPolicy,
    },
    /// Whatever the producer left behind.
    Any,
}

impl LayoutReq {
    pub fn accepts(self, layout: Layout) -> bool {
        match self {
            LayoutReq::Any => true,
            LayoutReq::Canonical => layout == Layout::ChannelFirst,
            LayoutReq::Packed { factor, remainder } => layout.is_packed_as(factor, remainder),
        }
    }
}

/// Everything an initializer may inspect when configuring one operator instance.
pub struct InitContext<'a> {
    pub op: OpKind,
    pub params: &'a OpParams,
    pub inputs: &'a [TensorDesc],
    /// Data of inputs that are constants, by slot.
    pub constants: &'a [Option<&'a Tensor>],
    /// Slots fed directly by a network input.
    pub graph_inputs: &'a [bool],
    pub outputs: &'a [TensorDesc],
}

impl<'a> InitContext<'a> {
    pub fn input(&self, slot: usize) -> KernelResult<&'a TensorDesc> {
        self.inputs.get(slot).ok_or_else(|| {
            KernelError::failure(format!("{} has no input slot {slot}", self.op)).with_op(self.op)
        })
    }

    pub fn output(&self, slot: usize) -> KernelResult<&'a TensorDesc> {
        self.outputs.get(slot).ok_or_else(|| {
            KernelError::failure(format!("{} has no output slot {slot}", self.op)).with_op(self.op)
        })
    }

    /// Constant data for `slot`; kernels that prepare weights require it.
    pub fn constant(&self, slot: usize) -> KernelResult<&'a Tensor> {
        self.constants.get(slot).copied().flatten().ok_or_else(|| {
            KernelError::unsupported_layout(format!(
                "{} expects a constant operand in slot {slot}",
                self.op
            ))
            .with_op(self.op)
        })
    }

    pub fn optional_constant(&self, slot: usize) -> Option<&'a Tensor> {
        self.constants.get(slot).copied().flatten()
    }

    pub fn reads_graph_input(&self, slot: usize) -> bool {
        self.graph_inputs.get(slot).copied().unwrap_or(false)
    }
}

/// Arguments of one executor invocation.
pub struct ExecContext<'a> {
    pub op: OpKind,
    pub params: &'a OpParams,
    pub inputs: &'a [&'a Tensor],
    pub outputs: &'a [TensorDesc],
}

impl<'a> ExecContext<'a> {
    pub fn input(&self, slot: usize) -> KernelResult<&'a Tensor> {
        self.inputs.get(slot).copied().ok_or_else(|| {
            KernelError::failure(format!("{} invoked without input {slot}", self.op))
        })
    }

    pub fn output(&self, slot: usize) -> KernelResult<&'a TensorDesc> {
        self.outputs.get(slot).ok_or_else(|| {
            KernelError::failure(format!("{} invoked without output {slot}", self.op))
        })
    }
}

/// Configures one operator instance and returns the executor bound to it.
///
/// Any weight preparation happens here, into values owned by the returned executor.
/// Returning an unsupported status means "try the next backend"; it never leaves
/// partial state behind.
pub trait Initializer: Send + Sync {
    fn initialize(&self, ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>>;
}

/// Computes output tensors from input tensors. Called once per run with identical shapes.
pub trait Executor: Send + Sync {
    /// Stable path name, surfaced through session diagnostics.
    fn name(&self) -> &str;

    fn input_layout(&self, _slot: usize) -> LayoutReq {
        LayoutReq::Canonical
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>>;
}

/// Shape/dtype inference without touching buffers.
pub trait Estimator: Send + Sync {
    fn estimate(&self, op: OpKind, params: &OpParams, inputs: &[TensorDesc]) -> KernelResult<Vec<TensorDesc>>;
}

pub type ExecFn = fn(&ExecContext<'_>) -> KernelResult<Vec<Tensor>>;
pub type EstimateFn = fn(OpKind, &OpParams, &[TensorDesc]) -> KernelResult<Vec<TensorDesc>>;
pub type InitFn = fn(&InitContext<'_>) -> KernelResult<Arc<dyn Executor>>;

/// Stateless executor backed by a plain function, reading canonical inputs.
pub struct FnExecutor {
    name: &'static str,
    func: ExecFn,
}

impl FnExecutor {
    pub fn new(name: &'static str, func: ExecFn) -> Self {
        FnExecutor { name, func }
    }
}

impl Executor for FnExecutor {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        (self.func)(ctx)
    }
}

pub struct FnEstimator(pub EstimateFn);

impl Estimator for FnEstimator {
    fn estimate(&self, op: OpKind, params: &OpParams, inputs: &[TensorDesc]) -> KernelResult<Vec<TensorDesc>> {
        (self.0)(op, params, inputs)
    }
}

pub struct FnInitializer(pub InitFn);

impl Initializer for FnInitializer {
    fn initialize(&self, ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
        (self.0)(ctx)
    }
}

/// Implementation record: up to three entry points for one `(op, dtype)`.
#[derive(Clone, Default)]
pub struct KernelRecord {
    pub init: Option<Arc<dyn Initializer>>,
    pub exec: Option<Arc<dyn Executor>>,
    pub est: Option<Arc<dyn Estimator>>,
}

impl KernelRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_init(mut self, init: impl Initializer + 'static) -> Self {
        self.init = Some(Arc::new(init));
        self
    }

    pub fn with_exec(mut self, exec: impl Executor + 'static) -> Self {
        self.exec = Some(Arc::new(exec));
        self
    }

    pub fn with_est(mut self, est: impl Estimator + 'static) -> Self {
        self.est = Some(Arc::new(est));
        self
    }

    pub fn init_fn(self, func: InitFn) -> Self {
        self.with_init(FnInitializer(func))
    }

    pub fn exec_fn(self, name: &'static str, func: ExecFn) -> Self {
        self.with_exec(FnExecutor::new(name, func))
    }

    pub fn est_fn(self, func: EstimateFn) -> Self {
        self.with_est(FnEstimator(func))
    }

    pub fn is_empty(&self) -> bool {
        self.init.is_none() && self.exec.is_none() && self.est.is_none()
    }

    /// `true` when the record can bind an operator instance.
    pub fn is_bindable(&self) -> bool {
        self.init.is_some() || self.exec.is_some()
    }

    /// Fills fields this record lacks from `fallback`.
    pub fn fill_from(&mut self, fallback: &KernelRecord) {
        if self.init.is_none() {
            self.init = fallback.init.clone();
        }
        if self.exec.is_none() {
            self.exec = fallback.exec.clone();
        }
        if self.est.is_none() {
            self.est = fallback.est.clone();
        }
    }
}

impl fmt::Debug for KernelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRecord")
            .field("init", &self.init.is_some())
            .field("exec", &self.exec.as_ref().map(|e| e.name().to_string()))
            .field("est", &self.est.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_request_checks_the_remainder_policy() {
        let zero_pad = LayoutReq::Packed {
            factor: 4,
            remainder: RemainderPolicy::ZeroPad,
        };
        let pack_one = LayoutReq::Packed {
            factor: 4,
            remainder: RemainderPolicy::PackOne,
        };
        let padded = Layout::Packed { factor: 4, channels: 6 };
        let unit = Layout::Packed { factor: 1, channels: 6 };
        assert!(zero_pad.accepts(padded));
        assert!(!pack_one.accepts(padded));
        assert!(pack_one.accepts(unit));
        assert!(!zero_pad.accepts(unit));

        let exact = Layout::Packed { factor: 4, channels: 8 };
        assert!(zero_pad.accepts(exact) && pack_one.accepts(exact));
        assert!(!zero_pad.accepts(Layout::ChannelFirst));
    }
}
