use std::sync::{Arc, Mutex, PoisonError};

use nnop_rs::backend::registry::BackendTable;
use nnop_rs::backend::spec::{
    ExecContext, Executor, InitContext, Initializer, KernelError, KernelRecord, KernelResult,
    LayoutReq,
};
use nnop_rs::ops::OpKind;
use nnop_rs::tensor::Tensor;

/// One executor call, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub op: OpKind,
    pub executor: String,
}

type Log = Arc<Mutex<Vec<Invocation>>>;

/// Test-only backend table that forwards to another table's kernels and logs every
/// executor invocation.
#[derive(Default, Clone)]
pub struct RecordingTable {
    log: Log,
}

impl RecordingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of `inner` named `name` whose kernels report to this recorder.
    pub fn wrap(&self, inner: &BackendTable, name: &str) -> KernelResult<BackendTable> {
        let mut table = BackendTable::new(name);
        for (op, dtype) in inner.keys() {
            let Some(record) = inner.get(op, dtype) else {
                continue;
            };
            let wrapped = KernelRecord {
                init: Some(Arc::new(RecordingInitializer {
                    inner: record.clone(),
                    log: Arc::clone(&self.log),
                })),
                exec: None,
                est: record.est.clone(),
            };
            table.register(op, dtype, wrapped)?;
        }
        Ok(table)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn ops(&self) -> Vec<OpKind> {
        self.invocations().into_iter().map(|call| call.op).collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

struct RecordingInitializer {
    inner: KernelRecord,
    log: Log,
}

impl Initializer for RecordingInitializer {
    fn initialize(&self, ctx: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
        let inner = match (&self.inner.init, &self.inner.exec) {
            (Some(init), _) => init.initialize(ctx)?,
            (None, Some(exec)) => Arc::clone(exec),
            (None, None) => {
                return Err(KernelError::unsupported_dtype("wrapped record is empty").with_op(ctx.op))
            }
        };
        Ok(Arc::new(RecordingExecutor {
            inner,
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingExecutor {
    inner: Arc<dyn Executor>,
    log: Log,
}

impl Executor for RecordingExecutor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn input_layout(&self, slot: usize) -> LayoutReq {
        self.inner.input_layout(slot)
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Invocation {
                op: ctx.op,
                executor: self.inner.name().to_string(),
            });
        self.inner.execute(ctx)
    }
}
