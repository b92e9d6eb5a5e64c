//! Kernel contract, per-backend tables, and the lookup chain.

pub mod registry;
pub mod select;
pub mod spec;

pub use registry::{
    default_registry, install_default_registry, BackendTable, KernelRegistry, PackInfo,
    RegistryBuilder,
};
pub use select::PathLadder;
pub use spec::{
    EstimateFn, Estimator, ExecContext, ExecFn, Executor, FnEstimator, FnExecutor, FnInitializer,
    InitContext, InitFn, Initializer, KernelContext, KernelError, KernelRecord, KernelResult,
    LayoutReq, Status,
};
