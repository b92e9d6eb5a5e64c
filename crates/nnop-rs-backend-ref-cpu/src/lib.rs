//! Portable reference backend.
//!
//! Direct, unfused loops over canonical channel-first buffers. Zero-points are subtracted
//! explicitly instead of folded, so these kernels double as the numerical oracle for every
//! other backend. The table is total over every advertised `(op, dtype)` pair and terminates
//! each registry chain.

pub mod cpu;

use nnop_rs::backend::registry::{BackendTable, KernelRegistry};
use nnop_rs::backend::spec::{InitFn, KernelRecord, KernelResult};
use nnop_rs::ops::{self, OpKind};
use nnop_rs::tensor::DType;

pub const REFERENCE_BACKEND: &str = "ref";

/// Element types every reference kernel accepts.
pub const REFERENCE_DTYPES: [DType; 2] = [DType::F32, DType::I8];

fn reference_record(op: OpKind) -> KernelRecord {
    let init: InitFn = match op {
        OpKind::Conv2d | OpKind::Conv2dRelu | OpKind::DepthwiseConv2d => cpu::init_conv,
        OpKind::FullyConnected => cpu::init_fc,
        OpKind::Add => cpu::init_add,
        OpKind::MaxPool2d => cpu::init_max_pool,
        OpKind::Relu => cpu::init_relu,
    };
    KernelRecord::new().init_fn(init).est_fn(ops::infer_outputs)
}

/// Registers every reference kernel into `table`.
pub fn register_reference_kernels(table: &mut BackendTable) -> KernelResult<()> {
    for dtype in REFERENCE_DTYPES {
        for op in OpKind::ALL {
            table.register(op, dtype, reference_record(op))?;
        }
    }
    Ok(())
}

pub fn reference_table() -> KernelResult<BackendTable> {
    let mut table = BackendTable::new(REFERENCE_BACKEND);
    register_reference_kernels(&mut table)?;
    tracing::debug!(entries = table.len(), "reference kernel table ready");
    Ok(table)
}

/// A chain holding only the reference backend.
pub fn reference_registry() -> KernelResult<KernelRegistry> {
    KernelRegistry::builder(reference_table()?).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnop_rs::backend::spec::Status;

    #[test]
    fn table_is_total_over_advertised_pairs() {
        let registry = reference_registry().unwrap();
        for dtype in REFERENCE_DTYPES {
            for op in OpKind::ALL {
                let record = registry.lookup(op, dtype).unwrap();
                assert!(record.is_bindable(), "{op}/{dtype}");
                assert!(record.est.is_some(), "{op}/{dtype}");
            }
        }
        assert_eq!(registry.advertised().len(), OpKind::ALL.len() * REFERENCE_DTYPES.len());
    }

    #[test]
    fn unadvertised_dtype_is_reported() {
        let registry = reference_registry().unwrap();
        let err = registry.lookup(OpKind::Conv2d, DType::F16).unwrap_err();
        assert_eq!(err.status(), Status::UnsupportedDtype);
    }
}
