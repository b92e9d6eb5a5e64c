use std::sync::Arc;

use nnop_rs::KernelRegistry;
use nnop_rs_backend_tests::define_backend_tests;
use nnop_rs_backend_vector::{registry_with, vector_registry, VectorConfig};

fn full_chain() -> Arc<KernelRegistry> {
    Arc::new(registry_with(VectorConfig::default()).expect("dot -> vector -> ref chain"))
}

/// 64-bit registers: int8 packs four lanes, f32 two.
fn narrow_vector() -> Arc<KernelRegistry> {
    Arc::new(vector_registry(VectorConfig::with_vlen_bits(64)).expect("vector -> ref chain"))
}

define_backend_tests!(default_chain, super::full_chain);
define_backend_tests!(narrow_vector_chain, super::narrow_vector);
