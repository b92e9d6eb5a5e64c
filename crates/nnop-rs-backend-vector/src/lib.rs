//! Vector backends for nnop-rs.
//!
//! `vector` serves convolutions, depthwise 3x3, fully connected layers, and ReLU over
//! channel-packed activations whose pack factor follows from a configurable register width.
//! `dot` layers int8 pointwise convolutions built on four-lane dot products on top of it.
//! [`default_registry`] chains `dot -> vector -> ref`.

pub mod conv;
pub mod depthwise;
pub mod dot;
pub mod fc;
mod gemm;
mod prepared;

use std::sync::Arc;

use anyhow::Context;
use nnop_rs::backend::registry::{self, BackendTable, KernelRegistry, PackInfo};
use nnop_rs::backend::spec::{KernelRecord, KernelResult};
use nnop_rs::layout::pack_factor;
use nnop_rs::ops::OpKind;
use nnop_rs::tensor::DType;
use nnop_rs_backend_ref_cpu::reference_table;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use prepared::REMAINDER;

pub const VECTOR_BACKEND: &str = "vector";
pub const DOT_BACKEND: &str = "dot";

/// Lanes of one dot-product instruction in the `dot` backend.
pub const DOT_LANES: usize = 4;

/// Register width the vector backend packs channels for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub vlen_bits: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        VectorConfig { vlen_bits: 128 }
    }
}

impl VectorConfig {
    pub fn with_vlen_bits(vlen_bits: usize) -> Self {
        VectorConfig { vlen_bits }
    }

    /// Defaults, with `NNOP_RS_VLEN` applied when set.
    pub fn from_env() -> Self {
        let mut config = VectorConfig::default();
        if let Some(bits) = nnop_rs::env::vector_length_bits() {
            config.vlen_bits = bits;
        }
        config
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: VectorConfig = serde_json::from_str(text).context("parsing vector backend config")?;
        anyhow::ensure!(config.vlen_bits > 0, "vlen_bits must be positive");
        Ok(config)
    }

    pub fn pack_factor(&self, dtype: DType) -> usize {
        pack_factor(self.vlen_bits, dtype)
    }
}

/// Element types the vector kernels accept.
pub const VECTOR_DTYPES: [DType; 2] = [DType::F32, DType::I8];

pub fn vector_table(config: VectorConfig) -> KernelResult<BackendTable> {
    let mut table = BackendTable::new(VECTOR_BACKEND).with_pack_info(PackInfo {
        vlen_bits: config.vlen_bits,
        remainder: REMAINDER,
    });
    for dtype in VECTOR_DTYPES {
        for op in [OpKind::Conv2d, OpKind::Conv2dRelu] {
            table.register(op, dtype, KernelRecord::new().with_init(conv::ConvInitializer::new(config)))?;
        }
        table.register(
            OpKind::DepthwiseConv2d,
            dtype,
            KernelRecord::new().with_init(depthwise::DepthwiseInitializer::new(config)),
        )?;
        table.register(OpKind::FullyConnected, dtype, KernelRecord::new().init_fn(fc::init_fc))?;
        table.register(OpKind::Relu, dtype, KernelRecord::new().init_fn(fc::init_relu))?;
    }
    debug!(
        vlen_bits = config.vlen_bits,
        entries = table.len(),
        "vector kernel table ready"
    );
    Ok(table)
}

pub fn dot_table() -> KernelResult<BackendTable> {
    let mut table = BackendTable::new(DOT_BACKEND);
    for op in [OpKind::Conv2d, OpKind::Conv2dRelu] {
        table.register(op, DType::I8, KernelRecord::new().with_init(dot::DotConvInitializer))?;
    }
    debug!(entries = table.len(), "dot kernel table ready");
    Ok(table)
}

/// `vector -> ref` at `config`.
pub fn vector_registry(config: VectorConfig) -> KernelResult<KernelRegistry> {
    KernelRegistry::builder(reference_table()?)
        .layer(vector_table(config)?)
        .build()
}

/// `dot -> vector -> ref` at `config`.
pub fn registry_with(config: VectorConfig) -> KernelResult<KernelRegistry> {
    KernelRegistry::builder(reference_table()?)
        .layer(vector_table(config)?)
        .layer(dot_table()?)
        .build()
}

/// `dot -> vector -> ref` with the vector width taken from the environment.
pub fn default_registry() -> KernelResult<KernelRegistry> {
    registry_with(VectorConfig::from_env())
}

/// Returns the process-wide registry, installing [`default_registry`] if none is set yet.
pub fn install_default() -> KernelResult<Arc<KernelRegistry>> {
    if let Some(existing) = registry::default_registry() {
        return Ok(existing);
    }
    let built = Arc::new(default_registry()?);
    match registry::install_default_registry(Arc::clone(&built)) {
        Ok(()) => Ok(built),
        // Another thread won the race; use its registry.
        Err(rejected) => Ok(registry::default_registry().unwrap_or(rejected)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnop_rs_backend_ref_cpu::REFERENCE_BACKEND;

    #[test]
    fn chain_orders_dot_before_vector_before_ref() {
        let registry = registry_with(VectorConfig::default()).unwrap();
        assert_eq!(registry.backend_names(), vec![DOT_BACKEND, VECTOR_BACKEND, REFERENCE_BACKEND]);
        let pack = registry.backend(VECTOR_BACKEND).unwrap().pack_info().unwrap();
        assert_eq!(pack.vlen_bits, 128);
    }

    #[test]
    fn estimators_come_from_the_reference_backend() {
        let registry = registry_with(VectorConfig::default()).unwrap();
        let vector = registry.backend(VECTOR_BACKEND).unwrap();
        let own = vector.get(OpKind::Conv2d, DType::I8).unwrap();
        assert!(own.est.is_none());
        assert!(registry.lookup(OpKind::Conv2d, DType::I8).unwrap().est.is_some());
    }

    #[test]
    fn pooling_and_add_stay_on_reference() {
        let registry = registry_with(VectorConfig::default()).unwrap();
        for op in [OpKind::Add, OpKind::MaxPool2d] {
            let (table, _) = registry.candidates(op, DType::I8).next().unwrap();
            assert_eq!(table.name(), REFERENCE_BACKEND);
        }
    }

    #[test]
    fn config_from_json_fills_defaults() {
        assert_eq!(VectorConfig::from_json("{}").unwrap(), VectorConfig::default());
        let narrow = VectorConfig::from_json(r#"{"vlen_bits": 64}"#).unwrap();
        assert_eq!(narrow.pack_factor(DType::I8), 4);
        assert_eq!(narrow.pack_factor(DType::F32), 2);
        assert!(VectorConfig::from_json(r#"{"vlen_bits": 0}"#).is_err());
    }
}
