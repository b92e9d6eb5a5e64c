//! Per-backend kernel tables and the fallback chain that resolves `(op, dtype)` lookups.
//!
//! A [`BackendTable`] is filled once while a backend is brought up and is read-only afterwards.
//! A [`KernelRegistry`] orders tables from most specific to the portable reference backend and
//! is shared between sessions through an `Arc`. A process-wide default can be installed once for
//! call sites that do not thread a registry through.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::spec::{KernelError, KernelRecord, KernelResult};
use crate::layout::RemainderPolicy;
use crate::ops::OpKind;
use crate::tensor::DType;

/// Packing facts a backend publishes for its vector kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackInfo {
    pub vlen_bits: usize,
    pub remainder: RemainderPolicy,
}

/// Fixed-capacity `(op, dtype) -> record` table owned by one backend.
#[derive(Debug, Clone)]
pub struct BackendTable {
    name: String,
    capacity: usize,
    entries: HashMap<(OpKind, DType), KernelRecord>,
    pack: Option<PackInfo>,
}

impl BackendTable {
    /// Enough slots for every operator kind at every dtype.
    pub const DEFAULT_CAPACITY: usize = OpKind::ALL.len() * DType::ALL.len();

    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        BackendTable {
            name: name.into(),
            capacity,
            entries: HashMap::with_capacity(capacity),
            pack: None,
        }
    }

    pub fn with_pack_info(mut self, pack: PackInfo) -> Self {
        self.pack = Some(pack);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pack_info(&self) -> Option<PackInfo> {
        self.pack
    }

    /// Registers `record` under `(op, dtype)`, replacing any earlier registration.
    ///
    /// Fails only when a new key would exceed the table's capacity.
    pub fn register(&mut self, op: OpKind, dtype: DType, record: KernelRecord) -> KernelResult<()> {
        let key = (op, dtype);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            return Err(KernelError::failure(format!(
                "kernel table '{}' is full ({} entries)",
                self.name, self.capacity
            ))
            .with_backend(&self.name)
            .with_op(op)
            .with_dtype(dtype));
        }
        if self.entries.insert(key, record).is_some() {
            debug!(backend = %self.name, %op, %dtype, "kernel registration overridden");
        }
        Ok(())
    }

    pub fn get(&self, op: OpKind, dtype: DType) -> Option<&KernelRecord> {
        self.entries.get(&(op, dtype))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered keys in a stable order.
    pub fn keys(&self) -> Vec<(OpKind, DType)> {
        let mut keys: Vec<_> = self.entries.keys().copied().collect();
        keys.sort();
        keys
    }
}

/// Ordered chain of backend tables: most specific first, reference backend last.
#[derive(Debug, Clone)]
pub struct KernelRegistry {
    chain: Vec<Arc<BackendTable>>,
}

impl KernelRegistry {
    pub fn builder(reference: BackendTable) -> RegistryBuilder {
        RegistryBuilder::new(reference)
    }

    /// Resolves `(op, dtype)` field by field along the chain.
    ///
    /// Each entry point comes from the most specific backend that provides it. Pairs no backend
    /// advertises are reported as `UNSUPPORTED_DTYPE`. Never invokes an entry point.
    pub fn lookup(&self, op: OpKind, dtype: DType) -> KernelResult<KernelRecord> {
        let mut resolved = KernelRecord::default();
        for table in &self.chain {
            if let Some(record) = table.get(op, dtype) {
                resolved.fill_from(record);
            }
        }
        if resolved.is_empty() {
            return Err(KernelError::unsupported_dtype(format!(
                "no backend in [{}] advertises {op} for {dtype}",
                self.backend_names().join(", ")
            ))
            .with_op(op)
            .with_dtype(dtype));
        }
        Ok(resolved)
    }

    /// Backend-qualified records for `(op, dtype)` in fallback order, skipping absent keys.
    pub fn candidates(&self, op: OpKind, dtype: DType) -> impl Iterator<Item = (&BackendTable, &KernelRecord)> {
        self.chain
            .iter()
            .filter_map(move |table| table.get(op, dtype).map(|record| (table.as_ref(), record)))
    }

    pub fn is_advertised(&self, op: OpKind, dtype: DType) -> bool {
        self.chain.iter().any(|table| {
            table
                .get(op, dtype)
                .is_some_and(|record| record.is_bindable())
        })
    }

    /// Every `(op, dtype)` pair some backend can bind, sorted.
    pub fn advertised(&self) -> Vec<(OpKind, DType)> {
        let mut pairs: Vec<_> = self
            .chain
            .iter()
            .flat_map(|table| table.keys())
            .filter(|&(op, dtype)| self.is_advertised(op, dtype))
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.chain.iter().map(|table| table.name()).collect()
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.chain.iter().any(|table| table.name() == name)
    }

    pub fn backend(&self, name: &str) -> Option<&BackendTable> {
        self.chain
            .iter()
            .find(|table| table.name() == name)
            .map(Arc::as_ref)
    }

    pub fn reference(&self) -> &BackendTable {
        // The builder guarantees a non-empty chain ending at the reference table.
        &self.chain[self.chain.len() - 1]
    }

    /// The tail of the chain starting at `name`.
    pub fn starting_at(&self, name: &str) -> KernelResult<KernelRegistry> {
        let start = self
            .chain
            .iter()
            .position(|table| table.name() == name)
            .ok_or_else(|| {
                KernelError::failure(format!(
                    "unknown backend '{name}', available: [{}]",
                    self.backend_names().join(", ")
                ))
            })?;
        Ok(KernelRegistry {
            chain: self.chain[start..].to_vec(),
        })
    }
}

/// Collects backend tables on top of a terminal reference table.
pub struct RegistryBuilder {
    reference: BackendTable,
    layers: Vec<BackendTable>,
}

impl RegistryBuilder {
    pub fn new(reference: BackendTable) -> Self {
        RegistryBuilder {
            reference,
            layers: Vec::new(),
        }
    }

    /// Adds a backend more specific than every table added so far.
    pub fn layer(mut self, table: BackendTable) -> Self {
        self.layers.push(table);
        self
    }

    pub fn build(self) -> KernelResult<KernelRegistry> {
        let RegistryBuilder { reference, layers } = self;
        for (op, dtype) in reference.keys() {
            let bindable = reference
                .get(op, dtype)
                .is_some_and(|record| record.is_bindable());
            if !bindable {
                return Err(KernelError::failure(format!(
                    "reference backend '{}' advertises {op}/{dtype} without an initializer or executor",
                    reference.name()
                ))
                .with_backend(reference.name()));
            }
        }
        let mut chain: Vec<Arc<BackendTable>> = Vec::with_capacity(layers.len() + 1);
        for table in layers.into_iter().rev() {
            if chain.iter().any(|t| t.name() == table.name()) || table.name() == reference.name() {
                return Err(KernelError::failure(format!(
                    "backend '{}' registered twice",
                    table.name()
                )));
            }
            chain.push(Arc::new(table));
        }
        chain.push(Arc::new(reference));
        let registry = KernelRegistry { chain };
        debug!(chain = ?registry.backend_names(), "kernel registry built");
        Ok(registry)
    }
}

static DEFAULT_REGISTRY: OnceLock<Arc<KernelRegistry>> = OnceLock::new();

/// Installs the process-wide default registry. Only the first call wins; later calls hand
/// their registry back.
pub fn install_default_registry(registry: Arc<KernelRegistry>) -> Result<(), Arc<KernelRegistry>> {
    DEFAULT_REGISTRY.set(registry)
}

pub fn default_registry() -> Option<Arc<KernelRegistry>> {
    DEFAULT_REGISTRY.get().cloned()
}
