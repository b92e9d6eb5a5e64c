//! Sessions own an execution graph, bind each operator to a kernel, and run them in order.
//!
//! ## Lifecycle
//!
//! 1. **Declare**: inputs, constants, and operators are added while the session is building.
//! 2. **Setup**: the graph is validated and every operator is bound by walking the registry's
//!    backend chain; a backend that declines is logged and the next one is tried.
//! 3. **Run**: operators execute in declaration order. Values are converted on demand to the
//!    layout each executor asks for, and intermediates are released after their last consumer.
//!
//! A failed run poisons the session; the graph has to be rebuilt.
//!
//! [`RunMode::Layer`] sessions skip the graph and execute one operator per call.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, debug_span, trace, warn};

use crate::backend::registry::{default_registry, KernelRegistry};
use crate::backend::spec::{ExecContext, Executor, InitContext, KernelError, KernelResult, LayoutReq};
use crate::env;
use crate::graph::{Graph, NodeId, ValueRole};
use crate::layout::{self, Layout};
use crate::ops::{self, OpKind, OpParams};
use crate::tensor::{DType, Tensor, TensorDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Build a graph, set it up once, run it many times.
    #[default]
    Graph,
    /// Execute each operator immediately.
    Layer,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub run_mode: RunMode,
    /// First backend of the chain to use; `None` uses the whole chain.
    pub backend: Option<String>,
    /// Keep intermediate buffers after their last consumer has run.
    pub keep_intermediates: bool,
}

impl SessionOptions {
    pub fn layer() -> Self {
        SessionOptions {
            run_mode: RunMode::Layer,
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }

    /// Defaults with `NNOP_RS_*` overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(backend) = env::backend_override() {
            self.backend = Some(backend.to_string());
        }
        if env::keep_intermediates() {
            self.keep_intermediates = true;
        }
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid session options")
    }
}

/// Which backend and executor path serve an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundKernel {
    /// Operator node, `None` in layer mode.
    pub node: Option<NodeId>,
    pub op: OpKind,
    pub dtype: DType,
    pub backend: String,
    pub executor: String,
}

struct BoundOp {
    node: NodeId,
    executor: Arc<dyn Executor>,
    info: BoundKernel,
}

enum SessionState {
    Building,
    Ready,
    Poisoned(String),
}

pub struct Session {
    registry: Arc<KernelRegistry>,
    options: SessionOptions,
    graph: Graph,
    inputs: Vec<Option<NodeId>>,
    outputs: Vec<Option<NodeId>>,
    bound: Vec<BoundOp>,
    /// Runtime buffers indexed by node.
    values: Vec<Option<Tensor>>,
    scratch: HashMap<(NodeId, LayoutReq), Tensor>,
    consumer_counts: Vec<usize>,
    releasable: Vec<bool>,
    last_layer: Option<BoundKernel>,
    state: SessionState,
}

/// Walks the backend chain until a backend binds the operator described by `ctx`.
fn bind_kernel(registry: &KernelRegistry, ctx: &InitContext<'_>) -> KernelResult<(Arc<dyn Executor>, String)> {
    let op = ctx.op;
    let dtype = ctx
        .inputs
        .first()
        .map(|desc| desc.dtype)
        .ok_or_else(|| KernelError::failure("operator without inputs").with_op(op))?;
    let mut declined: Option<KernelError> = None;
    for (table, record) in registry.candidates(op, dtype) {
        if let Some(init) = &record.init {
            match init.initialize(ctx) {
                Ok(executor) => return Ok((executor, table.name().to_string())),
                Err(err) if err.is_unsupported() => {
                    warn!(
                        backend = table.name(),
                        %op,
                        %dtype,
                        status = %err.status(),
                        reason = err.reason(),
                        "backend declined operator, falling back"
                    );
                    declined = Some(err.with_backend(table.name()));
                }
                Err(err) => {
                    return Err(err.with_backend(table.name()).with_op(op).with_dtype(dtype));
                }
            }
        } else if let Some(executor) = &record.exec {
            return Ok((Arc::clone(executor), table.name().to_string()));
        }
    }
    let err = declined.unwrap_or_else(|| {
        KernelError::unsupported_dtype(format!(
            "no backend in [{}] provides {op} for {dtype}",
            registry.backend_names().join(", ")
        ))
    });
    Err(err.with_op(op).with_dtype(dtype))
}

/// Produces a copy of `source` in the layout `request` asks for, reusing `scratch` if given.
fn convert_layout(source: &Tensor, request: LayoutReq, scratch: Option<Tensor>) -> KernelResult<Tensor> {
    match request {
        LayoutReq::Any => Ok(source.clone()),
        LayoutReq::Canonical => match source.layout() {
            Layout::Packed { .. } => match scratch {
                Some(mut target) => {
                    layout::from_packed_into(source, &mut target)?;
                    Ok(target)
                }
                None => layout::from_packed(source),
            },
            Layout::ChannelLast => layout::nhwc_to_nchw(source),
            Layout::ChannelFirst => Ok(source.clone()),
        },
        LayoutReq::Packed { factor, remainder } => {
            let canonical;
            let source = if source.layout() == Layout::ChannelFirst {
                source
            } else {
                canonical = convert_layout(source, LayoutReq::Canonical, None)?;
                &canonical
            };
            match scratch {
                Some(mut target) => {
                    layout::to_packed_into(source, factor, remainder, &mut target)?;
                    Ok(target)
                }
                None => layout::to_packed(source, factor, remainder),
            }
        }
    }
}

fn canonicalize(tensor: Tensor) -> KernelResult<Tensor> {
    if tensor.layout().is_packed() {
        layout::from_packed(&tensor)
    } else {
        Ok(tensor)
    }
}

fn check_outputs(op: OpKind, produced: &[Tensor], declared: &[TensorDesc]) -> KernelResult<()> {
    if produced.len() != declared.len() {
        return Err(KernelError::failure(format!(
            "executor returned {} outputs, {} declared",
            produced.len(),
            declared.len()
        ))
        .with_op(op));
    }
    for (tensor, desc) in produced.iter().zip(declared) {
        if tensor.dtype() != desc.dtype {
            return Err(KernelError::failure(format!(
                "executor produced {} for a declared {} output",
                tensor.dtype(),
                desc.dtype
            ))
            .with_op(op));
        }
        ops::check_output(op, desc, &tensor.desc().logical_dims())?;
    }
    Ok(())
}

fn value_tensor<'a>(graph: &'a Graph, values: &'a [Option<Tensor>], id: NodeId) -> Result<&'a Tensor> {
    let value = graph.value(id)?;
    value
        .constant()
        .or_else(|| values.get(id.index()).and_then(Option::as_ref))
        .ok_or_else(|| anyhow!("value {id} has no data"))
}

impl Session {
    pub fn new(registry: Arc<KernelRegistry>, options: SessionOptions) -> Result<Self> {
        let registry = match &options.backend {
            Some(name) => Arc::new(
                registry
                    .starting_at(name)
                    .with_context(|| format!("selecting backend '{name}'"))?,
            ),
            None => registry,
        };
        debug!(chain = ?registry.backend_names(), mode = ?options.run_mode, "session created");
        Ok(Session {
            registry,
            options,
            graph: Graph::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            bound: Vec::new(),
            values: Vec::new(),
            scratch: HashMap::new(),
            consumer_counts: Vec::new(),
            releasable: Vec::new(),
            last_layer: None,
            state: SessionState::Building,
        })
    }

    /// Session on the process-wide default registry.
    pub fn with_default_registry(options: SessionOptions) -> Result<Self> {
        let registry = default_registry().ok_or_else(|| anyhow!("no default kernel registry installed"))?;
        Session::new(registry, options)
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Raw graph access for callers wiring nodes with `begin_operator`/`connect_*` directly.
    pub fn graph_mut(&mut self) -> Result<&mut Graph> {
        self.ensure_building()?;
        Ok(&mut self.graph)
    }

    fn ensure_building(&self) -> Result<()> {
        ensure!(
            self.options.run_mode == RunMode::Graph,
            "layer-mode sessions do not build graphs; use run_operator()"
        );
        ensure!(
            matches!(self.state, SessionState::Building),
            "the graph is frozen once the session is set up"
        );
        Ok(())
    }

    pub fn set_input_number(&mut self, count: usize) -> Result<()> {
        self.ensure_building()?;
        self.inputs.resize(count, None);
        Ok(())
    }

    pub fn set_output_number(&mut self, count: usize) -> Result<()> {
        self.ensure_building()?;
        self.outputs.resize(count, None);
        Ok(())
    }

    /// Declares network input `index`.
    pub fn set_input(&mut self, index: usize, desc: TensorDesc) -> Result<NodeId> {
        self.ensure_building()?;
        let slot = self
            .inputs
            .get(index)
            .ok_or_else(|| anyhow!("input index {index} out of range ({} inputs)", self.inputs.len()))?;
        ensure!(slot.is_none(), "input {index} is already declared");
        let id = self.graph.add_input(desc);
        self.inputs[index] = Some(id);
        Ok(id)
    }

    pub fn add_constant(&mut self, tensor: Tensor) -> Result<NodeId> {
        self.ensure_building()?;
        Ok(self.graph.add_constant(tensor))
    }

    /// Marks `value` as network output `index`.
    pub fn set_output(&mut self, index: usize, value: NodeId) -> Result<()> {
        self.ensure_building()?;
        self.graph.value(value)?;
        let slot = self
            .outputs
            .get_mut(index)
            .ok_or_else(|| anyhow!("output index {index} out of range"))?;
        ensure!(slot.is_none(), "output {index} is already assigned");
        *slot = Some(value);
        Ok(())
    }

    /// Declares an operator reading `inputs` and producing one new value per output descriptor.
    pub fn declare(
        &mut self,
        op: OpKind,
        params: OpParams,
        inputs: &[NodeId],
        outputs: Vec<TensorDesc>,
    ) -> Result<Vec<NodeId>> {
        self.ensure_building()?;
        let node = self
            .graph
            .begin_operator(op, params, inputs.len(), outputs.len())?;
        for (slot, &value) in inputs.iter().enumerate() {
            self.graph
                .connect_input(node, value, slot)
                .with_context(|| format!("wiring input {slot} of {op}"))?;
        }
        let mut produced = Vec::with_capacity(outputs.len());
        for (slot, desc) in outputs.into_iter().enumerate() {
            let value = self.graph.add_value(desc);
            self.graph.connect_output(node, value, slot)?;
            produced.push(value);
        }
        Ok(produced)
    }

    /// Output descriptors for `op` over existing values, from the resolved estimator.
    pub fn infer_outputs(&self, op: OpKind, params: &OpParams, inputs: &[NodeId]) -> Result<Vec<TensorDesc>> {
        let descs = inputs
            .iter()
            .map(|&id| Ok(self.graph.value(id)?.desc.clone()))
            .collect::<Result<Vec<_>>>()?;
        self.estimate(op, params, &descs)
    }

    fn estimate(&self, op: OpKind, params: &OpParams, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>> {
        let dtype = inputs
            .first()
            .map(|desc| desc.dtype)
            .ok_or_else(|| anyhow!("{op} needs at least one input"))?;
        let record = self.registry.lookup(op, dtype)?;
        let estimator = record
            .est
            .ok_or_else(|| anyhow!("no estimator registered for {op}/{dtype}"))?;
        Ok(estimator.estimate(op, params, inputs)?)
    }

    /// Validates the graph and binds every operator, in declaration order.
    pub fn setup(&mut self) -> Result<()> {
        self.ensure_building()?;
        for (index, slot) in self.inputs.iter().enumerate() {
            ensure!(slot.is_some(), "input {index} was never declared");
        }
        for (index, slot) in self.outputs.iter().enumerate() {
            ensure!(slot.is_some(), "output {index} was never assigned");
        }
        self.graph.validate().context("invalid graph")?;

        let mut bound = Vec::with_capacity(self.graph.operators().len());
        for &node in self.graph.operators() {
            bound.push(self.bind_node(node)?);
        }

        let count = self.graph.node_count();
        let mut consumer_counts = vec![0; count];
        let mut releasable = vec![false; count];
        for (id, value) in self.graph.values() {
            consumer_counts[id.index()] = value.consumers.len();
            releasable[id.index()] =
                value.role == ValueRole::Intermediate && !self.outputs.contains(&Some(id));
        }
        self.values.resize_with(count, || None);
        self.consumer_counts = consumer_counts;
        self.releasable = releasable;
        self.bound = bound;
        self.state = SessionState::Ready;
        debug!(operators = self.bound.len(), "session ready");
        Ok(())
    }

    fn bind_node(&self, node: NodeId) -> Result<BoundOp> {
        let operator = self.graph.operator(node)?;
        let mut inputs = Vec::with_capacity(operator.inputs.len());
        let mut constants = Vec::with_capacity(operator.inputs.len());
        let mut graph_inputs = Vec::with_capacity(operator.inputs.len());
        for input in &operator.inputs {
            let id = input.ok_or_else(|| anyhow!("unconnected input on {node}"))?;
            let value = self.graph.value(id)?;
            inputs.push(value.desc.clone());
            constants.push(value.constant());
            graph_inputs.push(value.role == ValueRole::Input);
        }
        let outputs = operator
            .outputs
            .iter()
            .map(|output| {
                let id = output.ok_or_else(|| anyhow!("unconnected output on {node}"))?;
                Ok(self.graph.value(id)?.desc.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        let ctx = InitContext {
            op: operator.op,
            params: &operator.params,
            inputs: &inputs,
            constants: &constants,
            graph_inputs: &graph_inputs,
            outputs: &outputs,
        };
        let (executor, backend) = bind_kernel(&self.registry, &ctx)
            .with_context(|| format!("initializing {} at {node}", operator.op))?;
        let info = BoundKernel {
            node: Some(node),
            op: operator.op,
            dtype: inputs[0].dtype,
            backend,
            executor: executor.name().to_string(),
        };
        debug!(%node, op = %info.op, backend = %info.backend, executor = %info.executor, "operator bound");
        Ok(BoundOp {
            node,
            executor,
            info,
        })
    }

    /// Backend and executor chosen for each operator, in execution order.
    pub fn bound_kernels(&self) -> Vec<BoundKernel> {
        self.bound.iter().map(|bound| bound.info.clone()).collect()
    }

    /// Kernel used by the most recent [`Session::run_operator`] call.
    pub fn last_layer_kernel(&self) -> Option<&BoundKernel> {
        self.last_layer.as_ref()
    }

    /// Feeds network input `index`; dtype and logical shape must match the declaration.
    pub fn update_input(&mut self, index: usize, tensor: Tensor) -> Result<()> {
        let id = self
            .inputs
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| anyhow!("input {index} is not declared"))?;
        let declared = &self.graph.value(id)?.desc;
        if declared.dtype != tensor.dtype() || declared.logical_dims() != tensor.desc().logical_dims() {
            return Err(KernelError::shape_mismatch(format!(
                "input {index} declared as {} {:?}, got {} {:?}",
                declared.dtype,
                declared.logical_dims().as_slice(),
                tensor.dtype(),
                tensor.desc().logical_dims().as_slice()
            ))
            .into());
        }
        if self.values.len() <= id.index() {
            self.values.resize_with(id.index() + 1, || None);
        }
        self.values[id.index()] = Some(tensor);
        Ok(())
    }

    /// Executes every operator once, in declaration order.
    pub fn run(&mut self) -> Result<()> {
        match &self.state {
            SessionState::Building => bail!("session is not set up; call setup() first"),
            SessionState::Poisoned(reason) => {
                bail!("session must be rebuilt after a failed run: {reason}")
            }
            SessionState::Ready => {}
        }
        for (id, value) in self.graph.values() {
            match value.role {
                ValueRole::Input => ensure!(
                    self.values[id.index()].is_some(),
                    "graph input {id} has no data; call update_input() first"
                ),
                ValueRole::Intermediate => self.values[id.index()] = None,
                ValueRole::Constant => {}
            }
        }

        let span = debug_span!("session.run", operators = self.bound.len());
        let _guard = span.enter();
        let mut remaining = self.consumer_counts.clone();
        for index in 0..self.bound.len() {
            if let Err(err) = self.execute_bound(index, &mut remaining) {
                self.state = SessionState::Poisoned(format!("{err:#}"));
                return Err(err);
            }
        }
        Ok(())
    }

    fn execute_bound(&mut self, index: usize, remaining: &mut [usize]) -> Result<()> {
        let bound = &self.bound[index];
        let executor = Arc::clone(&bound.executor);
        let node = bound.node;
        let operator = self.graph.operator(node)?;
        let op = operator.op;
        let input_ids = operator
            .inputs
            .iter()
            .map(|slot| slot.ok_or_else(|| anyhow!("unconnected input on {node}")))
            .collect::<Result<SmallVec<[NodeId; 4]>>>()?;
        let output_ids = operator
            .outputs
            .iter()
            .map(|slot| slot.ok_or_else(|| anyhow!("unconnected output on {node}")))
            .collect::<Result<SmallVec<[NodeId; 2]>>>()?;
        let output_descs = output_ids
            .iter()
            .map(|&id| Ok(self.graph.value(id)?.desc.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut staged: SmallVec<[Option<(LayoutReq, Tensor)>; 4]> = SmallVec::new();
        for (slot, &id) in input_ids.iter().enumerate() {
            let source = value_tensor(&self.graph, &self.values, id)?;
            let request = executor.input_layout(slot);
            if request.accepts(source.layout()) {
                staged.push(None);
                continue;
            }
            let scratch = self.scratch.remove(&(id, request));
            let converted = convert_layout(source, request, scratch)
                .map_err(|err| err.with_op(op))
                .with_context(|| format!("converting input {slot} of {op} at {node}"))?;
            staged.push(Some((request, converted)));
        }

        let produced = {
            let inputs = input_ids
                .iter()
                .zip(&staged)
                .map(|(&id, staged)| match staged {
                    Some((_, tensor)) => Ok(tensor),
                    None => value_tensor(&self.graph, &self.values, id),
                })
                .collect::<Result<SmallVec<[&Tensor; 4]>>>()?;
            trace!(%node, %op, executor = executor.name(), "execute");
            let ctx = ExecContext {
                op,
                params: &operator.params,
                inputs: &inputs,
                outputs: &output_descs,
            };
            executor
                .execute(&ctx)
                .and_then(|produced| check_outputs(op, &produced, &output_descs).map(|()| produced))
                .map_err(|err| err.with_backend(&bound.info.backend).with_op(op))
                .with_context(|| format!("executing {op} at {node} with {}", executor.name()))?
        };

        for (&id, staged) in input_ids.iter().zip(staged) {
            if let Some((request, tensor)) = staged {
                self.scratch.insert((id, request), tensor);
            }
        }
        for (&id, tensor) in output_ids.iter().zip(produced) {
            self.values[id.index()] = Some(tensor);
        }
        if !self.options.keep_intermediates {
            for &id in &input_ids {
                let left = &mut remaining[id.index()];
                *left = left.saturating_sub(1);
                if *left == 0 && self.releasable[id.index()] {
                    trace!(value = %id, "releasing intermediate");
                    self.values[id.index()] = None;
                }
            }
        }
        Ok(())
    }

    /// Network output `index` in canonical layout.
    pub fn output(&self, index: usize) -> Result<Tensor> {
        ensure!(
            matches!(self.state, SessionState::Ready),
            "outputs are only available from a set-up session after a successful run"
        );
        let id = self
            .outputs
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| anyhow!("output {index} is not assigned"))?;
        let tensor = value_tensor(&self.graph, &self.values, id)
            .with_context(|| format!("output {index} has not been computed"))?;
        Ok(canonicalize(tensor.clone())?)
    }

    /// The buffer currently held for `value`, in whatever layout its producer left it.
    ///
    /// Intermediates are only available while they have not been released; see
    /// [`SessionOptions::keep_intermediates`].
    pub fn value(&self, value: NodeId) -> Result<&Tensor> {
        value_tensor(&self.graph, &self.values, value)
    }

    /// Binds and executes a single operator immediately ([`RunMode::Layer`]).
    ///
    /// Every operand is treated as caller-owned constant data; outputs come back canonical.
    pub fn run_operator(
        &mut self,
        op: OpKind,
        params: &OpParams,
        inputs: &[&Tensor],
        outputs: Option<&[TensorDesc]>,
    ) -> Result<Vec<Tensor>> {
        ensure!(
            self.options.run_mode == RunMode::Layer,
            "run_operator() requires a layer-mode session"
        );
        let (min, max, _) = op.arity();
        ensure!(
            (min..=max).contains(&inputs.len()),
            "{op} takes {min}..={max} inputs, got {}",
            inputs.len()
        );
        ensure!(params.matches(op), "{op} cannot take parameters {params:?}");

        let descs: Vec<TensorDesc> = inputs.iter().map(|tensor| tensor.desc().clone()).collect();
        let output_descs = match outputs {
            Some(outputs) => outputs.to_vec(),
            None => self.estimate(op, params, &descs)?,
        };
        let constants: Vec<Option<&Tensor>> = inputs.iter().map(|&tensor| Some(tensor)).collect();
        let graph_inputs = vec![true; inputs.len()];
        let ctx = InitContext {
            op,
            params,
            inputs: &descs,
            constants: &constants,
            graph_inputs: &graph_inputs,
            outputs: &output_descs,
        };
        let (executor, backend) = bind_kernel(&self.registry, &ctx).with_context(|| format!("initializing {op}"))?;

        let staged = inputs
            .iter()
            .enumerate()
            .map(|(slot, tensor)| {
                let request = executor.input_layout(slot);
                if request.accepts(tensor.layout()) {
                    Ok(None)
                } else {
                    convert_layout(tensor, request, None).map(Some)
                }
            })
            .collect::<KernelResult<Vec<_>>>()?;
        let refs: Vec<&Tensor> = inputs
            .iter()
            .zip(&staged)
            .map(|(&tensor, staged)| staged.as_ref().unwrap_or(tensor))
            .collect();
        let exec_ctx = ExecContext {
            op,
            params,
            inputs: &refs,
            outputs: &output_descs,
        };
        let produced = executor
            .execute(&exec_ctx)
            .map_err(|err| err.with_backend(&backend).with_op(op))
            .with_context(|| format!("executing {op} with {}", executor.name()))?;
        check_outputs(op, &produced, &output_descs)?;

        self.last_layer = Some(BoundKernel {
            node: None,
            op,
            dtype: descs[0].dtype,
            backend,
            executor: executor.name().to_string(),
        });
        produced
            .into_iter()
            .map(|tensor| canonicalize(tensor).map_err(anyhow::Error::from))
            .collect()
    }
}
