//! Node records stored in the graph arena.

use smallvec::SmallVec;

use crate::ops::{OpKind, OpParams};
use crate::tensor::{Tensor, TensorDesc};

/// Stable index of a node inside one [`Graph`](super::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// `(node, slot)` end of an edge.
pub type Port = (NodeId, usize);

#[derive(Debug, Clone)]
pub struct OperatorNode {
    pub op: OpKind,
    pub params: OpParams,
    /// Index in declaration order, which is also execution order.
    pub position: usize,
    pub inputs: SmallVec<[Option<NodeId>; 4]>,
    pub outputs: SmallVec<[Option<NodeId>; 2]>,
}

/// How a value enters the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRole {
    /// Fed by the caller before each run.
    Input,
    /// Zero-input node carrying its data from construction.
    Constant,
    /// Produced by exactly one operator.
    Intermediate,
}

#[derive(Debug, Clone)]
pub struct ValueNode {
    pub desc: TensorDesc,
    pub role: ValueRole,
    pub producer: Option<Port>,
    pub consumers: SmallVec<[Port; 4]>,
    pub(crate) data: Option<Tensor>,
}

impl ValueNode {
    /// Data of a constant value.
    pub fn constant(&self) -> Option<&Tensor> {
        self.data.as_ref()
    }

    /// Whether consumers may read this value: it is fed externally or already produced.
    pub fn is_available(&self) -> bool {
        self.role != ValueRole::Intermediate || self.producer.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Operator(OperatorNode),
    Value(ValueNode),
}
