//! Execution graph of operator and value nodes.
//!
//! All nodes live in one arena and refer to each other by [`NodeId`]. Operators are recorded in
//! the order they are declared, and that order is the execution order: every consumer must be
//! declared after the producer of each value it reads. The graph never sorts; it rejects any
//! wiring that would break the invariant at the moment the edge is added.

mod node;

use smallvec::smallvec;
use thiserror::Error;

use crate::ops::{OpKind, OpParams};
use crate::tensor::{Tensor, TensorDesc};

pub use node::{Node, NodeId, OperatorNode, Port, ValueNode, ValueRole};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("node {node} is not {expected}")]
    WrongKind { node: NodeId, expected: &'static str },
    #[error("{op} takes {min}..={max} inputs and {outputs} outputs, declared {inputs_declared} and {outputs_declared}")]
    Arity {
        op: OpKind,
        min: usize,
        max: usize,
        outputs: usize,
        inputs_declared: usize,
        outputs_declared: usize,
    },
    #[error("{op} cannot take parameters {params:?}")]
    ParamsMismatch { op: OpKind, params: OpParams },
    #[error("operator {op} has no {direction} slot {slot}")]
    SlotOutOfRange {
        op: NodeId,
        direction: &'static str,
        slot: usize,
    },
    #[error("{direction} slot {slot} of operator {op} is already connected")]
    SlotTaken {
        op: NodeId,
        direction: &'static str,
        slot: usize,
    },
    #[error("operator {consumer} reads value {value} before any earlier operator produces it")]
    ConsumerBeforeProducer { consumer: NodeId, value: NodeId },
    #[error("value {value} already has producer {existing}")]
    MultipleProducers { value: NodeId, existing: NodeId },
    #[error("value {value} is a graph input or constant and cannot be produced by an operator")]
    NotProducible { value: NodeId },
    #[error("{direction} slot {slot} of operator {op} is not connected")]
    Unconnected {
        op: NodeId,
        direction: &'static str,
        slot: usize,
    },
}

/// Arena-backed directed acyclic graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    operators: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn push_value(&mut self, desc: TensorDesc, role: ValueRole, data: Option<Tensor>) -> NodeId {
        self.push(Node::Value(ValueNode {
            desc,
            role,
            producer: None,
            consumers: smallvec![],
            data,
        }))
    }

    /// Value fed by the caller at run time.
    pub fn add_input(&mut self, desc: TensorDesc) -> NodeId {
        self.push_value(desc, ValueRole::Input, None)
    }

    /// Value that an operator declared later will produce.
    pub fn add_value(&mut self, desc: TensorDesc) -> NodeId {
        self.push_value(desc, ValueRole::Intermediate, None)
    }

    /// Zero-input value node wrapping constant data.
    pub fn add_constant(&mut self, tensor: Tensor) -> NodeId {
        let desc = tensor.desc().clone();
        self.push_value(desc, ValueRole::Constant, Some(tensor))
    }

    /// Records an operator with fixed input and output arity.
    pub fn begin_operator(
        &mut self,
        op: OpKind,
        params: OpParams,
        input_count: usize,
        output_count: usize,
    ) -> Result<NodeId, GraphError> {
        let (min, max, outputs) = op.arity();
        if input_count < min || input_count > max || output_count != outputs {
            return Err(GraphError::Arity {
                op,
                min,
                max,
                outputs,
                inputs_declared: input_count,
                outputs_declared: output_count,
            });
        }
        if !params.matches(op) {
            return Err(GraphError::ParamsMismatch { op, params });
        }
        let position = self.operators.len();
        let id = self.push(Node::Operator(OperatorNode {
            op,
            params,
            position,
            inputs: smallvec![None; input_count],
            outputs: smallvec![None; output_count],
        }));
        self.operators.push(id);
        Ok(id)
    }

    /// Wires `value` into input `slot` of `op`.
    ///
    /// The value must already be available: a graph input, a constant, or the output of an
    /// operator declared before `op`.
    pub fn connect_input(&mut self, op: NodeId, value: NodeId, slot: usize) -> Result<(), GraphError> {
        let operator = self.operator(op)?;
        let position = operator.position;
        match operator.inputs.get(slot) {
            None => {
                return Err(GraphError::SlotOutOfRange {
                    op,
                    direction: "input",
                    slot,
                })
            }
            Some(Some(_)) => {
                return Err(GraphError::SlotTaken {
                    op,
                    direction: "input",
                    slot,
                })
            }
            Some(None) => {}
        }
        let target = self.value(value)?;
        if !target.is_available() {
            return Err(GraphError::ConsumerBeforeProducer {
                consumer: op,
                value,
            });
        }
        if let Some((producer, _)) = target.producer {
            if self.operator(producer)?.position >= position {
                return Err(GraphError::ConsumerBeforeProducer {
                    consumer: op,
                    value,
                });
            }
        }

        if let Node::Operator(operator) = &mut self.nodes[op.index()] {
            operator.inputs[slot] = Some(value);
        }
        if let Node::Value(target) = &mut self.nodes[value.index()] {
            target.consumers.push((op, slot));
        }
        Ok(())
    }

    /// Wires output `slot` of `op` to `value`, making `op` its only producer.
    pub fn connect_output(&mut self, op: NodeId, value: NodeId, slot: usize) -> Result<(), GraphError> {
        let operator = self.operator(op)?;
        match operator.outputs.get(slot) {
            None => {
                return Err(GraphError::SlotOutOfRange {
                    op,
                    direction: "output",
                    slot,
                })
            }
            Some(Some(_)) => {
                return Err(GraphError::SlotTaken {
                    op,
                    direction: "output",
                    slot,
                })
            }
            Some(None) => {}
        }
        let target = self.value(value)?;
        if target.role != ValueRole::Intermediate {
            return Err(GraphError::NotProducible { value });
        }
        if let Some((existing, _)) = target.producer {
            return Err(GraphError::MultipleProducers { value, existing });
        }
        if let Some(&(consumer, _)) = target.consumers.first() {
            return Err(GraphError::ConsumerBeforeProducer { consumer, value });
        }

        if let Node::Operator(operator) = &mut self.nodes[op.index()] {
            operator.outputs[slot] = Some(value);
        }
        if let Node::Value(target) = &mut self.nodes[value.index()] {
            target.producer = Some((op, slot));
        }
        Ok(())
    }

    /// Wraps `tensor` in a constant node and wires it into `slot` of `op`.
    pub fn connect_constant(&mut self, op: NodeId, tensor: Tensor, slot: usize) -> Result<NodeId, GraphError> {
        self.operator(op)?;
        let value = self.add_constant(tensor);
        self.connect_input(op, value, slot)?;
        Ok(value)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(id.index()).ok_or(GraphError::UnknownNode(id))
    }

    pub fn operator(&self, id: NodeId) -> Result<&OperatorNode, GraphError> {
        match self.node(id)? {
            Node::Operator(operator) => Ok(operator),
            Node::Value(_) => Err(GraphError::WrongKind {
                node: id,
                expected: "an operator",
            }),
        }
    }

    pub fn value(&self, id: NodeId) -> Result<&ValueNode, GraphError> {
        match self.node(id)? {
            Node::Value(value) => Ok(value),
            Node::Operator(_) => Err(GraphError::WrongKind {
                node: id,
                expected: "a value",
            }),
        }
    }

    /// Operators in declaration order.
    pub fn operators(&self) -> &[NodeId] {
        &self.operators
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn values(&self) -> impl Iterator<Item = (NodeId, &ValueNode)> {
        self.nodes.iter().enumerate().filter_map(|(idx, node)| match node {
            Node::Value(value) => Some((NodeId(idx as u32), value)),
            Node::Operator(_) => None,
        })
    }

    /// Checks that every declared slot is wired and that producers precede consumers.
    pub fn validate(&self) -> Result<(), GraphError> {
        for &op in &self.operators {
            let operator = self.operator(op)?;
            for (slot, input) in operator.inputs.iter().enumerate() {
                let value = input.ok_or(GraphError::Unconnected {
                    op,
                    direction: "input",
                    slot,
                })?;
                if let Some((producer, _)) = self.value(value)?.producer {
                    if self.operator(producer)?.position >= operator.position {
                        return Err(GraphError::ConsumerBeforeProducer {
                            consumer: op,
                            value,
                        });
                    }
                }
            }
            for (slot, output) in operator.outputs.iter().enumerate() {
                if output.is_none() {
                    return Err(GraphError::Unconnected {
                        op,
                        direction: "output",
                        slot,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn desc() -> TensorDesc {
        TensorDesc::new(DType::F32, [1, 4])
    }

    #[test]
    fn edges_update_both_endpoints() {
        let mut graph = Graph::new();
        let x = graph.add_input(desc());
        let y = graph.add_value(desc());
        let relu = graph.begin_operator(OpKind::Relu, OpParams::None, 1, 1).unwrap();
        graph.connect_input(relu, x, 0).unwrap();
        graph.connect_output(relu, y, 0).unwrap();

        assert_eq!(graph.value(x).unwrap().consumers.as_slice(), &[(relu, 0)]);
        assert_eq!(graph.value(y).unwrap().producer, Some((relu, 0)));
        assert_eq!(graph.operator(relu).unwrap().inputs[0], Some(x));
        graph.validate().unwrap();
    }

    #[test]
    fn consumer_declared_before_producer_is_rejected() {
        let mut graph = Graph::new();
        let x = graph.add_input(desc());
        let mid = graph.add_value(desc());
        let consumer = graph.begin_operator(OpKind::Relu, OpParams::None, 1, 1).unwrap();
        let err = graph.connect_input(consumer, mid, 0).unwrap_err();
        assert_eq!(err, GraphError::ConsumerBeforeProducer { consumer, value: mid });

        // Producer declared after the consumer is still out of order.
        let producer = graph.begin_operator(OpKind::Relu, OpParams::None, 1, 1).unwrap();
        graph.connect_input(producer, x, 0).unwrap();
        graph.connect_output(producer, mid, 0).unwrap();
        assert!(matches!(
            graph.connect_input(consumer, mid, 0),
            Err(GraphError::ConsumerBeforeProducer { .. })
        ));
    }

    #[test]
    fn a_value_has_one_producer() {
        let mut graph = Graph::new();
        let x = graph.add_input(desc());
        let y = graph.add_value(desc());
        let first = graph.begin_operator(OpKind::Relu, OpParams::None, 1, 1).unwrap();
        let second = graph.begin_operator(OpKind::Relu, OpParams::None, 1, 1).unwrap();
        graph.connect_input(first, x, 0).unwrap();
        graph.connect_input(second, x, 0).unwrap();
        graph.connect_output(first, y, 0).unwrap();
        assert_eq!(
            graph.connect_output(second, y, 0).unwrap_err(),
            GraphError::MultipleProducers { value: y, existing: first }
        );
        assert_eq!(
            graph.connect_output(second, x, 0).unwrap_err(),
            GraphError::NotProducible { value: x }
        );
    }

    #[test]
    fn arity_and_params_are_checked() {
        let mut graph = Graph::new();
        assert!(matches!(
            graph.begin_operator(OpKind::Add, OpParams::None, 1, 1),
            Err(GraphError::Arity { .. })
        ));
        assert!(matches!(
            graph.begin_operator(OpKind::Conv2d, OpParams::None, 2, 1),
            Err(GraphError::ParamsMismatch { .. })
        ));
        assert!(graph.operators().is_empty());
    }

    #[test]
    fn validate_reports_unconnected_slots() {
        let mut graph = Graph::new();
        let x = graph.add_input(desc());
        let add = graph.begin_operator(OpKind::Add, OpParams::None, 2, 1).unwrap();
        graph.connect_input(add, x, 0).unwrap();
        assert!(matches!(
            graph.validate(),
            Err(GraphError::Unconnected { direction: "input", slot: 1, .. })
        ));
    }
}
