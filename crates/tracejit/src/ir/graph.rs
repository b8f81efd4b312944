use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::spec::{Attr, NodeId, Operation, TensorSpec, ValueId};
use crate::error::GraphInvariantError;
use crate::hashing;

/// Where a value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueDef {
    Input { index: usize },
    Node { node: NodeId, output: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
    pub ty: Option<TensorSpec>,
    pub def: ValueDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Operation,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub attrs: BTreeMap<String, Attr>,
}

impl Node {
    /// Builds a detached node, used by backends and fused-kernel evaluation.
    pub fn detached(op: Operation, inputs: Vec<ValueId>, outputs: Vec<ValueId>) -> Self {
        Self {
            op,
            inputs,
            outputs,
            attrs: BTreeMap::new(),
        }
    }
}

/// SSA dataflow graph with an arena of nodes and an explicit topological order.
///
/// Node and value ids are never reused, so ids held across a rewrite either still name
/// the same entity or name nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    name: String,
    values: Vec<Option<ValueRecord>>,
    nodes: Vec<Option<Node>>,
    order: Vec<NodeId>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    frozen: bool,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            nodes: Vec::new(),
            order: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            frozen: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Forbids further appends through the public builder API.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn add_input(&mut self, ty: Option<TensorSpec>) -> Result<ValueId, GraphInvariantError> {
        self.ensure_mutable()?;
        let index = self.inputs.len();
        let value = self.alloc_value(ty, ValueDef::Input { index });
        self.inputs.push(value);
        Ok(value)
    }

    /// Appends a node with untyped outputs and returns its first output.
    pub fn push(
        &mut self,
        op: Operation,
        inputs: &[ValueId],
    ) -> Result<ValueId, GraphInvariantError> {
        let node = self.push_node(op, inputs.to_vec(), BTreeMap::new(), Vec::new())?;
        self.node(node)
            .and_then(|entry| entry.outputs.first().copied())
            .ok_or(GraphInvariantError::MissingNode { node })
    }

    /// Appends a node at the end of the topological order.
    ///
    /// `output_types` may be shorter than the operator's output count; missing entries are
    /// recorded as unknown.
    pub fn push_node(
        &mut self,
        op: Operation,
        inputs: Vec<ValueId>,
        attrs: BTreeMap<String, Attr>,
        output_types: Vec<Option<TensorSpec>>,
    ) -> Result<NodeId, GraphInvariantError> {
        self.ensure_mutable()?;
        let pos = self.order.len();
        self.insert_node_at(pos, op, inputs, attrs, output_types)
    }

    pub fn set_outputs(&mut self, outputs: Vec<ValueId>) -> Result<(), GraphInvariantError> {
        self.ensure_mutable()?;
        for value in &outputs {
            if self.value(*value).is_none() {
                return Err(GraphInvariantError::UndefinedOutput { value: *value });
            }
        }
        self.outputs = outputs;
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn value(&self, id: ValueId) -> Option<&ValueRecord> {
        self.values.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn value_type(&self, id: ValueId) -> Option<&TensorSpec> {
        self.value(id).and_then(|record| record.ty.as_ref())
    }

    /// Node producing `value`, or `None` for graph inputs and unknown values.
    pub fn producer(&self, value: ValueId) -> Option<NodeId> {
        match self.value(value)?.def {
            ValueDef::Node { node, .. } => Some(node),
            ValueDef::Input { .. } => None,
        }
    }

    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Live nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.node(*id).map(|node| (*id, node)))
    }

    pub fn num_nodes(&self) -> usize {
        self.order.len()
    }

    pub fn num_values(&self) -> usize {
        self.values.iter().filter(|slot| slot.is_some()).count()
    }

    /// Counts live nodes whose operator name matches `name`.
    pub fn count_op(&self, name: &str) -> usize {
        self.nodes().filter(|(_, node)| node.op.name() == name).count()
    }

    /// Structural fingerprint used as a cache key. Ignores the graph name.
    pub fn fingerprint(&self) -> Option<u64> {
        let input_types: Vec<Option<&TensorSpec>> =
            self.inputs.iter().map(|value| self.value_type(*value)).collect();
        let body: Vec<&Node> = self.nodes().map(|(_, node)| node).collect();
        hashing::fingerprint(&(&self.inputs, input_types, body, &self.outputs))
    }

    pub(crate) fn node_slots(&self) -> &[Option<Node>] {
        &self.nodes
    }

    pub(crate) fn value_slots(&self) -> &[Option<ValueRecord>] {
        &self.values
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut Vec<ValueId> {
        &mut self.outputs
    }

    pub(crate) fn replace_outputs(&mut self, outputs: Vec<ValueId>) {
        self.outputs = outputs;
    }

    pub(crate) fn set_value_type(&mut self, id: ValueId, ty: Option<TensorSpec>) {
        if let Some(Some(record)) = self.values.get_mut(id.0 as usize) {
            record.ty = ty;
        }
    }

    pub(crate) fn alloc_value(&mut self, ty: Option<TensorSpec>, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Some(ValueRecord { ty, def }));
        id
    }

    /// Inserts a node at `pos` in the topological order, allocating its outputs.
    pub(crate) fn insert_node_at(
        &mut self,
        pos: usize,
        op: Operation,
        inputs: Vec<ValueId>,
        attrs: BTreeMap<String, Attr>,
        mut output_types: Vec<Option<TensorSpec>>,
    ) -> Result<NodeId, GraphInvariantError> {
        let id = NodeId(self.nodes.len() as u32);
        for value in &inputs {
            if self.value(*value).is_none() {
                return Err(GraphInvariantError::DanglingValue {
                    node: id,
                    value: *value,
                });
            }
        }
        let expected = op.num_inputs();
        if inputs.len() != expected {
            return Err(GraphInvariantError::ArityMismatch {
                node: id,
                op: op.name().to_string(),
                role: "inputs",
                expected,
                actual: inputs.len(),
            });
        }
        let num_outputs = op.num_outputs();
        output_types.resize(num_outputs, None);
        let outputs = output_types
            .into_iter()
            .enumerate()
            .map(|(output, ty)| self.alloc_value(ty, ValueDef::Node { node: id, output }))
            .collect();
        self.nodes.push(Some(Node {
            op,
            inputs,
            outputs,
            attrs,
        }));
        self.order.insert(pos.min(self.order.len()), id);
        Ok(id)
    }

    /// Removes a node and the records of its outputs. Callers check for remaining users.
    pub(crate) fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.get_mut(id.0 as usize)?.take()?;
        self.order.retain(|entry| *entry != id);
        for value in &node.outputs {
            if let Some(slot) = self.values.get_mut(value.0 as usize) {
                *slot = None;
            }
        }
        Some(node)
    }

    /// Removes many nodes with a single pass over the order.
    pub(crate) fn remove_nodes(&mut self, ids: &std::collections::HashSet<NodeId>) -> usize {
        let mut removed = 0;
        for id in ids {
            if let Some(node) = self.nodes.get_mut(id.0 as usize).and_then(Option::take) {
                for value in &node.outputs {
                    if let Some(slot) = self.values.get_mut(value.0 as usize) {
                        *slot = None;
                    }
                }
                removed += 1;
            }
        }
        self.order.retain(|entry| !ids.contains(entry));
        removed
    }

    fn ensure_mutable(&self) -> Result<(), GraphInvariantError> {
        if self.frozen {
            Err(GraphInvariantError::Frozen)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::spec::{BinaryOp, Literal, UnaryOp};

    #[test]
    fn push_allocates_fresh_values_in_order() {
        let mut graph = Graph::new("g");
        let x = graph.add_input(None).unwrap();
        let c = graph
            .push(Operation::Constant(Literal::Scalar(2.0)), &[])
            .unwrap();
        let y = graph.push(Operation::Binary(BinaryOp::Mul), &[x, c]).unwrap();
        graph.set_outputs(vec![y]).unwrap();

        assert_eq!(graph.num_nodes(), 2);
        assert_eq!(graph.producer(x), None);
        assert!(graph.producer(y).is_some());
        assert_eq!(graph.outputs(), &[y]);
    }

    #[test]
    fn frozen_graph_rejects_appends() {
        let mut graph = Graph::new("g");
        let x = graph.add_input(None).unwrap();
        graph.freeze();
        let err = graph.push(Operation::Unary(UnaryOp::Neg), &[x]).unwrap_err();
        assert_eq!(err, GraphInvariantError::Frozen);
    }

    #[test]
    fn arity_is_checked_on_append() {
        let mut graph = Graph::new("g");
        let x = graph.add_input(None).unwrap();
        let err = graph
            .push(Operation::Binary(BinaryOp::Add), &[x])
            .unwrap_err();
        assert!(matches!(err, GraphInvariantError::ArityMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn removed_node_ids_are_not_reused() {
        let mut graph = Graph::new("g");
        let x = graph.add_input(None).unwrap();
        let y = graph.push(Operation::Unary(UnaryOp::Neg), &[x]).unwrap();
        let node = graph.producer(y).unwrap();
        graph.remove_node(node);
        let z = graph.push(Operation::Unary(UnaryOp::Abs), &[x]).unwrap();
        assert_ne!(graph.producer(z), Some(node));
        assert!(graph.value(y).is_none());
    }

    #[test]
    fn fingerprint_ignores_name() {
        let build = |name: &str| {
            let mut graph = Graph::new(name);
            let x = graph.add_input(None).unwrap();
            let y = graph.push(Operation::Unary(UnaryOp::Exp), &[x]).unwrap();
            graph.set_outputs(vec![y]).unwrap();
            graph
        };
        assert_eq!(build("a").fingerprint(), build("b").fingerprint());
    }
}
