use std::collections::BTreeMap;

use super::graph::{Graph, Node};
use super::index::GraphIndex;
use super::spec::{Attr, NodeId, Operation, TensorSpec, ValueId};
use crate::error::GraphInvariantError;

/// Mutable graph editor that keeps the def-use index in sync with every edit.
pub struct GraphRewriter<'a> {
    graph: &'a mut Graph,
    index: GraphIndex,
}

impl<'a> GraphRewriter<'a> {
    pub fn new(graph: &'a mut Graph) -> Result<Self, GraphInvariantError> {
        let index = GraphIndex::build(graph)?;
        Ok(Self { graph, index })
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.graph.node(id).is_some()
    }

    pub fn users_of(&self, value: ValueId) -> &[NodeId] {
        self.index.users_of(value)
    }

    pub fn is_graph_output(&self, value: ValueId) -> bool {
        self.graph.outputs().contains(&value)
    }

    pub fn set_value_type(&mut self, value: ValueId, ty: Option<TensorSpec>) {
        self.graph.set_value_type(value, ty);
    }

    /// Snapshot of the current topological order.
    pub fn nodes_in_order(&self) -> Vec<NodeId> {
        self.graph.order().to_vec()
    }

    /// Producer of `value` and the operator it runs, when `value` is a node output.
    pub fn producer_op(&self, value: ValueId) -> Option<(NodeId, &Operation)> {
        let node = self.graph.producer(value)?;
        self.graph.node(node).map(|entry| (node, &entry.op))
    }

    /// Rewires every consumer of `from`, including graph outputs, to read `to`.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        if from == to {
            return;
        }
        let consumers = self.index.users_of(from).to_vec();
        for user in consumers {
            if let Some(node) = self.graph.node_mut(user) {
                for input in &mut node.inputs {
                    if *input == from {
                        *input = to;
                    }
                }
            }
            self.index.add_user(to, user);
        }
        self.index.clear_users(from);
        for output in self.graph.outputs_mut() {
            if *output == from {
                *output = to;
            }
        }
    }

    /// Swaps the operand list of `id`, updating the user index.
    pub fn set_inputs(&mut self, id: NodeId, inputs: Vec<ValueId>) {
        let Some(node) = self.graph.node_mut(id) else {
            return;
        };
        let previous = std::mem::replace(&mut node.inputs, inputs.clone());
        for value in previous {
            self.index.remove_user(value, id);
        }
        for value in inputs {
            self.index.add_user(value, id);
        }
    }

    /// Removes a node whose outputs have no remaining users.
    pub fn erase_node(&mut self, id: NodeId) -> Result<(), GraphInvariantError> {
        let node = self
            .graph
            .node(id)
            .ok_or(GraphInvariantError::MissingNode { node: id })?;
        let has_users = node.outputs.iter().any(|value| {
            !self.index.users_of(*value).is_empty() || self.graph.outputs().contains(value)
        });
        if has_users {
            return Err(GraphInvariantError::NodeHasUsers { node: id });
        }
        if let Some(node) = self.graph.remove_node(id) {
            for value in &node.inputs {
                self.index.remove_user(*value, id);
            }
        }
        Ok(())
    }

    /// Inserts a node directly before `at` and returns its id and outputs.
    pub fn insert_before(
        &mut self,
        at: NodeId,
        op: Operation,
        inputs: Vec<ValueId>,
        attrs: BTreeMap<String, Attr>,
        output_types: Vec<Option<TensorSpec>>,
    ) -> Result<(NodeId, Vec<ValueId>), GraphInvariantError> {
        let pos = self
            .graph
            .order()
            .iter()
            .position(|entry| *entry == at)
            .ok_or(GraphInvariantError::MissingNode { node: at })?;
        let id = self
            .graph
            .insert_node_at(pos, op, inputs.clone(), attrs, output_types)?;
        for value in inputs {
            self.index.add_user(value, id);
        }
        let outputs = self
            .graph
            .node(id)
            .map(|node| node.outputs.clone())
            .unwrap_or_default();
        Ok((id, outputs))
    }

    /// Replaces `id` with a single new node of the same output count and erases it.
    pub fn replace_node(
        &mut self,
        id: NodeId,
        op: Operation,
        inputs: Vec<ValueId>,
    ) -> Result<NodeId, GraphInvariantError> {
        let (old_outputs, types) = {
            let node = self
                .graph
                .node(id)
                .ok_or(GraphInvariantError::MissingNode { node: id })?;
            let types = node
                .outputs
                .iter()
                .map(|value| self.graph.value_type(*value).cloned())
                .collect::<Vec<_>>();
            (node.outputs.clone(), types)
        };
        let (new_id, new_outputs) = self.insert_before(id, op, inputs, BTreeMap::new(), types)?;
        if new_outputs.len() != old_outputs.len() {
            return Err(GraphInvariantError::ArityMismatch {
                node: new_id,
                op: self
                    .graph
                    .node(new_id)
                    .map(|node| node.op.name().to_string())
                    .unwrap_or_default(),
                role: "outputs",
                expected: old_outputs.len(),
                actual: new_outputs.len(),
            });
        }
        for (from, to) in old_outputs.iter().zip(new_outputs.iter()) {
            self.replace_all_uses(*from, *to);
        }
        self.erase_node(id)?;
        Ok(new_id)
    }

    /// Forwards every output of `id` to `value` and erases the node.
    pub fn forward_to(&mut self, id: NodeId, value: ValueId) -> Result<(), GraphInvariantError> {
        let outputs = self
            .graph
            .node(id)
            .map(|node| node.outputs.clone())
            .ok_or(GraphInvariantError::MissingNode { node: id })?;
        for output in outputs {
            self.replace_all_uses(output, value);
        }
        self.erase_node(id)
    }
}
