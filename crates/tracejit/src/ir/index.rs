use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use super::graph::Graph;
use super::spec::{NodeId, ValueId};
use crate::error::GraphInvariantError;

/// Def-use index over a graph. Each consuming node appears once per value, however many
/// operand slots it uses the value in.
#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    users: HashMap<ValueId, SmallVec<[NodeId; 4]>>,
}

impl GraphIndex {
    /// Indexes `graph`, rejecting uses of values that are not yet defined.
    pub fn build(graph: &Graph) -> Result<Self, GraphInvariantError> {
        let mut defined: HashSet<ValueId> = graph.inputs().iter().copied().collect();
        let mut users: HashMap<ValueId, SmallVec<[NodeId; 4]>> = HashMap::new();

        for (id, node) in graph.nodes() {
            for value in &node.inputs {
                if !defined.contains(value) {
                    return Err(GraphInvariantError::UseBeforeDef {
                        node: id,
                        value: *value,
                    });
                }
                let entry = users.entry(*value).or_default();
                if !entry.contains(&id) {
                    entry.push(id);
                }
            }
            for value in &node.outputs {
                if !defined.insert(*value) {
                    return Err(GraphInvariantError::DuplicateDefinition { value: *value });
                }
            }
        }

        for value in graph.outputs() {
            if !defined.contains(value) {
                return Err(GraphInvariantError::UndefinedOutput { value: *value });
            }
        }

        Ok(Self { users })
    }

    pub fn users_of(&self, value: ValueId) -> &[NodeId] {
        self.users.get(&value).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub(crate) fn add_user(&mut self, value: ValueId, node: NodeId) {
        let entry = self.users.entry(value).or_default();
        if !entry.contains(&node) {
            entry.push(node);
        }
    }

    pub(crate) fn remove_user(&mut self, value: ValueId, node: NodeId) {
        if let Some(entry) = self.users.get_mut(&value) {
            entry.retain(|user| *user != node);
            if entry.is_empty() {
                self.users.remove(&value);
            }
        }
    }

    pub(crate) fn clear_users(&mut self, value: ValueId) {
        self.users.remove(&value);
    }
}
