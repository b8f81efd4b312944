use std::fmt;

use super::graph::Graph;
use super::spec::ValueId;

fn write_value(f: &mut fmt::Formatter<'_>, graph: &Graph, value: ValueId) -> fmt::Result {
    match graph.value_type(value) {
        Some(ty) => write!(f, "{value}: {ty}"),
        None => write!(f, "{value}"),
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, values: &[ValueId]) -> fmt::Result {
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{value}")?;
    }
    Ok(())
}

/// Human-readable dump, one node per line in topological order.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph {}(", self.name())?;
        for (idx, value) in self.inputs().iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write_value(f, self, *value)?;
        }
        writeln!(f, ") {{")?;
        for (id, node) in self.nodes() {
            write!(f, "  ")?;
            for (idx, value) in node.outputs.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write_value(f, self, *value)?;
            }
            write!(f, " = {}(", node.op)?;
            write_list(f, &node.inputs)?;
            write!(f, ")")?;
            if !node.attrs.is_empty() {
                write!(f, " {{")?;
                for (idx, (key, attr)) in node.attrs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}={attr}")?;
                }
                write!(f, "}}")?;
            }
            writeln!(f, "  // {id}")?;
        }
        write!(f, "  return (")?;
        write_list(f, self.outputs())?;
        writeln!(f, ")")?;
        write!(f, "}}")
    }
}
