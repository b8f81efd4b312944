use super::{GraphPass, PassContext, PassError, PassResult};
use crate::ir::{ExportOp, Graph, GraphRewriter, Operation};

/// Cleanup over exchange operators: drops `Identity` and cancels `Transpose` pairs.
#[derive(Default)]
pub struct ExportPeepholePass;

impl ExportPeepholePass {
    const NAME: &'static str = "export-peephole";
}

impl GraphPass for ExportPeepholePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut PassContext<'_>) -> Result<PassResult, PassError> {
        let mut rewriter = GraphRewriter::new(graph)?;
        let mut stats = PassResult {
            iterations: 1,
            ..PassResult::default()
        };

        for id in rewriter.nodes_in_order() {
            let Some(node) = rewriter.node(id) else {
                continue;
            };
            let source = match &node.op {
                Operation::Export(ExportOp::Identity) => Some(node.inputs[0]),
                Operation::Export(ExportOp::Transpose) => match rewriter.producer_op(node.inputs[0]) {
                    Some((inner, Operation::Export(ExportOp::Transpose))) => {
                        rewriter.node(inner).map(|inner| inner.inputs[0])
                    }
                    _ => None,
                },
                _ => None,
            };
            if let Some(source) = source {
                rewriter.forward_to(id, source)?;
                stats.changed = true;
                stats.rewrites_applied += 1;
                stats.erased_nodes += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::export_peephole;

    #[test]
    fn identity_and_transpose_pairs_disappear() {
        let mut graph = Graph::new("g");
        let x = graph.add_input(None).unwrap();
        let i = graph.push(Operation::Export(ExportOp::Identity), &[x]).unwrap();
        let t1 = graph.push(Operation::Export(ExportOp::Transpose), &[i]).unwrap();
        let t2 = graph.push(Operation::Export(ExportOp::Transpose), &[t1]).unwrap();
        let y = graph.push(Operation::Export(ExportOp::Exp), &[t2]).unwrap();
        graph.set_outputs(vec![y]).unwrap();

        let stats = export_peephole(&mut graph).unwrap();
        assert_eq!(stats.rewrites_applied, 2);
        let exp = graph.producer(y).unwrap();
        assert_eq!(graph.node(exp).unwrap().inputs, vec![x]);
    }
}
