//! Uncompiled evaluation straight off the graph.

use lathe_core::{Device, Tensor};
use lathe_graph::{Graph, NodeId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{BoxError, Result, VmError};

/// Evaluate `targets` without compiling, using each operation's
/// value-producing strategy on the host.
///
/// Inputs must already carry bound values. Nodes run in the order a compiled
/// program for the same targets would use, gradient nodes accumulate into the
/// slots of the nodes they differentiate, and read statements and targets get
/// their values bound onto the graph.
pub fn evaluate(graph: &mut Graph, targets: &[NodeId]) -> Result<Vec<Tensor>> {
    let order = graph.topological_sort_from(targets)?;
    graph.clear_grads();

    let mut values: FxHashMap<NodeId, Tensor> = FxHashMap::default();
    for (index, &id) in order.iter().enumerate() {
        let value = eval_node(graph, &values, id).map_err(|source| VmError::Execution {
            index,
            node: id,
            source,
        })?;

        let node = graph.node(id)?;
        let deriv_of: SmallVec<[NodeId; 1]> = node.deriv_of().into();
        let is_statement = node.is_statement();
        for target in deriv_of {
            graph.accumulate_grad(target, &value)?;
        }
        if is_statement {
            graph.set_value(id, value.clone())?;
        }
        values.insert(id, value);
    }

    let mut out = Vec::with_capacity(targets.len());
    for &t in targets {
        let v = values.get(&t).cloned().ok_or(VmError::NoValue(t))?;
        graph.set_value(t, v.clone())?;
        out.push(v);
    }
    tracing::debug!(nodes = order.len(), targets = targets.len(), "local evaluation done");
    Ok(out)
}

fn eval_node(
    graph: &Graph,
    values: &FxHashMap<NodeId, Tensor>,
    id: NodeId,
) -> std::result::Result<Tensor, BoxError> {
    let node = graph.node(id)?;
    let Some(op) = node.op() else {
        let bound = node.value().ok_or(VmError::UnboundInput(id))?;
        return Ok(bound.to_device(Device::Cpu)?);
    };
    let inputs = node
        .operands()
        .iter()
        .map(|o| values.get(o).ok_or(VmError::NoValue(*o)))
        .collect::<Result<SmallVec<[&Tensor; 2]>>>()?;
    Ok(op.execute(&inputs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lathe_core::{DType, Shape};

    #[test]
    fn test_evaluate_binds_targets() {
        let mut g = Graph::new();
        let x = g.input("x", DType::F64, [2]);
        let e = g.exp(x).unwrap();
        let s = g.sum(e).unwrap();
        g.bind(x, Tensor::from_f64(&[0.0, 0.0], &[2])).unwrap();

        let out = evaluate(&mut g, &[s]).unwrap();
        assert_eq!(out[0].item().unwrap(), 2.0);
        assert_eq!(g.node(s).unwrap().value().unwrap().item().unwrap(), 2.0);
        assert!(g.node(e).unwrap().value().is_none());
    }

    #[test]
    fn test_evaluate_unbound_input() {
        let mut g = Graph::new();
        let x = g.input("x", DType::F64, Shape::scalar());
        let e = g.exp(x).unwrap();
        let err = evaluate(&mut g, &[e]).unwrap_err();
        assert!(matches!(err, VmError::Execution { index: 0, node, .. } if node == x));
    }
}
