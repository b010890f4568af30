//! Reachability over a topologically sorted node list.

use lathe_graph::{Graph, NodeId};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{AutogradError, Result};

pub type NodeSet = FxHashSet<NodeId>;

/// Nodes with a directed path to some node of `outputs` (outputs included).
///
/// Walks `sorted` in reverse: a node belongs to the set if it is an output or
/// any of its consumers already does.
pub fn affects_output(graph: &Graph, sorted: &[NodeId], outputs: &[NodeId]) -> Result<NodeSet> {
    check_order(graph, sorted)?;
    let consumers = graph.consumers(sorted);
    let frontier: NodeSet = outputs.iter().copied().collect();

    let mut set = NodeSet::default();
    for &id in sorted.iter().rev() {
        let reaches = frontier.contains(&id)
            || consumers
                .get(&id)
                .is_some_and(|cs| cs.iter().any(|c| set.contains(c)));
        if reaches {
            set.insert(id);
        }
    }
    tracing::debug!(outputs = outputs.len(), size = set.len(), "affects-output analysis");
    Ok(set)
}

/// Nodes with a directed path from some node of `inputs` (inputs included).
///
/// Walks `sorted` forward: a node belongs to the set if it is an input or any
/// of its operands already does.
pub fn affected_by(graph: &Graph, sorted: &[NodeId], inputs: &[NodeId]) -> Result<NodeSet> {
    check_order(graph, sorted)?;
    let frontier: NodeSet = inputs.iter().copied().collect();

    let mut set = NodeSet::default();
    for &id in sorted {
        let node = graph.node(id)?;
        if frontier.contains(&id) || node.operands().iter().any(|o| set.contains(o)) {
            set.insert(id);
        }
    }
    tracing::debug!(inputs = inputs.len(), size = set.len(), "affected-by analysis");
    Ok(set)
}

/// Reject lists in which some operand appears after its consumer.
fn check_order(graph: &Graph, sorted: &[NodeId]) -> Result<()> {
    let position: FxHashMap<NodeId, usize> =
        sorted.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    for (i, &id) in sorted.iter().enumerate() {
        for &operand in graph.node(id)?.operands() {
            if position.get(&operand).is_some_and(|&p| p >= i) {
                return Err(AutogradError::Topology { node: id, operand });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lathe_core::{DType, Shape};

    struct LogXY {
        g: Graph,
        x: NodeId,
        y: NodeId,
        z: NodeId,
        xy: NodeId,
        res: NodeId,
    }

    fn log_xy() -> LogXY {
        let mut g = Graph::new();
        let x = g.input("x", DType::F64, Shape::scalar());
        let y = g.input("y", DType::F64, Shape::scalar());
        let z = g.input("z", DType::F64, Shape::scalar());
        let xy = g.mul(x, y).unwrap();
        let res = g.log(xy).unwrap();
        LogXY { g, x, y, z, xy, res }
    }

    #[test]
    fn test_affected_by_excludes_unrelated() {
        let t = log_xy();
        let sorted = t.g.topological_sort().unwrap();
        let set = affected_by(&t.g, &sorted, &[t.x, t.y]).unwrap();
        assert!(set.contains(&t.x));
        assert!(set.contains(&t.y));
        assert!(set.contains(&t.xy));
        assert!(set.contains(&t.res));
        assert!(!set.contains(&t.z));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_affected_by_single_input() {
        let t = log_xy();
        let sorted = t.g.topological_sort().unwrap();
        let set = affected_by(&t.g, &sorted, &[t.y]).unwrap();
        assert!(!set.contains(&t.x));
        assert!(set.contains(&t.xy));
    }

    #[test]
    fn test_affects_output() {
        let t = log_xy();
        let sorted = t.g.topological_sort().unwrap();
        let set = affects_output(&t.g, &sorted, &[t.res]).unwrap();
        assert!(set.contains(&t.x));
        assert!(set.contains(&t.y));
        assert!(set.contains(&t.xy));
        assert!(set.contains(&t.res));
        assert!(!set.contains(&t.z));

        let set = affects_output(&t.g, &sorted, &[t.xy]).unwrap();
        assert!(!set.contains(&t.res));
    }

    #[test]
    fn test_reachability_passes_through_statements() {
        let mut t = log_xy();
        let r = t.g.read(t.res).unwrap();
        let e = t.g.exp(r).unwrap();
        let sorted = t.g.topological_sort().unwrap();

        let set = affected_by(&t.g, &sorted, &[t.x]).unwrap();
        assert!(set.contains(&r));
        assert!(set.contains(&e));
        let set = affects_output(&t.g, &sorted, &[e]).unwrap();
        assert!(set.contains(&r));
        assert!(set.contains(&t.x));
    }

    #[test]
    fn test_rejects_bad_order() {
        let t = log_xy();
        let mut sorted = t.g.topological_sort().unwrap();
        sorted.reverse();
        assert!(matches!(
            affects_output(&t.g, &sorted, &[t.res]),
            Err(AutogradError::Topology { .. })
        ));
        assert!(matches!(
            affected_by(&t.g, &sorted, &[t.x]),
            Err(AutogradError::Topology { .. })
        ));
    }
}
