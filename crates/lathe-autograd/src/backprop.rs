//! Reverse-mode symbolic differentiation.
//!
//! Gradients are built as new nodes in the same graph. Each node visited in
//! reverse topological order sums the contributions routed to it by its
//! consumers, then asks its operation for the per-operand derivatives.

use lathe_graph::{Graph, GraphError, NodeId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::analysis::{affected_by, affects_output, NodeSet};
use crate::{AutogradError, DiffOptions, Result};

/// Gradients of `outputs` (seeded with `seeds`, one per output) with respect to
/// each node of `targets`, in target order.
///
/// A seed must have its output's dtype and either its shape or a shape that
/// broadcasts to it (a scalar one seeds any output).
pub fn differentiate(
    graph: &mut Graph,
    outputs: &[NodeId],
    seeds: &[NodeId],
    targets: &[NodeId],
    options: &DiffOptions,
) -> Result<Vec<NodeId>> {
    differentiate_multi(graph, &[outputs], &[seeds], targets, options)
}

/// Differentiate several output groups in one traversal.
///
/// Contributions from every group meet at shared operands, so each shared node
/// gets a single accumulated gradient instead of one per group.
pub fn differentiate_multi(
    graph: &mut Graph,
    outputs_list: &[&[NodeId]],
    seeds_list: &[&[NodeId]],
    targets: &[NodeId],
    options: &DiffOptions,
) -> Result<Vec<NodeId>> {
    if outputs_list.len() != seeds_list.len() {
        return Err(AutogradError::SeedCount {
            outputs: outputs_list.len(),
            seeds: seeds_list.len(),
        });
    }
    let mut pairs = Vec::new();
    for (outputs, seeds) in outputs_list.iter().zip(seeds_list) {
        if outputs.len() != seeds.len() {
            return Err(AutogradError::SeedCount {
                outputs: outputs.len(),
                seeds: seeds.len(),
            });
        }
        pairs.extend(outputs.iter().copied().zip(seeds.iter().copied()));
    }
    Backprop::new(graph, options).run(&pairs, targets)
}

/// Gradient of a scalar `cost` with respect to `targets`, seeded with one.
pub fn grad(
    graph: &mut Graph,
    cost: NodeId,
    targets: &[NodeId],
    options: &DiffOptions,
) -> Result<Vec<NodeId>> {
    let node = graph.node(cost)?;
    if !node.shape().is_scalar() {
        return Err(AutogradError::NonScalarCost(cost));
    }
    let one = graph.scalar(1.0, node.dtype());
    differentiate(graph, &[cost], &[one], targets, options)
}

struct Backprop<'a> {
    graph: &'a mut Graph,
    options: &'a DiffOptions,
    /// Contributions not yet summed, keyed by the node they flow into.
    pending: FxHashMap<NodeId, SmallVec<[NodeId; 2]>>,
    /// Final accumulated gradient per visited node.
    grads: FxHashMap<NodeId, NodeId>,
}

impl<'a> Backprop<'a> {
    fn new(graph: &'a mut Graph, options: &'a DiffOptions) -> Self {
        Self {
            graph,
            options,
            pending: FxHashMap::default(),
            grads: FxHashMap::default(),
        }
    }

    fn run(mut self, pairs: &[(NodeId, NodeId)], targets: &[NodeId]) -> Result<Vec<NodeId>> {
        let sorted = self.graph.topological_sort()?;
        let outputs: Vec<NodeId> = pairs.iter().map(|&(o, _)| o).collect();

        let affects = affects_output(self.graph, &sorted, &outputs)?;
        for &t in targets {
            self.graph.node(t)?;
            if !affects.contains(&t) {
                return Err(AutogradError::DisconnectedGradient { target: t });
            }
        }
        let affected = affected_by(self.graph, &sorted, targets)?;
        // Only float nodes on some target → output path carry a gradient.
        let mut active = NodeSet::default();
        for &id in affects.intersection(&affected) {
            if self.graph.node(id)?.dtype().is_float() {
                active.insert(id);
            }
        }

        for &(output, seed) in pairs {
            let seed = self.check_seed(output, seed)?;
            if active.contains(&output) {
                self.pending.entry(output).or_default().push(seed);
            }
        }

        for &id in sorted.iter().rev() {
            if !active.contains(&id) {
                continue;
            }
            let Some(contributions) = self.pending.remove(&id) else {
                continue;
            };
            let grad = self.accumulate(&contributions)?;
            self.grads.insert(id, grad);
            self.graph.set_deriv_of(grad, id)?;
            self.visit(id, grad, &active)?;
        }

        let mut result = Vec::with_capacity(targets.len());
        for &t in targets {
            match self.grads.get(&t) {
                Some(&g) => result.push(g),
                None => return Err(AutogradError::DisconnectedGradient { target: t }),
            }
        }
        tracing::debug!(
            outputs = outputs.len(),
            targets = targets.len(),
            visited = self.grads.len(),
            nodes = self.graph.len(),
            "backpropagation done"
        );
        Ok(result)
    }

    /// Route `grad` (the gradient of `id`) to `id`'s operands.
    fn visit(&mut self, id: NodeId, grad: NodeId, active: &NodeSet) -> Result<()> {
        let node = self.graph.node(id)?;
        let Some(op) = node.op().cloned() else {
            return Ok(());
        };
        let operands: SmallVec<[NodeId; 2]> = node.operands().into();
        if operands.is_empty() {
            return Ok(());
        }
        let wrt = op.diff_wrt(operands.len());
        let wanted = |i: usize| wrt.get(i).copied().unwrap_or(false) && active.contains(&operands[i]);
        if !(0..operands.len()).any(wanted) {
            return Ok(());
        }

        let derived = if self.options.stabilization {
            op.stabilized_sym_diff(self.graph, &operands, id, grad)
        } else {
            None
        };
        let derivs = derived
            .unwrap_or_else(|| op.sym_diff(self.graph, &operands, id, grad))
            .map_err(|e| match e {
                GraphError::NotDifferentiable { op } => AutogradError::NotDifferentiable { node: id, op },
                other => other.into(),
            })?;

        tracing::trace!(node = %id, op = %op, grad = %grad, "visit");
        for (i, d) in derivs.into_iter().enumerate() {
            if let Some(d) = d.filter(|_| i < operands.len() && wanted(i)) {
                self.pending.entry(operands[i]).or_default().push(d);
            }
        }
        Ok(())
    }

    /// Sum contributions with a chain of add nodes; a single one passes through.
    fn accumulate(&mut self, contributions: &[NodeId]) -> Result<NodeId> {
        let (&first, rest) = contributions
            .split_first()
            .ok_or(GraphError::Arity {
                op: "accumulate".into(),
                expected: "at least 1".into(),
                got: 0,
            })?;
        let mut acc = first;
        for &c in rest {
            acc = self.graph.add(acc, c)?;
        }
        Ok(acc)
    }

    fn check_seed(&mut self, output: NodeId, seed: NodeId) -> Result<NodeId> {
        let o = self.graph.node(output)?;
        let s = self.graph.node(seed)?;
        if s.dtype() != o.dtype() || !s.shape().broadcasts_to(o.shape()) {
            return Err(AutogradError::SeedLayout {
                seed,
                seed_dtype: s.dtype(),
                seed_shape: s.shape().clone(),
                output,
                dtype: o.dtype(),
                shape: o.shape().clone(),
            });
        }
        let shape = o.shape().clone();
        Ok(self.graph.fit_to_shape(seed, &shape)?)
    }
}
