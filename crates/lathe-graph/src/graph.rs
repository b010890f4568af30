use std::collections::VecDeque;
use std::hash::Hasher;
use std::sync::Arc;

use lathe_core::{DType, Shape, Tensor};
use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;

use crate::node::{Node, NodeId, NodeKind};
use crate::op::{Op, OpRef};
use crate::ops::Constant;
use crate::{GraphError, Result};

/// Reverse-edge map: node → the nodes that consume it as an operand.
pub type ConsumerMap = FxHashMap<NodeId, SmallVec<[NodeId; 4]>>;

/// Arena of nodes. Nodes reference operands by id; an operand always exists
/// before its consumer is created.
///
/// Applying an operation that is equal (same `hashcode` and `op_eq`) to one
/// already applied to the same operands returns the existing node.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    interned: FxHashMap<u64, SmallVec<[NodeId; 1]>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.index()).ok_or(GraphError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id.index()).ok_or(GraphError::UnknownNode(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Create an input leaf. Its value is supplied by binding before a run.
    pub fn input(&mut self, name: &str, dtype: DType, shape: impl Into<Shape>) -> NodeId {
        let id = self.next_id();
        self.nodes.push(Node {
            id,
            name: Some(name.to_string()),
            kind: NodeKind::Input,
            op: None,
            operands: SmallVec::new(),
            dtype,
            shape: shape.into(),
            value: None,
            grad: None,
            deriv_of: SmallVec::new(),
            derivative: None,
        });
        tracing::trace!(%id, name, "input node");
        id
    }

    /// Create (or reuse) a constant leaf holding `value`.
    pub fn constant(&mut self, value: Tensor) -> NodeId {
        let dtype = value.dtype();
        let shape = value.shape().clone();
        let op: OpRef = Arc::new(Constant::new(value));
        self.intern(op, &[], dtype, shape, NodeKind::Constant)
    }

    /// Scalar constant of the given dtype.
    pub fn scalar(&mut self, value: f64, dtype: DType) -> NodeId {
        self.constant(Tensor::scalar(value, dtype))
    }

    /// Apply `op` to `operands`, validating arity, dtypes and shapes immediately.
    pub fn apply<O: Op>(&mut self, op: O, operands: &[NodeId]) -> Result<NodeId> {
        self.apply_op(Arc::new(op), operands)
    }

    /// [`Graph::apply`] for an already shared operation handle.
    pub fn apply_op(&mut self, op: OpRef, operands: &[NodeId]) -> Result<NodeId> {
        if !op.arity().accepts(operands.len()) {
            return Err(GraphError::Arity {
                op: op.to_string(),
                expected: op.arity().to_string(),
                got: operands.len(),
            });
        }
        let (dtype, shape) = {
            let mut dtypes: SmallVec<[DType; 2]> = SmallVec::with_capacity(operands.len());
            let mut shapes: SmallVec<[&Shape; 2]> = SmallVec::with_capacity(operands.len());
            for &o in operands {
                let n = self.node(o)?;
                dtypes.push(n.dtype);
                shapes.push(&n.shape);
            }
            (op.infer_dtype(&dtypes)?, op.infer_shape(&shapes)?)
        };
        Ok(self.intern(op, operands, dtype, shape, NodeKind::Op))
    }

    fn intern(
        &mut self,
        op: OpRef,
        operands: &[NodeId],
        dtype: DType,
        shape: Shape,
        kind: NodeKind,
    ) -> NodeId {
        let key = intern_key(op.as_ref(), operands);
        if let Some(candidates) = self.interned.get(&key) {
            for &c in candidates {
                let n = &self.nodes[c.index()];
                if n.operands.as_slice() == operands
                    && n.op.as_ref().is_some_and(|existing| existing.op_eq(op.as_ref()))
                {
                    return c;
                }
            }
        }

        let id = self.next_id();
        tracing::trace!(%id, op = %op, ?operands, %dtype, %shape, "apply");
        self.nodes.push(Node {
            id,
            name: None,
            kind,
            op: Some(op),
            operands: SmallVec::from_slice(operands),
            dtype,
            shape,
            value: None,
            grad: None,
            deriv_of: SmallVec::new(),
            derivative: None,
        });
        self.interned.entry(key).or_default().push(id);
        id
    }

    fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32)
    }

    pub fn set_name(&mut self, id: NodeId, name: &str) -> Result<()> {
        self.node_mut(id)?.name = Some(name.to_string());
        Ok(())
    }

    /// Record that `grad` is the gradient of `of` for one differentiation
    /// request.
    ///
    /// Links are kept per request, not deduplicated: when two requests are
    /// interned to the same gradient node, `of` appears twice and receives
    /// the computed value twice.
    pub fn set_deriv_of(&mut self, grad: NodeId, of: NodeId) -> Result<()> {
        self.node(of)?;
        self.node_mut(grad)?.deriv_of.push(of);
        self.node_mut(of)?.derivative = Some(grad);
        Ok(())
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Topological order of the whole graph (Kahn's algorithm, operands first,
    /// ties broken by creation order).
    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.operands.len()).collect();
        let consumers = self.consumers_of_all();

        let mut queue: VecDeque<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.operands.is_empty())
            .map(|n| n.id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(cs) = consumers.get(&id) {
                for &c in cs {
                    let d = &mut in_degree[c.index()];
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(c);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = in_degree
                .iter()
                .position(|&d| d > 0)
                .map(|i| NodeId(i as u32))
                .unwrap_or(NodeId(0));
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Topological order of the nodes reachable from `roots` through operand edges.
    pub fn topological_sort_from(&self, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Visiting,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack: Vec<(NodeId, usize)> = Vec::new();

        for &root in roots {
            self.node(root)?;
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            marks[root.index()] = Mark::Visiting;
            stack.push((root, 0));

            while let Some(top) = stack.last_mut() {
                let id = top.0;
                let operands = &self.nodes[id.index()].operands;
                if top.1 < operands.len() {
                    let child = operands[top.1];
                    top.1 += 1;
                    match marks[child.index()] {
                        Mark::Unvisited => {
                            marks[child.index()] = Mark::Visiting;
                            stack.push((child, 0));
                        }
                        Mark::Visiting => return Err(GraphError::Cycle(child)),
                        Mark::Done => {}
                    }
                } else {
                    marks[id.index()] = Mark::Done;
                    order.push(id);
                    stack.pop();
                }
            }
        }
        Ok(order)
    }

    /// Reverse-edge map restricted to the nodes in `order`.
    pub fn consumers(&self, order: &[NodeId]) -> ConsumerMap {
        let mut map = ConsumerMap::default();
        for &id in order {
            if let Some(n) = self.nodes.get(id.index()) {
                for &o in &n.operands {
                    let entry = map.entry(o).or_default();
                    if !entry.contains(&id) {
                        entry.push(id);
                    }
                }
            }
        }
        map
    }

    /// Every consumer edge, duplicates included.
    fn consumers_of_all(&self) -> ConsumerMap {
        let mut map = ConsumerMap::default();
        for n in &self.nodes {
            for &o in &n.operands {
                map.entry(o).or_default().push(n.id);
            }
        }
        map
    }

    /// Nodes that no other node consumes.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut consumed = vec![false; self.nodes.len()];
        for n in &self.nodes {
            for &o in &n.operands {
                consumed[o.index()] = true;
            }
        }
        self.nodes
            .iter()
            .filter(|n| !consumed[n.id.index()])
            .map(|n| n.id)
            .collect()
    }

    /// All input leaves, in creation order.
    pub fn inputs(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.is_input()).map(|n| n.id).collect()
    }

    // =========================================================================
    // Value slots
    // =========================================================================

    /// Bind an external value to an input node.
    pub fn bind(&mut self, id: NodeId, value: Tensor) -> Result<()> {
        if !self.node(id)?.is_input() {
            return Err(GraphError::NotAnInput(id));
        }
        self.set_value(id, value)
    }

    /// Record a computed value on any node. The value must match the node's
    /// declared shape and dtype.
    pub fn set_value(&mut self, id: NodeId, value: Tensor) -> Result<()> {
        let n = self.node_mut(id)?;
        value
            .check_layout(&n.shape, n.dtype)
            .map_err(|source| GraphError::Bind { node: id, source })?;
        n.value = Some(value);
        Ok(())
    }

    pub fn clear_value(&mut self, id: NodeId) -> Result<()> {
        self.node_mut(id)?.value = None;
        Ok(())
    }

    /// Add `grad` into the node's gradient slot.
    pub fn accumulate_grad(&mut self, id: NodeId, grad: &Tensor) -> Result<()> {
        let n = self.node_mut(id)?;
        grad.check_layout(&n.shape, n.dtype)
            .map_err(|source| GraphError::Bind { node: id, source })?;
        match n.grad.as_mut() {
            Some(existing) => existing.add_(grad)?,
            None => n.grad = Some(grad.clone()),
        }
        Ok(())
    }

    /// Clear every gradient slot.
    pub fn clear_grads(&mut self) {
        for n in &mut self.nodes {
            n.grad = None;
        }
    }

    /// Drop every bound value and gradient except constants.
    pub fn unbind_all(&mut self) {
        for n in &mut self.nodes {
            if !n.is_constant() {
                n.value = None;
            }
            n.grad = None;
        }
    }
}

fn intern_key(op: &dyn Op, operands: &[NodeId]) -> u64 {
    let mut h = FxHasher::default();
    h.write_u32(op.hashcode());
    for o in operands {
        h.write_u32(o.0);
    }
    h.finish()
}
