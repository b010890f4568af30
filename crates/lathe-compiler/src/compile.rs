//! Scheduling, device placement and instruction emission.
//!
//! Emission works on virtual values: one per computed node, one per input and
//! one per device copy. Liveness and register allocation then fold those
//! values onto a small register file.

use lathe_core::{DType, Device, Shape};
use lathe_graph::ops::Let;
use lathe_graph::{Graph, Node, NodeId, NodeKind, OpRef};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::liveness::{self, LiveRange};
use crate::program::{Instruction, Program, RegisterMap, RegisterSpec, StatementKind};
use crate::regalloc::{self, Allocation};
use crate::{CompileError, CompileOptions, Result};

pub(crate) type ValueId = usize;

/// A value produced or consumed by the draft tape.
#[derive(Debug, Clone)]
pub(crate) struct Value {
    pub node: NodeId,
    pub spec: RegisterSpec,
    /// Bound from outside before the run rather than computed.
    pub input: bool,
}

/// Draft instruction over virtual values.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Exec {
        node: NodeId,
        op: OpRef,
        sources: SmallVec<[ValueId; 2]>,
        dest: ValueId,
        deriv_of: SmallVec<[NodeId; 1]>,
    },
    Transfer {
        node: NodeId,
        src: ValueId,
        dest: ValueId,
    },
    Statement {
        node: NodeId,
        kind: StatementKind,
        src: ValueId,
    },
}

impl Step {
    pub fn reads(&self) -> &[ValueId] {
        match self {
            Step::Exec { sources, .. } => sources,
            Step::Transfer { src, .. } | Step::Statement { src, .. } => std::slice::from_ref(src),
        }
    }

    pub fn writes(&self) -> Option<ValueId> {
        match self {
            Step::Exec { dest, .. } | Step::Transfer { dest, .. } => Some(*dest),
            Step::Statement { .. } => None,
        }
    }
}

/// Compile the part of `graph` that `fetches` depend on.
///
/// `inputs` are the nodes the caller binds before each run. Every input leaf a
/// fetch depends on must be among them.
pub fn compile(
    graph: &Graph,
    inputs: &[NodeId],
    fetches: &[NodeId],
    options: &CompileOptions,
) -> Result<(Program, RegisterMap)> {
    let Plan {
        nodes,
        values,
        steps,
        ranges: _,
        alloc,
        fetch_list,
        fetched,
        input_values,
    } = plan(graph, inputs, fetches, options)?;

    let mut instructions = Vec::with_capacity(steps.len());
    for (i, step) in steps.into_iter().enumerate() {
        let inst = match step {
            Step::Exec {
                node,
                op,
                sources,
                dest,
                deriv_of,
            } => Instruction::Exec {
                node,
                op,
                sources: sources.iter().map(|&v| alloc.assignment[v]).collect(),
                dest: alloc.assignment[dest],
                device: values[dest].spec.device,
                in_place: alloc.in_place[i],
                deriv_of,
            },
            Step::Transfer { node, src, dest } => Instruction::Transfer {
                node,
                src: alloc.assignment[src],
                dest: alloc.assignment[dest],
                from: values[src].spec.device,
                to: values[dest].spec.device,
            },
            Step::Statement { node, kind, src } => Instruction::Statement {
                node,
                kind,
                src: alloc.assignment[src],
            },
        };
        instructions.push(inst);
    }

    let mut map = RegisterMap::default();
    let mut program_inputs = Vec::with_capacity(input_values.len());
    for (node, v) in input_values {
        let reg = alloc.assignment[v];
        map.nodes.insert(node, reg);
        map.inputs.push(node);
        program_inputs.push((node, reg));
    }
    for (node, v) in fetched {
        map.nodes.insert(node, alloc.assignment[v]);
    }

    tracing::debug!(
        nodes,
        values = values.len(),
        instructions = instructions.len(),
        registers = alloc.registers.len(),
        in_place = alloc.in_place.iter().filter(|&&b| b).count(),
        "compiled program"
    );

    let program = Program {
        instructions,
        registers: alloc.registers,
        fetches: fetch_list,
        inputs: program_inputs,
    };
    Ok((program, map))
}

/// Draft tape with its live ranges and register assignment, before lowering.
pub(crate) struct Plan {
    /// Graph nodes scheduled.
    pub nodes: usize,
    pub values: Vec<Value>,
    pub steps: Vec<Step>,
    pub ranges: Vec<LiveRange>,
    pub alloc: Allocation,
    pub fetch_list: Vec<NodeId>,
    pub fetched: Vec<(NodeId, ValueId)>,
    pub input_values: Vec<(NodeId, ValueId)>,
}

pub(crate) fn plan(
    graph: &Graph,
    inputs: &[NodeId],
    fetches: &[NodeId],
    options: &CompileOptions,
) -> Result<Plan> {
    if fetches.is_empty() {
        return Err(CompileError::NoFetches);
    }
    let mut bound: Vec<NodeId> = Vec::with_capacity(inputs.len());
    for &id in inputs {
        if !graph.node(id)?.is_input() {
            return Err(CompileError::NotAnInput(id));
        }
        if !bound.contains(&id) {
            bound.push(id);
        }
    }
    let mut fetch_list: Vec<NodeId> = Vec::with_capacity(fetches.len());
    for &f in fetches {
        if !fetch_list.contains(&f) {
            fetch_list.push(f);
        }
    }

    let order = graph.topological_sort_from(&fetch_list)?;
    check_bound(graph, &order, &bound, &fetch_list)?;
    for &id in &order {
        resolve_layout(graph, graph.node(id)?)?;
    }

    let mut emitter = Emitter::new(graph, options);
    emitter.emit(&order, &bound, &fetch_list)?;
    let Emitter {
        values,
        steps,
        pinned,
        fetched,
        input_values,
        ..
    } = emitter;

    let ranges = liveness::analyze(&values, &steps, &pinned);
    let alloc = regalloc::allocate(&values, &steps, &ranges, options.in_place)?;
    Ok(Plan {
        nodes: order.len(),
        values,
        steps,
        ranges,
        alloc,
        fetch_list,
        fetched,
        input_values,
    })
}

/// Compile the whole graph: every input is bound and every root is fetched.
pub fn compile_all(graph: &Graph, options: &CompileOptions) -> Result<(Program, RegisterMap)> {
    compile(graph, &graph.inputs(), &graph.roots(), options)
}

/// Reject fetches that depend on an input the caller never binds; such a
/// fetch could never hold a valid value.
fn check_bound(graph: &Graph, order: &[NodeId], bound: &[NodeId], fetches: &[NodeId]) -> Result<()> {
    let mut missing: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    for &id in order {
        let node = graph.node(id)?;
        if node.is_input() {
            if !bound.contains(&id) {
                missing.insert(id, id);
            }
            continue;
        }
        if let Some(input) = node.operands().iter().find_map(|o| missing.get(o).copied()) {
            missing.insert(id, input);
        }
    }
    for &fetch in fetches {
        if let Some(&input) = missing.get(&fetch) {
            return Err(CompileError::UnboundInput { fetch, input });
        }
    }
    Ok(())
}

/// Re-run type and shape inference and compare with what the node declares.
fn resolve_layout(graph: &Graph, node: &Node) -> Result<()> {
    let Some(op) = node.op() else {
        return Ok(());
    };
    let id = node.id();
    let mut dtypes: SmallVec<[DType; 2]> = SmallVec::with_capacity(node.operands().len());
    let mut shapes: SmallVec<[&Shape; 2]> = SmallVec::with_capacity(node.operands().len());
    for &o in node.operands() {
        let operand = graph.node(o)?;
        dtypes.push(operand.dtype());
        shapes.push(operand.shape());
    }
    let unresolved = |source| CompileError::Unresolved { node: id, source };
    let dtype = op.infer_dtype(&dtypes).map_err(unresolved)?;
    let shape = op.infer_shape(&shapes).map_err(unresolved)?;
    if dtype != node.dtype() || &shape != node.shape() {
        return Err(CompileError::LayoutConflict {
            node: id,
            declared_dtype: node.dtype(),
            declared_shape: node.shape().clone(),
            dtype,
            shape,
        });
    }
    Ok(())
}

struct Emitter<'g> {
    graph: &'g Graph,
    options: &'g CompileOptions,
    values: Vec<Value>,
    steps: Vec<Step>,
    /// Value holding each node on the device it was computed on.
    home: FxHashMap<NodeId, ValueId>,
    copies: FxHashMap<(NodeId, Device), ValueId>,
    pinned: FxHashSet<ValueId>,
    fetched: Vec<(NodeId, ValueId)>,
    input_values: Vec<(NodeId, ValueId)>,
}

impl<'g> Emitter<'g> {
    fn new(graph: &'g Graph, options: &'g CompileOptions) -> Self {
        Self {
            graph,
            options,
            values: Vec::new(),
            steps: Vec::new(),
            home: FxHashMap::default(),
            copies: FxHashMap::default(),
            pinned: FxHashSet::default(),
            fetched: Vec::new(),
            input_values: Vec::new(),
        }
    }

    fn emit(&mut self, order: &[NodeId], bound: &[NodeId], fetches: &[NodeId]) -> Result<()> {
        let graph = self.graph;
        for &id in bound {
            let node = graph.node(id)?;
            let v = self.new_value(node, Device::Cpu, true);
            self.home.insert(id, v);
            self.pinned.insert(v);
            self.input_values.push((id, v));
        }

        for &id in order {
            let node = graph.node(id)?;
            match node.kind() {
                NodeKind::Input => {
                    if !self.home.contains_key(&id) {
                        return Err(CompileError::UnresolvedRegister { node: id });
                    }
                }
                NodeKind::Constant | NodeKind::Op => self.emit_node(node)?,
            }
        }

        for &f in fetches {
            let v = self.value_on(f, Device::Cpu)?;
            self.pinned.insert(v);
            self.fetched.push((f, v));
        }
        Ok(())
    }

    fn emit_node(&mut self, node: &Node) -> Result<()> {
        let id = node.id();
        let op = node
            .op()
            .cloned()
            .ok_or(CompileError::UnresolvedRegister { node: id })?;

        if op.is_statement() {
            let operand = node
                .operands()
                .first()
                .copied()
                .ok_or(CompileError::UnresolvedRegister { node: id })?;
            let src = self.home_of(operand)?;
            let kind = if op.as_any().is::<Let>() {
                StatementKind::Let
            } else {
                StatementKind::Read
            };
            self.steps.push(Step::Statement { node: id, kind, src });
            // The statement's own value is its operand's.
            self.home.insert(id, src);
            return Ok(());
        }

        let device = self.place(node);
        let mut sources = SmallVec::with_capacity(node.operands().len());
        for &o in node.operands() {
            sources.push(self.value_on(o, device)?);
        }
        let dest = self.new_value(node, device, false);
        self.steps.push(Step::Exec {
            node: id,
            op,
            sources,
            dest,
            deriv_of: node.deriv_of().into(),
        });
        self.home.insert(id, dest);
        Ok(())
    }

    fn place(&self, node: &Node) -> Device {
        let Some(accel) = self.options.accelerator.filter(|d| !d.is_cpu()) else {
            return Device::Cpu;
        };
        if node.kind() != NodeKind::Op {
            return Device::Cpu;
        }
        let Some(device_op) = node.op().and_then(|op| op.as_device()) else {
            return Device::Cpu;
        };
        let shapes: SmallVec<[&Shape; 2]> = node
            .operands()
            .iter()
            .filter_map(|&o| self.graph.node(o).ok().map(|n| n.shape()))
            .collect();
        if shapes.len() == node.operands().len() && device_op.supports_device(node.dtype(), &shapes) {
            accel
        } else {
            Device::Cpu
        }
    }

    fn home_of(&self, node: NodeId) -> Result<ValueId> {
        self.home
            .get(&node)
            .copied()
            .ok_or(CompileError::UnresolvedRegister { node })
    }

    /// `node`'s value on `device`, emitting a transfer the first time it is
    /// needed there.
    fn value_on(&mut self, node: NodeId, device: Device) -> Result<ValueId> {
        let home = self.home_of(node)?;
        if self.values[home].spec.device == device {
            return Ok(home);
        }
        if let Some(&v) = self.copies.get(&(node, device)) {
            return Ok(v);
        }
        let spec = RegisterSpec {
            device,
            ..self.values[home].spec.clone()
        };
        let dest = self.values.len();
        self.values.push(Value {
            node,
            spec,
            input: false,
        });
        self.steps.push(Step::Transfer {
            node,
            src: home,
            dest,
        });
        self.copies.insert((node, device), dest);
        Ok(dest)
    }

    fn new_value(&mut self, node: &Node, device: Device, input: bool) -> ValueId {
        self.values.push(Value {
            node: node.id(),
            spec: RegisterSpec {
                device,
                dtype: node.dtype(),
                shape: node.shape().clone(),
            },
            input,
        });
        self.values.len() - 1
    }
}
