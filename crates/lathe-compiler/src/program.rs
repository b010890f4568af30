//! The compiled tape: instructions over a fixed register file.

use std::fmt;

use lathe_core::{DType, Device, Shape};
use lathe_graph::{NodeId, OpRef};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Index into a machine's register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterId(pub u32);

impl RegisterId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// What a register may hold. Registers are only shared between values with
/// equal specs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegisterSpec {
    pub device: Device,
    pub dtype: DType,
    pub shape: Shape,
}

impl fmt::Display for RegisterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} @{}", self.dtype, self.shape, self.device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Let,
    Read,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementKind::Let => f.write_str("let"),
            StatementKind::Read => f.write_str("read"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Instruction {
    /// Evaluate `node`'s operation on `sources` into `dest`.
    Exec {
        node: NodeId,
        op: OpRef,
        sources: SmallVec<[RegisterId; 2]>,
        dest: RegisterId,
        device: Device,
        /// `dest` is the register of the operand the op overwrites.
        in_place: bool,
        /// Nodes whose gradient slot receives this value.
        deriv_of: SmallVec<[NodeId; 1]>,
    },
    /// Copy `node`'s value between devices.
    Transfer {
        node: NodeId,
        src: RegisterId,
        dest: RegisterId,
        from: Device,
        to: Device,
    },
    /// Statement nodes produce nothing; they only read `src`.
    Statement {
        node: NodeId,
        kind: StatementKind,
        src: RegisterId,
    },
}

impl Instruction {
    pub fn node(&self) -> NodeId {
        match self {
            Instruction::Exec { node, .. }
            | Instruction::Transfer { node, .. }
            | Instruction::Statement { node, .. } => *node,
        }
    }

    pub fn sources(&self) -> &[RegisterId] {
        match self {
            Instruction::Exec { sources, .. } => sources,
            Instruction::Transfer { src, .. } | Instruction::Statement { src, .. } => {
                std::slice::from_ref(src)
            }
        }
    }

    pub fn dest(&self) -> Option<RegisterId> {
        match self {
            Instruction::Exec { dest, .. } | Instruction::Transfer { dest, .. } => Some(*dest),
            Instruction::Statement { .. } => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Exec {
                node,
                op,
                sources,
                dest,
                device,
                in_place,
                deriv_of,
            } => {
                write!(f, "{dest} = {op}(")?;
                for (i, s) in sources.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{s}")?;
                }
                write!(f, ") @{device}  ; {node}")?;
                if *in_place {
                    f.write_str(" in-place")?;
                }
                if !deriv_of.is_empty() {
                    f.write_str(" d/")?;
                    for (i, d) in deriv_of.iter().enumerate() {
                        if i > 0 {
                            f.write_str(",")?;
                        }
                        write!(f, "{d}")?;
                    }
                }
                Ok(())
            }
            Instruction::Transfer {
                node,
                src,
                dest,
                from,
                to,
            } => write!(f, "{dest} = transfer {src} {from} -> {to}  ; {node}"),
            Instruction::Statement { node, kind, src } => write!(f, "{kind} {src}  ; {node}"),
        }
    }
}

/// Where each compiled node's value lives.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    pub(crate) nodes: FxHashMap<NodeId, RegisterId>,
    pub(crate) inputs: Vec<NodeId>,
}

impl RegisterMap {
    /// Register holding `node`'s value at the end of a run. Fetched nodes are
    /// mapped to their host copy; statements to their operand's register.
    pub fn get(&self, node: NodeId) -> Option<RegisterId> {
        self.nodes.get(&node).copied()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, RegisterId)> + '_ {
        self.nodes.iter().map(|(&n, &r)| (n, r))
    }
}

/// An immutable compiled program.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) registers: Vec<RegisterSpec>,
    pub(crate) fetches: Vec<NodeId>,
    pub(crate) inputs: Vec<(NodeId, RegisterId)>,
}

impl Program {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Register file layout, indexed by `RegisterId`.
    pub fn registers(&self) -> &[RegisterSpec] {
        &self.registers
    }

    pub fn register_spec(&self, id: RegisterId) -> Option<&RegisterSpec> {
        self.registers.get(id.index())
    }

    pub fn fetches(&self) -> &[NodeId] {
        &self.fetches
    }

    /// Input nodes and the registers `bind` writes to.
    pub fn inputs(&self) -> &[(NodeId, RegisterId)] {
        &self.inputs
    }

    pub fn is_input_register(&self, id: RegisterId) -> bool {
        self.inputs.iter().any(|&(_, r)| r == id)
    }

    /// Every device a register lives on, host first.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.registers.iter().map(|r| r.device).collect();
        devices.sort();
        devices.dedup();
        devices
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "program: {} instructions, {} registers",
            self.instructions.len(),
            self.registers.len()
        )?;
        for (i, spec) in self.registers.iter().enumerate() {
            writeln!(f, "  r{i}: {spec}")?;
        }
        for (node, reg) in &self.inputs {
            writeln!(f, "  input {node} -> {reg}")?;
        }
        for (i, inst) in self.instructions.iter().enumerate() {
            writeln!(f, "  {i:>4}: {inst}")?;
        }
        f.write_str("  fetch")?;
        for node in &self.fetches {
            write!(f, " {node}")?;
        }
        Ok(())
    }
}
