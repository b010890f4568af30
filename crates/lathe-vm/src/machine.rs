//! The tape machine: runs a compiled program against its register file.

use std::fmt;
use std::sync::Arc;

use lathe_compiler::{Instruction, Program, RegisterId, RegisterMap, StatementKind};
use lathe_core::{CoreError, Device, Tensor};
use lathe_graph::{Graph, NodeId, OpRef};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::{BoxError, DeviceContext, Result, VmError, VmOptions};

/// Called before each instruction with its index. Returning an error aborts
/// the run as if the instruction had failed.
pub type Hook<'g> = Box<dyn FnMut(usize, &Instruction) -> std::result::Result<(), BoxError> + 'g>;

/// Executes a `Program` repeatedly.
///
/// Registers survive between runs: inputs stay bound until rebound and
/// computed registers keep their buffers, so later runs write into them
/// instead of allocating. `reset` drops everything but the inputs.
pub struct TapeMachine<'g> {
    graph: &'g mut Graph,
    program: Arc<Program>,
    map: RegisterMap,
    registers: Vec<Option<Tensor>>,
    /// Written by an upload that has not been waited on yet.
    pending: Vec<bool>,
    input_registers: Vec<bool>,
    contexts: Vec<DeviceContext>,
    options: VmOptions,
    watch: FxHashSet<NodeId>,
    hook: Option<Hook<'g>>,
    poisoned: bool,
}

impl<'g> TapeMachine<'g> {
    /// Build a machine, acquiring a context for every device the program or
    /// `options.devices` names.
    pub fn new(graph: &'g mut Graph, program: Program, map: RegisterMap, options: VmOptions) -> Result<Self> {
        let mut devices = program.devices();
        devices.extend(options.devices.iter().copied());
        devices.sort();
        devices.dedup();
        let contexts = devices
            .into_iter()
            .map(DeviceContext::acquire)
            .collect::<Result<Vec<_>>>()?;

        let n = program.registers().len();
        let mut input_registers = vec![false; n];
        for &(_, reg) in program.inputs() {
            input_registers[reg.index()] = true;
        }
        let watch = options.watch.iter().copied().collect();
        tracing::debug!(
            instructions = program.len(),
            registers = n,
            devices = contexts.len(),
            "tape machine ready"
        );
        Ok(Self {
            graph,
            program: Arc::new(program),
            map,
            registers: vec![None; n],
            pending: vec![false; n],
            input_registers,
            contexts,
            options,
            watch,
            hook: None,
            poisoned: false,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Whether a failed run left the machine waiting for `reset`.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn set_hook(
        &mut self,
        hook: impl FnMut(usize, &Instruction) -> std::result::Result<(), BoxError> + 'g,
    ) {
        self.hook = Some(Box::new(hook));
    }

    pub fn clear_hook(&mut self) {
        self.hook = None;
    }

    // =========================================================================
    // Binding and inspection
    // =========================================================================

    /// Write an input's value. It must match the register's shape and dtype.
    pub fn bind(&mut self, node: NodeId, value: Tensor) -> Result<()> {
        let reg = self
            .program
            .inputs()
            .iter()
            .find(|&&(n, _)| n == node)
            .map(|&(_, r)| r)
            .ok_or(VmError::NotAnInput(node))?;
        let spec = self
            .program
            .register_spec(reg)
            .ok_or(VmError::EmptyRegister(reg))?;
        if value.shape() != &spec.shape {
            return Err(VmError::ShapeMismatch {
                node,
                expected: spec.shape.clone(),
                got: value.shape().clone(),
            });
        }
        if value.dtype() != spec.dtype {
            return Err(VmError::DTypeMismatch {
                node,
                expected: spec.dtype,
                got: value.dtype(),
            });
        }
        let value = value.to_device(spec.device).map_err(VmError::Device)?;
        self.graph.bind(node, value.clone())?;
        self.registers[reg.index()] = Some(value);
        tracing::trace!(%node, register = %reg, "bind");
        Ok(())
    }

    /// Host copy of `node`'s value after a run. Fetched nodes and inputs are
    /// read from their registers; anything else must have been bound onto
    /// the graph by a read statement or tracing.
    pub fn value(&self, node: NodeId) -> Result<Tensor> {
        if let Some(reg) = self.map.get(node) {
            if let Some(t) = self.registers.get(reg.index()).and_then(Option::as_ref) {
                return t.to_device(Device::Cpu).map_err(VmError::Device);
            }
        }
        self.graph
            .node(node)?
            .value()
            .cloned()
            .ok_or(VmError::NoValue(node))
    }

    /// Gradient accumulated into `node` by the last run: the sum over every
    /// differentiation request that linked a gradient to `node`, counting a
    /// request even when its gradient node was shared with another.
    pub fn gradient(&self, node: NodeId) -> Result<Tensor> {
        self.graph
            .node(node)?
            .grad()
            .cloned()
            .ok_or(VmError::NoGradient(node))
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute every instruction in program order.
    ///
    /// On failure the register file is left partially written and the machine
    /// refuses to run again until `reset`.
    pub fn run(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(VmError::ResetRequired);
        }
        for &(node, reg) in self.program.inputs() {
            if self.registers[reg.index()].is_none() {
                return Err(VmError::UnboundInput(node));
            }
        }
        self.graph.clear_grads();

        let program = Arc::clone(&self.program);
        // A bound input can itself be a gradient, e.g. a caller-supplied seed.
        for &(node, reg) in program.inputs() {
            let targets: SmallVec<[NodeId; 1]> = self.graph.node(node)?.deriv_of().into();
            if targets.is_empty() {
                continue;
            }
            let value = self.register(reg)?.clone();
            for target in targets {
                self.graph.accumulate_grad(target, &value)?;
            }
        }
        for (index, inst) in program.instructions().iter().enumerate() {
            if let Err(source) = self.step_hooked(index, inst) {
                self.poisoned = true;
                tracing::warn!(index, node = %inst.node(), error = %source, "run aborted");
                return Err(VmError::Execution {
                    index,
                    node: inst.node(),
                    source,
                });
            }
        }
        self.publish()?;
        tracing::debug!(instructions = program.len(), "run complete");
        Ok(())
    }

    /// Clear every computed register so the next run starts from scratch.
    /// Bound inputs are kept.
    pub fn reset(&mut self) {
        for (slot, &input) in self.registers.iter_mut().zip(&self.input_registers) {
            if !input {
                *slot = None;
            }
        }
        self.pending.fill(false);
        self.graph.clear_grads();
        self.poisoned = false;
        tracing::debug!("tape machine reset");
    }

    fn step_hooked(&mut self, index: usize, inst: &Instruction) -> std::result::Result<(), BoxError> {
        if let Some(hook) = self.hook.as_mut() {
            hook(index, inst)?;
        }
        tracing::trace!(index, %inst, "step");
        self.step(inst)
    }

    fn step(&mut self, inst: &Instruction) -> std::result::Result<(), BoxError> {
        match inst {
            Instruction::Exec {
                node,
                op,
                sources,
                dest,
                device,
                in_place,
                deriv_of,
            } => {
                self.ready(sources)?;
                let out = self.execute(op, sources, *dest, *device, *in_place)?;
                if !deriv_of.is_empty() {
                    let host = out.to_device(Device::Cpu)?;
                    for &target in deriv_of {
                        self.graph.accumulate_grad(target, &host)?;
                    }
                }
                if self.should_bind(*node)? {
                    self.graph.set_value(*node, out.to_device(Device::Cpu)?)?;
                }
                self.registers[dest.index()] = Some(out);
            }
            Instruction::Transfer { src, dest, to, .. } => {
                self.ready(std::slice::from_ref(src))?;
                let value = self.register(*src)?.to_device(*to)?;
                // Downloads complete before returning; uploads are awaited on
                // first read.
                self.pending[dest.index()] = !to.is_cpu();
                self.registers[dest.index()] = Some(value);
            }
            Instruction::Statement { node, kind, src } => {
                self.ready(std::slice::from_ref(src))?;
                let value = self.register(*src)?;
                if *kind == StatementKind::Read {
                    let host = value.to_device(Device::Cpu)?;
                    self.graph.set_value(*node, host)?;
                }
            }
        }
        Ok(())
    }

    /// Strategy dispatch: accelerator, then preallocated buffer, then in
    /// place, then a fresh result.
    fn execute(
        &mut self,
        op: &OpRef,
        sources: &[RegisterId],
        dest: RegisterId,
        device: Device,
        in_place: bool,
    ) -> std::result::Result<Tensor, BoxError> {
        if !device.is_cpu() {
            let device_op = op
                .as_device()
                .ok_or(VmError::Device(CoreError::DeviceUnavailable(device)))?;
            let inputs = self.gather(sources)?;
            return Ok(device_op.execute_on_device(&inputs)?);
        }

        if !in_place {
            if let Some(prealloc) = op.as_prealloc() {
                if let Some(mut buf) = self.reusable(dest) {
                    let inputs = self.gather(sources)?;
                    prealloc.execute_into(&mut buf, &inputs)?;
                    return Ok(buf);
                }
            }
        }

        if in_place {
            if let Some(in_place_op) = op.as_in_place() {
                let k = in_place_op.overwrites_input();
                let target_reg = *sources.get(k).ok_or(VmError::EmptyRegister(dest))?;
                let target = self.registers[target_reg.index()]
                    .take()
                    .ok_or(VmError::EmptyRegister(target_reg))?;
                let rest = sources
                    .iter()
                    .enumerate()
                    .filter(|&(i, _)| i != k)
                    .map(|(_, &r)| self.register(r))
                    .collect::<Result<SmallVec<[&Tensor; 2]>>>()?;
                return Ok(in_place_op.execute_in_place(target, &rest)?);
            }
        }

        let inputs = self.gather(sources)?;
        Ok(op.execute(&inputs)?)
    }

    /// The destination's previous buffer, if it still fits the register.
    fn reusable(&mut self, dest: RegisterId) -> Option<Tensor> {
        let spec = self.program.register_spec(dest)?;
        let buf = self.registers[dest.index()].take()?;
        (buf.shape() == &spec.shape && buf.dtype() == spec.dtype && buf.device() == spec.device)
            .then_some(buf)
    }

    /// Wait for uploads into `regs` that are still in flight.
    fn ready(&mut self, regs: &[RegisterId]) -> Result<()> {
        for &r in regs {
            if !self.pending[r.index()] {
                continue;
            }
            let device = self
                .program
                .register_spec(r)
                .map(|s| s.device)
                .ok_or(VmError::EmptyRegister(r))?;
            self.context(device)?.synchronize()?;
            self.pending[r.index()] = false;
            tracing::trace!(register = %r, %device, "upload synchronized");
        }
        Ok(())
    }

    fn context(&self, device: Device) -> Result<&DeviceContext> {
        self.contexts
            .iter()
            .find(|c| c.device() == device)
            .ok_or(VmError::Device(CoreError::DeviceUnavailable(device)))
    }

    fn register(&self, r: RegisterId) -> Result<&Tensor> {
        self.registers
            .get(r.index())
            .and_then(Option::as_ref)
            .ok_or(VmError::EmptyRegister(r))
    }

    fn gather(&self, sources: &[RegisterId]) -> Result<SmallVec<[&Tensor; 2]>> {
        sources.iter().map(|&r| self.register(r)).collect()
    }

    fn should_bind(&self, node: NodeId) -> Result<bool> {
        if self.options.trace && (self.watch.is_empty() || self.watch.contains(&node)) {
            return Ok(true);
        }
        Ok(self.options.bind_dual_values && self.graph.node(node)?.derivative().is_some())
    }

    /// Copy fetched values onto their graph nodes.
    fn publish(&mut self) -> Result<()> {
        let program = Arc::clone(&self.program);
        for &node in program.fetches() {
            let reg = self.map.get(node).ok_or(VmError::NoValue(node))?;
            let value = self.register(reg)?.to_device(Device::Cpu).map_err(VmError::Device)?;
            self.graph.set_value(node, value)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TapeMachine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapeMachine")
            .field("instructions", &self.program.len())
            .field("registers", &self.registers.len())
            .field("contexts", &self.contexts)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
