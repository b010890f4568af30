//! Config-driven pipeline: differentiate, compile, build a machine.

use std::path::Path;

use lathe_compiler::{Program, RegisterMap};
use lathe_graph::{Graph, NodeId};

use crate::{EngineConfig, Result, TapeMachine};

#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(EngineConfig::from_path(path)?))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn differentiate(
        &self,
        graph: &mut Graph,
        outputs: &[NodeId],
        seeds: &[NodeId],
        targets: &[NodeId],
    ) -> Result<Vec<NodeId>> {
        Ok(lathe_autograd::differentiate(
            graph,
            outputs,
            seeds,
            targets,
            &self.config.diff,
        )?)
    }

    /// Gradients of a scalar `cost`.
    pub fn grad(&self, graph: &mut Graph, cost: NodeId, targets: &[NodeId]) -> Result<Vec<NodeId>> {
        Ok(lathe_autograd::grad(graph, cost, targets, &self.config.diff)?)
    }

    pub fn compile(
        &self,
        graph: &Graph,
        inputs: &[NodeId],
        fetches: &[NodeId],
    ) -> Result<(Program, RegisterMap)> {
        Ok(lathe_compiler::compile(graph, inputs, fetches, &self.config.compile)?)
    }

    /// Compile `fetches` and wrap the program in a machine over `graph`.
    pub fn machine<'g>(
        &self,
        graph: &'g mut Graph,
        inputs: &[NodeId],
        fetches: &[NodeId],
    ) -> Result<TapeMachine<'g>> {
        let (program, map) = self.compile(graph, inputs, fetches)?;
        TapeMachine::new(graph, program, map, self.config.vm.clone())
    }
}
