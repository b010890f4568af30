#![cfg(feature = "cuda")]

use lathe_compiler::{compile, CompileOptions, Instruction};
use lathe_core::{DType, Device};
use lathe_graph::Graph;

// Placement is a pure compile-time decision; no GPU is touched here.

#[test]
fn test_eligible_ops_move_to_accelerator() {
    let mut g = Graph::new();
    let x = g.input("x", DType::F32, [16]);
    let y = g.input("y", DType::F32, [16]);
    let s = g.add(x, y).unwrap();
    let e = g.exp(s).unwrap();

    let opts = CompileOptions::with_accelerator(Device::Cuda(0));
    let (program, map) = compile(&g, &[x, y], &[e], &opts).unwrap();

    let transfers: Vec<(Device, Device)> = program
        .instructions()
        .iter()
        .filter_map(|i| match i {
            Instruction::Transfer { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    // x and y go up, the fetched result comes back down
    assert_eq!(transfers.iter().filter(|t| **t == (Device::Cpu, Device::Cuda(0))).count(), 2);
    assert_eq!(transfers.iter().filter(|t| **t == (Device::Cuda(0), Device::Cpu)).count(), 1);
    assert_eq!(program.devices(), vec![Device::Cpu, Device::Cuda(0)]);

    let fetched = map.get(e).unwrap();
    assert_eq!(program.register_spec(fetched).unwrap().device, Device::Cpu);
}

#[test]
fn test_unsupported_dtype_stays_on_host() {
    let mut g = Graph::new();
    let x = g.input("x", DType::F64, [16]);
    let e = g.exp(x).unwrap();
    let opts = CompileOptions::with_accelerator(Device::Cuda(0));
    let (program, _) = compile(&g, &[x], &[e], &opts).unwrap();
    assert!(program
        .instructions()
        .iter()
        .all(|i| !matches!(i, Instruction::Transfer { .. })));
}
