//! Linear-scan register allocation over live ranges.
//!
//! A register is handed to a new value only after every earlier occupant's
//! range has ended, and only between values with equal device, dtype and
//! shape. In-place instructions take over the register of the operand they
//! overwrite when that operand dies at the instruction.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::compile::{Step, Value, ValueId};
use crate::liveness::LiveRange;
use crate::program::{RegisterId, RegisterSpec};
use crate::{CompileError, Result};

#[derive(Debug)]
pub(crate) struct Allocation {
    /// Register of each value.
    pub assignment: Vec<RegisterId>,
    pub registers: Vec<RegisterSpec>,
    /// Per step: the destination reuses the overwritten operand's register.
    pub in_place: Vec<bool>,
}

struct Allocator {
    registers: Vec<RegisterSpec>,
    /// Current occupant of each register.
    owner: Vec<ValueId>,
    free: FxHashMap<RegisterSpec, Vec<RegisterId>>,
}

impl Allocator {
    fn take(&mut self, value: ValueId, spec: &RegisterSpec) -> RegisterId {
        if let Some(reg) = self.free.get_mut(spec).and_then(Vec::pop) {
            self.owner[reg.index()] = value;
            return reg;
        }
        let reg = RegisterId(self.registers.len() as u32);
        self.registers.push(spec.clone());
        self.owner.push(value);
        reg
    }

    fn release(&mut self, value: ValueId, reg: RegisterId) {
        // A coalesced successor may already own the register.
        if self.owner[reg.index()] == value {
            let spec = self.registers[reg.index()].clone();
            self.free.entry(spec).or_default().push(reg);
        }
    }
}

pub(crate) fn allocate(
    values: &[Value],
    steps: &[Step],
    ranges: &[LiveRange],
    in_place: bool,
) -> Result<Allocation> {
    let mut alloc = Allocator {
        registers: Vec::new(),
        owner: Vec::new(),
        free: FxHashMap::default(),
    };
    let mut assignment: Vec<Option<RegisterId>> = vec![None; values.len()];
    let mut coalesced = vec![false; steps.len()];
    // Values to release once the scan passes the key index.
    let mut expiry: BTreeMap<usize, Vec<ValueId>> = BTreeMap::new();

    for (v, value) in values.iter().enumerate() {
        if value.input {
            assignment[v] = Some(alloc.take(v, &value.spec));
        }
    }

    for (i, step) in steps.iter().enumerate() {
        while let Some(entry) = expiry.first_entry() {
            if *entry.key() >= i {
                break;
            }
            for v in entry.remove() {
                if let Some(reg) = assignment[v] {
                    alloc.release(v, reg);
                }
            }
        }

        let Some(dest) = step.writes() else {
            continue;
        };
        let reused = if in_place {
            in_place_source(step, i, values, ranges).and_then(|src| assignment[src])
        } else {
            None
        };
        let reg = match reused {
            Some(reg) => {
                alloc.owner[reg.index()] = dest;
                coalesced[i] = true;
                reg
            }
            None => alloc.take(dest, &values[dest].spec),
        };
        assignment[dest] = Some(reg);
        expiry.entry(ranges[dest].end).or_default().push(dest);
        tracing::trace!(
            step = i,
            node = %values[dest].node,
            register = %reg,
            in_place = coalesced[i],
            "assign"
        );
    }

    let assignment = assignment
        .into_iter()
        .enumerate()
        .map(|(v, r)| r.ok_or(CompileError::UnresolvedRegister { node: values[v].node }))
        .collect::<Result<Vec<_>>>()?;
    Ok(Allocation {
        assignment,
        registers: alloc.registers,
        in_place: coalesced,
    })
}

/// Panics unless every pair of values sharing a register is either live over
/// disjoint steps or an operand handed to an in-place destination at the step
/// where one ends and the other begins.
#[cfg(test)]
pub(crate) fn assert_no_clobber(steps: &[Step], ranges: &[LiveRange], alloc: &Allocation) {
    let n = alloc.assignment.len();
    for x in 0..n {
        for y in (x + 1)..n {
            if alloc.assignment[x] != alloc.assignment[y] {
                continue;
            }
            let (early, late) = if ranges[x].start <= ranges[y].start {
                (x, y)
            } else {
                (y, x)
            };
            if !ranges[early].overlaps(&ranges[late]) {
                continue;
            }
            let i = ranges[late].start;
            let handed_over = ranges[early].end == i
                && alloc.in_place[i]
                && steps[i].writes() == Some(late)
                && steps[i].reads().contains(&early);
            assert!(
                handed_over,
                "values {early} {:?} and {late} {:?} share {}",
                ranges[early], ranges[late], alloc.assignment[x]
            );
        }
    }
}

/// The operand `step` may overwrite: it must be declared by the op, die at
/// this step, appear once among the sources and share the destination's spec.
fn in_place_source(step: &Step, i: usize, values: &[Value], ranges: &[LiveRange]) -> Option<ValueId> {
    let Step::Exec {
        op, sources, dest, ..
    } = step
    else {
        return None;
    };
    let k = op.as_in_place()?.overwrites_input();
    let src = *sources.get(k)?;
    let eligible = !values[src].input
        && ranges[src].end == i
        && sources.iter().filter(|&&s| s == src).count() == 1
        && values[src].spec == values[*dest].spec;
    eligible.then_some(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lathe_core::{BinaryKind, DType, Device, Shape, UnaryKind};
    use lathe_graph::ops::{Binary, Sum, Unary};
    use lathe_graph::{NodeId, OpRef};
    use smallvec::{smallvec, SmallVec};
    use std::sync::Arc;

    use crate::liveness::analyze;
    use rustc_hash::FxHashSet;

    fn value(node: u32, input: bool, dims: &[usize]) -> Value {
        Value {
            node: NodeId(node),
            spec: RegisterSpec {
                device: Device::Cpu,
                dtype: DType::F32,
                shape: Shape::new(dims),
            },
            input,
        }
    }

    fn exec(op: OpRef, sources: SmallVec<[ValueId; 2]>, dest: ValueId) -> Step {
        Step::Exec {
            node: NodeId(dest as u32),
            op,
            sources,
            dest,
            deriv_of: smallvec![],
        }
    }

    fn exp() -> OpRef {
        Arc::new(Unary::new(UnaryKind::Exp))
    }

    fn run(values: &[Value], steps: &[Step], pinned: &[ValueId], in_place: bool) -> Allocation {
        let pinned: FxHashSet<ValueId> = pinned.iter().copied().collect();
        let ranges = analyze(values, steps, &pinned);
        allocate(values, steps, &ranges, in_place).unwrap()
    }

    fn chain() -> (Vec<Value>, Vec<Step>) {
        let values = (0..5).map(|i| value(i, i == 0, &[4])).collect();
        let steps = vec![
            exec(exp(), smallvec![0], 1),
            exec(exp(), smallvec![1], 2),
            exec(exp(), smallvec![2], 3),
            exec(exp(), smallvec![3], 4),
        ];
        (values, steps)
    }

    #[test]
    fn test_in_place_chain_shares_one_register() {
        let (values, steps) = chain();
        let a = run(&values, &steps, &[4], true);
        // input register plus one working register
        assert_eq!(a.registers.len(), 2);
        assert_eq!(a.in_place, vec![false, true, true, true]);
        assert_eq!(a.assignment[1], a.assignment[4]);
        assert_ne!(a.assignment[0], a.assignment[1]);
    }

    #[test]
    fn test_chain_without_in_place_alternates() {
        let (values, steps) = chain();
        let a = run(&values, &steps, &[4], false);
        assert_eq!(a.registers.len(), 3);
        assert!(a.in_place.iter().all(|&b| !b));
        assert_eq!(a.assignment[1], a.assignment[3]);
        assert_ne!(a.assignment[1], a.assignment[2]);
        assert_ne!(a.assignment[3], a.assignment[4]);
    }

    #[test]
    fn test_input_never_overwritten() {
        let values = vec![value(0, true, &[4]), value(1, false, &[4])];
        let steps = vec![exec(exp(), smallvec![0], 1)];
        let a = run(&values, &steps, &[1], true);
        assert!(!a.in_place[0]);
        assert_ne!(a.assignment[0], a.assignment[1]);
    }

    #[test]
    fn test_duplicate_operand_not_in_place() {
        // v2 = v1 * v1 cannot overwrite v1 while reading it twice
        let values = vec![value(0, true, &[4]), value(1, false, &[4]), value(2, false, &[4])];
        let mul: OpRef = Arc::new(Binary::new(BinaryKind::Mul));
        let steps = vec![exec(exp(), smallvec![0], 1), exec(mul, smallvec![1, 1], 2)];
        let a = run(&values, &steps, &[2], true);
        assert!(!a.in_place[1]);
        assert_ne!(a.assignment[1], a.assignment[2]);
    }

    #[test]
    fn test_registers_split_by_shape() {
        // v1 [4] dies before v3 is written, but v3 is a scalar
        let values = vec![
            value(0, true, &[4]),
            value(1, false, &[4]),
            value(2, false, &[]),
            value(3, false, &[]),
        ];
        let sum: OpRef = Arc::new(Sum);
        let steps = vec![
            exec(exp(), smallvec![0], 1),
            exec(sum, smallvec![1], 2),
            exec(exp(), smallvec![2], 3),
        ];
        let a = run(&values, &steps, &[3], false);
        assert_ne!(a.assignment[1], a.assignment[3]);
        for (v, reg) in a.assignment.iter().enumerate() {
            assert_eq!(a.registers[reg.index()], values[v].spec);
        }
    }

    #[test]
    fn test_live_values_never_share() {
        let (values, steps) = chain();
        let set: FxHashSet<ValueId> = [4].into_iter().collect();
        let ranges = analyze(&values, &steps, &set);
        for in_place in [false, true] {
            let a = allocate(&values, &steps, &ranges, in_place).unwrap();
            assert_no_clobber(&steps, &ranges, &a);
        }
    }

    #[test]
    fn test_unwritten_value_is_unresolved() {
        // v2 is neither an input nor written by any step
        let values = vec![value(0, true, &[4]), value(1, false, &[4]), value(2, false, &[4])];
        let steps = vec![exec(exp(), smallvec![0], 1)];
        let set: FxHashSet<ValueId> = [1].into_iter().collect();
        let ranges = analyze(&values, &steps, &set);
        let err = allocate(&values, &steps, &ranges, true).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedRegister { node } if node == NodeId(2)));
    }
}
