//! Numeric checks of the symbolic gradients, evaluated with a small
//! interpreter over the graph.

use lathe_autograd::{affects_output, differentiate, grad, DiffOptions};
use lathe_core::{DType, Shape, Tensor};
use lathe_graph::{Graph, NodeId};
use rustc_hash::FxHashMap;

fn assert_close(a: f64, b: f64, tol: f64) {
    assert!((a - b).abs() < tol, "expected {b}, got {a} (tol {tol})");
}

fn eval(g: &Graph, bindings: &[(NodeId, Tensor)], targets: &[NodeId]) -> Vec<Tensor> {
    let mut values: FxHashMap<NodeId, Tensor> = bindings.iter().cloned().collect();
    for id in g.topological_sort_from(targets).unwrap() {
        if values.contains_key(&id) {
            continue;
        }
        let node = g.node(id).unwrap();
        let op = node.op().expect("unbound input");
        let inputs: Vec<&Tensor> = node.operands().iter().map(|o| &values[o]).collect();
        let out = op.execute(&inputs).unwrap();
        values.insert(id, out);
    }
    targets.iter().map(|t| values[t].clone()).collect()
}

fn scalar(v: f64) -> Tensor {
    Tensor::scalar(v, DType::F64)
}

#[test]
fn test_log_of_product() {
    let mut g = Graph::new();
    let x = g.input("x", DType::F64, Shape::scalar());
    let y = g.input("y", DType::F64, Shape::scalar());
    let xy = g.mul(x, y).unwrap();
    let res = g.log(xy).unwrap();

    let grads = grad(&mut g, res, &[x, y], &DiffOptions::default()).unwrap();
    let vals = eval(&g, &[(x, scalar(2.0)), (y, scalar(3.0))], &grads);
    assert_close(vals[0].item().unwrap(), 0.5, 1e-12);
    assert_close(vals[1].item().unwrap(), 1.0 / 3.0, 1e-12);
}

#[test]
fn test_multiple_outputs_with_vector_seeds() {
    // x = 2 z0 + z1, y = z0 + 2 z1
    let mut g = Graph::new();
    let z = g.input("z", DType::F64, [2]);
    let xproj = g.constant(Tensor::from_f64(&[2.0, 1.0], &[2]));
    let yproj = g.constant(Tensor::from_f64(&[1.0, 2.0], &[2]));
    let zx = g.mul(z, xproj).unwrap();
    let x = g.sum(zx).unwrap();
    let zy = g.mul(z, yproj).unwrap();
    let y = g.sum(zy).unwrap();
    let xx = g.mul(x, x).unwrap();
    let yy = g.mul(y, y).unwrap();
    let sq = g.sub(xx, yy).unwrap();
    let sumxy = g.add(x, y).unwrap();

    let one = g.scalar(1.0, DType::F64);
    let dsq = differentiate(&mut g, &[sq], &[one], &[z], &DiffOptions::default()).unwrap()[0];
    let dsum = differentiate(&mut g, &[sumxy], &[one], &[z], &DiffOptions::default()).unwrap()[0];

    let z_val = Tensor::from_f64(&[3.0, 4.0], &[2]);
    let vals = eval(&g, &[(z, z_val.clone())], &[x, y, dsum, dsq]);
    assert_eq!(vals[0].item().unwrap(), 10.0);
    assert_eq!(vals[1].item().unwrap(), 11.0);
    // d(x + y)/dz = xproj + yproj
    assert_eq!(vals[2].to_f64_vec().unwrap(), vec![3.0, 3.0]);
    // d(x^2 - y^2)/dz = 2x xproj - 2y yproj = [40 - 22, 20 - 44]
    assert_eq!(vals[3].to_f64_vec().unwrap(), vec![18.0, -24.0]);
}

#[test]
fn test_shared_operand_accumulates() {
    // f = x*x + exp(x): df/dx = 2x + exp(x)
    let mut g = Graph::new();
    let x = g.input("x", DType::F64, Shape::scalar());
    let xx = g.mul(x, x).unwrap();
    let e = g.exp(x).unwrap();
    let f = g.add(xx, e).unwrap();

    let dx = grad(&mut g, f, &[x], &DiffOptions::default()).unwrap()[0];
    let v = eval(&g, &[(x, scalar(1.5))], &[dx])[0].item().unwrap();
    assert_close(v, 3.0 + 1.5f64.exp(), 1e-12);
}

#[test]
fn test_broadcast_gradient_reduces_to_operand() {
    // f = sum(v * s): df/ds = sum(v), df/dv = s
    let mut g = Graph::new();
    let v = g.input("v", DType::F64, [3]);
    let s = g.input("s", DType::F64, Shape::scalar());
    let vs = g.mul(v, s).unwrap();
    let f = g.sum(vs).unwrap();

    let grads = grad(&mut g, f, &[v, s], &DiffOptions::default()).unwrap();
    assert_eq!(g.node(grads[0]).unwrap().shape(), &Shape::new(&[3]));
    assert!(g.node(grads[1]).unwrap().shape().is_scalar());

    let vals = eval(
        &g,
        &[(v, Tensor::from_f64(&[1.0, 2.0, 3.0], &[3])), (s, scalar(2.0))],
        &grads,
    );
    assert_eq!(vals[0].to_f64_vec().unwrap(), vec![2.0, 2.0, 2.0]);
    assert_eq!(vals[1].item().unwrap(), 6.0);
}

#[test]
fn test_stabilized_matches_plain() {
    for opts in [DiffOptions::default(), DiffOptions::stabilized()] {
        let mut g = Graph::new();
        let x = g.input("x", DType::F64, Shape::scalar());
        let l = g.log1p(x).unwrap();
        let e = g.expm1(x).unwrap();
        let f = g.add(l, e).unwrap();
        let dx = grad(&mut g, f, &[x], &opts).unwrap()[0];
        let v = eval(&g, &[(x, scalar(0.25))], &[dx])[0].item().unwrap();
        assert_close(v, 1.0 / 1.25 + 0.25f64.exp(), 1e-12);
    }
}

#[test]
fn test_quotient_rule() {
    let mut g = Graph::new();
    let a = g.input("a", DType::F64, Shape::scalar());
    let b = g.input("b", DType::F64, Shape::scalar());
    let q = g.div(a, b).unwrap();
    let grads = grad(&mut g, q, &[a, b], &DiffOptions::default()).unwrap();
    let vals = eval(&g, &[(a, scalar(3.0)), (b, scalar(2.0))], &grads);
    assert_close(vals[0].item().unwrap(), 0.5, 1e-12);
    assert_close(vals[1].item().unwrap(), -0.75, 1e-12);
}

#[test]
fn test_gradient_nodes_extend_analysis() {
    let mut g = Graph::new();
    let x = g.input("x", DType::F64, Shape::scalar());
    let s = g.sqrt(x).unwrap();
    let dx = grad(&mut g, s, &[x], &DiffOptions::default()).unwrap()[0];

    let sorted = g.topological_sort().unwrap();
    let affects = affects_output(&g, &sorted, &[dx]).unwrap();
    assert!(affects.contains(&x));
    let v = eval(&g, &[(x, scalar(4.0))], &[dx])[0].item().unwrap();
    assert_close(v, 0.25, 1e-12);
}
