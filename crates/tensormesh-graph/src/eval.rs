//! Restricted topological evaluation.
//!
//! [`evaluate_targets`] computes exactly the functors between leaves
//! and a target set, skipping `ignored` subtrees and any functor whose
//! arguments are unchanged since its last compute. The actual math is
//! delegated to a [`Device`] collaborator so the operator catalog can
//! live outside this crate.

use std::collections::HashSet;

use crate::data::TensorData;
use crate::error::GraphError;
use crate::node::{Graph, NodeId, NodeKind, Op};
use crate::shape::Shape;

/// Something capable of computing one functor's pending computation.
pub trait Device: Send + Sync {
    /// Compute `op` over fully materialized inputs.
    ///
    /// # Errors
    ///
    /// Implementations report arity or kernel failures as
    /// [`GraphError`] values.
    fn calc(&self, op: Op, inputs: &[TensorData], shape: &Shape) -> Result<TensorData, GraphError>;
}

/// Reference CPU device for the elementwise catalog.
///
/// Computes in f64 and narrows the result to the first input's dtype,
/// mirroring the wire conversion rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuDevice;

impl Device for CpuDevice {
    fn calc(&self, op: Op, inputs: &[TensorData], _shape: &Shape) -> Result<TensorData, GraphError> {
        if inputs.len() != op.arity() {
            return Err(GraphError::Arity {
                op: op.to_string(),
                expected: op.arity(),
                got: inputs.len(),
            });
        }
        let a = inputs[0].to_f64s();
        let out: Vec<f64> = match op {
            Op::Add => {
                let b = inputs[1].to_f64s();
                a.iter().zip(&b).map(|(x, y)| x + y).collect()
            }
            Op::Mul => {
                let b = inputs[1].to_f64s();
                a.iter().zip(&b).map(|(x, y)| x * y).collect()
            }
            Op::Neg => a.iter().map(|x| -x).collect(),
            Op::Sin => a.iter().map(|x| x.sin()).collect(),
        };
        Ok(TensorData::from_f64s(inputs[0].dtype(), &out))
    }
}

/// Evaluate the functors required by `targets`, in dependency order.
///
/// Functors in `ignored` (and anything only reachable through them)
/// keep their current value and are not descended into. A functor is
/// recomputed only when it has no cached value or when any direct
/// argument's version differs from the one observed at its last
/// compute; recomputation bumps the functor's version. Returns the
/// ids actually recomputed.
///
/// # Errors
///
/// Fails if a required remote reference has never been populated
/// ([`GraphError::Unpopulated`]) or if the device reports a kernel
/// error. The graph is left with every functor computed before the
/// failure point intact.
pub fn evaluate_targets(
    graph: &mut Graph,
    device: &dyn Device,
    targets: &[NodeId],
    ignored: &HashSet<NodeId>,
) -> Result<Vec<NodeId>, GraphError> {
    let order = postorder(graph, targets, ignored)?;
    let mut recomputed = Vec::new();
    for id in order {
        let (op, args, stale) = match &graph.node(id)?.kind {
            NodeKind::Functor {
                op,
                args,
                value,
                arg_versions,
                ..
            } => {
                let current: Vec<u64> = args
                    .iter()
                    .map(|&a| graph.node(a).map(|n| n.version()))
                    .collect::<Result<_, _>>()?;
                let stale = value.is_none() || current != *arg_versions;
                (*op, args.clone(), stale)
            }
            _ => continue,
        };
        if !stale {
            continue;
        }
        let mut inputs = Vec::with_capacity(args.len());
        let mut versions = Vec::with_capacity(args.len());
        for &arg in &args {
            let node = graph.node(arg)?;
            if let NodeKind::Remote(r) = &node.kind {
                if !r.is_populated() {
                    return Err(GraphError::Unpopulated(arg));
                }
            }
            let data = node.value().ok_or(GraphError::Unpopulated(arg))?;
            inputs.push(data.clone());
            versions.push(node.version());
        }
        let shape = graph.node(id)?.shape().clone();
        let out = device.calc(op, &inputs, &shape)?;
        if let NodeKind::Functor {
            value,
            version,
            arg_versions,
            ..
        } = &mut graph.node_mut(id)?.kind
        {
            *value = Some(out);
            *version += 1;
            *arg_versions = versions;
        }
        recomputed.push(id);
    }
    Ok(recomputed)
}

/// Dependency-ordered functor list reachable from `targets`, stopping
/// at `ignored` nodes.
fn postorder(
    graph: &Graph,
    targets: &[NodeId],
    ignored: &HashSet<NodeId>,
) -> Result<Vec<NodeId>, GraphError> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    // (node, children already expanded)
    let mut stack: Vec<(NodeId, bool)> = targets
        .iter()
        .rev()
        .map(|&t| (t, false))
        .collect();
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if visited.contains(&id) || ignored.contains(&id) {
            continue;
        }
        visited.insert(id);
        let node = graph.node(id)?;
        if matches!(node.kind, NodeKind::Functor { .. }) {
            stack.push((id, true));
            for &arg in node.args() {
                stack.push((arg, false));
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::reference::RemoteRef;

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    #[test]
    fn test_evaluate_chain() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[2]), &[1.0, 2.0]).unwrap();
        let b = g.leaf(DType::F64, shape(&[2]), &[3.0, 4.0]).unwrap();
        let sum = g.functor(Op::Add, vec![a, b]).unwrap();
        let out = g.functor(Op::Neg, vec![sum]).unwrap();

        let done = evaluate_targets(&mut g, &CpuDevice, &[out], &HashSet::new()).unwrap();
        assert_eq!(done, vec![sum, out]);
        assert_eq!(
            g.node(out).unwrap().value().unwrap().to_f64s(),
            vec![-4.0, -6.0]
        );
    }

    #[test]
    fn test_unchanged_inputs_skip_recompute() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[1]), &[2.0]).unwrap();
        let f = g.functor(Op::Sin, vec![a]).unwrap();

        evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new()).unwrap();
        assert_eq!(g.node(f).unwrap().version(), 1);

        let done = evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new()).unwrap();
        assert!(done.is_empty());
        assert_eq!(g.node(f).unwrap().version(), 1);

        g.set_leaf(a, &[3.0]).unwrap();
        let done = evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new()).unwrap();
        assert_eq!(done, vec![f]);
        assert_eq!(g.node(f).unwrap().version(), 2);
    }

    #[test]
    fn test_unpopulated_remote_fails() {
        let mut g = Graph::new();
        let r = g.remote(RemoteRef::new(
            "peer-b".into(),
            "uid".into(),
            DType::F64,
            shape(&[1]),
        )).unwrap();
        let f = g.functor(Op::Neg, vec![r]).unwrap();
        let err = evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new());
        assert!(matches!(err, Err(GraphError::Unpopulated(id)) if id == r));
    }

    #[test]
    fn test_populated_remote_feeds_functor() {
        let mut g = Graph::new();
        let r = g.remote(RemoteRef::new(
            "peer-b".into(),
            "uid".into(),
            DType::F64,
            shape(&[2]),
        )).unwrap();
        g.update_remote(r, &[1.0, -1.0], 1).unwrap();
        let f = g.functor(Op::Neg, vec![r]).unwrap();
        evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new()).unwrap();
        assert_eq!(
            g.node(f).unwrap().value().unwrap().to_f64s(),
            vec![-1.0, 1.0]
        );
    }

    #[test]
    fn test_remote_version_bump_triggers_recompute() {
        let mut g = Graph::new();
        let r = g.remote(RemoteRef::new(
            "peer-b".into(),
            "uid".into(),
            DType::F64,
            shape(&[1]),
        )).unwrap();
        g.update_remote(r, &[2.0], 1).unwrap();
        let f = g.functor(Op::Neg, vec![r]).unwrap();
        evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new()).unwrap();
        assert_eq!(g.node(f).unwrap().value().unwrap().to_f64s(), vec![-2.0]);

        // Stale re-delivery: no recompute.
        g.update_remote(r, &[9.0], 1).unwrap();
        let done = evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new()).unwrap();
        assert!(done.is_empty());

        g.update_remote(r, &[5.0], 2).unwrap();
        evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new()).unwrap();
        assert_eq!(g.node(f).unwrap().value().unwrap().to_f64s(), vec![-5.0]);
    }

    #[test]
    fn test_ignored_subtree_not_descended() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[1]), &[1.0]).unwrap();
        let inner = g.functor(Op::Neg, vec![a]).unwrap();
        let outer = g.functor(Op::Neg, vec![inner]).unwrap();

        // inner has no value and is ignored: outer cannot evaluate.
        let ignored: HashSet<NodeId> = [inner].into_iter().collect();
        let err = evaluate_targets(&mut g, &CpuDevice, &[outer], &ignored);
        assert!(matches!(err, Err(GraphError::Unpopulated(id)) if id == inner));
    }

    #[test]
    fn test_shared_subexpression_computed_once() {
        let mut g = Graph::new();
        let a = g.leaf(DType::F64, shape(&[1]), &[2.0]).unwrap();
        let n = g.functor(Op::Neg, vec![a]).unwrap();
        let f = g.functor(Op::Mul, vec![n, n]).unwrap();
        let done = evaluate_targets(&mut g, &CpuDevice, &[f], &HashSet::new()).unwrap();
        assert_eq!(done, vec![n, f]);
        assert_eq!(g.node(f).unwrap().value().unwrap().to_f64s(), vec![4.0]);
    }
}
