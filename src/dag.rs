//! The producer/consumer graph the search runs over, with per-node cost
//! coefficients and per-edge symbolic footprints, all derived once up front.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use log::debug;
use smallvec::SmallVec;

use crate::common::MachineParams;
use crate::expr::{self, Callee, Expr, Interval, LeafCounter, Scope};
use crate::stage::Stage;

/// Index of a node in [`FunctionDag::nodes`]. Nodes are stored in reverse
/// realization order, so index 0 is an output and every producer has a
/// strictly greater index than all of its consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EdgeId(pub usize);

#[derive(Debug)]
pub struct Node {
    pub stage: Stage,
    /// Arithmetic done per point evaluated when the stage is realized,
    /// including the work of generating each call.
    pub compute: f64,
    /// Arithmetic done per call site when the stage is inlined.
    pub compute_if_inlined: f64,
    /// Cost coefficient applied to each cold load of the stage's values.
    pub memory: f64,
    /// The symbolic region of this stage, one `[<name>.<i>.min,
    /// <name>.<i>.max]` interval per dimension.
    pub region: Vec<Interval>,
    /// Concrete `[lo, hi]` per dimension when the user supplied an estimate
    /// for every dimension.
    pub estimate_region: Option<SmallVec<[(i64, i64); 4]>>,
}

#[derive(Debug)]
pub struct Edge {
    pub producer: NodeId,
    pub consumer: NodeId,
    /// Region of the producer required per symbolic region of the consumer.
    pub bounds: Vec<Interval>,
    /// Calls the consumer makes to the producer per point evaluated.
    pub calls: i64,
}

#[derive(thiserror::Error, Debug)]
pub enum DagError {
    #[error("output stage \"{stage}\" needs an extent estimate on dimension {dim}")]
    MissingEstimate { stage: String, dim: usize },
    #[error("stage \"{stage}\" has update definitions, which are not supported")]
    UnsupportedStage { stage: String },
}

/// The whole pipeline: nodes in reverse realization order plus edge indices
/// for walking either direction. Immutable once built; the search borrows it
/// for its entire run, so it is deliberately not `Clone`.
#[derive(Debug)]
pub struct FunctionDag {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<EdgeId>>,
    incoming: Vec<Vec<EdgeId>>,
}

impl FunctionDag {
    pub fn new(outputs: &[Stage], params: &MachineParams) -> Result<FunctionDag, DagError> {
        for o in outputs {
            for (dim, arg) in o.args().iter().enumerate() {
                if o.estimate_for(arg).is_none() {
                    return Err(DagError::MissingEstimate {
                        stage: o.name().to_owned(),
                        dim,
                    });
                }
            }
        }

        // Realization order: producers before consumers, outputs last.
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        for o in outputs {
            visit_producers_first(o, &mut visited, &mut order);
        }
        // Nodes go in reverse realization order, outputs first.
        order.reverse();
        let ids: HashMap<String, NodeId> = order
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_owned(), NodeId(i)))
            .collect();

        let mut nodes = Vec::with_capacity(order.len());
        let mut edges = Vec::new();
        for (i, consumer) in order.iter().enumerate() {
            if consumer.has_updates() {
                return Err(DagError::UnsupportedStage {
                    stage: consumer.name().to_owned(),
                });
            }

            // The symbolic region this stage is evaluated over.
            let mut scope = Scope::new();
            let mut region = Vec::with_capacity(consumer.dimensions());
            for (d, arg) in consumer.args().iter().enumerate() {
                let interval = Interval {
                    min: expr::var(&format!("{}.{}.min", consumer.name(), d)),
                    max: expr::var(&format!("{}.{}.max", consumer.name(), d)),
                };
                scope.insert(arg.clone(), interval.clone());
                region.push(interval);
            }

            let mut counter = LeafCounter::default();
            for v in consumer.values() {
                counter.visit(v);
            }

            // The cost model's per-stage coefficients. Wider element types
            // have lower vector throughput, so work scales with byte width.
            let bytes_per_element: i64 = consumer
                .values()
                .iter()
                .map(|v| i64::from(v.dtype().bytes()))
                .sum();
            let compute = (counter.leaves * bytes_per_element) as f64;
            let compute_if_inlined =
                ((counter.leaves - consumer.dimensions() as i64).max(0) * bytes_per_element) as f64;
            let memory = bytes_per_element as f64 * params.balance
                / (params.last_level_cache_size as f64).ln();

            let estimate_region = resolve_estimates(consumer);

            for (callee, bbox) in expr::required_boxes(consumer.values(), &scope) {
                // Loads from input images don't become edges.
                if let Callee::Stage(producer) = callee {
                    if let Some(&producer_id) = ids.get(producer.name()) {
                        let bounds = bbox
                            .into_iter()
                            .map(|iv| Interval {
                                min: expr::simplify(&expr::apply_param_estimates(&iv.min)),
                                max: expr::simplify(&expr::apply_param_estimates(&iv.max)),
                            })
                            .collect();
                        edges.push(Edge {
                            producer: producer_id,
                            consumer: NodeId(i),
                            bounds,
                            calls: counter.calls.get(producer.name()).copied().unwrap_or(0),
                        });
                    }
                }
            }

            nodes.push(Node {
                stage: consumer.clone(),
                compute,
                compute_if_inlined,
                memory,
                region,
                estimate_region,
            });
        }

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        for (i, e) in edges.iter().enumerate() {
            outgoing[e.producer.0].push(EdgeId(i));
            incoming[e.consumer.0].push(EdgeId(i));
        }

        Ok(FunctionDag {
            nodes,
            edges,
            outgoing,
            incoming,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0]
    }

    pub fn name(&self, id: NodeId) -> &str {
        self.nodes[id.0].stage.name()
    }

    /// Edges from `id` to its consumers.
    pub fn outgoing(&self, id: NodeId) -> &[EdgeId] {
        &self.outgoing[id.0]
    }

    /// Edges from producers of `id`.
    pub fn incoming(&self, id: NodeId) -> &[EdgeId] {
        &self.incoming[id.0]
    }

    pub fn outgoing_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.outgoing[id.0].iter().map(|e| &self.edges[e.0])
    }

    pub fn incoming_edges(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.incoming[id.0].iter().map(|e| &self.edges[e.0])
    }

    pub fn node_id_of(&self, stage: &Stage) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.stage.same_as(stage))
            .map(NodeId)
    }

    /// Logs every node and edge for debugging.
    pub fn dump(&self) {
        for n in &self.nodes {
            debug!(
                "node {}: region [{}], compute {}, inlined {}, memory {}",
                n.stage.name(),
                n.region
                    .iter()
                    .map(|i| format!("{}..{}", i.min, i.max))
                    .join(", "),
                n.compute,
                n.compute_if_inlined,
                n.memory,
            );
        }
        for e in &self.edges {
            debug!(
                "edge {} -> {}: footprint [{}], {} calls",
                self.name(e.producer),
                self.name(e.consumer),
                e.bounds
                    .iter()
                    .map(|i| format!("{}..{}", i.min, i.max))
                    .join(", "),
                e.calls,
            );
        }
    }
}

fn resolve_estimates(stage: &Stage) -> Option<SmallVec<[(i64, i64); 4]>> {
    let mut region = SmallVec::new();
    for arg in stage.args() {
        let (min, extent) = stage.estimate_for(arg)?;
        region.push((min, min + extent - 1));
    }
    Some(region)
}

fn visit_producers_first(stage: &Stage, visited: &mut HashSet<String>, order: &mut Vec<Stage>) {
    if !visited.insert(stage.name().to_owned()) {
        return;
    }
    let mut producers = Vec::new();
    for v in stage.values() {
        collect_stage_callees(v, &mut producers);
    }
    for p in &producers {
        visit_producers_first(p, visited, order);
    }
    order.push(stage.clone());
}

fn collect_stage_callees(e: &Expr, out: &mut Vec<Stage>) {
    match e {
        Expr::Binary(_, a, b) => {
            collect_stage_callees(a, out);
            collect_stage_callees(b, out);
        }
        Expr::Call(c) => {
            for a in &c.args {
                collect_stage_callees(a, out);
            }
            if let Callee::Stage(s) = &c.callee {
                out.push(s.clone());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{lit, var};
    use proptest::prelude::*;

    fn chain(n: usize, offset: i64) -> Vec<Stage> {
        let mut stages = vec![Stage::define(
            "s0",
            &["x", "y"],
            vec![(var("x") + var("y")) * (var("x") + var("y"))],
        )];
        for i in 1..n {
            let prev = stages[i - 1].clone();
            let body = prev.at(vec![var("x") + offset, var("y")])
                + prev.at(vec![var("x") - offset, var("y")]);
            stages.push(Stage::define(format!("s{i}"), &["x", "y"], vec![body]));
        }
        let last = stages.last().unwrap();
        last.set_estimate("x", 0, 1024).set_estimate("y", 0, 1024);
        stages
    }

    #[test]
    fn test_output_is_node_zero() {
        let stages = chain(3, 1);
        let dag = FunctionDag::new(&[stages[2].clone()], &MachineParams::generic()).unwrap();
        assert_eq!(dag.len(), 3);
        assert_eq!(dag.name(NodeId(0)), "s2");
        assert_eq!(dag.name(NodeId(2)), "s0");
        // Outputs have no consumers; sources have no producers.
        assert!(dag.outgoing(NodeId(0)).is_empty());
        assert!(dag.incoming(NodeId(2)).is_empty());
    }

    #[test]
    fn test_edge_footprint_covers_stencil() {
        let stages = chain(2, 9);
        let dag = FunctionDag::new(&[stages[1].clone()], &MachineParams::generic()).unwrap();
        let edge = dag.outgoing_edges(NodeId(1)).next().unwrap();
        assert_eq!(edge.calls, 2);
        // Footprint in x is [s1.0.min - 9, s1.0.max + 9]; it only reduces to
        // integers once the consumer's symbolic bounds are substituted.
        let mut bindings = std::collections::HashMap::new();
        bindings.insert("s1.0.min".to_owned(), lit(0));
        bindings.insert("s1.0.max".to_owned(), lit(99));
        let min = expr::simplify(&expr::substitute(&bindings, &edge.bounds[0].min));
        let max = expr::simplify(&expr::substitute(&bindings, &edge.bounds[0].max));
        assert_eq!(min.as_const_int(), Some(-9));
        assert_eq!(max.as_const_int(), Some(108));
    }

    #[test]
    fn test_compute_coefficients() {
        let f = Stage::define("f", &["x", "y"], vec![var("x") + var("y")]);
        f.set_estimate("x", 0, 16).set_estimate("y", 0, 16);
        let dag = FunctionDag::new(&[f], &MachineParams::new(8, 16 << 20, 100.0)).unwrap();
        let n = dag.node(NodeId(0));
        // Two leaves, four bytes per element.
        assert_eq!(n.compute, 8.0);
        // Inlining saves the two dimension leaves, clamped at zero.
        assert_eq!(n.compute_if_inlined, 0.0);
        assert!(n.memory > 0.0);
    }

    #[test]
    fn test_image_loads_do_not_become_edges() {
        use crate::common::Dtype;
        use crate::expr::ImageParam;

        let input = ImageParam::new("input", Dtype::Float32);
        let f = Stage::define(
            "f",
            &["x", "y"],
            vec![input.at(vec![var("x"), var("y")]) * 2],
        );
        f.set_estimate("x", 0, 16).set_estimate("y", 0, 16);
        let dag = FunctionDag::new(&[f], &MachineParams::generic()).unwrap();
        assert_eq!(dag.len(), 1);
        assert!(dag.edges.is_empty());
        // The load still counts toward the stage's arithmetic: two var
        // leaves, one call, two addressing leaves, one literal, all f32.
        assert_eq!(dag.node(NodeId(0)).compute, 24.0);
    }

    #[test]
    fn test_update_definitions_rejected() {
        let f = Stage::define("f", &["x"], vec![var("x")]);
        f.set_estimate("x", 0, 16);
        f.push_update(vec![var("x") + 1]);
        let err = FunctionDag::new(&[f], &MachineParams::generic()).unwrap_err();
        assert!(matches!(err, DagError::UnsupportedStage { stage } if stage == "f"));
    }

    #[test]
    fn test_missing_estimate_rejected() {
        let f = Stage::define("f", &["x", "y"], vec![var("x")]);
        f.set_estimate("x", 0, 16);
        let err = FunctionDag::new(&[f], &MachineParams::generic()).unwrap_err();
        assert!(matches!(err, DagError::MissingEstimate { dim: 1, .. }));
    }

    proptest! {
        /// Every producer appears strictly after all of its consumers.
        #[test]
        fn test_reverse_realization_order(len in 1usize..7, offset in 0i64..12) {
            let stages = chain(len, offset);
            let dag = FunctionDag::new(
                &[stages.last().unwrap().clone()],
                &MachineParams::generic(),
            ).unwrap();
            for e in 0..dag.edges.len() {
                let e = dag.edge(EdgeId(e));
                prop_assert!(e.producer.0 > e.consumer.0);
            }
        }
    }
}
