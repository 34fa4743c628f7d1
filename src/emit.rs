//! Emission of the winning schedule as an ordered directive sequence for an
//! external loop-nest realizer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::MachineParams;
use crate::dag::{FunctionDag, NodeId};
use crate::loopnest::{BoundsError, LoopNest};

/// A position in the realized loop nest: the whole program, or a particular
/// loop variable of a particular stage.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum LoopLevel {
    Root,
    At { stage: String, var: String },
}

/// One instruction to the external realizer. The realizer receives the
/// sequence in order; later directives may reference variables introduced by
/// earlier ones.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Directive {
    ComputeRoot {
        stage: String,
    },
    Split {
        stage: String,
        var: String,
        outer: String,
        inner: String,
        factor: i64,
    },
    Vectorize {
        stage: String,
        var: String,
        width: i64,
    },
    Unroll {
        stage: String,
        var: String,
    },
    Parallel {
        stage: String,
        var: String,
        /// Iterations per task, when coarser than one.
        task_size: Option<i64>,
    },
    Fuse {
        stage: String,
        inner: String,
        outer: String,
        fused: String,
    },
    StoreAt {
        stage: String,
        at: LoopLevel,
    },
    ComputeAt {
        stage: String,
        at: LoopLevel,
    },
    Reorder {
        stage: String,
        vars: Vec<String>,
    },
}

/// Walks the winning tree and issues the full directive sequence, ending
/// with one reorder per stage carrying the accumulated variable order.
pub fn apply_schedule(
    root: &LoopNest,
    dag: &FunctionDag,
    params: &MachineParams,
) -> Result<Vec<Directive>, BoundsError> {
    let mut directives = Vec::new();
    let mut vars_map: HashMap<NodeId, Vec<String>> = HashMap::new();
    apply(
        root,
        dag,
        &mut vars_map,
        f64::from(params.parallelism),
        &mut directives,
    )?;

    let mut stages: Vec<NodeId> = vars_map.keys().copied().collect();
    stages.sort();
    for f in stages {
        directives.push(Directive::Reorder {
            stage: dag.name(f).to_owned(),
            vars: vars_map[&f].clone(),
        });
    }
    Ok(directives)
}

fn apply(
    node: &LoopNest,
    dag: &FunctionDag,
    vars_map: &mut HashMap<NodeId, Vec<String>>,
    num_cores: f64,
    out: &mut Vec<Directive>,
) -> Result<(), BoundsError> {
    let Some(f) = node.func else {
        // Every direct child of the root is computed at root level.
        for c in &node.children {
            if let Some(cf) = c.func {
                out.push(Directive::ComputeRoot {
                    stage: dag.name(cf).to_owned(),
                });
            }
            apply(c, dag, vars_map, num_cores, out)?;
        }
        return Ok(());
    };

    let stage = &dag.node(f).stage;
    let stage_name = stage.name().to_owned();
    let dimensions = stage.dimensions();
    let mut vars = vars_map
        .get(&f)
        .cloned()
        .unwrap_or_else(|| stage.args().to_vec());

    let mut num_cores = num_cores;
    let new_here;
    if node.innermost {
        let v = vars[0].clone();
        new_here = LoopLevel::At {
            stage: stage_name.clone(),
            var: v.clone(),
        };
        if node.size[0] >= 16 {
            out.push(Directive::Vectorize {
                stage: stage_name.clone(),
                var: v.clone(),
                width: 16,
            });
        } else if node.size[0] >= 8 {
            out.push(Directive::Vectorize {
                stage: stage_name.clone(),
                var: v.clone(),
                width: 8,
            });
        } else if node.size[0] >= 4 {
            out.push(Directive::Vectorize {
                stage: stage_name.clone(),
                var: v.clone(),
                width: 4,
            });
        }
        // Once tiled at least once the inner extents are known, so short
        // ones can be unrolled.
        if vars.len() > dimensions && node.size[0] <= 32 {
            out.push(Directive::Unroll {
                stage: stage_name.clone(),
                var: v,
            });
        }
        if num_cores > 1.0 {
            let task_size = *node.size.last().unwrap_or(&1) as f64 / num_cores;
            out.push(Directive::Parallel {
                stage: stage_name.clone(),
                var: vars[dimensions - 1].clone(),
                task_size: (task_size > 1.0).then(|| task_size.ceil() as i64),
            });
        }
    } else {
        // The implied splits: one outer/inner pair per dimension, sized by
        // the extents this loop covers.
        let bounds = node.get_bounds(f, dag)?;
        let mut new_inner = Vec::with_capacity(bounds.region.len());
        for (i, &(lo, hi)) in bounds.region.iter().enumerate() {
            let extent = hi - lo + 1;
            let old = vars[i].clone();
            let outer = format!("{old}o");
            let inner = format!("{old}i");
            out.push(Directive::Split {
                stage: stage_name.clone(),
                var: old,
                outer: outer.clone(),
                inner: inner.clone(),
                factor: extent,
            });
            vars[i] = outer;
            new_inner.push(inner);
        }

        // Parallelize outer dimensions from outermost inward, then fuse
        // them into a single parallel loop to avoid nesting.
        if num_cores > 1.0 {
            let mut innermost_parallel_dimension = 0;
            let mut num_parallel_dimensions = 0;
            for i in (0..dimensions).rev() {
                if num_cores <= 1.0 {
                    break;
                }
                out.push(Directive::Parallel {
                    stage: stage_name.clone(),
                    var: vars[i].clone(),
                    task_size: None,
                });
                num_parallel_dimensions += 1;
                innermost_parallel_dimension = i;
                num_cores /= node.size[i] as f64;
            }
            for _ in 1..num_parallel_dimensions {
                let inner_var = vars[innermost_parallel_dimension].clone();
                let outer_var = vars[innermost_parallel_dimension + 1].clone();
                let fused = format!("{inner_var}_{outer_var}");
                out.push(Directive::Fuse {
                    stage: stage_name.clone(),
                    inner: inner_var,
                    outer: outer_var,
                    fused: fused.clone(),
                });
                vars[innermost_parallel_dimension] = fused;
                vars.remove(innermost_parallel_dimension + 1);
            }
        }

        new_here = LoopLevel::At {
            stage: stage_name.clone(),
            var: vars[0].clone(),
        };
        for (i, inner_var) in new_inner.into_iter().enumerate() {
            vars.insert(i, inner_var);
        }
    }
    vars_map.insert(f, vars);

    for &stored in &node.store_at {
        out.push(Directive::StoreAt {
            stage: dag.name(stored).to_owned(),
            at: new_here.clone(),
        });
    }
    for c in &node.children {
        if c.func != node.func {
            if let Some(cf) = c.func {
                out.push(Directive::ComputeAt {
                    stage: dag.name(cf).to_owned(),
                    at: new_here.clone(),
                });
            }
        }
        apply(c, dag, vars_map, num_cores, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::FunctionDag;
    use crate::expr::var;
    use crate::search::optimal_schedule;
    use crate::stage::Stage;
    use std::collections::{HashMap, HashSet};

    /// Interprets a directive sequence the way a realizer would, tracking
    /// per-stage known variables and the placement relationships.
    #[derive(Default)]
    struct MockRealizer {
        vars: HashMap<String, Vec<String>>,
        compute_root: HashSet<String>,
        compute_at: HashMap<String, LoopLevel>,
        store_at: HashMap<String, LoopLevel>,
        splits: HashMap<String, Vec<i64>>,
    }

    impl MockRealizer {
        fn known(&self, stage: &str, v: &str) -> bool {
            self.vars
                .get(stage)
                .is_some_and(|vs| vs.iter().any(|k| k == v))
        }

        fn level_is_known(&self, at: &LoopLevel) {
            if let LoopLevel::At { stage, var } = at {
                assert!(
                    self.known(stage, var),
                    "directive targets unknown loop level {stage}.{var}"
                );
            }
        }

        fn interpret(dag: &FunctionDag, directives: &[Directive]) -> MockRealizer {
            let mut r = MockRealizer::default();
            for n in dag.nodes() {
                r.vars
                    .insert(n.stage.name().to_owned(), n.stage.args().to_vec());
            }
            for d in directives {
                match d {
                    Directive::ComputeRoot { stage } => {
                        r.compute_root.insert(stage.clone());
                    }
                    Directive::Split {
                        stage,
                        var,
                        outer,
                        inner,
                        factor,
                    } => {
                        assert!(r.known(stage, var), "split of unknown var {stage}.{var}");
                        assert!(*factor >= 1);
                        let vs = r.vars.get_mut(stage).unwrap();
                        vs.retain(|v| v != var);
                        vs.push(outer.clone());
                        vs.push(inner.clone());
                        r.splits.entry(stage.clone()).or_default().push(*factor);
                    }
                    Directive::Vectorize { stage, var, width } => {
                        assert!(r.known(stage, var));
                        assert!([4, 8, 16].contains(width));
                    }
                    Directive::Unroll { stage, var } => {
                        assert!(r.known(stage, var));
                    }
                    Directive::Parallel { stage, var, .. } => {
                        assert!(r.known(stage, var));
                    }
                    Directive::Fuse {
                        stage,
                        inner,
                        outer,
                        fused,
                    } => {
                        assert!(r.known(stage, inner) && r.known(stage, outer));
                        let vs = r.vars.get_mut(stage).unwrap();
                        vs.retain(|v| v != inner && v != outer);
                        vs.push(fused.clone());
                    }
                    Directive::StoreAt { stage, at } => {
                        r.level_is_known(at);
                        r.store_at.insert(stage.clone(), at.clone());
                    }
                    Directive::ComputeAt { stage, at } => {
                        r.level_is_known(at);
                        r.compute_at.insert(stage.clone(), at.clone());
                    }
                    Directive::Reorder { stage, vars } => {
                        for v in vars {
                            assert!(r.known(stage, v), "reorder of unknown var {stage}.{v}");
                        }
                    }
                }
            }
            r
        }
    }

    fn fused_stencil() -> FunctionDag {
        let (x, y) = (var("x"), var("y"));
        let f = Stage::define(
            "f",
            &["x", "y"],
            vec![
                (x.clone() + y.clone())
                    * (x.clone() + y.clone() * 2)
                    * (x.clone() + y.clone() * 3),
            ],
        );
        let h = Stage::define(
            "h",
            &["x", "y"],
            vec![
                f.at(vec![x.clone() - 9, y.clone() - 9]) + f.at(vec![x.clone() + 9, y.clone() + 9]),
            ],
        );
        h.set_estimate("x", 0, 2048).set_estimate("y", 0, 2048);
        FunctionDag::new(&[h], &MachineParams::new(8, 16 * 1024 * 1024, 100.0)).unwrap()
    }

    /// Stages of direct root children, in emission order.
    fn root_stages(root: &LoopNest, dag: &FunctionDag) -> HashSet<String> {
        root.children
            .iter()
            .filter_map(|c| c.func.map(|f| dag.name(f).to_owned()))
            .collect()
    }

    /// For every parent/child pair with differing stages, the child's stage
    /// mapped to the stage of the loop it is computed under.
    fn nesting_relations(root: &LoopNest, dag: &FunctionDag, out: &mut HashMap<String, String>) {
        for c in &root.children {
            if let (Some(pf), Some(cf)) = (root.func, c.func) {
                if pf != cf {
                    out.insert(dag.name(cf).to_owned(), dag.name(pf).to_owned());
                }
            }
            nesting_relations(c, dag, out);
        }
    }

    #[test]
    fn test_emitted_sequence_reconstructs_tree() {
        let dag = fused_stencil();
        let optimal = optimal_schedule(&dag, 1).unwrap();
        let params = MachineParams::new(8, 16 * 1024 * 1024, 100.0);
        let directives = apply_schedule(&optimal.root, &dag, &params).unwrap();

        let realized = MockRealizer::interpret(&dag, &directives);

        // Root placement matches the tree.
        assert_eq!(realized.compute_root, root_stages(&optimal.root, &dag));

        // Compute-at relationships mirror parent/child nesting.
        let mut expected = HashMap::new();
        nesting_relations(&optimal.root, &dag, &mut expected);
        for (child, parent) in &expected {
            let at = realized
                .compute_at
                .get(child)
                .unwrap_or_else(|| panic!("missing compute_at for {child}"));
            match at {
                LoopLevel::At { stage, .. } => assert_eq!(stage, parent),
                LoopLevel::Root => panic!("{child} computed at root, expected inside {parent}"),
            }
        }

        // Store-at directives cover every non-root store site in the tree.
        fn stored_below_root(n: &LoopNest, dag: &FunctionDag, out: &mut HashSet<String>) {
            for c in &n.children {
                for &s in &c.store_at {
                    out.insert(dag.name(s).to_owned());
                }
                stored_below_root(c, dag, out);
            }
        }
        let mut expected_stores = HashSet::new();
        stored_below_root(&optimal.root, &dag, &mut expected_stores);
        for s in &expected_stores {
            assert!(realized.store_at.contains_key(s), "missing store_at for {s}");
        }

        // Split factors match the per-dimension extents of the tiled loops.
        fn expected_splits(
            n: &LoopNest,
            dag: &FunctionDag,
            out: &mut HashMap<String, Vec<i64>>,
        ) {
            if let Some(f) = n.func {
                if !n.innermost {
                    let b = n.get_bounds(f, dag).unwrap();
                    out.entry(dag.name(f).to_owned()).or_default().extend(
                        b.region.iter().map(|&(lo, hi)| hi - lo + 1),
                    );
                }
            }
            for c in &n.children {
                expected_splits(c, dag, out);
            }
        }
        let mut expected_factors = HashMap::new();
        expected_splits(&optimal.root, &dag, &mut expected_factors);
        for (stage, factors) in &expected_factors {
            assert_eq!(
                realized.splits.get(stage),
                Some(factors),
                "split factors for {stage} diverge"
            );
        }
    }

    #[test]
    fn test_untiled_innermost_vectorizes_and_parallelizes() {
        let (x, y) = (var("x"), var("y"));
        let h = Stage::define(
            "h",
            &["x", "y"],
            vec![(x.clone() + y.clone()) * (x.clone() + y.clone())],
        );
        h.set_estimate("x", 0, 100).set_estimate("y", 0, 100);
        let params = MachineParams::new(8, 16 * 1024 * 1024, 100.0);
        let dag = FunctionDag::new(&[h], &params).unwrap();
        let optimal = optimal_schedule(&dag, 1).unwrap();
        let directives = apply_schedule(&optimal.root, &dag, &params).unwrap();

        assert!(directives.contains(&Directive::ComputeRoot {
            stage: "h".to_owned()
        }));
        assert!(directives.contains(&Directive::Vectorize {
            stage: "h".to_owned(),
            var: "x".to_owned(),
            width: 16,
        }));
        // 100 iterations over 8 cores rounds up to 13 per task.
        assert!(directives.contains(&Directive::Parallel {
            stage: "h".to_owned(),
            var: "y".to_owned(),
            task_size: Some(13),
        }));
        // No tiling happened, so nothing to unroll and nothing to split.
        assert!(!directives
            .iter()
            .any(|d| matches!(d, Directive::Unroll { .. } | Directive::Split { .. })));
        assert!(directives.contains(&Directive::Reorder {
            stage: "h".to_owned(),
            vars: vec!["x".to_owned(), "y".to_owned()],
        }));
    }

    #[test]
    fn test_small_extents_pick_narrower_vectors() {
        let (x, y) = (var("x"), var("y"));
        let h = Stage::define(
            "h",
            &["x", "y"],
            vec![(x.clone() + y.clone()) * (x.clone() + y.clone())],
        );
        h.set_estimate("x", 0, 9).set_estimate("y", 0, 64);
        let params = MachineParams::new(1, 16 * 1024 * 1024, 100.0);
        let dag = FunctionDag::new(&[h], &params).unwrap();
        let optimal = optimal_schedule(&dag, 1).unwrap();
        let directives = apply_schedule(&optimal.root, &dag, &params).unwrap();

        assert!(directives.contains(&Directive::Vectorize {
            stage: "h".to_owned(),
            var: "x".to_owned(),
            width: 8,
        }));
        // A single core emits no parallel directive.
        assert!(!directives
            .iter()
            .any(|d| matches!(d, Directive::Parallel { .. })));
    }
}
