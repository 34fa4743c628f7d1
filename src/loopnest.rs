//! The partial loop-nest tree the search explores. Each node is a slice of
//! some stage's loop nest: a leaf is the innermost point-compute body, an
//! interior node is a loop over tiles. Sibling trees share unmodified
//! subtrees through `Rc`, so replicating a candidate is cheap.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ptr;
use std::rc::Rc;

use divrem::DivCeil;
use log::debug;
use smallvec::{smallvec, SmallVec};

use crate::common::{Extents, PARALLELISM_FLOOR, VECTOR_WIDTH};
use crate::dag::{EdgeId, FunctionDag, NodeId};
use crate::expr::{self, Expr};
use crate::tiling::generate_tilings;

/// The box a stage must cover for one representative iteration of a loop
/// level, with the least work any placement of the stage could do there.
#[derive(Clone, Debug, Default)]
pub struct Bound {
    /// Concrete `[lo, hi]` per dimension.
    pub region: SmallVec<[(i64, i64); 4]>,
    /// Fewest points that must be evaluated: realize the whole region, or
    /// answer every call if inlined, whichever is smaller.
    pub min_points: i64,
    /// The essential compute cost of those points.
    pub min_cost: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum BoundsError {
    #[error(
        "bound for stage \"{stage}\" dimension {dim} did not reduce to a constant: [{min}, {max}]"
    )]
    NonConstantBound {
        stage: String,
        dim: usize,
        min: String,
        max: String,
    },
    #[error("stage \"{stage}\" has no consumers at this loop level")]
    MissingConsumer { stage: String },
}

/// Optional per-stage cost attribution, filled by [`LoopNest::cost`] when a
/// caller wants the predicted-runtime report.
#[derive(Debug, Default)]
pub struct CostDetails {
    pub node_costs: HashMap<NodeId, f64>,
    pub edge_costs: HashMap<EdgeId, f64>,
    pub inlined: BTreeSet<NodeId>,
}

/// One loop-nest fragment of a partial schedule. The root has no stage and
/// stands for all top-level parallel work.
#[derive(Clone, Debug, Default)]
pub struct LoopNest {
    /// The stage this loop iterates over; absent at the root.
    pub func: Option<NodeId>,
    /// Whether this is the innermost loop of its stage.
    pub innermost: bool,
    /// Whether splitting this loop further is still permitted. Sliding a
    /// producer over it turns this off.
    pub tileable: bool,
    /// Loop extents, one per dimension.
    pub size: Extents,
    /// Loops nested inside this one.
    pub children: Vec<Rc<LoopNest>>,
    /// Stages inlined into this body and their per-point call multipliers.
    /// Only valid on innermost nodes.
    pub inlined: BTreeMap<NodeId, i64>,
    /// Stages whose storage is allocated at this level.
    pub store_at: BTreeSet<NodeId>,
    /// Memoized bounds per stage. A pure cache: it depends only on the
    /// subtree below and on bounds fixed when the node was created, so it
    /// stays valid across clones.
    bounds: RefCell<HashMap<NodeId, Bound>>,
}

impl LoopNest {
    pub fn is_root(&self) -> bool {
        self.func.is_none()
    }

    /// The bounds required of `f` for one representative iteration of this
    /// loop. Cached per node.
    pub fn get_bounds(&self, f: NodeId, dag: &FunctionDag) -> Result<Bound, BoundsError> {
        if let Some(b) = self.bounds.borrow().get(&f) {
            return Ok(b.clone());
        }
        let node = dag.node(f);
        let bound = if dag.outgoing(f).is_empty() && self.is_root() {
            // An output: covered by the user-supplied estimates.
            let region = node.estimate_region.clone().ok_or_else(|| {
                BoundsError::MissingConsumer {
                    stage: node.stage.name().to_owned(),
                }
            })?;
            let min_points: i64 = region.iter().map(|(lo, hi)| hi - lo + 1).product();
            Bound {
                region,
                min_points,
                min_cost: min_points as f64 * node.compute,
            }
        } else {
            if dag.outgoing(f).is_empty() {
                return Err(BoundsError::MissingConsumer {
                    stage: node.stage.name().to_owned(),
                });
            }
            let mut region: SmallVec<[(i64, i64); 4]> = smallvec![];
            let mut calls_if_inlined: i64 = 0;
            for e in dag.outgoing(f) {
                let e = dag.edge(*e);
                let consumer_bounds = self.get_bounds(e.consumer, dag)?;
                let consumer_name = dag.name(e.consumer);
                let mut bindings = HashMap::new();
                for (i, (lo, hi)) in consumer_bounds.region.iter().enumerate() {
                    bindings.insert(format!("{consumer_name}.{i}.min"), Expr::from(*lo));
                    bindings.insert(format!("{consumer_name}.{i}.max"), Expr::from(*hi));
                }
                calls_if_inlined += consumer_bounds.min_points * e.calls;
                for (i, interval) in e.bounds.iter().enumerate() {
                    let min = expr::simplify(&expr::substitute(&bindings, &interval.min));
                    let max = expr::simplify(&expr::substitute(&bindings, &interval.max));
                    let (imin, imax) = match (min.as_const_int(), max.as_const_int()) {
                        (Some(a), Some(b)) => (a, b),
                        _ => {
                            return Err(BoundsError::NonConstantBound {
                                stage: node.stage.name().to_owned(),
                                dim: i,
                                min: min.to_string(),
                                max: max.to_string(),
                            })
                        }
                    };
                    if i >= region.len() {
                        region.push((imin, imax));
                    } else {
                        region[i].0 = region[i].0.min(imin);
                        region[i].1 = region[i].1.min(imax);
                    }
                }
            }
            let points_if_realized: i64 = region.iter().map(|(lo, hi)| hi - lo + 1).product();
            Bound {
                region,
                min_points: points_if_realized.min(calls_if_inlined),
                min_cost: (points_if_realized as f64 * node.compute)
                    .min(calls_if_inlined as f64 * node.compute_if_inlined),
            }
        };
        self.bounds.borrow_mut().insert(f, bound.clone());
        Ok(bound)
    }

    /// The total modeled cost of everything under this node, where
    /// `instances` is the product of all enclosing loop extents.
    ///
    /// Side effects: `compute_site` records, per stage, the loop under which
    /// the stage's nest first appears, and `overcompute` records each
    /// stage's vectorization inflation factor at its innermost loop.
    pub fn cost<'a>(
        &'a self,
        dag: &FunctionDag,
        compute_site: &mut HashMap<NodeId, &'a LoopNest>,
        overcompute: &mut HashMap<NodeId, f64>,
        instances: i64,
        parent: Option<&'a LoopNest>,
        mut details: Option<&mut CostDetails>,
    ) -> Result<f64, BoundsError> {
        if let (Some(func), Some(parent)) = (self.func, parent) {
            compute_site.entry(func).or_insert(parent);
        }

        let mut result = 0.0;

        let mut subinstances = instances * self.size.iter().product::<i64>();
        if self.innermost {
            // The innermost extent rounds up to the vector width, and the
            // loop header taxes short loops.
            let ideal_subinstances = subinstances;
            subinstances /= self.size[0];
            subinstances *= DivCeil::div_ceil(self.size[0], VECTOR_WIDTH) * VECTOR_WIDTH;
            let mut factor = subinstances as f64 / ideal_subinstances as f64;
            factor *= (self.size[0] as f64 + 0.01) / self.size[0] as f64;
            if let Some(func) = self.func {
                overcompute.insert(func, factor);
            }
        }

        for c in &self.children {
            result += c.cost(
                dag,
                compute_site,
                overcompute,
                subinstances,
                Some(self),
                details.as_deref_mut(),
            )?;
        }

        // Bill compute and memory for every stage realized at this level.
        for &f in &self.store_at {
            let bounds_realized = self.get_bounds(f, dag)?;
            let points: f64 = bounds_realized
                .region
                .iter()
                .map(|(lo, hi)| (hi - lo + 1) as f64)
                .product();
            let node = dag.node(f);
            let mut compute_cost = node.compute * points * subinstances as f64;
            // Recompute within a single realization comes from vector
            // rounding of the innermost loop; overlap between realizations
            // is charged through `points` itself.
            compute_cost *= overcompute.get(&f).copied().unwrap_or_default();
            if let Some(details) = details.as_deref_mut() {
                details.node_costs.insert(f, compute_cost);
            }

            // Storage folding shrinks the live region when the compute site
            // is nested strictly inside the store site.
            let mut discount = 1.0;
            if let Some(site) = compute_site.get(&f).copied() {
                if !ptr::eq(site, self) {
                    let bounds_computed = site.get_bounds(f, dag)?;
                    discount = 1.01;
                    for i in (0..bounds_realized.region.len()).rev() {
                        let (rlo, rhi) = bounds_realized.region[i];
                        let (clo, chi) = bounds_computed.region[i];
                        let realized_extent = rhi - rlo + 1;
                        let computed_extent = chi - clo + 1;
                        if realized_extent == computed_extent {
                            continue;
                        }
                        discount = computed_extent as f64 / realized_extent as f64;
                        break;
                    }
                    if details.is_some() {
                        debug!(
                            "folding discount for {}: {}",
                            node.stage.name(),
                            discount
                        );
                    }
                }
            }

            // Cold loads times the per-load cost; the discount cheapens each
            // load but does not reduce their number.
            let cost_per_cold_load = (discount * points).ln();
            let num_cold_loads = instances as f64 * points;
            let mem_cost = node.memory * num_cold_loads * cost_per_cold_load;
            for e in dag.outgoing(f) {
                result += mem_cost;
                if let Some(details) = details.as_deref_mut() {
                    details.edge_costs.insert(*e, mem_cost);
                }
            }
            result += mem_cost + compute_cost;
        }

        for (&f, &calls) in &self.inlined {
            result += dag.node(f).compute_if_inlined * subinstances as f64 * calls as f64;
            if let Some(details) = details.as_deref_mut() {
                details.inlined.insert(f);
            }
        }

        Ok(result)
    }

    /// Whether anything under this node calls `f`.
    pub fn calls(&self, f: NodeId, dag: &FunctionDag) -> bool {
        for c in &self.children {
            if c.calls(f, dag) {
                return true;
            }
        }
        for e in dag.outgoing_edges(f) {
            if Some(e.consumer) == self.func {
                return true;
            }
            if self.inlined.contains_key(&e.consumer) {
                return true;
            }
        }
        false
    }

    /// Whether this subtree computes `f`, either as a loop nest or inlined.
    pub fn computes(&self, f: NodeId) -> bool {
        if self.func == Some(f) {
            return true;
        }
        if self.inlined.contains_key(&f) {
            return true;
        }
        self.children.iter().any(|c| c.computes(f))
    }

    /// A copy of this tree with `f` inlined into every innermost body that
    /// calls it. Subtrees that never reference `f` stay shared.
    pub fn inline_func(&self, f: NodeId, dag: &FunctionDag) -> LoopNest {
        let mut result = self.clone();

        for (i, c) in self.children.iter().enumerate() {
            if c.calls(f, dag) {
                result.children[i] = Rc::new(c.inline_func(f, dag));
            }
        }

        if self.innermost {
            let mut calls = 0;
            for e in dag.outgoing_edges(f) {
                if let Some(&multiplier) = self.inlined.get(&e.consumer) {
                    calls += multiplier * e.calls;
                }
                if Some(e.consumer) == self.func {
                    calls += e.calls;
                }
            }
            if calls != 0 {
                result.inlined.insert(f, calls);
            }
        }
        result
    }

    /// Appends a new innermost loop for `f` covering its required bounds at
    /// this level.
    fn compute_here(&mut self, f: NodeId, dag: &FunctionDag) -> Result<(), BoundsError> {
        let bounds = self.get_bounds(f, dag)?;
        let mut node = LoopNest {
            func: Some(f),
            innermost: true,
            tileable: true,
            ..LoopNest::default()
        };
        // Seed the new loop's own bound: one representative iteration of an
        // innermost body touches a single point.
        let mut single_point = Bound {
            region: smallvec![],
            min_points: 1,
            min_cost: dag.node(f).compute,
        };
        for &(lo, hi) in &bounds.region {
            node.size.push(hi - lo + 1);
            single_point.region.push((lo, lo));
        }
        node.bounds.get_mut().insert(f, single_point);
        self.children.push(Rc::new(node));
        Ok(())
    }

    /// All placements of the unscheduled stage `f` at or below this loop:
    /// compute-and-store here, tile this loop and place `f` per tile
    /// (optionally sliding by storing at the outer tile loop and computing
    /// further in), or push the whole decision into the unique child that
    /// calls `f`.
    pub fn compute_in_tiles(
        &self,
        f: NodeId,
        dag: &FunctionDag,
        parent: Option<&LoopNest>,
        in_realization: bool,
    ) -> Result<Vec<LoopNest>, BoundsError> {
        let mut result = Vec::new();

        // Which child could the computation be fused into?
        let mut child: Option<usize> = None;
        let mut called_by_multiple_children = false;
        for (i, c) in self.children.iter().enumerate() {
            if c.calls(f, dag) {
                if child.is_some() {
                    called_by_multiple_children = true;
                }
                child = Some(i);
            }
        }

        {
            let mut here = self.clone();
            here.compute_here(f, dag)?;
            if !in_realization {
                here.store_at.insert(f);
            }
            result.push(here);
        }

        if dag.outgoing(f).is_empty() {
            // Outputs are placed whole; tiling them is the emitter's job.
            return Ok(result);
        }

        if self.tileable {
            if let (Some(func), Some(parent)) = (self.func, parent) {
                for t in generate_tilings(&self.size, !in_realization) {
                    if parent.is_root() {
                        // Root-level tilings must supply enough parallel tasks.
                        let total: i64 = t.iter().product();
                        if total < PARALLELISM_FLOOR {
                            continue;
                        }
                    }

                    let mut outer = self.clone();
                    let mut inner = LoopNest {
                        func: self.func,
                        innermost: self.innermost,
                        tileable: self.tileable,
                        size: smallvec![1; self.size.len()],
                        ..LoopNest::default()
                    };

                    // The inner loop absorbs the current body wholesale.
                    std::mem::swap(&mut inner.children, &mut outer.children);
                    std::mem::swap(&mut inner.inlined, &mut outer.inlined);
                    std::mem::swap(&mut inner.bounds, &mut outer.bounds);
                    std::mem::swap(&mut inner.store_at, &mut outer.store_at);
                    outer.innermost = false;

                    let Some(mut own_bound) = inner.bounds.borrow().get(&func).cloned() else {
                        continue;
                    };

                    // Move factors from the outer loop to the inner loop and
                    // narrow the outer bound to a single tile.
                    let parent_bounds = parent.get_bounds(func, dag)?;
                    for (i, &factor) in t.iter().enumerate() {
                        inner.size[i] = DivCeil::div_ceil(outer.size[i], factor);
                        outer.size[i] = factor;
                        let min = parent_bounds.region[i].0;
                        let extent = parent_bounds.region[i].1 - min + 1;
                        let tile_extent = DivCeil::div_ceil(extent, factor);
                        own_bound.region[i] = (min, min + tile_extent - 1);
                    }
                    outer.bounds.get_mut().insert(func, own_bound);

                    let inner = Rc::new(inner);
                    outer.children.push(Rc::clone(&inner));

                    // Site the computation inside the outer tile loop.
                    let mut compute_at_here = outer.clone();
                    compute_at_here.compute_here(f, dag)?;
                    if !in_realization {
                        compute_at_here.store_at.insert(f);
                    }
                    result.push(compute_at_here);

                    if !in_realization {
                        // Store here but compute further in: sliding.
                        // Parallelism is pinned at the root, so the storage
                        // placement doesn't constrain it.
                        let mut store_at_here = outer;
                        store_at_here.store_at.insert(f);
                        let v = inner.compute_in_tiles(f, dag, Some(&store_at_here), true)?;
                        for mut n in v {
                            // Re-tiling a loop a stage slides over confuses
                            // downstream bounds analysis.
                            n.tileable = false;
                            let mut candidate = store_at_here.clone();
                            candidate.children.pop();
                            candidate.children.push(Rc::new(n));
                            result.push(candidate);
                        }
                    }
                }
            }
        }

        if let Some(child_idx) = child {
            if !called_by_multiple_children {
                for store_here in [false, true] {
                    if store_here && (in_realization || self.is_root()) {
                        // Storage is already placed further out, or storing
                        // at the root would constrain the parallel loops.
                        continue;
                    }
                    let v =
                        self.children[child_idx].compute_in_tiles(f, dag, Some(self), store_here)?;
                    for n in v {
                        let mut r = self.clone();
                        if store_here {
                            r.store_at.insert(f);
                        }
                        r.children[child_idx] = Rc::new(n);
                        result.push(r);
                    }
                }
            }
        }

        Ok(result)
    }

    /// Writes an indented rendering of the tree, one loop per line.
    pub fn dump<W: fmt::Write>(
        &self,
        w: &mut W,
        dag: &FunctionDag,
        prefix: &str,
    ) -> fmt::Result {
        let mut prefix = prefix.to_owned();
        if let Some(f) = self.func {
            write!(w, "{}{}", prefix, dag.name(f))?;
            prefix.push(' ');
        }
        for s in &self.size {
            write!(w, " {s}")?;
        }
        if self.tileable {
            write!(w, " t")?;
        }
        if self.innermost {
            writeln!(w, " *")?;
        } else {
            writeln!(w)?;
        }
        for &f in &self.store_at {
            writeln!(w, "{}realize: {}", prefix, dag.name(f))?;
        }
        for c in self.children.iter().rev() {
            c.dump(w, dag, &prefix)?;
        }
        for (&f, calls) in &self.inlined {
            writeln!(w, "{}inlined: {} {}", prefix, dag.name(f), calls)?;
        }
        Ok(())
    }
}
