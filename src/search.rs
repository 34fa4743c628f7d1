//! Beam search over partial schedules, and the environment-driven entry
//! point that wraps it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use log::debug;

use crate::common::MachineParams;
use crate::dag::{DagError, FunctionDag, NodeId};
use crate::emit::{self, Directive};
use crate::loopnest::{BoundsError, CostDetails, LoopNest};
use crate::stage::Stage;

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Dag(#[from] DagError),
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error("partial schedule fails to compute stage \"{stage}\"")]
    IncoherentState { stage: String },
    #[error("search queue drained before every stage was scheduled")]
    Exhausted,
}

/// A partial schedule of the whole pipeline: the loop-nest tree so far, the
/// modeled cost, and how many stages have been committed.
#[derive(Clone, Debug, Default)]
pub struct State {
    pub root: LoopNest,
    pub cost: f64,
    pub num_funcs_scheduled: usize,
}

impl State {
    /// Recomputes `cost` as overhead above the minimum necessary work of the
    /// stages scheduled so far, which makes states at different scheduling
    /// depths comparable.
    pub fn calculate_cost(&mut self, dag: &FunctionDag) -> Result<(), BoundsError> {
        let mut compute_site = HashMap::new();
        let mut overcompute = HashMap::new();
        self.cost = self
            .root
            .cost(dag, &mut compute_site, &mut overcompute, 1, None, None)?;
        for i in 0..self.num_funcs_scheduled {
            self.cost -= self.root.get_bounds(NodeId(i), dag)?.min_cost;
        }
        Ok(())
    }

    /// Emits every legal way to schedule the next stage, in reverse
    /// realization order (outputs first, then their producers).
    pub fn generate_children(
        &self,
        dag: &FunctionDag,
        accept: &mut dyn FnMut(State),
    ) -> Result<(), SearchError> {
        if self.num_funcs_scheduled == dag.len() {
            return Ok(());
        }
        let f = NodeId(self.num_funcs_scheduled);
        for e in dag.outgoing_edges(f) {
            if !self.root.computes(e.consumer) {
                return Err(SearchError::IncoherentState {
                    stage: dag.name(e.consumer).to_owned(),
                });
            }
        }

        // Inline it. Outputs have no call sites to substitute into.
        if !dag.outgoing(f).is_empty() {
            let mut child = self.clone();
            child.root = self.root.inline_func(f, dag);
            child.num_funcs_scheduled += 1;
            child.calculate_cost(dag)?;
            if !child.root.computes(f) {
                return Err(SearchError::IncoherentState {
                    stage: dag.name(f).to_owned(),
                });
            }
            accept(child);
        }

        // Realize it somewhere.
        for root in self.root.compute_in_tiles(f, dag, None, false)? {
            let mut child = State {
                root,
                cost: 0.0,
                num_funcs_scheduled: self.num_funcs_scheduled + 1,
            };
            child.calculate_cost(dag)?;
            if !child.root.computes(f) {
                return Err(SearchError::IncoherentState {
                    stage: dag.name(f).to_owned(),
                });
            }
            accept(child);
        }
        Ok(())
    }

    /// Per-stage predicted `(compute, memory)` cost of the schedule, with
    /// inlined stages' memory charges folded into their consumers.
    pub fn predicted_runtimes(
        &self,
        dag: &FunctionDag,
    ) -> Result<Vec<(NodeId, f64, f64)>, BoundsError> {
        let mut compute_site = HashMap::new();
        let mut overcompute = HashMap::new();
        let mut details = CostDetails::default();
        self.root.cost(
            dag,
            &mut compute_site,
            &mut overcompute,
            1,
            None,
            Some(&mut details),
        )?;

        let mut edge_costs = details.edge_costs;
        for i in (0..dag.len()).rev() {
            let f = NodeId(i);
            if details.inlined.contains(&f) {
                let charge: f64 = dag
                    .incoming(f)
                    .iter()
                    .filter_map(|e| edge_costs.get(e))
                    .sum();
                for e in dag.outgoing(f) {
                    *edge_costs.entry(*e).or_insert(0.0) += charge;
                }
            }
        }

        let mut rows: Vec<(NodeId, f64, f64)> = details
            .node_costs
            .iter()
            .map(|(&f, &compute_cost)| {
                let mem_cost: f64 = dag
                    .incoming(f)
                    .iter()
                    .filter_map(|e| edge_costs.get(e))
                    .sum();
                (f, compute_cost, mem_cost)
            })
            .collect();
        rows.sort_by_key(|r| r.0);
        Ok(rows)
    }

    pub fn dump(&self, dag: &FunctionDag) -> String {
        let mut out = format!("State with cost {}:\n", self.cost);
        let _ = self.root.dump(&mut out, dag, "");
        out
    }
}

/// Orders the heap by ascending cost.
struct Scored(State);

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.0.cost == other.0.cost
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cost.total_cmp(&self.0.cost)
    }
}

/// Runs the beam search: repeatedly trims the queue to the best `beam_size`
/// states, then expands each of them, until a fully scheduled state reaches
/// the front.
pub fn optimal_schedule(dag: &FunctionDag, beam_size: usize) -> Result<State, SearchError> {
    let mut q = BinaryHeap::new();
    q.push(Scored(State::default()));

    let mut expansions: u32 = 0;
    loop {
        if q.len() > beam_size {
            let mut trimmed = BinaryHeap::with_capacity(beam_size);
            while trimmed.len() < beam_size {
                match q.pop() {
                    Some(s) => trimmed.push(s),
                    None => break,
                }
            }
            q = trimmed;
        }

        let mut pending = std::mem::take(&mut q);
        while let Some(Scored(state)) = pending.pop() {
            if state.num_funcs_scheduled == dag.len() {
                return Ok(state);
            }
            state.generate_children(dag, &mut |child| {
                expansions = expansions.wrapping_add(1);
                if expansions & 1023 == 0 {
                    debug!(
                        "{} candidates expanded, {}/{} stages scheduled",
                        expansions,
                        child.num_funcs_scheduled,
                        dag.len()
                    );
                }
                q.push(Scored(child));
            })?;
        }

        if q.is_empty() {
            return Err(SearchError::Exhausted);
        }
    }
}

const BEAM_SIZE_VAR: &str = "HL_BEAM_SIZE";
const TIME_LIMIT_VAR: &str = "HL_AUTO_SCHEDULE_TIME_LIMIT";

#[derive(Clone, Debug)]
pub struct AutoscheduleOptions {
    pub beam_size: usize,
    /// When set, the beam size is doubled iteratively (1, 2, 4, ...) and the
    /// best state found is kept, stopping once elapsed time exceeds half the
    /// limit.
    pub time_limit: Option<Duration>,
}

impl Default for AutoscheduleOptions {
    fn default() -> Self {
        AutoscheduleOptions {
            beam_size: 1,
            time_limit: None,
        }
    }
}

impl AutoscheduleOptions {
    /// Reads the recognized environment variables once; resolved values are
    /// passed by value from here on.
    pub fn from_env() -> Self {
        let beam_size = std::env::var(BEAM_SIZE_VAR)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);
        let time_limit = std::env::var(TIME_LIMIT_VAR)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|&t| t > 0.0)
            .map(Duration::from_secs_f64);
        AutoscheduleOptions {
            beam_size,
            time_limit,
        }
    }
}

/// The winning schedule: the ordered directive sequence for the external
/// realizer, a human-readable rendering of the loop-nest tree, and the
/// modeled cost.
#[derive(Clone, Debug)]
pub struct Autoschedule {
    pub directives: Vec<Directive>,
    pub dump: String,
    pub cost: f64,
}

/// Builds the pipeline DAG, searches for the best schedule, and emits it.
pub fn autoschedule(
    outputs: &[Stage],
    params: &MachineParams,
    options: &AutoscheduleOptions,
) -> Result<Autoschedule, SearchError> {
    let dag = FunctionDag::new(outputs, params)?;
    dag.dump();

    let optimal = match options.time_limit {
        Some(limit) => {
            let start = Instant::now();
            let mut best = optimal_schedule(&dag, 1)?;
            let mut beam_size = 2;
            while start.elapsed() <= limit / 2 {
                let s = optimal_schedule(&dag, beam_size)?;
                if s.cost < best.cost {
                    best = s;
                }
                beam_size *= 2;
            }
            best
        }
        None => optimal_schedule(&dag, options.beam_size)?,
    };

    let dump = optimal.dump(&dag);
    debug!("optimal schedule:\n{dump}");
    for (f, compute_cost, mem_cost) in optimal.predicted_runtimes(&dag)? {
        debug!(
            "stage {} has predicted cost {} = {} + {}",
            dag.name(f),
            compute_cost + mem_cost,
            compute_cost,
            mem_cost
        );
    }

    let directives = emit::apply_schedule(&optimal.root, &dag, params)?;
    Ok(Autoschedule {
        directives,
        dump,
        cost: optimal.cost,
    })
}
