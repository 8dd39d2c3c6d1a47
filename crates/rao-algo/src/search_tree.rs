//! Depth-by-depth search over network action combinations.
//!
//! The root leaf starts from the pre-perimeter situation and gets its range
//! actions optimised. Every depth then blooms the current optimal leaf,
//! sorts the candidates by priority and optimises them on a rayon pool. One
//! leaf per candidate, each on a network leased from a [`NetworkPool`].
//!
//! Workers never touch the optimal leaf. They send a [`LeafOutcome`] to the
//! calling thread, which alone decides which leaf becomes optimal:
//!
//! ```text
//!  bloom ─▶ sort ─▶ spawn ──┬─▶ worker ─┐
//!                           ├─▶ worker ─┼─▶ channel ─▶ coordinator ─▶ optimal leaf
//!                           └─▶ worker ─┘                  │
//!                                 ▲                        │
//!                                 └──── winning rank ◀─────┘
//! ```
//!
//! Once a leaf reaches the stop criterion, its rank is published through an
//! atomic and workers holding a lower-priority candidate skip optimisation.

use crate::bloomer::{Candidate, SearchTreeBloomer};
use crate::leaf::{Leaf, LeafStatus};
use crate::network_pool::{NetworkLease, NetworkPool};
use crate::objective::ObjectiveFunction;
use crate::parameters::{RaoParameters, StopCriterion};
use crate::result::{
    EvaluationResult, FlowResult, LinearProblemStatus, RangeActionActivation, SensitivityResult,
};
use crate::sensitivity::SensitivityComputer;
use rao_core::{
    FlowCnec, Network, NetworkAction, NetworkActionCombination, OptimizationPerimeter, RaoError, RaoResult, State,
    Unit,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicUsize};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

const EPSILON: f64 = 1e-6;
const NO_WINNER: usize = usize::MAX;
const LOGGED_ELEMENTS: usize = 5;

/// Physics of the perimeter before any of its remedial actions.
#[derive(Debug, Clone)]
pub struct PrePerimeterResult {
    pub flow: FlowResult,
    pub sensitivity: SensitivityResult,
    pub setpoints: RangeActionActivation,
}

/// Everything a search tree needs besides its parameters.
pub struct SearchTreeInput {
    pub network: Network,
    pub perimeter: Arc<OptimizationPerimeter>,
    pub pre_perimeter: PrePerimeterResult,
    /// Reference for MNEC and loop-flow limits.
    pub initial_flows: FlowResult,
    pub sensitivity_computer: Arc<dyn SensitivityComputer>,
    pub objective: ObjectiveFunction,
    /// Combinations found efficient by an earlier run; searched first.
    pub detected_combinations: Vec<NetworkActionCombination>,
}

/// What a worker reports for one candidate.
enum LeafOutcome {
    Done { rank: usize, leaf: Leaf },
    Skipped { rank: usize },
    Failed { rank: usize, reason: String },
}

impl LeafOutcome {
    fn rank(&self) -> usize {
        match self {
            LeafOutcome::Done { rank, .. } | LeafOutcome::Skipped { rank } | LeafOutcome::Failed { rank, .. } => *rank,
        }
    }
}

/// Shared, read-only state of a run.
struct TreeContext {
    input: SearchTreeInput,
    parameters: RaoParameters,
    predefined: Vec<NetworkActionCombination>,
    purely_virtual: bool,
}

pub struct SearchTree {
    context: Arc<TreeContext>,
}

impl SearchTree {
    pub fn new(input: SearchTreeInput, parameters: RaoParameters) -> RaoResult<Self> {
        parameters.validate()?;
        let mut predefined = input.detected_combinations.clone();
        predefined.extend(predefined_combinations(&input.perimeter, &parameters));
        let purely_virtual = input.perimeter.is_purely_virtual();
        Ok(Self {
            context: Arc::new(TreeContext {
                input,
                parameters,
                predefined,
                purely_virtual,
            }),
        })
    }

    pub fn run(&self) -> RaoResult<SearchTreeResult> {
        let context = &self.context;
        let input = &context.input;
        let started = Instant::now();

        let root_evaluation = EvaluationResult {
            flow: input.pre_perimeter.flow.clone(),
            sensitivity: input.pre_perimeter.sensitivity.clone(),
            objective: input.objective.evaluate(&input.pre_perimeter.flow)?,
        };
        let mut root = Leaf::root(
            Arc::clone(&input.perimeter),
            NetworkLease::detached(input.network.clone()),
            root_evaluation,
            input.pre_perimeter.setpoints.clone(),
        );
        tracing::info!("{}: cost {:.2} before optimisation", root, root.cost()?);

        if context.stop_criterion_reached(&root)? {
            tracing::info!("stop criterion reached on the root leaf");
            root.finalize_optimization();
            return SearchTreeResult::from_leaf(&root, 0);
        }

        if input.perimeter.has_range_actions() {
            root.optimize(input, &context.parameters)?;
            if root.status() != LeafStatus::Optimized {
                tracing::warn!("{}: range action optimisation failed", root);
            }
        } else {
            tracing::info!("no range action to optimize");
        }
        root.finalize_optimization();
        log_most_limiting_elements(&root, 2);

        if context.stop_criterion_reached(&root)? {
            tracing::info!("stop criterion reached on the root leaf");
            return SearchTreeResult::from_leaf(&root, 0);
        }

        let (optimal, depth) = self.iterate_on_tree(Arc::new(root))?;
        tracing::info!(
            "search tree done in {:.2?}: {}, cost {:.2} at depth {}",
            started.elapsed(),
            optimal,
            optimal.cost()?,
            depth
        );
        log_most_limiting_elements(&optimal, LOGGED_ELEMENTS);
        SearchTreeResult::from_leaf(&optimal, depth)
    }

    fn iterate_on_tree(&self, root: Arc<Leaf>) -> RaoResult<(Arc<Leaf>, usize)> {
        let context = &self.context;
        let input = &context.input;
        let network_actions = input.perimeter.network_actions();
        if network_actions.is_empty() {
            tracing::info!("no network action available");
            return Ok((root, 0));
        }

        let configured = match context.parameters.multithreading.leaves_in_parallel {
            0 => num_cpus::get(),
            n => n,
        };
        let leaves_in_parallel = configured.min(network_actions.len()).max(1);
        tracing::debug!("evaluating {} leaves in parallel", leaves_in_parallel);
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(leaves_in_parallel)
            .thread_name(|index| format!("search-tree-leaf-{}", index))
            .build()
            .map_err(|e| RaoError::Other(format!("cannot build the leaf thread pool: {}", e)))?;
        let network_pool = NetworkPool::new(&input.network, leaves_in_parallel);
        let bloomer = SearchTreeBloomer::new(
            &input.network,
            &input.perimeter,
            &context.parameters,
            context.predefined.clone(),
            &input.pre_perimeter.setpoints,
        );

        let max_depth = context.parameters.topology.max_search_tree_depth;
        let mut optimal = root;
        let mut depth = 0;
        let mut depth_of_optimal = 0;
        while depth < max_depth && !context.stop_criterion_reached(&optimal)? {
            tracing::info!("search depth {} start", depth + 1);
            let candidates = sort_candidates(bloomer.bloom(&optimal, network_actions)?, &bloomer);
            if candidates.is_empty() {
                tracing::info!("no more network action available");
                break;
            }
            tracing::info!("{} leaves to evaluate", candidates.len());

            let previous = Arc::clone(&optimal);
            optimal = self.explore_depth(&thread_pool, &network_pool, Arc::clone(&previous), candidates)?;
            depth += 1;
            if Arc::ptr_eq(&previous, &optimal) {
                tracing::info!("no better result found in search depth {}", depth);
                break;
            }
            depth_of_optimal = depth;
            tracing::info!("search depth {} best leaf: {}, cost {:.2}", depth, optimal, optimal.cost()?);
            log_most_limiting_elements(&optimal, 2);
            if depth >= max_depth {
                tracing::info!("maximum search depth reached");
            }
        }
        Ok((optimal, depth_of_optimal))
    }

    /// Optimises every candidate of one depth and returns the new optimal leaf,
    /// which is `previous` when no candidate improved enough.
    ///
    /// Outcomes are applied in candidate order once all are in, so among equal
    /// costs the higher-priority combination wins whatever the completion
    /// order was.
    fn explore_depth(
        &self,
        thread_pool: &rayon::ThreadPool,
        network_pool: &NetworkPool,
        previous: Arc<Leaf>,
        candidates: Vec<Candidate>,
    ) -> RaoResult<Arc<Leaf>> {
        let context = &self.context;
        let total = candidates.len();
        let winner = Arc::new(AtomicUsize::new(NO_WINNER));
        let (sender, receiver) = mpsc::channel::<LeafOutcome>();

        for (rank, (combination, remove_range_actions)) in candidates.into_iter().enumerate() {
            let context = Arc::clone(context);
            let previous = Arc::clone(&previous);
            let network_pool = network_pool.clone();
            let winner = Arc::clone(&winner);
            let sender = sender.clone();
            thread_pool.spawn(move || {
                let label = combination.concatenated_id();
                let work = AssertUnwindSafe(|| {
                    context.optimize_one_leaf(&network_pool, &previous, rank, combination, remove_range_actions, &winner)
                });
                let outcome = match panic::catch_unwind(work) {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(err)) => LeafOutcome::Failed {
                        rank,
                        reason: err.to_string(),
                    },
                    Err(_) => LeafOutcome::Failed {
                        rank,
                        reason: "worker panicked".to_string(),
                    },
                };
                if let LeafOutcome::Failed { reason, .. } = &outcome {
                    tracing::warn!("cannot optimize remedial action combination {}: {}", label, reason);
                }
                let _ = sender.send(outcome);
            });
        }
        drop(sender);

        let previous_cost = previous.cost()?;
        let timeout = context.parameters.depth_timeout();
        let deadline = Instant::now() + timeout;
        let mut outcomes = Vec::with_capacity(total);
        while outcomes.len() < total {
            let outcome = match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(RaoError::Timeout(format!(
                        "{} of {} leaves still running after {:?}",
                        total - outcomes.len(),
                        total,
                        timeout
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RaoError::Other(format!(
                        "leaf workers stopped after {} of {} outcomes",
                        outcomes.len(),
                        total
                    )))
                }
            };
            if let LeafOutcome::Done { rank, leaf } = &outcome {
                if context.stop_criterion_reached(leaf)? && context.improved_enough(previous_cost, leaf)? {
                    winner.fetch_min(*rank, atomic::Ordering::SeqCst);
                }
            }
            outcomes.push(outcome);
            tracing::debug!("remaining leaves to evaluate: {}", total - outcomes.len());
        }

        outcomes.sort_by_key(LeafOutcome::rank);
        let mut optimal = previous;
        let mut optimal_cost = previous_cost;
        let mut stop_criterion_met = false;
        for outcome in outcomes {
            let leaf = match outcome {
                LeafOutcome::Done { leaf, .. } => leaf,
                LeafOutcome::Skipped { rank } => {
                    tracing::debug!("candidate #{} skipped: a higher-priority leaf reached the stop criterion", rank);
                    continue;
                }
                LeafOutcome::Failed { .. } => continue,
            };
            tracing::debug!("{}: cost {:.2} ({})", leaf, leaf.cost()?, leaf.status());
            if stop_criterion_met || !context.improved_enough(previous_cost, &leaf)? {
                continue;
            }
            let cost = leaf.cost()?;
            if cost < optimal_cost {
                stop_criterion_met = context.stop_criterion_reached(&leaf)?;
                if stop_criterion_met {
                    tracing::info!("stop criterion reached on {}", leaf);
                }
                optimal_cost = cost;
                optimal = Arc::new(leaf);
            }
        }
        Ok(optimal)
    }
}

impl TreeContext {
    fn optimize_one_leaf(
        &self,
        network_pool: &NetworkPool,
        previous: &Leaf,
        rank: usize,
        combination: NetworkActionCombination,
        remove_range_actions: bool,
        winner: &AtomicUsize,
    ) -> RaoResult<LeafOutcome> {
        let mut network = network_pool.checkout()?;
        if outranked(rank, winner) {
            tracing::debug!("skipping {}: a higher-priority leaf reached the stop criterion", combination);
            return Ok(LeafOutcome::Skipped { rank });
        }

        let perimeter = &self.input.perimeter;
        let starting_setpoints = if remove_range_actions {
            self.input.pre_perimeter.setpoints.clone()
        } else {
            previous.setpoints()?.clone()
        };
        starting_setpoints.apply(perimeter, perimeter.main_state(), &mut network)?;

        let mut leaf = Leaf::child(
            Arc::clone(perimeter),
            previous.network_actions(),
            combination,
            network,
            starting_setpoints,
        );
        leaf.evaluate(&self.input.objective, self.input.sensitivity_computer.as_ref())?;
        if leaf.status() == LeafStatus::Error {
            return Ok(LeafOutcome::Failed {
                rank,
                reason: format!("{} could not be evaluated", leaf),
            });
        }
        tracing::debug!("{}: evaluated, cost {:.2}", leaf, leaf.cost()?);

        if !self.stop_criterion_reached(&leaf)? {
            if outranked(rank, winner) {
                tracing::debug!("skipping optimisation of {}: a higher-priority leaf reached the stop criterion", leaf);
            } else if perimeter.has_range_actions() {
                leaf.optimize(&self.input, &self.parameters)?;
            }
        }
        leaf.finalize_optimization();
        Ok(LeafOutcome::Done { rank, leaf })
    }

    /// No virtual cost, and either nothing to optimise or the configured
    /// criterion met.
    fn stop_criterion_reached(&self, leaf: &Leaf) -> RaoResult<bool> {
        if leaf.virtual_cost()? > EPSILON {
            return Ok(false);
        }
        if self.purely_virtual {
            tracing::debug!("perimeter is purely virtual and virtual cost is zero");
            return Ok(true);
        }
        let objective = &self.parameters.objective_function;
        Ok(match objective.stop_criterion {
            StopCriterion::MinObjective => false,
            StopCriterion::AtTargetObjectiveValue => leaf.cost()? < objective.target_objective_value,
        })
    }

    /// Whether `leaf` beats the previous depth's cost by the minimum impact
    /// thresholds. A leaf that reaches the stop criterion only has to beat it.
    fn improved_enough(&self, previous_cost: f64, leaf: &Leaf) -> RaoResult<bool> {
        let topology = &self.parameters.topology;
        let relative = topology.relative_min_impact_threshold.max(0.0);
        let absolute = topology.absolute_min_impact_threshold.max(0.0);
        let cost = leaf.cost()?;
        if previous_cost > cost && self.stop_criterion_reached(leaf)? {
            return Ok(true);
        }
        Ok(improves_by_thresholds(previous_cost, cost, relative, absolute))
    }
}

fn improves_by_thresholds(previous_cost: f64, cost: f64, relative: f64, absolute: f64) -> bool {
    let sign = if previous_cost > 0.0 {
        1.0
    } else if previous_cost < 0.0 {
        -1.0
    } else {
        0.0
    };
    previous_cost - absolute > cost && (1.0 - sign * relative) * previous_cost > cost
}

fn outranked(rank: usize, winner: &AtomicUsize) -> bool {
    rank > winner.load(atomic::Ordering::SeqCst)
}

/// Parameter combinations resolved against the perimeter's network actions.
fn predefined_combinations(perimeter: &OptimizationPerimeter, parameters: &RaoParameters) -> Vec<NetworkActionCombination> {
    let mut combinations = Vec::new();
    'combinations: for ids in &parameters.topology.predefined_combinations {
        let mut actions: Vec<Arc<NetworkAction>> = Vec::with_capacity(ids.len());
        for id in ids {
            match perimeter.network_actions().iter().find(|action| &action.id == id) {
                Some(action) => actions.push(Arc::clone(action)),
                None => {
                    tracing::warn!("predefined combination {:?} ignored: unknown network action '{}'", ids, id);
                    continue 'combinations;
                }
            }
        }
        combinations.push(NetworkActionCombination::new(actions, false));
    }
    combinations
}

/// 32-bit FNV-1a, stable across runs and platforms.
fn stable_hash(value: &str) -> u32 {
    value.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

/// Priority order of candidates: detected during an earlier run first, then
/// predefined, then larger, then a stable hash of the concatenated id.
pub fn compare_combinations(
    a: &NetworkActionCombination,
    b: &NetworkActionCombination,
    is_predefined: impl Fn(&NetworkActionCombination) -> bool,
) -> Ordering {
    let (id_a, id_b) = (a.concatenated_id(), b.concatenated_id());
    b.is_detected_during_rao()
        .cmp(&a.is_detected_during_rao())
        .then_with(|| is_predefined(b).cmp(&is_predefined(a)))
        .then_with(|| b.len().cmp(&a.len()))
        .then_with(|| stable_hash(&id_a).cmp(&stable_hash(&id_b)))
        .then_with(|| id_a.cmp(&id_b))
}

fn sort_candidates(mut candidates: Vec<Candidate>, bloomer: &SearchTreeBloomer<'_>) -> Vec<Candidate> {
    candidates.sort_by(|(a, _), (b, _)| compare_combinations(a, b, |c| bloomer.is_predefined(c)));
    candidates.dedup_by(|(a, _), (b, _)| a == b);
    candidates
}

fn log_most_limiting_elements(leaf: &Leaf, count: usize) {
    match leaf.most_limiting_elements(count) {
        Ok(elements) if !elements.is_empty() => {
            tracing::info!("{}: most limiting elements {}", leaf, elements.join(", "))
        }
        Ok(_) => {}
        Err(err) => tracing::debug!("{}: {}", leaf, err),
    }
}

/// Optimal leaf of a search tree, read per state.
#[derive(Debug, Clone)]
pub struct SearchTreeResult {
    perimeter: Arc<OptimizationPerimeter>,
    network_actions: BTreeSet<String>,
    setpoints: RangeActionActivation,
    evaluation: EvaluationResult,
    status: Option<LinearProblemStatus>,
    depth: usize,
}

impl SearchTreeResult {
    fn from_leaf(leaf: &Leaf, depth: usize) -> RaoResult<Self> {
        let result = leaf.result()?;
        Ok(Self {
            perimeter: Arc::clone(leaf.perimeter()),
            network_actions: leaf.activated_network_actions(),
            setpoints: result.setpoints().clone(),
            evaluation: result.evaluation().clone(),
            status: leaf.optimization_status(),
            depth,
        })
    }

    /// Status of the range action optimisation of the optimal leaf; `None`
    /// when range actions were not optimised.
    pub fn status(&self) -> Option<LinearProblemStatus> {
        self.status
    }

    /// Depth the optimal leaf was found at; 0 for the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Network actions are only activated at the main state.
    pub fn activated_network_actions(&self, state: &State) -> BTreeSet<String> {
        if state == self.perimeter.main_state() {
            self.network_actions.clone()
        } else {
            BTreeSet::new()
        }
    }

    pub fn activated_range_actions(&self, state: &State) -> BTreeSet<String> {
        self.setpoints.activated(state)
    }

    /// Setpoints of the range actions activated at `state`.
    pub fn optimized_setpoints(&self, state: &State) -> RaoResult<BTreeMap<String, f64>> {
        self.activated_range_actions(state)
            .into_iter()
            .map(|id| Ok((id.clone(), self.setpoints.setpoint(&id, state)?)))
            .collect()
    }

    pub fn setpoint(&self, range_action_id: &str, state: &State) -> RaoResult<f64> {
        self.setpoints.setpoint(range_action_id, state)
    }

    pub fn tap(&self, range_action_id: &str, state: &State) -> RaoResult<i32> {
        let range_action = self
            .perimeter
            .range_action(range_action_id)
            .ok_or_else(|| RaoError::Validation(format!("unknown range action '{}'", range_action_id)))?;
        self.setpoints.tap(&range_action, state)
    }

    pub fn setpoints(&self) -> &RangeActionActivation {
        &self.setpoints
    }

    pub fn cost(&self) -> f64 {
        self.evaluation.cost()
    }

    pub fn functional_cost(&self) -> f64 {
        self.evaluation.objective.functional_cost
    }

    pub fn virtual_cost(&self) -> f64 {
        self.evaluation.objective.virtual_cost()
    }

    /// Zero for a virtual cost that is not computed.
    pub fn virtual_cost_of(&self, name: &str) -> f64 {
        self.evaluation.objective.virtual_costs.get(name).copied().unwrap_or(0.0)
    }

    pub fn virtual_cost_names(&self) -> impl Iterator<Item = &str> {
        self.evaluation.objective.virtual_costs.keys().map(String::as_str)
    }

    pub fn most_limiting_elements(&self, count: usize) -> Vec<String> {
        self.evaluation
            .objective
            .most_limiting_elements
            .iter()
            .take(count)
            .cloned()
            .collect()
    }

    pub fn costly_elements(&self, virtual_cost: &str, count: usize) -> Vec<String> {
        self.evaluation
            .objective
            .costly_elements
            .get(virtual_cost)
            .map(|elements| elements.iter().take(count).cloned().collect())
            .unwrap_or_default()
    }

    pub fn flow(&self, cnec: &FlowCnec, unit: Unit) -> RaoResult<f64> {
        self.evaluation.flow.flow(cnec, unit)
    }

    pub fn margin(&self, cnec: &FlowCnec, unit: Unit) -> RaoResult<f64> {
        self.evaluation.flow.margin(cnec, unit)
    }
}
