//! Search-tree leaves.
//!
//! A leaf is one candidate set of network actions applied on its own network
//! copy. It moves through
//!
//! ```text
//! Created ──evaluate──▶ Evaluated ──optimize──▶ Optimized
//!    │                                  ▲           │
//!    └──sensitivity failure──▶ Error    └─optimize──┘
//! ```
//!
//! and keeps its results once [`Leaf::finalize_optimization`] has released
//! the network.

use crate::iterating_optimizer::{IteratingLinearOptimizer, IteratingLinearOptimizerInput};
use crate::network_pool::NetworkLease;
use crate::objective::ObjectiveFunction;
use crate::parameters::RaoParameters;
use crate::result::{
    EvaluationResult, LinearOptimizationResult, LinearProblemStatus, OptimizedResult, RangeActionActivation,
};
use crate::search_tree::SearchTreeInput;
use crate::sensitivity::SensitivityComputer;
use crate::usage_limits;
use rao_core::{
    FlowCnec, NetworkAction, NetworkActionCombination, OptimizationPerimeter, RaoError, RaoResult, State, Unit,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafStatus {
    Created,
    Evaluated,
    Optimized,
    Error,
}

impl fmt::Display for LeafStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LeafStatus::Created => "created",
            LeafStatus::Evaluated => "evaluated",
            LeafStatus::Optimized => "optimized",
            LeafStatus::Error => "error",
        };
        write!(f, "{}", label)
    }
}

/// The result a leaf answers from.
#[derive(Debug, Clone, Copy)]
pub enum LeafResult<'a> {
    Evaluated {
        evaluation: &'a EvaluationResult,
        setpoints: &'a RangeActionActivation,
    },
    Optimized(&'a OptimizedResult),
}

impl<'a> LeafResult<'a> {
    pub fn evaluation(&self) -> &'a EvaluationResult {
        match self {
            LeafResult::Evaluated { evaluation, .. } => evaluation,
            LeafResult::Optimized(result) => &result.evaluation,
        }
    }

    pub fn setpoints(&self) -> &'a RangeActionActivation {
        match self {
            LeafResult::Evaluated { setpoints, .. } => setpoints,
            LeafResult::Optimized(result) => &result.activation,
        }
    }
}

pub struct Leaf {
    perimeter: Arc<OptimizationPerimeter>,
    network: Option<NetworkLease>,
    /// Parent actions followed by the leaf's own combination.
    network_actions: Vec<Arc<NetworkAction>>,
    combination: Option<NetworkActionCombination>,
    status: LeafStatus,
    /// Setpoints of the network before optimisation.
    starting_setpoints: RangeActionActivation,
    evaluation: Option<EvaluationResult>,
    optimized: Option<OptimizedResult>,
}

impl Leaf {
    /// Root leaf, already evaluated on the pre-perimeter situation.
    pub fn root(
        perimeter: Arc<OptimizationPerimeter>,
        network: NetworkLease,
        evaluation: EvaluationResult,
        starting_setpoints: RangeActionActivation,
    ) -> Self {
        Self {
            perimeter,
            network: Some(network),
            network_actions: Vec::new(),
            combination: None,
            status: LeafStatus::Evaluated,
            starting_setpoints,
            evaluation: Some(evaluation),
            optimized: None,
        }
    }

    /// Child of a leaf whose actions were `parent_actions`. Every action is
    /// applied on `network`; a leaf whose actions cannot be applied is born
    /// in error.
    pub fn child(
        perimeter: Arc<OptimizationPerimeter>,
        parent_actions: &[Arc<NetworkAction>],
        combination: NetworkActionCombination,
        mut network: NetworkLease,
        starting_setpoints: RangeActionActivation,
    ) -> Self {
        let mut network_actions = parent_actions.to_vec();
        network_actions.extend(combination.network_actions().iter().cloned());
        let mut status = LeafStatus::Created;
        for action in &network_actions {
            if let Err(err) = action.apply(&mut network) {
                tracing::warn!("{}: {}", combination, err);
                status = LeafStatus::Error;
                break;
            }
        }
        Self {
            perimeter,
            network: Some(network),
            network_actions,
            combination: Some(combination),
            status,
            starting_setpoints,
            evaluation: None,
            optimized: None,
        }
    }

    pub fn status(&self) -> LeafStatus {
        self.status
    }

    pub fn perimeter(&self) -> &Arc<OptimizationPerimeter> {
        &self.perimeter
    }

    pub fn is_root(&self) -> bool {
        self.combination.is_none()
    }

    /// Combination the leaf added to its parent's actions.
    pub fn combination(&self) -> Option<&NetworkActionCombination> {
        self.combination.as_ref()
    }

    pub fn network_actions(&self) -> &[Arc<NetworkAction>] {
        &self.network_actions
    }

    pub fn activated_network_actions(&self) -> BTreeSet<String> {
        self.network_actions.iter().map(|action| action.id.clone()).collect()
    }

    /// Runs the sensitivity computation, or refreshes the cost of an
    /// evaluated leaf. A sensitivity failure puts the leaf in error.
    pub fn evaluate(&mut self, objective: &ObjectiveFunction, computer: &dyn SensitivityComputer) -> RaoResult<()> {
        match self.status {
            LeafStatus::Evaluated => {
                if let Some(evaluation) = self.evaluation.as_mut() {
                    evaluation.objective = objective.evaluate(&evaluation.flow)?;
                }
                Ok(())
            }
            LeafStatus::Created => {
                let network = self
                    .network
                    .as_deref()
                    .ok_or_else(|| RaoError::ResultNotAvailable(format!("{}: network already released", self)))?;
                match computer.compute(network, &self.perimeter, &self.starting_setpoints) {
                    Ok(physics) => {
                        let objective = objective.evaluate(&physics.flow)?;
                        tracing::debug!("{}: evaluated, cost {:.2}", self, objective.cost());
                        self.evaluation = Some(EvaluationResult {
                            flow: physics.flow,
                            sensitivity: physics.sensitivity,
                            objective,
                        });
                        self.status = LeafStatus::Evaluated;
                    }
                    Err(err) => {
                        tracing::warn!("{}: sensitivity computation failed: {}", self, err);
                        self.status = LeafStatus::Error;
                    }
                }
                Ok(())
            }
            LeafStatus::Optimized | LeafStatus::Error => Ok(()),
        }
    }

    /// Optimises range actions on top of the leaf's network actions.
    pub fn optimize(&mut self, input: &SearchTreeInput, parameters: &RaoParameters) -> RaoResult<()> {
        if matches!(self.status, LeafStatus::Created | LeafStatus::Error) {
            tracing::warn!("{}: cannot optimize a {} leaf", self, self.status);
            return Ok(());
        }
        let Some(evaluation) = self.evaluation.as_ref() else {
            return Err(RaoError::ResultNotAvailable(format!("{}: no evaluation to optimize from", self)));
        };
        let Some(network) = self.network.as_deref_mut() else {
            return Err(RaoError::ResultNotAvailable(format!(
                "leaf '{}' has released its network",
                describe(&self.network_actions)
            )));
        };
        let main_state = self.perimeter.main_state();
        if self.status == LeafStatus::Optimized {
            self.starting_setpoints.apply(&self.perimeter, main_state, network)?;
        }

        if !self.perimeter.has_range_actions() {
            self.optimized = Some(OptimizedResult {
                status: LinearProblemStatus::Optimal,
                iterations: 0,
                activation: self.starting_setpoints.clone(),
                evaluation: evaluation.clone(),
            });
            self.status = LeafStatus::Optimized;
            return Ok(());
        }

        let limits = usage_limits::range_action_limits(parameters, &self.perimeter, &self.network_actions);
        let outcome = IteratingLinearOptimizer::new(parameters).optimize(IteratingLinearOptimizerInput {
            network,
            perimeter: &self.perimeter,
            pre_optimization: evaluation,
            starting_setpoints: &self.starting_setpoints,
            pre_perimeter_setpoints: &input.pre_perimeter.setpoints,
            pre_perimeter_flows: &input.pre_perimeter.flow,
            initial_flows: &input.initial_flows,
            sensitivity_computer: input.sensitivity_computer.as_ref(),
            objective: &input.objective,
            limits: &limits,
        })?;

        let optimized = match outcome {
            LinearOptimizationResult::Computed(result) => *result,
            LinearOptimizationResult::Failed { status } => {
                tracing::warn!("{}: linear optimisation failed ({}), keeping pre-optimisation setpoints", self, status);
                OptimizedResult {
                    status,
                    iterations: 0,
                    activation: self.starting_setpoints.clone(),
                    evaluation: evaluation.clone(),
                }
            }
        };
        tracing::info!(
            "{}: optimized, cost {:.2} after {} iteration(s) ({})",
            self,
            optimized.cost(),
            optimized.iterations,
            optimized.status
        );
        self.optimized = Some(optimized);
        self.status = LeafStatus::Optimized;
        Ok(())
    }

    /// Releases the network. Results stay readable; the leaf can no longer
    /// be evaluated nor optimised.
    pub fn finalize_optimization(&mut self) {
        self.network = None;
    }

    pub fn has_network(&self) -> bool {
        self.network.is_some()
    }

    pub fn result(&self) -> RaoResult<LeafResult<'_>> {
        match (self.status, &self.optimized, &self.evaluation) {
            (LeafStatus::Optimized, Some(optimized), _) => Ok(LeafResult::Optimized(optimized)),
            (LeafStatus::Evaluated | LeafStatus::Optimized, _, Some(evaluation)) => Ok(LeafResult::Evaluated {
                evaluation,
                setpoints: &self.starting_setpoints,
            }),
            _ => Err(RaoError::ResultNotAvailable(format!("{} ({}) has no result", self, self.status))),
        }
    }

    /// Status of the iterating optimisation, once optimised.
    pub fn optimization_status(&self) -> Option<LinearProblemStatus> {
        self.optimized.as_ref().map(|optimized| optimized.status)
    }

    pub fn cost(&self) -> RaoResult<f64> {
        Ok(self.result()?.evaluation().cost())
    }

    pub fn functional_cost(&self) -> RaoResult<f64> {
        Ok(self.result()?.evaluation().objective.functional_cost)
    }

    pub fn virtual_cost(&self) -> RaoResult<f64> {
        Ok(self.result()?.evaluation().objective.virtual_cost())
    }

    pub fn virtual_costs(&self) -> RaoResult<&BTreeMap<String, f64>> {
        Ok(&self.result()?.evaluation().objective.virtual_costs)
    }

    pub fn most_limiting_elements(&self, count: usize) -> RaoResult<Vec<String>> {
        let elements = &self.result()?.evaluation().objective.most_limiting_elements;
        Ok(elements.iter().take(count).cloned().collect())
    }

    /// CNECs contributing to a virtual cost, costliest first.
    pub fn costly_elements(&self, virtual_cost: &str, count: usize) -> RaoResult<Vec<String>> {
        let costly = &self.result()?.evaluation().objective.costly_elements;
        Ok(costly
            .get(virtual_cost)
            .map(|elements| elements.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    pub fn flow(&self, cnec: &FlowCnec, unit: Unit) -> RaoResult<f64> {
        self.result()?.evaluation().flow.flow(cnec, unit)
    }

    pub fn margin(&self, cnec: &FlowCnec, unit: Unit) -> RaoResult<f64> {
        self.result()?.evaluation().flow.margin(cnec, unit)
    }

    pub fn sensitivity(&self, cnec_id: &str, range_action_id: &str) -> RaoResult<f64> {
        Ok(self.result()?.evaluation().sensitivity.sensitivity(cnec_id, range_action_id))
    }

    pub fn setpoints(&self) -> RaoResult<&RangeActionActivation> {
        Ok(self.result()?.setpoints())
    }

    pub fn setpoint(&self, range_action_id: &str, state: &State) -> RaoResult<f64> {
        self.result()?.setpoints().setpoint(range_action_id, state)
    }

    pub fn tap(&self, range_action_id: &str, state: &State) -> RaoResult<i32> {
        let range_action = self.perimeter.range_action(range_action_id).ok_or_else(|| {
            RaoError::Validation(format!("unknown range action '{}'", range_action_id))
        })?;
        self.result()?.setpoints().tap(&range_action, state)
    }

    /// Range actions moved at `state`.
    pub fn activated_range_actions(&self, state: &State) -> RaoResult<BTreeSet<String>> {
        Ok(self.result()?.setpoints().activated(state))
    }
}

fn describe(actions: &[Arc<NetworkAction>]) -> String {
    actions.iter().map(|action| action.id.as_str()).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.network_actions.is_empty() {
            write!(f, "Root leaf")
        } else {
            write!(f, "network action(s): {}", describe(&self.network_actions))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn test_root_leaf_is_evaluated() {
        let fixture = test_utils::search_tree_fixture(950.0);
        let leaf = test_utils::root_leaf(&fixture);
        assert_eq!(leaf.status(), LeafStatus::Evaluated);
        assert_eq!(leaf.to_string(), "Root leaf");
        assert!((leaf.cost().unwrap() + 50.0).abs() < 1e-9);
        assert!(leaf.optimization_status().is_none());
    }

    #[test]
    fn test_child_leaf_lifecycle() {
        let fixture = test_utils::search_tree_fixture(950.0);
        let action = fixture.input.perimeter.network_actions()[0].clone();
        let mut leaf = Leaf::child(
            Arc::clone(&fixture.input.perimeter),
            &[],
            NetworkActionCombination::single(action),
            NetworkLease::detached(fixture.input.network.clone()),
            fixture.input.pre_perimeter.setpoints.clone(),
        );
        assert_eq!(leaf.status(), LeafStatus::Created);
        assert_eq!(leaf.to_string(), "network action(s): open-coupler");
        assert!(matches!(leaf.cost(), Err(RaoError::ResultNotAvailable(_))));

        leaf.evaluate(&fixture.input.objective, fixture.input.sensitivity_computer.as_ref())
            .unwrap();
        assert_eq!(leaf.status(), LeafStatus::Evaluated);
        // opening the coupler relieves the line by 300 MW
        assert!((leaf.cost().unwrap() + 350.0).abs() < 1e-9);

        leaf.optimize(&fixture.input, &fixture.parameters).unwrap();
        assert_eq!(leaf.status(), LeafStatus::Optimized);
        let optimized_cost = leaf.cost().unwrap();
        assert!(optimized_cost <= -350.0 + 1e-9);

        leaf.finalize_optimization();
        assert!(!leaf.has_network());
        assert_eq!(leaf.cost().unwrap(), optimized_cost);
        assert!(matches!(
            leaf.optimize(&fixture.input, &fixture.parameters),
            Err(RaoError::ResultNotAvailable(_))
        ));
    }

    #[test]
    fn test_sensitivity_failure_puts_leaf_in_error() {
        let fixture = test_utils::search_tree_fixture(950.0);
        let action = fixture.input.perimeter.network_actions()[0].clone();
        let mut leaf = Leaf::child(
            Arc::clone(&fixture.input.perimeter),
            &[],
            NetworkActionCombination::single(action),
            NetworkLease::detached(fixture.input.network.clone()),
            fixture.input.pre_perimeter.setpoints.clone(),
        );
        let failing = test_utils::FailingComputer::after(0, test_utils::linear_computer(&fixture.input.network, 950.0));
        leaf.evaluate(&fixture.input.objective, &failing).unwrap();
        assert_eq!(leaf.status(), LeafStatus::Error);

        // optimizing an error leaf is a no-op
        leaf.optimize(&fixture.input, &fixture.parameters).unwrap();
        assert_eq!(leaf.status(), LeafStatus::Error);
        assert!(leaf.result().is_err());
    }

    #[test]
    fn test_unknown_element_puts_child_in_error() {
        let fixture = test_utils::search_tree_fixture(950.0);
        let broken = Arc::new(NetworkAction::new(
            "broken",
            Some("FR"),
            vec![rao_core::ElementaryAction::Topological {
                element_id: "missing".into(),
                action: rao_core::ActionType::Open,
            }],
        ));
        let leaf = Leaf::child(
            Arc::clone(&fixture.input.perimeter),
            &[],
            NetworkActionCombination::single(broken),
            NetworkLease::detached(fixture.input.network.clone()),
            fixture.input.pre_perimeter.setpoints.clone(),
        );
        assert_eq!(leaf.status(), LeafStatus::Error);
    }
}
