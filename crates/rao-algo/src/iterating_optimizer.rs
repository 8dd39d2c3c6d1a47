//! Iterating linear optimisation of range actions.
//!
//! Each iteration solves the linear problem, rounds the continuous setpoints
//! to physical taps, re-runs the sensitivity computation with the rounded
//! setpoints and keeps the result only if its cost is strictly lower than
//! the best one so far:
//!
//! ```text
//! best = iteration 0 (pre-optimisation evaluation)
//! for i in 1..=max_iterations:
//!     solve            -> no solution: Failed (i = 1) or best as FEASIBLE
//!     round            -> unchanged: best as OPTIMAL
//!     sensitivity      -> failure: best as SENSITIVITY_COMPUTATION_FAILED
//!     cost < best?     -> adopt and update the problem, else stop on best
//! best as MAX_ITERATION_REACHED
//! ```
//!
//! The returned cost is therefore never above the iteration-0 cost.

use crate::best_tap::BestTapFinder;
use crate::fillers::{FillerContext, ProblemFillerChain};
use crate::linear_problem::{keys, LinearProblem};
use crate::objective::ObjectiveFunction;
use crate::parameters::{PstModel, RangeActionLimits, RaoParameters};
use crate::result::{
    EvaluationResult, FlowResult, LinearOptimizationResult, LinearProblemStatus, OptimizedResult,
    RangeActionActivation, SETPOINT_EPSILON,
};
use crate::sensitivity::SensitivityComputer;
use crate::usage_limits;
use rao_core::{Network, OptimizationPerimeter, RaoResult, State};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything one iterating optimisation reads or mutates.
pub struct IteratingLinearOptimizerInput<'a> {
    /// Network of the leaf; ends with the setpoints of the returned result.
    pub network: &'a mut Network,
    pub perimeter: &'a Arc<OptimizationPerimeter>,
    /// Evaluation of the network before optimisation.
    pub pre_optimization: &'a EvaluationResult,
    /// Setpoints `pre_optimization` was computed with.
    pub starting_setpoints: &'a RangeActionActivation,
    pub pre_perimeter_setpoints: &'a RangeActionActivation,
    pub pre_perimeter_flows: &'a FlowResult,
    pub initial_flows: &'a FlowResult,
    pub sensitivity_computer: &'a dyn SensitivityComputer,
    pub objective: &'a ObjectiveFunction,
    pub limits: &'a BTreeMap<State, RangeActionLimits>,
}

pub struct IteratingLinearOptimizer<'p> {
    parameters: &'p RaoParameters,
}

impl<'p> IteratingLinearOptimizer<'p> {
    pub fn new(parameters: &'p RaoParameters) -> Self {
        Self { parameters }
    }

    /// Runs the optimisation. Only filler construction errors and network
    /// errors come back as `Err`; solver and sensitivity failures are
    /// statuses of the result.
    pub fn optimize(&self, input: IteratingLinearOptimizerInput<'_>) -> RaoResult<LinearOptimizationResult> {
        let range_actions = &self.parameters.range_actions;
        let chain = ProblemFillerChain::build(&FillerContext {
            perimeter: input.perimeter,
            parameters: self.parameters,
            pre_perimeter_setpoints: input.pre_perimeter_setpoints,
            starting_setpoints: input.starting_setpoints,
            initial_flows: input.initial_flows,
            pre_perimeter_flows: input.pre_perimeter_flows,
            limits: input.limits,
        })?;
        let mut problem = LinearProblem::new(chain, range_actions.solver.build_backend(), range_actions.precision_bits);
        problem.fill(&input.pre_optimization.flow, &input.pre_optimization.sensitivity)?;

        let mut best = OptimizedResult {
            status: LinearProblemStatus::Optimal,
            iterations: 0,
            activation: input.starting_setpoints.clone(),
            evaluation: input.pre_optimization.clone(),
        };
        let main_state = input.perimeter.main_state().clone();

        for iteration in 1..=range_actions.max_iterations {
            let status = problem.solve();
            if !status.has_solution() {
                if iteration == 1 {
                    tracing::warn!("linear optimisation failed at first iteration: {}", status);
                    return Ok(LinearOptimizationResult::Failed { status });
                }
                tracing::info!("iteration {}: linear problem {}, keeping iteration {}", iteration, status, best.iterations);
                best.status = LinearProblemStatus::Feasible;
                return Ok(LinearOptimizationResult::Computed(Box::new(best)));
            }

            let rounded = self.rounded_solution(&mut problem, &input, &best)?;
            if !has_changed(input.perimeter, &rounded, &best.activation)? {
                tracing::debug!("iteration {}: same setpoints as iteration {}, stopping", iteration, best.iterations);
                best.status = LinearProblemStatus::Optimal;
                return Ok(LinearOptimizationResult::Computed(Box::new(best)));
            }

            rounded.apply(input.perimeter, &main_state, input.network)?;
            let physics = match input.sensitivity_computer.compute(input.network, input.perimeter, &rounded) {
                Ok(physics) => physics,
                Err(err) => {
                    tracing::warn!("iteration {}: sensitivity computation failed: {}", iteration, err);
                    best.activation.apply(input.perimeter, &main_state, input.network)?;
                    best.status = LinearProblemStatus::SensitivityComputationFailed;
                    return Ok(LinearOptimizationResult::Computed(Box::new(best)));
                }
            };
            let objective = input.objective.evaluate(&physics.flow)?;
            let candidate = OptimizedResult {
                status: LinearProblemStatus::Optimal,
                iterations: iteration,
                activation: rounded,
                evaluation: EvaluationResult {
                    flow: physics.flow,
                    sensitivity: physics.sensitivity,
                    objective,
                },
            };
            tracing::info!(
                "iteration {}: cost {:.2} (functional {:.2}, virtual {:.2})",
                iteration,
                candidate.cost(),
                candidate.evaluation.objective.functional_cost,
                candidate.evaluation.objective.virtual_cost()
            );

            if candidate.cost() < best.cost() {
                best = candidate;
                problem.update(&best.evaluation.flow, &best.evaluation.sensitivity, &best.activation)?;
            } else if range_actions.ra_range_shrinking {
                tracing::debug!("iteration {}: no improvement, shrinking ranges", iteration);
                problem.update(
                    &candidate.evaluation.flow,
                    &candidate.evaluation.sensitivity,
                    &candidate.activation,
                )?;
            } else {
                tracing::debug!("iteration {}: no improvement, back to iteration {}", iteration, best.iterations);
                best.activation.apply(input.perimeter, &main_state, input.network)?;
                best.status = LinearProblemStatus::Optimal;
                return Ok(LinearOptimizationResult::Computed(Box::new(best)));
            }
        }

        best.activation.apply(input.perimeter, &main_state, input.network)?;
        best.status = LinearProblemStatus::MaxIterationReached;
        Ok(LinearOptimizationResult::Computed(Box::new(best)))
    }

    /// Reads, rounds and budgets the setpoints of a solved problem.
    fn rounded_solution(
        &self,
        problem: &mut LinearProblem,
        input: &IteratingLinearOptimizerInput<'_>,
        best: &OptimizedResult,
    ) -> RaoResult<RangeActionActivation> {
        let finder = BestTapFinder::new(
            input.perimeter,
            &best.evaluation.flow,
            &best.evaluation.sensitivity,
            &best.activation,
            input.pre_perimeter_setpoints,
            &best.evaluation.objective.most_limiting_elements,
            &self.parameters.tap_rounding,
        );

        let optimal = read_setpoints(problem, input.perimeter, input.starting_setpoints)?;
        let mut rounded = match self.parameters.range_actions.pst_model {
            PstModel::Continuous => finder.round(&optimal)?,
            PstModel::ApproximatedIntegers => {
                let first = round_to_closest_taps(input.perimeter, &optimal)?;
                problem.update_between_mip_iterations(&first)?;
                let status = problem.solve();
                if status.has_solution() {
                    round_to_closest_taps(input.perimeter, &read_setpoints(problem, input.perimeter, input.starting_setpoints)?)?
                } else {
                    tracing::debug!("second integer solve ended {}, keeping the first rounding", status);
                    first
                }
            }
        };
        if !input.limits.is_empty() {
            rounded = usage_limits::enforce(&rounded, input.perimeter, input.limits, input.pre_perimeter_setpoints)?;
        }
        Ok(rounded)
    }
}

/// Setpoint variable values of every range action at every state.
fn read_setpoints(
    problem: &LinearProblem,
    perimeter: &OptimizationPerimeter,
    template: &RangeActionActivation,
) -> RaoResult<RangeActionActivation> {
    let mut activation = RangeActionActivation::new(template.reference().clone());
    for (state, range_actions) in perimeter.range_actions_per_state() {
        for range_action in range_actions {
            let variable = problem.variable(&keys::setpoint_variable(&range_action.id, state))?;
            activation.put(state, range_action.id.clone(), problem.value(variable)?);
        }
    }
    Ok(activation)
}

/// Integer-tap rounding: PST angles to their closest tap, other setpoints to
/// the closest integer.
fn round_to_closest_taps(perimeter: &OptimizationPerimeter, optimal: &RangeActionActivation) -> RaoResult<RangeActionActivation> {
    let mut rounded = RangeActionActivation::new(optimal.reference().clone());
    for (state, range_actions) in perimeter.range_actions_per_state() {
        for range_action in range_actions {
            let setpoint = optimal.setpoint(&range_action.id, state)?;
            let value = match range_action.as_pst() {
                Some(pst) => pst.convert_tap_to_angle(pst.convert_angle_to_tap(setpoint))?,
                None => setpoint.round(),
            };
            rounded.put(state, range_action.id.clone(), value);
        }
    }
    Ok(rounded)
}

fn has_changed(
    perimeter: &OptimizationPerimeter,
    candidate: &RangeActionActivation,
    previous: &RangeActionActivation,
) -> RaoResult<bool> {
    for (state, range_actions) in perimeter.range_actions_per_state() {
        for range_action in range_actions {
            let delta = candidate.setpoint(&range_action.id, state)? - previous.setpoint(&range_action.id, state)?;
            if delta.abs() >= SETPOINT_EPSILON {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn test_feasible_start_converges_without_moving() {
        let mut network = test_utils::two_area_network();
        let perimeter = Arc::new(test_utils::single_pst_perimeter());
        let computer = test_utils::linear_computer(&network, 0.0);
        let parameters = RaoParameters::default();
        let pre = test_utils::pre_perimeter(&network, &perimeter, &computer, &parameters);

        let result = IteratingLinearOptimizer::new(&parameters)
            .optimize(IteratingLinearOptimizerInput {
                network: &mut network,
                perimeter: &perimeter,
                pre_optimization: &pre.evaluation,
                starting_setpoints: &pre.setpoints,
                pre_perimeter_setpoints: &pre.setpoints,
                pre_perimeter_flows: &pre.evaluation.flow,
                initial_flows: &pre.evaluation.flow,
                sensitivity_computer: &computer,
                objective: &pre.objective,
                limits: &BTreeMap::new(),
            })
            .unwrap();

        assert_eq!(result.status(), LinearProblemStatus::Optimal);
        let optimized = result.into_computed().unwrap();
        assert!(optimized.iterations <= 2);
        assert_eq!(optimized.activation.setpoint("pst-ra", &State::preventive()).unwrap(), 0.0);
        assert_eq!(network.pst_tap("pst").unwrap(), 0);
    }

    #[test]
    fn test_changed_detection_uses_epsilon() {
        let perimeter = test_utils::single_pst_perimeter();
        let reference = RangeActionActivation::new([("pst-ra".to_string(), 0.0)].into_iter().collect());
        let mut moved = reference.clone();
        moved.put(&State::preventive(), "pst-ra", 1e-8);
        assert!(!has_changed(&perimeter, &moved, &reference).unwrap());
        moved.put(&State::preventive(), "pst-ra", 0.5);
        assert!(has_changed(&perimeter, &moved, &reference).unwrap());
    }

    #[test]
    fn test_round_to_closest_taps() {
        let perimeter = test_utils::single_pst_perimeter();
        let reference = RangeActionActivation::new([("pst-ra".to_string(), 0.0)].into_iter().collect());
        let mut optimal = reference.clone();
        optimal.put(&State::preventive(), "pst-ra", 1.3);
        let rounded = round_to_closest_taps(&perimeter, &optimal).unwrap();
        assert_eq!(rounded.setpoint("pst-ra", &State::preventive()).unwrap(), 1.5);
    }
}
