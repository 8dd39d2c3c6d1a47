//! Flow and setpoint variables.
//!
//! ```text
//! F[c] − Σ_r sens[c,r] · S[r,s] = ref[c] − Σ_r sens[c,r] · current[r]
//! S[r,s] − up[r,s] + down[r,s]  = pre[r]          (or S[r,s'] of the previous state s')
//! AV[r,s] − up[r,s] − down[r,s] = 0
//! S[r,s] − G[g,s]               = 0               (grouped range actions)
//! objective += penalty(kind) · AV[r,s]
//! ```

use super::{applicable_state, previous_state, ProblemFiller};
use crate::linear_problem::keys::{self, Direction};
use crate::linear_problem::LinearProblem;
use crate::parameters::RangeActionsParameters;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{FlowCnec, OptimizationPerimeter, RangeAction, RangeActionKind, RaoResult, State};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Slack added around admissible ranges so that setpoints read back from the
/// network are never outside their own bounds.
const RANGE_EPSILON: f64 = 1e-5;

/// Range shrink rate applied at every update when range shrinking is on.
const RANGE_SHRINK_RATE: f64 = 0.667;

pub struct CoreProblemFiller {
    perimeter: Arc<OptimizationPerimeter>,
    pre_perimeter_setpoints: RangeActionActivation,
    starting_setpoints: RangeActionActivation,
    parameters: RangeActionsParameters,
    iteration: AtomicUsize,
}

impl CoreProblemFiller {
    pub fn new(
        perimeter: Arc<OptimizationPerimeter>,
        pre_perimeter_setpoints: RangeActionActivation,
        starting_setpoints: RangeActionActivation,
        parameters: RangeActionsParameters,
    ) -> Self {
        Self {
            perimeter,
            pre_perimeter_setpoints,
            starting_setpoints,
            parameters,
            iteration: AtomicUsize::new(0),
        }
    }

    fn penalty_cost(&self, range_action: &RangeAction) -> f64 {
        match range_action.kind {
            RangeActionKind::Pst(_) => self.parameters.pst_penalty_cost,
            RangeActionKind::Hvdc { .. } => self.parameters.hvdc_penalty_cost,
            RangeActionKind::Injection { .. } => self.parameters.injection_penalty_cost,
        }
    }

    fn sensitivity_threshold(&self, range_action: &RangeAction) -> f64 {
        match range_action.kind {
            RangeActionKind::Pst(_) => self.parameters.pst_sensitivity_threshold,
            RangeActionKind::Hvdc { .. } => self.parameters.hvdc_sensitivity_threshold,
            RangeActionKind::Injection { .. } => self.parameters.injection_sensitivity_threshold,
        }
    }

    fn admissible_range(&self, range_action: &RangeAction, state: &State) -> RaoResult<(f64, f64)> {
        let previous = self.pre_perimeter_setpoints.setpoint(&range_action.id, state)?;
        Ok((
            range_action.min_admissible_setpoint(previous),
            range_action.max_admissible_setpoint(previous),
        ))
    }

    fn add_range_action_variables(&self, problem: &mut LinearProblem, range_action: &RangeAction, state: &State) -> RaoResult<()> {
        let id = &range_action.id;
        let (min, max) = self.admissible_range(range_action, state)?;
        let setpoint = problem.add_variable(
            &keys::setpoint_variable(id, state),
            min - RANGE_EPSILON,
            max + RANGE_EPSILON,
        )?;
        let upward = problem.add_variable(&keys::set_point_variation_variable(id, state, Direction::Upward), 0.0, f64::INFINITY)?;
        let downward =
            problem.add_variable(&keys::set_point_variation_variable(id, state, Direction::Downward), 0.0, f64::INFINITY)?;

        let variation = match previous_state(&self.perimeter, id, state) {
            Some(previous) => {
                let previous_setpoint = problem.variable(&keys::setpoint_variable(id, previous))?;
                let constraint = problem.add_constraint(&keys::set_point_variation_constraint(id, state), 0.0, 0.0)?;
                problem.set_coefficient(constraint, previous_setpoint, -1.0);
                constraint
            }
            None => {
                let pre = self.pre_perimeter_setpoints.setpoint(id, state)?;
                problem.add_constraint(&keys::set_point_variation_constraint(id, state), pre, pre)?
            }
        };
        problem.set_coefficient(variation, setpoint, 1.0);
        problem.set_coefficient(variation, upward, -1.0);
        problem.set_coefficient(variation, downward, 1.0);

        let absolute = problem.add_variable(&keys::absolute_variation_variable(id, state), 0.0, f64::INFINITY)?;
        let definition = problem.add_constraint(&keys::absolute_variation_constraint(id, state), 0.0, 0.0)?;
        problem.set_coefficient(definition, absolute, 1.0);
        problem.set_coefficient(definition, upward, -1.0);
        problem.set_coefficient(definition, downward, -1.0);
        problem.set_objective_coefficient(absolute, self.penalty_cost(range_action));

        if let Some(group) = &range_action.group_id {
            let group_key = keys::range_action_group_variable(group, state);
            let group_setpoint = match problem.get_variable(&group_key) {
                Some(existing) => existing,
                None => problem.add_variable(&group_key, f64::NEG_INFINITY, f64::INFINITY)?,
            };
            let constraint = problem.add_constraint(&keys::range_action_group_constraint(id, group, state), 0.0, 0.0)?;
            problem.set_coefficient(constraint, setpoint, 1.0);
            problem.set_coefficient(constraint, group_setpoint, -1.0);
        }
        Ok(())
    }

    /// Rewrites the sensitivities and the right-hand side of the flow
    /// constraint of `cnec` around `setpoints`.
    fn refresh_flow_constraint(
        &self,
        problem: &mut LinearProblem,
        cnec: &FlowCnec,
        flows: &FlowResult,
        sensitivities: &SensitivityResult,
        setpoints: &RangeActionActivation,
    ) -> RaoResult<()> {
        let constraint = problem.constraint(&keys::flow_constraint(&cnec.id))?;
        let mut right_hand_side = flows.flow_mw(&cnec.id)?;
        for range_action in self.perimeter.range_actions() {
            let Some(state) = applicable_state(&self.perimeter, &range_action.id, &cnec.state) else {
                continue;
            };
            let setpoint = problem.variable(&keys::setpoint_variable(&range_action.id, state))?;
            let mut sensitivity = sensitivities.sensitivity(&cnec.id, &range_action.id);
            if sensitivity.abs() < self.sensitivity_threshold(&range_action) {
                sensitivity = 0.0;
            }
            problem.set_coefficient(constraint, setpoint, -sensitivity);
            if sensitivity != 0.0 {
                right_hand_side -= sensitivity * setpoints.setpoint(&range_action.id, &cnec.state)?;
            }
        }
        problem.set_constraint_bounds(constraint, right_hand_side, right_hand_side);
        Ok(())
    }

    fn shrink_ranges(&self, problem: &mut LinearProblem, activation: &RangeActionActivation) -> RaoResult<()> {
        let iteration = self.iteration.fetch_add(1, Ordering::SeqCst) + 1;
        let factor = RANGE_SHRINK_RATE.powi(iteration as i32);
        for (state, range_actions) in self.perimeter.range_actions_per_state() {
            for range_action in range_actions {
                let (min, max) = self.admissible_range(range_action, state)?;
                let half_width = (max - min) * factor;
                let current = activation.setpoint(&range_action.id, state)?;
                let setpoint = problem.variable(&keys::setpoint_variable(&range_action.id, state))?;
                problem.set_variable_bounds(
                    setpoint,
                    (current - half_width).max(min) - RANGE_EPSILON,
                    (current + half_width).min(max) + RANGE_EPSILON,
                );
            }
        }
        Ok(())
    }
}

impl ProblemFiller for CoreProblemFiller {
    fn name(&self) -> &'static str {
        "core"
    }

    fn fill(&self, problem: &mut LinearProblem, flows: &FlowResult, sensitivities: &SensitivityResult) -> RaoResult<()> {
        for cnec in self.perimeter.flow_cnecs() {
            problem.add_variable(&keys::flow_variable(&cnec.id), f64::NEG_INFINITY, f64::INFINITY)?;
            problem.register_cnec(&cnec.id);
        }
        for (state, range_actions) in self.perimeter.range_actions_per_state() {
            for range_action in range_actions {
                self.add_range_action_variables(problem, range_action, state)?;
                problem.register_range_action(&range_action.id);
            }
        }
        for cnec in self.perimeter.flow_cnecs() {
            let flow = problem.variable(&keys::flow_variable(&cnec.id))?;
            let constraint = problem.add_constraint(&keys::flow_constraint(&cnec.id), 0.0, 0.0)?;
            problem.set_coefficient(constraint, flow, 1.0);
            self.refresh_flow_constraint(problem, cnec, flows, sensitivities, &self.starting_setpoints)?;
        }
        Ok(())
    }

    /// With range shrinking on, also narrows every setpoint range around the
    /// new setpoints; the narrowing tightens at every call.
    fn update(
        &self,
        problem: &mut LinearProblem,
        flows: &FlowResult,
        sensitivities: &SensitivityResult,
        activation: &RangeActionActivation,
    ) -> RaoResult<()> {
        for cnec in self.perimeter.flow_cnecs() {
            self.refresh_flow_constraint(problem, cnec, flows, sensitivities, activation)?;
        }
        if self.parameters.ra_range_shrinking {
            self.shrink_ranges(problem, activation)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fillers::{FillerSlot, ProblemFillerChain};
    use crate::linear_problem::ClarabelBackend;
    use crate::test_utils;

    fn problem_with_core(parameters: RangeActionsParameters) -> (LinearProblem, Arc<OptimizationPerimeter>, RangeActionActivation) {
        let perimeter = Arc::new(test_utils::single_pst_perimeter());
        let network = test_utils::two_area_network();
        let setpoints = RangeActionActivation::from_network(&perimeter, &network).unwrap();
        let mut chain = ProblemFillerChain::new();
        chain.insert(
            FillerSlot::Core,
            Box::new(CoreProblemFiller::new(
                Arc::clone(&perimeter),
                setpoints.clone(),
                setpoints.clone(),
                parameters,
            )),
        );
        (LinearProblem::new(chain, Box::new(ClarabelBackend), 30), perimeter, setpoints)
    }

    fn physics(flow: f64) -> (FlowResult, SensitivityResult) {
        let mut flows = FlowResult::new();
        flows.insert_flow("cnec-line", flow);
        let mut sensitivities = SensitivityResult::new();
        sensitivities.insert("cnec-line", "pst-ra", 100.0);
        (flows, sensitivities)
    }

    #[test]
    fn test_fill_creates_variables_and_flow_constraint() {
        let (mut problem, perimeter, _) = problem_with_core(RangeActionsParameters::default());
        let (flows, sensitivities) = physics(200.0);
        problem.fill(&flows, &sensitivities).unwrap();

        let state = perimeter.main_state().clone();
        let setpoint = problem.variable(&keys::setpoint_variable("pst-ra", &state)).unwrap();
        let (lb, ub) = problem.variable_bounds(setpoint);
        assert!((lb + 5.0 + RANGE_EPSILON).abs() < 1e-8);
        assert!((ub - 5.0 - RANGE_EPSILON).abs() < 1e-8);

        let constraint = problem.constraint(&keys::flow_constraint("cnec-line")).unwrap();
        assert_eq!(problem.coefficient(constraint, setpoint), -100.0);
        assert_eq!(problem.constraint_bounds(constraint), (200.0, 200.0));

        let absolute = problem.variable(&keys::absolute_variation_variable("pst-ra", &state)).unwrap();
        assert!((problem.objective_coefficient(absolute) - 0.01).abs() < 1e-9);
        assert!(problem.cnecs().contains("cnec-line"));
        assert!(problem.range_actions().contains("pst-ra"));
    }

    #[test]
    fn test_update_moves_the_linearisation_point() {
        let (mut problem, perimeter, setpoints) = problem_with_core(RangeActionsParameters::default());
        let (flows, sensitivities) = physics(200.0);
        problem.fill(&flows, &sensitivities).unwrap();

        let mut moved = setpoints.clone();
        moved.put(perimeter.main_state(), "pst-ra", 1.0);
        let (flows, sensitivities) = physics(300.0);
        problem.update(&flows, &sensitivities, &moved).unwrap();
        problem.update(&flows, &sensitivities, &moved).unwrap();

        let constraint = problem.constraint(&keys::flow_constraint("cnec-line")).unwrap();
        assert_eq!(problem.constraint_bounds(constraint), (200.0, 200.0));
    }

    #[test]
    fn test_small_sensitivities_are_dropped() {
        let parameters = RangeActionsParameters {
            pst_sensitivity_threshold: 500.0,
            ..Default::default()
        };
        let (mut problem, perimeter, _) = problem_with_core(parameters);
        let (flows, sensitivities) = physics(200.0);
        problem.fill(&flows, &sensitivities).unwrap();

        let setpoint = problem
            .variable(&keys::setpoint_variable("pst-ra", perimeter.main_state()))
            .unwrap();
        let constraint = problem.constraint(&keys::flow_constraint("cnec-line")).unwrap();
        assert_eq!(problem.coefficient(constraint, setpoint), 0.0);
    }

    #[test]
    fn test_range_shrinking_narrows_bounds() {
        let parameters = RangeActionsParameters {
            ra_range_shrinking: true,
            ..Default::default()
        };
        let (mut problem, perimeter, setpoints) = problem_with_core(parameters);
        let (flows, sensitivities) = physics(200.0);
        problem.fill(&flows, &sensitivities).unwrap();
        problem.update(&flows, &sensitivities, &setpoints).unwrap();

        let setpoint = problem
            .variable(&keys::setpoint_variable("pst-ra", perimeter.main_state()))
            .unwrap();
        let (lb, ub) = problem.variable_bounds(setpoint);
        // span 10° shrunk once: ±6.67° around 0, clipped to the range
        assert!((ub - 5.0 - RANGE_EPSILON).abs() < 1e-8);
        problem.update(&flows, &sensitivities, &setpoints).unwrap();
        let (lb2, ub2) = problem.variable_bounds(setpoint);
        assert!(ub2 < ub);
        assert!(lb2 > lb);
        assert!((ub2 - (10.0 * RANGE_SHRINK_RATE * RANGE_SHRINK_RATE) - RANGE_EPSILON).abs() < 1e-6);
    }
}
