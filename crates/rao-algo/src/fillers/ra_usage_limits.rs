//! Remedial action usage limits.
//!
//! A binary `δ[r,s]` flags every range action that moves at a state:
//!
//! ```text
//! AV[r,s] − span[r]·δ[r,s] ≤ ε[r]
//! Σ δ[r,s]                 ≤ maxRa
//! δ[r,s] − t[o,s]          ≤ 0        for each operator o of r
//! Σ t[o,s]                 ≤ maxTso
//! Σ_{r of o} δ[r,s]        ≤ maxRaPerTso[o]   (PSTs only: maxPstPerTso[o])
//! step[r]·TAV[r,s] − AV[r,s] ≥ −ε[r]
//! Σ_{r of o} TAV[r,s]      ≤ maxElementaryActionsPerTso[o]
//! ```
//!
//! `ε` lets continuous PST angles drift by less than a third of a tap without
//! counting as a move, since such a drift is rounded away.

use super::ProblemFiller;
use crate::linear_problem::keys;
use crate::linear_problem::{LinearProblem, VariableHandle};
use crate::parameters::RangeActionLimits;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{OptimizationPerimeter, RangeAction, RaoResult, State};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Share of a tap a continuous PST angle may move without being activated.
const PST_RELAXATION_IN_TAPS: f64 = 0.3;
const DEFAULT_RELAXATION: f64 = 1e-4;

pub struct RaUsageLimitsFiller {
    perimeter: Arc<OptimizationPerimeter>,
    limits: BTreeMap<State, RangeActionLimits>,
    pre_perimeter_setpoints: RangeActionActivation,
    discrete_taps: bool,
}

impl RaUsageLimitsFiller {
    pub fn new(
        perimeter: Arc<OptimizationPerimeter>,
        limits: BTreeMap<State, RangeActionLimits>,
        pre_perimeter_setpoints: RangeActionActivation,
        discrete_taps: bool,
    ) -> Self {
        Self {
            perimeter,
            limits,
            pre_perimeter_setpoints,
            discrete_taps,
        }
    }

    fn relaxation(&self, range_action: &RangeAction) -> f64 {
        match range_action.as_pst() {
            Some(pst) if !self.discrete_taps => PST_RELAXATION_IN_TAPS * pst.average_step(),
            _ => DEFAULT_RELAXATION,
        }
    }

    fn add_sum_constraint<'a>(
        problem: &mut LinearProblem,
        key: &str,
        max: usize,
        variables: impl IntoIterator<Item = &'a VariableHandle>,
    ) -> RaoResult<()> {
        let constraint = problem.add_constraint(key, f64::NEG_INFINITY, max as f64)?;
        for variable in variables {
            problem.set_coefficient(constraint, *variable, 1.0);
        }
        Ok(())
    }

    fn fill_state(
        &self,
        problem: &mut LinearProblem,
        state: &State,
        limits: &RangeActionLimits,
        range_actions: &[Arc<RangeAction>],
    ) -> RaoResult<()> {
        let mut binaries: BTreeMap<&str, VariableHandle> = BTreeMap::new();
        for range_action in range_actions {
            let id = range_action.id.as_str();
            let binary = problem.add_binary_variable(&keys::range_action_variation_binary(id, state))?;
            let variation = problem.variable(&keys::absolute_variation_variable(id, state))?;
            let previous = self.pre_perimeter_setpoints.setpoint(id, state)?;
            let span = range_action.max_admissible_setpoint(previous) - range_action.min_admissible_setpoint(previous);
            let constraint = problem.add_constraint(
                &keys::is_variation_constraint(id, state),
                f64::NEG_INFINITY,
                self.relaxation(range_action),
            )?;
            problem.set_coefficient(constraint, variation, 1.0);
            problem.set_coefficient(constraint, binary, -span.max(0.0));
            binaries.insert(id, binary);
        }

        if let Some(max_ra) = limits.max_ra {
            if max_ra < range_actions.len() {
                Self::add_sum_constraint(problem, &keys::max_ra_constraint(state), max_ra, binaries.values())?;
            }
        }

        let by_operator = range_actions_per_operator(range_actions);

        if let Some(max_tso) = limits.max_tso {
            let counted: Vec<&str> = by_operator
                .keys()
                .copied()
                .filter(|operator| !limits.excluded_tsos.contains(*operator))
                .collect();
            if counted.len() > max_tso {
                let mut used = Vec::with_capacity(counted.len());
                for operator in counted {
                    let operator_used = problem.add_binary_variable(&keys::tso_ra_used_variable(operator, state))?;
                    for range_action in &by_operator[operator] {
                        let constraint = problem.add_constraint(
                            &keys::tso_ra_used_constraint(operator, &range_action.id, state),
                            f64::NEG_INFINITY,
                            0.0,
                        )?;
                        problem.set_coefficient(constraint, binaries[range_action.id.as_str()], 1.0);
                        problem.set_coefficient(constraint, operator_used, -1.0);
                    }
                    used.push(operator_used);
                }
                Self::add_sum_constraint(problem, &keys::max_tso_constraint(state), max_tso, &used)?;
            }
        }

        for (operator, max) in &limits.max_ra_per_tso {
            let Some(own) = by_operator.get(operator.as_str()) else {
                continue;
            };
            if own.len() > *max {
                let variables: Vec<VariableHandle> = own.iter().map(|ra| binaries[ra.id.as_str()]).collect();
                Self::add_sum_constraint(problem, &keys::max_ra_per_tso_constraint(operator, state), *max, &variables)?;
            }
        }

        for (operator, max) in &limits.max_pst_per_tso {
            let Some(own) = by_operator.get(operator.as_str()) else {
                continue;
            };
            let psts: Vec<VariableHandle> = own
                .iter()
                .filter(|ra| ra.is_pst())
                .map(|ra| binaries[ra.id.as_str()])
                .collect();
            if psts.len() > *max {
                Self::add_sum_constraint(problem, &keys::max_pst_per_tso_constraint(operator, state), *max, &psts)?;
            }
        }

        for (operator, max) in &limits.max_elementary_actions_per_tso {
            let Some(own) = by_operator.get(operator.as_str()) else {
                continue;
            };
            let mut tap_variations = Vec::new();
            for range_action in own.iter().filter(|ra| ra.is_pst()) {
                let Some(pst) = range_action.as_pst() else {
                    continue;
                };
                let id = range_action.id.as_str();
                let taps = f64::from(pst.max_tap() - pst.min_tap());
                let tap_variation =
                    problem.add_integer_variable(&keys::pst_absolute_tap_variation_variable(id, state), 0.0, taps)?;
                let variation = problem.variable(&keys::absolute_variation_variable(id, state))?;
                let constraint = problem.add_constraint(
                    &keys::pst_absolute_tap_variation_constraint(id, state),
                    -self.relaxation(range_action),
                    f64::INFINITY,
                )?;
                problem.set_coefficient(constraint, tap_variation, pst.average_step());
                problem.set_coefficient(constraint, variation, -1.0);
                tap_variations.push(tap_variation);
            }
            if !tap_variations.is_empty() {
                Self::add_sum_constraint(
                    problem,
                    &keys::max_elementary_actions_per_tso_constraint(operator, state),
                    *max,
                    &tap_variations,
                )?;
            }
        }
        Ok(())
    }
}

/// Range actions grouped by operator; actions without operator are left out.
pub(crate) fn range_actions_per_operator(range_actions: &[Arc<RangeAction>]) -> BTreeMap<&str, Vec<&Arc<RangeAction>>> {
    let mut grouped: BTreeMap<&str, Vec<&Arc<RangeAction>>> = BTreeMap::new();
    for range_action in range_actions {
        if let Some(operator) = range_action.operator.as_deref() {
            grouped.entry(operator).or_default().push(range_action);
        }
    }
    grouped
}

impl ProblemFiller for RaUsageLimitsFiller {
    fn name(&self) -> &'static str {
        "ra-usage-limits"
    }

    fn needs_integrality(&self) -> bool {
        true
    }

    fn fill(&self, problem: &mut LinearProblem, _flows: &FlowResult, _sensitivities: &SensitivityResult) -> RaoResult<()> {
        for (state, limits) in &self.limits {
            if limits.is_unlimited() {
                continue;
            }
            let Some(range_actions) = self.perimeter.range_actions_per_state().get(state) else {
                continue;
            };
            if range_actions.is_empty() {
                continue;
            }
            self.fill_state(problem, state, limits, range_actions)?;
        }
        Ok(())
    }

    fn update(
        &self,
        _problem: &mut LinearProblem,
        _flows: &FlowResult,
        _sensitivities: &SensitivityResult,
        _activation: &RangeActionActivation,
    ) -> RaoResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fillers::ProblemFillerChain;
    use crate::linear_problem::ClarabelBackend;
    use crate::test_utils;

    fn perimeter() -> Arc<OptimizationPerimeter> {
        let preventive = State::preventive();
        Arc::new(
            OptimizationPerimeter::builder(preventive.clone())
                .range_action(preventive.clone(), test_utils::pst_range_action("pst-fr-1", "pst-1"))
                .range_action(preventive.clone(), test_utils::pst_range_action("pst-fr-2", "pst-2"))
                .range_action(
                    preventive,
                    test_utils::pst_range_action("pst-be", "pst-3").with_operator("BE"),
                )
                .build()
                .unwrap(),
        )
    }

    fn problem_for(perimeter: &OptimizationPerimeter) -> LinearProblem {
        let mut problem = LinearProblem::new(ProblemFillerChain::new(), Box::new(ClarabelBackend), 30);
        let state = State::preventive();
        for range_action in perimeter.range_actions() {
            problem
                .add_variable(&keys::absolute_variation_variable(&range_action.id, &state), 0.0, f64::INFINITY)
                .unwrap();
        }
        problem
    }

    fn reference(perimeter: &OptimizationPerimeter) -> RangeActionActivation {
        RangeActionActivation::new(perimeter.range_actions().iter().map(|ra| (ra.id.clone(), 0.0)).collect())
    }

    #[test]
    fn test_limits_only_constrain_when_binding() {
        let perimeter = perimeter();
        let limits = RangeActionLimits {
            max_ra: Some(2),
            max_tso: Some(2),
            max_ra_per_tso: [("FR".to_string(), 1), ("BE".to_string(), 1)].into_iter().collect(),
            ..RangeActionLimits::default()
        };
        let filler = RaUsageLimitsFiller::new(
            Arc::clone(&perimeter),
            [(State::preventive(), limits)].into_iter().collect(),
            reference(&perimeter),
            false,
        );
        let mut problem = problem_for(&perimeter);
        filler.fill(&mut problem, &FlowResult::new(), &SensitivityResult::new()).unwrap();

        let state = State::preventive();
        assert!(problem.get_constraint(&keys::max_ra_constraint(&state)).is_some());
        // two operators within a limit of two
        assert!(problem.get_constraint(&keys::max_tso_constraint(&state)).is_none());
        assert!(problem.get_constraint(&keys::max_ra_per_tso_constraint("FR", &state)).is_some());
        assert!(problem.get_constraint(&keys::max_ra_per_tso_constraint("BE", &state)).is_none());

        // span of 10 degrees, a third of a half-degree tap tolerated
        let binary = problem.variable(&keys::range_action_variation_binary("pst-fr-1", &state)).unwrap();
        let constraint = problem.constraint(&keys::is_variation_constraint("pst-fr-1", &state)).unwrap();
        assert_eq!(problem.coefficient(constraint, binary), -10.0);
        assert!((problem.constraint_bounds(constraint).1 - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_excluded_operators_leave_tso_budget() {
        let perimeter = perimeter();
        let limits = RangeActionLimits {
            max_tso: Some(0),
            excluded_tsos: ["FR".to_string()].into_iter().collect(),
            ..RangeActionLimits::default()
        };
        let filler = RaUsageLimitsFiller::new(
            Arc::clone(&perimeter),
            [(State::preventive(), limits)].into_iter().collect(),
            reference(&perimeter),
            false,
        );
        let mut problem = problem_for(&perimeter);
        filler.fill(&mut problem, &FlowResult::new(), &SensitivityResult::new()).unwrap();

        let state = State::preventive();
        assert!(problem.get_variable(&keys::tso_ra_used_variable("FR", &state)).is_none());
        let used = problem.variable(&keys::tso_ra_used_variable("BE", &state)).unwrap();
        let max_tso = problem.constraint(&keys::max_tso_constraint(&state)).unwrap();
        assert_eq!(problem.coefficient(max_tso, used), 1.0);
        assert_eq!(problem.constraint_bounds(max_tso).1, 0.0);
    }

    #[test]
    fn test_elementary_action_budget_counts_taps() {
        let perimeter = perimeter();
        let limits = RangeActionLimits {
            max_elementary_actions_per_tso: [("FR".to_string(), 3)].into_iter().collect(),
            ..RangeActionLimits::default()
        };
        let filler = RaUsageLimitsFiller::new(
            Arc::clone(&perimeter),
            [(State::preventive(), limits)].into_iter().collect(),
            reference(&perimeter),
            true,
        );
        let mut problem = problem_for(&perimeter);
        filler.fill(&mut problem, &FlowResult::new(), &SensitivityResult::new()).unwrap();

        let state = State::preventive();
        let budget = problem
            .constraint(&keys::max_elementary_actions_per_tso_constraint("FR", &state))
            .unwrap();
        assert_eq!(problem.constraint_bounds(budget).1, 3.0);
        for id in ["pst-fr-1", "pst-fr-2"] {
            let taps = problem.variable(&keys::pst_absolute_tap_variation_variable(id, &state)).unwrap();
            assert_eq!(problem.coefficient(budget, taps), 1.0);
            let link = problem.constraint(&keys::pst_absolute_tap_variation_constraint(id, &state)).unwrap();
            assert_eq!(problem.coefficient(link, taps), 0.5);
        }
        assert!(problem
            .get_variable(&keys::pst_absolute_tap_variation_variable("pst-be", &state))
            .is_none());
    }
}
