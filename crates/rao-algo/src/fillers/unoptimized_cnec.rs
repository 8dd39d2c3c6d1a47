//! CNECs of operators that do not want their CNECs optimised.
//!
//! Such a CNEC only drives the objective when its margin gets worse than in
//! the pre-perimeter situation. A binary `b[c]` (1 = optimise) relaxes the
//! margin constraints of the margin filler, while the flow is kept within
//! the pre-perimeter margin when `b[c] = 0`:
//!
//! ```text
//! F[c] − bigM·b[c] ≤ max[c] − preMargin[c]
//! F[c] + bigM·b[c] ≥ min[c] + preMargin[c]
//! MM  + k·F[c] + M·b[c] ≤ k·max[c] + M          (same for −k·F, and MRM)
//! ```

use super::max_min_margin::margin_coefficient;
use super::max_min_relative_margin::max_positive_relative_margin;
use super::ProblemFiller;
use crate::linear_problem::keys::{self, Bound};
use crate::linear_problem::{LinearProblem, VariableHandle};
use crate::parameters::ObjectiveFunctionParameters;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{FlowCnec, OptimizationPerimeter, RaoResult, Unit};
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct UnoptimizedCnecFiller {
    cnecs: Vec<Arc<FlowCnec>>,
    pre_perimeter_flows: FlowResult,
    /// Relaxation of flow constraints, in MW.
    flow_big_m: f64,
    /// Relaxation of absolute margin constraints, in the objective unit.
    margin_big_m: f64,
    /// Relaxation of relative margin constraints.
    relative_margin_big_m: f64,
}

impl UnoptimizedCnecFiller {
    pub fn new(
        perimeter: &OptimizationPerimeter,
        operators_not_to_optimize: &BTreeSet<String>,
        pre_perimeter_flows: &FlowResult,
        objective: &ObjectiveFunctionParameters,
    ) -> Self {
        let optimized: Vec<Arc<FlowCnec>> = perimeter.optimized_flow_cnecs().cloned().collect();
        let cnecs: Vec<Arc<FlowCnec>> = optimized
            .iter()
            .filter(|cnec| {
                cnec.operator
                    .as_ref()
                    .is_some_and(|operator| operators_not_to_optimize.contains(operator))
            })
            .cloned()
            .collect();
        let largest_mw = optimized.iter().map(|c| c.largest_threshold_mw()).fold(0.0, f64::max);
        let largest_in_unit = optimized
            .iter()
            .map(|c| c.largest_threshold_mw() * margin_coefficient(c, objective.unit))
            .fold(0.0, f64::max);
        Self {
            cnecs,
            pre_perimeter_flows: pre_perimeter_flows.clone(),
            flow_big_m: 20.0 * largest_mw,
            margin_big_m: 2.0 * largest_in_unit,
            relative_margin_big_m: 2.0
                * max_positive_relative_margin(&optimized, objective.unit, objective.ptdf_sum_lower_bound),
        }
    }

    pub fn has_cnecs(&self) -> bool {
        !self.cnecs.is_empty()
    }

    fn relax(problem: &mut LinearProblem, key: &str, binary: VariableHandle, big_m: f64) {
        if let Some(constraint) = problem.get_constraint(key) {
            let (lb, ub) = problem.constraint_bounds(constraint);
            let current = problem.coefficient(constraint, binary);
            problem.set_coefficient(constraint, binary, current + big_m);
            problem.set_constraint_bounds(constraint, lb, ub + big_m);
        }
    }
}

impl ProblemFiller for UnoptimizedCnecFiller {
    fn name(&self) -> &'static str {
        "unoptimized-cnec"
    }

    fn needs_integrality(&self) -> bool {
        true
    }

    fn fill(&self, problem: &mut LinearProblem, _flows: &FlowResult, _sensitivities: &SensitivityResult) -> RaoResult<()> {
        for cnec in &self.cnecs {
            let flow = problem.variable(&keys::flow_variable(&cnec.id))?;
            let optimize = problem.add_binary_variable(&keys::optimize_cnec_binary(&cnec.id))?;
            let pre_margin = self.pre_perimeter_flows.margin(cnec, Unit::Megawatt)?;

            if let Some(max) = cnec.upper_bound_mw() {
                let constraint = problem.add_constraint(
                    &keys::dont_optimize_cnec_constraint(&cnec.id, Bound::Above),
                    f64::NEG_INFINITY,
                    max - pre_margin,
                )?;
                problem.set_coefficient(constraint, flow, 1.0);
                problem.set_coefficient(constraint, optimize, -self.flow_big_m);
            }
            if let Some(min) = cnec.lower_bound_mw() {
                let constraint = problem.add_constraint(
                    &keys::dont_optimize_cnec_constraint(&cnec.id, Bound::Below),
                    min + pre_margin,
                    f64::INFINITY,
                )?;
                problem.set_coefficient(constraint, flow, 1.0);
                problem.set_coefficient(constraint, optimize, self.flow_big_m);
            }

            for bound in [Bound::Above, Bound::Below] {
                Self::relax(problem, &keys::min_margin_constraint(&cnec.id, bound), optimize, self.margin_big_m);
                Self::relax(problem, &keys::min_relative_margin_constraint(&cnec.id, bound), optimize, self.relative_margin_big_m);
            }
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
    use crate::fillers::{FillerSlot, MaxMinMarginFiller, ProblemFillerChain};
    use crate::linear_problem::ClarabelBackend;
    use rao_core::{BranchThreshold, State};

    #[test]
    fn test_unoptimized_cnec_relaxes_margin_constraints() {
        let perimeter = OptimizationPerimeter::builder(State::preventive())
            .flow_cnec(
                FlowCnec::new("fr", "line-fr", State::preventive())
                    .with_threshold(BranchThreshold::symmetric(1000.0, Unit::Megawatt))
                    .with_operator("FR"),
            )
            .flow_cnec(
                FlowCnec::new("be", "line-be", State::preventive())
                    .with_threshold(BranchThreshold::symmetric(500.0, Unit::Megawatt))
                    .with_operator("BE"),
            )
            .build()
            .unwrap();
        let mut pre_perimeter = FlowResult::new();
        pre_perimeter.insert_flow("fr", 0.0);
        pre_perimeter.insert_flow("be", 400.0);
        let operators: BTreeSet<String> = ["BE".to_string()].into_iter().collect();
        let filler = UnoptimizedCnecFiller::new(
            &perimeter,
            &operators,
            &pre_perimeter,
            &ObjectiveFunctionParameters::default(),
        );
        assert!(filler.has_cnecs());

        let mut chain = ProblemFillerChain::new();
        chain.insert(FillerSlot::Margin, Box::new(MaxMinMarginFiller::new(&perimeter, Unit::Megawatt)));
        chain.insert(FillerSlot::UnoptimizedCnec, Box::new(filler));
        let mut problem = LinearProblem::new(chain, Box::new(ClarabelBackend), 30);
        for id in ["fr", "be"] {
            problem.add_variable(&keys::flow_variable(id), f64::NEG_INFINITY, f64::INFINITY).unwrap();
        }
        problem.fill(&pre_perimeter, &SensitivityResult::new()).unwrap();

        let binary = problem.variable(&keys::optimize_cnec_binary("be")).unwrap();
        let relaxed = problem.constraint(&keys::min_margin_constraint("be", Bound::Above)).unwrap();
        assert_eq!(problem.coefficient(relaxed, binary), 2000.0);
        assert_eq!(problem.constraint_bounds(relaxed).1, 2500.0);
        assert!(problem.get_variable(&keys::optimize_cnec_binary("fr")).is_none());

        // pre-perimeter margin 100 MW: the flow may not exceed 400 MW unless optimised
        let guard = problem.constraint(&keys::dont_optimize_cnec_constraint("be", Bound::Above)).unwrap();
        assert_eq!(problem.constraint_bounds(guard).1, 400.0);
        assert_eq!(problem.coefficient(guard, binary), -20000.0);
    }
}
