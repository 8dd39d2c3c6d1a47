//! Maximise the worst margin.
//!
//! ```text
//! MM + k·F[c] ≤  k·max[c]
//! MM − k·F[c] ≤ −k·min[c]        for every optimized CNEC c
//! objective −MM
//! ```
//!
//! `k` converts MW to the objective unit.

use super::ProblemFiller;
use crate::linear_problem::keys::{self, Bound};
use crate::linear_problem::LinearProblem;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{FlowCnec, OptimizationPerimeter, RaoResult, Side, Unit};
use std::sync::Arc;

/// MW to `unit` factor of a CNEC, on the side flows are read on.
pub(crate) fn margin_coefficient(cnec: &FlowCnec, unit: Unit) -> f64 {
    cnec.unit_conversion_factor(Side::One, Unit::Megawatt, unit)
}

pub struct MaxMinMarginFiller {
    optimized_cnecs: Vec<Arc<FlowCnec>>,
    unit: Unit,
}

impl MaxMinMarginFiller {
    pub fn new(perimeter: &OptimizationPerimeter, unit: Unit) -> Self {
        Self {
            optimized_cnecs: perimeter.optimized_flow_cnecs().cloned().collect(),
            unit,
        }
    }

    /// Adds `MM` and the two margin constraints of every optimized CNEC.
    /// Shared with the relative-margin filler.
    pub(crate) fn add_min_margin_constraints(
        problem: &mut LinearProblem,
        cnecs: &[Arc<FlowCnec>],
        unit: Unit,
    ) -> RaoResult<()> {
        // With nothing to optimise, MM would be unbounded.
        let (lb, ub) = if cnecs.is_empty() {
            (0.0, 0.0)
        } else {
            (f64::NEG_INFINITY, f64::INFINITY)
        };
        let min_margin = problem.add_variable(keys::MIN_MARGIN_VARIABLE, lb, ub)?;
        for cnec in cnecs {
            let flow = problem.variable(&keys::flow_variable(&cnec.id))?;
            let k = margin_coefficient(cnec, unit);
            if let Some(max) = cnec.upper_bound_mw() {
                let constraint =
                    problem.add_constraint(&keys::min_margin_constraint(&cnec.id, Bound::Above), f64::NEG_INFINITY, k * max)?;
                problem.set_coefficient(constraint, min_margin, 1.0);
                problem.set_coefficient(constraint, flow, k);
            }
            if let Some(min) = cnec.lower_bound_mw() {
                let constraint =
                    problem.add_constraint(&keys::min_margin_constraint(&cnec.id, Bound::Below), f64::NEG_INFINITY, -k * min)?;
                problem.set_coefficient(constraint, min_margin, 1.0);
                problem.set_coefficient(constraint, flow, -k);
            }
        }
        Ok(())
    }
}

impl ProblemFiller for MaxMinMarginFiller {
    fn name(&self) -> &'static str {
        "max-min-margin"
    }

    fn fill(&self, problem: &mut LinearProblem, _flows: &FlowResult, _sensitivities: &SensitivityResult) -> RaoResult<()> {
        Self::add_min_margin_constraints(problem, &self.optimized_cnecs, self.unit)?;
        let min_margin = problem.variable(keys::MIN_MARGIN_VARIABLE)?;
        problem.set_objective_coefficient(min_margin, -1.0);
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
    use crate::fillers::{CoreProblemFiller, FillerSlot, ProblemFillerChain};
    use crate::linear_problem::ClarabelBackend;
    use crate::parameters::RangeActionsParameters;
    use crate::result::LinearProblemStatus;
    use crate::test_utils;

    #[test]
    fn test_overloaded_line_pushes_pst_to_its_limit() {
        let perimeter = Arc::new(test_utils::single_pst_perimeter());
        let network = test_utils::two_area_network();
        let setpoints = RangeActionActivation::from_network(&perimeter, &network).unwrap();
        let mut chain = ProblemFillerChain::new();
        chain.insert(
            FillerSlot::Core,
            Box::new(CoreProblemFiller::new(
                Arc::clone(&perimeter),
                setpoints.clone(),
                setpoints,
                RangeActionsParameters::default(),
            )),
        );
        chain.insert(FillerSlot::Margin, Box::new(MaxMinMarginFiller::new(&perimeter, Unit::Megawatt)));
        let mut problem = LinearProblem::new(chain, Box::new(ClarabelBackend), 30);

        // 1200 MW on a 1000 MW line, 100 MW/°: the best reachable angle is -5°
        let mut flows = FlowResult::new();
        flows.insert_flow("cnec-line", 1200.0);
        let mut sensitivities = SensitivityResult::new();
        sensitivities.insert("cnec-line", "pst-ra", 100.0);
        problem.fill(&flows, &sensitivities).unwrap();

        assert_eq!(problem.solve(), LinearProblemStatus::Optimal);
        let setpoint = problem
            .variable(&keys::setpoint_variable("pst-ra", perimeter.main_state()))
            .unwrap();
        let min_margin = problem.variable(keys::MIN_MARGIN_VARIABLE).unwrap();
        assert!((problem.value(setpoint).unwrap() + 5.0).abs() < 1e-3);
        assert!((problem.value(min_margin).unwrap() - 300.0).abs() < 0.1);
    }

    #[test]
    fn test_ampere_objective_scales_constraints() {
        let perimeter = test_utils::single_pst_perimeter();
        let cnec = perimeter.flow_cnec("cnec-line").unwrap();
        let k = margin_coefficient(cnec, Unit::Ampere);
        assert!((k - 1000.0 / (400.0 * 3f64.sqrt())).abs() < 1e-12);
        assert_eq!(margin_coefficient(cnec, Unit::Megawatt), 1.0);
    }
}
