//! Maximise the worst relative margin.
//!
//! Positive margins are divided by the PTDF zonal sum of their CNEC, so that
//! CNECs that matter more to cross-border exchanges weigh more. A sign binary
//! `b` tells whether the worst margin is positive:
//!
//! ```text
//! MM − maxNeg·b                      ≥ −maxNeg
//! MRM − MM − bigM·b                  ≤ 0
//! MRM − maxPos·b                     ≤ 0
//! MRM + (k/p)·F[c] + bigM·b          ≤  (k/p)·max[c] + bigM
//! MRM − (k/p)·F[c] + bigM·b          ≤ −(k/p)·min[c] + bigM
//! objective −MRM
//! ```
//!
//! with `maxPos = highest threshold / ptdf floor`, `maxNeg = 5·maxPos` and
//! `bigM = maxPos + maxNeg`. The absolute `MM` constraints are kept.

use super::max_min_margin::{margin_coefficient, MaxMinMarginFiller};
use super::ProblemFiller;
use crate::linear_problem::keys::{self, Bound};
use crate::linear_problem::LinearProblem;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{FlowCnec, OptimizationPerimeter, RaoResult, Unit};
use std::sync::Arc;

const NEGATIVE_RANGE_FACTOR: f64 = 5.0;

/// Largest threshold among `cnecs`, in `unit`, divided by the PTDF floor.
pub(crate) fn max_positive_relative_margin(cnecs: &[Arc<FlowCnec>], unit: Unit, ptdf_floor: f64) -> f64 {
    let highest = cnecs
        .iter()
        .map(|cnec| cnec.largest_threshold_mw() * margin_coefficient(cnec, unit))
        .fold(0.0, f64::max);
    highest / ptdf_floor
}

pub struct MaxMinRelativeMarginFiller {
    optimized_cnecs: Vec<Arc<FlowCnec>>,
    unit: Unit,
    /// PTDF sum per optimized CNEC, floored.
    ptdf_sums: Vec<f64>,
    max_positive: f64,
}

impl MaxMinRelativeMarginFiller {
    pub fn new(perimeter: &OptimizationPerimeter, unit: Unit, initial_flows: &FlowResult, ptdf_floor: f64) -> Self {
        let optimized_cnecs: Vec<Arc<FlowCnec>> = perimeter.optimized_flow_cnecs().cloned().collect();
        let ptdf_sums = optimized_cnecs
            .iter()
            .map(|cnec| initial_flows.ptdf_zonal_sum(&cnec.id).max(ptdf_floor))
            .collect();
        let max_positive = max_positive_relative_margin(&optimized_cnecs, unit, ptdf_floor);
        Self {
            optimized_cnecs,
            unit,
            ptdf_sums,
            max_positive,
        }
    }
}

impl ProblemFiller for MaxMinRelativeMarginFiller {
    fn name(&self) -> &'static str {
        "max-min-relative-margin"
    }

    fn needs_integrality(&self) -> bool {
        true
    }

    fn fill(&self, problem: &mut LinearProblem, _flows: &FlowResult, _sensitivities: &SensitivityResult) -> RaoResult<()> {
        MaxMinMarginFiller::add_min_margin_constraints(problem, &self.optimized_cnecs, self.unit)?;
        let min_margin = problem.variable(keys::MIN_MARGIN_VARIABLE)?;

        let max_positive = self.max_positive;
        let max_negative = NEGATIVE_RANGE_FACTOR * max_positive;
        let big_m = max_positive + max_negative;

        let relative = problem.add_variable(keys::MIN_RELATIVE_MARGIN_VARIABLE, -max_negative, max_positive)?;
        let sign = problem.add_binary_variable(keys::MIN_RELATIVE_MARGIN_SIGN_BINARY)?;

        let definition = problem.add_constraint(keys::MIN_RELATIVE_MARGIN_SIGN_CONSTRAINT, -max_negative, f64::INFINITY)?;
        problem.set_coefficient(definition, min_margin, 1.0);
        problem.set_coefficient(definition, sign, -max_negative);

        let link = problem.add_constraint(keys::MIN_RELATIVE_MARGIN_LINK_CONSTRAINT, f64::NEG_INFINITY, 0.0)?;
        problem.set_coefficient(link, relative, 1.0);
        problem.set_coefficient(link, min_margin, -1.0);
        problem.set_coefficient(link, sign, -big_m);

        let upper = problem.add_constraint(keys::MIN_RELATIVE_MARGIN_UPPER_CONSTRAINT, f64::NEG_INFINITY, 0.0)?;
        problem.set_coefficient(upper, relative, 1.0);
        problem.set_coefficient(upper, sign, -max_positive);

        for (cnec, ptdf) in self.optimized_cnecs.iter().zip(&self.ptdf_sums) {
            let flow = problem.variable(&keys::flow_variable(&cnec.id))?;
            let k = margin_coefficient(cnec, self.unit) / ptdf;
            if let Some(max) = cnec.upper_bound_mw() {
                let constraint = problem.add_constraint(
                    &keys::min_relative_margin_constraint(&cnec.id, Bound::Above),
                    f64::NEG_INFINITY,
                    k * max + big_m,
                )?;
                problem.set_coefficient(constraint, relative, 1.0);
                problem.set_coefficient(constraint, flow, k);
                problem.set_coefficient(constraint, sign, big_m);
            }
            if let Some(min) = cnec.lower_bound_mw() {
                let constraint = problem.add_constraint(
                    &keys::min_relative_margin_constraint(&cnec.id, Bound::Below),
                    f64::NEG_INFINITY,
                    -k * min + big_m,
                )?;
                problem.set_coefficient(constraint, relative, 1.0);
                problem.set_coefficient(constraint, flow, -k);
                problem.set_coefficient(constraint, sign, big_m);
            }
        }

        problem.set_objective_coefficient(relative, -1.0);
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
    use crate::linear_problem::ClarabelBackend;
    use crate::fillers::ProblemFillerChain;
    use crate::test_utils;

    #[test]
    fn test_relative_margin_structure() {
        let perimeter = test_utils::single_pst_perimeter();
        let mut initial = FlowResult::new();
        initial.insert_ptdf_zonal_sum("cnec-line", 0.5);
        let filler = MaxMinRelativeMarginFiller::new(&perimeter, Unit::Megawatt, &initial, 0.01);
        assert!((filler.max_positive - 1000.0 / 0.01).abs() < 1e-6);

        let mut problem = LinearProblem::new(ProblemFillerChain::new(), Box::new(ClarabelBackend), 30);
        problem.add_variable(&keys::flow_variable("cnec-line"), f64::NEG_INFINITY, f64::INFINITY).unwrap();
        filler.fill(&mut problem, &FlowResult::new(), &SensitivityResult::new()).unwrap();

        let relative = problem.variable(keys::MIN_RELATIVE_MARGIN_VARIABLE).unwrap();
        let flow = problem.variable(&keys::flow_variable("cnec-line")).unwrap();
        let above = problem
            .constraint(&keys::min_relative_margin_constraint("cnec-line", Bound::Above))
            .unwrap();
        assert_eq!(problem.coefficient(above, flow), 2.0);
        assert_eq!(problem.objective_coefficient(relative), -1.0);
        assert!(problem.get_constraint(&keys::min_margin_constraint("cnec-line", Bound::Below)).is_some());
    }
}
