//! Monitored CNECs may not lose more than an acceptable margin.
//!
//! ```text
//! F[c] − V[c] ≤ max(max[c], F0[c] + decrease) − adjustment
//! F[c] + V[c] ≥ min(min[c], F0[c] − decrease) + adjustment
//! objective += violation_cost · V[c]
//! ```
//!
//! `F0` is the flow in the initial situation, in MW.

use super::ProblemFiller;
use crate::linear_problem::keys::{self, Bound};
use crate::linear_problem::LinearProblem;
use crate::parameters::MnecParameters;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{FlowCnec, OptimizationPerimeter, RaoResult};
use std::sync::Arc;

pub struct MnecFiller {
    cnecs: Vec<Arc<FlowCnec>>,
    parameters: MnecParameters,
    initial_flows: FlowResult,
}

impl MnecFiller {
    pub fn new(perimeter: &OptimizationPerimeter, parameters: MnecParameters, initial_flows: &FlowResult) -> Self {
        Self {
            cnecs: perimeter.monitored_flow_cnecs().cloned().collect(),
            parameters,
            initial_flows: initial_flows.clone(),
        }
    }
}

impl ProblemFiller for MnecFiller {
    fn name(&self) -> &'static str {
        "mnec"
    }

    fn fill(&self, problem: &mut LinearProblem, _flows: &FlowResult, _sensitivities: &SensitivityResult) -> RaoResult<()> {
        let decrease = self.parameters.acceptable_margin_decrease;
        let adjustment = self.parameters.constraint_adjustment_coefficient;
        for cnec in &self.cnecs {
            let initial_flow = self.initial_flows.flow_mw(&cnec.id)?;
            let flow = problem.variable(&keys::flow_variable(&cnec.id))?;
            let violation = problem.add_variable(&keys::mnec_violation_variable(&cnec.id), 0.0, f64::INFINITY)?;
            problem.set_objective_coefficient(violation, self.parameters.violation_cost);

            if let Some(max) = cnec.upper_bound_mw() {
                let upper = max.max(initial_flow + decrease) - adjustment;
                let constraint =
                    problem.add_constraint(&keys::mnec_flow_constraint(&cnec.id, Bound::Above), f64::NEG_INFINITY, upper)?;
                problem.set_coefficient(constraint, flow, 1.0);
                problem.set_coefficient(constraint, violation, -1.0);
            }
            if let Some(min) = cnec.lower_bound_mw() {
                let lower = min.min(initial_flow - decrease) + adjustment;
                let constraint =
                    problem.add_constraint(&keys::mnec_flow_constraint(&cnec.id, Bound::Below), lower, f64::INFINITY)?;
                problem.set_coefficient(constraint, flow, 1.0);
                problem.set_coefficient(constraint, violation, 1.0);
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
    use crate::fillers::ProblemFillerChain;
    use crate::linear_problem::ClarabelBackend;
    use rao_core::{BranchThreshold, State, Unit};

    #[test]
    fn test_mnec_bounds_allow_acceptable_decrease() {
        let perimeter = OptimizationPerimeter::builder(State::preventive())
            .flow_cnec(
                FlowCnec::new("m", "line", State::preventive())
                    .with_threshold(BranchThreshold::symmetric(100.0, Unit::Megawatt))
                    .with_roles(false, true),
            )
            .build()
            .unwrap();
        let mut initial = FlowResult::new();
        initial.insert_flow("m", 80.0);
        let filler = MnecFiller::new(&perimeter, MnecParameters::default(), &initial);

        let mut problem = LinearProblem::new(ProblemFillerChain::new(), Box::new(ClarabelBackend), 30);
        problem.add_variable(&keys::flow_variable("m"), f64::NEG_INFINITY, f64::INFINITY).unwrap();
        filler.fill(&mut problem, &initial, &SensitivityResult::new()).unwrap();

        // already close to the limit: the flow may grow by the 50 MW decrease
        let above = problem.constraint(&keys::mnec_flow_constraint("m", Bound::Above)).unwrap();
        assert_eq!(problem.constraint_bounds(above).1, 130.0);
        let below = problem.constraint(&keys::mnec_flow_constraint("m", Bound::Below)).unwrap();
        assert_eq!(problem.constraint_bounds(below).0, -100.0);
    }
}
