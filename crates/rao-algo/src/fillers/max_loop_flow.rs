//! Loop-flow limitation.
//!
//! ```text
//! F[c] − V[c] ≤  thr[c] + commercial[c]
//! F[c] + V[c] ≥ −thr[c] + commercial[c]
//! objective += violation_cost · V[c]
//! ```
//!
//! `thr = max(threshold, |initial loop flow| + acceptable increase) − adjustment`.
//! Commercial flows are refreshed on update when the new flows carry them.

use super::ProblemFiller;
use crate::linear_problem::keys::{self, Bound};
use crate::linear_problem::LinearProblem;
use crate::objective::loop_flow_threshold;
use crate::parameters::LoopFlowParameters;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{FlowCnec, OptimizationPerimeter, RaoError, RaoResult};
use std::sync::Arc;

pub struct MaxLoopFlowFiller {
    cnecs: Vec<Arc<FlowCnec>>,
    parameters: LoopFlowParameters,
    initial_flows: FlowResult,
}

impl MaxLoopFlowFiller {
    pub fn new(perimeter: &OptimizationPerimeter, parameters: LoopFlowParameters, initial_flows: &FlowResult) -> Self {
        Self {
            cnecs: perimeter.loop_flow_cnecs().cloned().collect(),
            parameters,
            initial_flows: initial_flows.clone(),
        }
    }

    fn commercial_flow(&self, cnec: &FlowCnec, flows: &FlowResult) -> RaoResult<f64> {
        flows
            .commercial_flow(&cnec.id)
            .or_else(|| self.initial_flows.commercial_flow(&cnec.id))
            .ok_or_else(|| RaoError::FillerConstruction(format!("no commercial flow for loop-flow CNEC '{}'", cnec.id)))
    }

    fn bounds(&self, cnec: &FlowCnec, flows: &FlowResult) -> RaoResult<(f64, f64)> {
        let threshold = loop_flow_threshold(cnec, &self.initial_flows, &self.parameters)?
            - self.parameters.constraint_adjustment_coefficient;
        let commercial = self.commercial_flow(cnec, flows)?;
        Ok((commercial - threshold, commercial + threshold))
    }
}

impl ProblemFiller for MaxLoopFlowFiller {
    fn name(&self) -> &'static str {
        "max-loop-flow"
    }

    fn fill(&self, problem: &mut LinearProblem, flows: &FlowResult, _sensitivities: &SensitivityResult) -> RaoResult<()> {
        for cnec in &self.cnecs {
            let flow = problem.variable(&keys::flow_variable(&cnec.id))?;
            let violation = problem.add_variable(&keys::loop_flow_violation_variable(&cnec.id), 0.0, f64::INFINITY)?;
            problem.set_objective_coefficient(violation, self.parameters.violation_cost);
            let (lower, upper) = self.bounds(cnec, flows)?;

            let above = problem.add_constraint(&keys::max_loop_flow_constraint(&cnec.id, Bound::Above), f64::NEG_INFINITY, upper)?;
            problem.set_coefficient(above, flow, 1.0);
            problem.set_coefficient(above, violation, -1.0);

            let below = problem.add_constraint(&keys::max_loop_flow_constraint(&cnec.id, Bound::Below), lower, f64::INFINITY)?;
            problem.set_coefficient(below, flow, 1.0);
            problem.set_coefficient(below, violation, 1.0);
        }
        Ok(())
    }

    fn update(
        &self,
        problem: &mut LinearProblem,
        flows: &FlowResult,
        _sensitivities: &SensitivityResult,
        _activation: &RangeActionActivation,
    ) -> RaoResult<()> {
        for cnec in &self.cnecs {
            let (lower, upper) = self.bounds(cnec, flows)?;
            let above = problem.constraint(&keys::max_loop_flow_constraint(&cnec.id, Bound::Above))?;
            problem.set_constraint_bounds(above, f64::NEG_INFINITY, upper);
            let below = problem.constraint(&keys::max_loop_flow_constraint(&cnec.id, Bound::Below))?;
            problem.set_constraint_bounds(below, lower, f64::INFINITY);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fillers::ProblemFillerChain;
    use crate::linear_problem::ClarabelBackend;
    use rao_core::{BranchThreshold, State, Unit};

    fn perimeter() -> OptimizationPerimeter {
        OptimizationPerimeter::builder(State::preventive())
            .flow_cnec(
                FlowCnec::new("lf", "line", State::preventive())
                    .with_threshold(BranchThreshold::symmetric(1000.0, Unit::Megawatt))
                    .with_loop_flow_threshold(100.0),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_loop_flow_bounds_follow_commercial_flow() {
        let perimeter = perimeter();
        let mut initial = FlowResult::new();
        initial.insert_flow("lf", 250.0);
        initial.insert_commercial_flow("lf", 100.0);
        let parameters = LoopFlowParameters {
            acceptable_increase: 20.0,
            violation_cost: 10.0,
            constraint_adjustment_coefficient: 5.0,
        };
        let filler = MaxLoopFlowFiller::new(&perimeter, parameters, &initial);

        let mut problem = LinearProblem::new(ProblemFillerChain::new(), Box::new(ClarabelBackend), 30);
        problem.add_variable(&keys::flow_variable("lf"), f64::NEG_INFINITY, f64::INFINITY).unwrap();
        filler.fill(&mut problem, &initial, &SensitivityResult::new()).unwrap();

        // threshold max(100, 150 + 20) - 5 = 165 around a commercial flow of 100
        let above = problem.constraint(&keys::max_loop_flow_constraint("lf", Bound::Above)).unwrap();
        assert_eq!(problem.constraint_bounds(above), (f64::NEG_INFINITY, 265.0));

        let mut flows = FlowResult::new();
        flows.insert_flow("lf", 300.0);
        flows.insert_commercial_flow("lf", 50.0);
        filler
            .update(&mut problem, &flows, &SensitivityResult::new(), &RangeActionActivation::default())
            .unwrap();
        let below = problem.constraint(&keys::max_loop_flow_constraint("lf", Bound::Below)).unwrap();
        assert_eq!(problem.constraint_bounds(below), (-115.0, f64::INFINITY));
        let violation = problem.variable(&keys::loop_flow_violation_variable("lf")).unwrap();
        assert_eq!(problem.objective_coefficient(violation), 10.0);
    }
}
