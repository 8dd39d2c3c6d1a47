//! Cost of a network situation.
//!
//! The functional cost is the opposite of the worst margin over optimized
//! CNECs, so lower is better and a negative cost means every CNEC is secure.
//! Virtual costs penalise what the margin does not capture:
//!
//! | Name                  | Applies to         | Penalised quantity                                  |
//! |-----------------------|--------------------|-----------------------------------------------------|
//! | `mnec-violation-cost` | monitored CNECs    | margin decrease beyond the acceptable one           |
//! | `loop-flow-cost`      | loop-flow CNECs    | loop flow above `max(threshold, initial + increase)`|

use crate::parameters::{
    LoopFlowParameters, MnecParameters, ObjectiveFunctionKind, RaoParameters, UnoptimizedCnecParameters,
};
use crate::result::{FlowResult, ObjectiveFunctionResult};
use rao_core::{FlowCnec, OptimizationPerimeter, RaoResult, Unit};
use std::cmp::Ordering;
use std::sync::Arc;

pub const MNEC_VIOLATION_COST: &str = "mnec-violation-cost";
pub const LOOP_FLOW_COST: &str = "loop-flow-cost";

/// Evaluates functional and virtual costs of flow results for one perimeter.
#[derive(Debug, Clone)]
pub struct ObjectiveFunction {
    kind: ObjectiveFunctionKind,
    unit: Unit,
    ptdf_floor: f64,
    optimized_cnecs: Vec<Arc<FlowCnec>>,
    mnecs: Vec<Arc<FlowCnec>>,
    loop_flow_cnecs: Vec<Arc<FlowCnec>>,
    mnec: Option<MnecParameters>,
    loop_flow: Option<LoopFlowParameters>,
    unoptimized: Option<UnoptimizedCnecParameters>,
    initial_flows: FlowResult,
    pre_perimeter_flows: FlowResult,
}

impl ObjectiveFunction {
    /// `initial_flows` is the reference for MNEC and loop-flow costs,
    /// `pre_perimeter_flows` the one for CNECs of operators not optimized.
    pub fn build(
        perimeter: &OptimizationPerimeter,
        parameters: &RaoParameters,
        initial_flows: &FlowResult,
        pre_perimeter_flows: &FlowResult,
    ) -> Self {
        let objective = &parameters.objective_function;
        Self {
            kind: objective.kind,
            unit: objective.unit,
            ptdf_floor: objective.ptdf_sum_lower_bound,
            optimized_cnecs: perimeter.optimized_flow_cnecs().cloned().collect(),
            mnecs: perimeter.monitored_flow_cnecs().cloned().collect(),
            loop_flow_cnecs: perimeter.loop_flow_cnecs().cloned().collect(),
            mnec: parameters.mnec.clone(),
            loop_flow: parameters.loop_flow.clone(),
            unoptimized: parameters.unoptimized_cnecs.clone(),
            initial_flows: initial_flows.clone(),
            pre_perimeter_flows: pre_perimeter_flows.clone(),
        }
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn evaluate(&self, flows: &FlowResult) -> RaoResult<ObjectiveFunctionResult> {
        let (functional_cost, most_limiting_elements) = self.functional_cost(flows)?;
        let mut result = ObjectiveFunctionResult {
            functional_cost,
            most_limiting_elements,
            ..Default::default()
        };
        if let Some(mnec) = &self.mnec {
            let (cost, elements) = self.mnec_cost(mnec, flows)?;
            result.virtual_costs.insert(MNEC_VIOLATION_COST.to_string(), cost);
            result.costly_elements.insert(MNEC_VIOLATION_COST.to_string(), elements);
        }
        if let Some(loop_flow) = &self.loop_flow {
            let (cost, elements) = self.loop_flow_cost(loop_flow, flows)?;
            result.virtual_costs.insert(LOOP_FLOW_COST.to_string(), cost);
            result.costly_elements.insert(LOOP_FLOW_COST.to_string(), elements);
        }
        Ok(result)
    }

    fn cnec_margin(&self, cnec: &FlowCnec, flows: &FlowResult) -> RaoResult<f64> {
        match self.kind {
            ObjectiveFunctionKind::MaxMinMargin => flows.margin(cnec, self.unit),
            ObjectiveFunctionKind::MaxMinRelativeMargin => {
                let margin = flows.margin(cnec, self.unit)?;
                if margin > 0.0 {
                    Ok(margin / self.initial_flows.ptdf_zonal_sum(&cnec.id).max(self.ptdf_floor))
                } else {
                    Ok(margin)
                }
            }
        }
    }

    /// CNECs of operators not to optimize only count once their margin went
    /// below the pre-perimeter one.
    fn is_ignored(&self, cnec: &FlowCnec, flows: &FlowResult) -> RaoResult<bool> {
        let (Some(unoptimized), Some(operator)) = (&self.unoptimized, &cnec.operator) else {
            return Ok(false);
        };
        if !unoptimized.operators_not_to_optimize.contains(operator) {
            return Ok(false);
        }
        let current = flows.margin(cnec, Unit::Megawatt)?;
        let pre_perimeter = self.pre_perimeter_flows.margin(cnec, Unit::Megawatt)?;
        Ok(current >= pre_perimeter)
    }

    fn functional_cost(&self, flows: &FlowResult) -> RaoResult<(f64, Vec<String>)> {
        let mut margins = Vec::with_capacity(self.optimized_cnecs.len());
        for cnec in &self.optimized_cnecs {
            if self.is_ignored(cnec, flows)? {
                continue;
            }
            margins.push((cnec.id.clone(), self.cnec_margin(cnec, flows)?));
        }
        margins.sort_by(|(id_a, a), (id_b, b)| a.total_cmp(b).then_with(|| id_a.cmp(id_b)));
        let cost = margins.first().map(|(_, margin)| -margin).unwrap_or(0.0);
        Ok((cost, margins.into_iter().map(|(id, _)| id).collect()))
    }

    fn mnec_cost(&self, parameters: &MnecParameters, flows: &FlowResult) -> RaoResult<(f64, Vec<String>)> {
        let mut violations = Vec::new();
        for cnec in &self.mnecs {
            let initial_margin = self.initial_flows.margin(cnec, Unit::Megawatt)?;
            let current_margin = flows.margin(cnec, Unit::Megawatt)?;
            let floor = (initial_margin - parameters.acceptable_margin_decrease).min(0.0);
            let violation = (floor - current_margin).max(0.0);
            if violation > 0.0 {
                violations.push((cnec.id.clone(), violation));
            }
        }
        Ok(weighted_violations(violations, parameters.violation_cost))
    }

    fn loop_flow_cost(&self, parameters: &LoopFlowParameters, flows: &FlowResult) -> RaoResult<(f64, Vec<String>)> {
        let mut violations = Vec::new();
        for cnec in &self.loop_flow_cnecs {
            let threshold = loop_flow_threshold(cnec, &self.initial_flows, parameters)?;
            let Some(commercial) = flows
                .commercial_flow(&cnec.id)
                .or_else(|| self.initial_flows.commercial_flow(&cnec.id))
            else {
                continue;
            };
            let loop_flow = flows.flow_mw(&cnec.id)? - commercial;
            let violation = (loop_flow.abs() - threshold).max(0.0);
            if violation > 0.0 {
                violations.push((cnec.id.clone(), violation));
            }
        }
        Ok(weighted_violations(violations, parameters.violation_cost))
    }
}

/// Loop-flow limit of a CNEC in MW: its threshold, raised to the initial
/// loop flow plus the acceptable increase when that is higher.
pub fn loop_flow_threshold(cnec: &FlowCnec, initial_flows: &FlowResult, parameters: &LoopFlowParameters) -> RaoResult<f64> {
    let threshold = cnec.loop_flow_threshold.unwrap_or(f64::MAX);
    let initial_loop_flow = match initial_flows.commercial_flow(&cnec.id) {
        Some(commercial) => (initial_flows.flow_mw(&cnec.id)? - commercial).abs(),
        None => 0.0,
    };
    Ok(threshold.max(initial_loop_flow + parameters.acceptable_increase))
}

fn weighted_violations(mut violations: Vec<(String, f64)>, cost: f64) -> (f64, Vec<String>) {
    violations.sort_by(|(id_a, a), (id_b, b)| match b.total_cmp(a) {
        Ordering::Equal => id_a.cmp(id_b),
        other => other,
    });
    let total: f64 = violations.iter().map(|(_, violation)| violation * cost).sum();
    (total, violations.into_iter().map(|(id, _)| id).collect())
}
