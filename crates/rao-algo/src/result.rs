//! Physics and optimisation results.
//!
//! A leaf goes through two kinds of results: the [`EvaluationResult`] of a
//! sensitivity run on its network, then, once optimised, an
//! [`OptimizedResult`] carrying the range action setpoints the iterating
//! optimiser settled on. [`LinearOptimizationResult::Failed`] stands for an
//! optimisation that could not produce anything; every accessor on it fails.

use rao_core::{FlowCnec, OptimizationPerimeter, RaoError, RaoResult, RangeAction, State, Unit};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Setpoint differences below this are not a move.
pub const SETPOINT_EPSILON: f64 = 1e-6;

/// Outcome of a linear problem solve, or of a whole iterating optimisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinearProblemStatus {
    Optimal,
    Feasible,
    Infeasible,
    Unbounded,
    Abnormal,
    NotSolved,
    SensitivityComputationFailed,
    MaxIterationReached,
}

impl LinearProblemStatus {
    /// Whether the solver returned a usable solution.
    pub fn has_solution(&self) -> bool {
        matches!(self, LinearProblemStatus::Optimal | LinearProblemStatus::Feasible)
    }
}

impl fmt::Display for LinearProblemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinearProblemStatus::Optimal => "OPTIMAL",
            LinearProblemStatus::Feasible => "FEASIBLE",
            LinearProblemStatus::Infeasible => "INFEASIBLE",
            LinearProblemStatus::Unbounded => "UNBOUNDED",
            LinearProblemStatus::Abnormal => "ABNORMAL",
            LinearProblemStatus::NotSolved => "NOT_SOLVED",
            LinearProblemStatus::SensitivityComputationFailed => "SENSITIVITY_COMPUTATION_FAILED",
            LinearProblemStatus::MaxIterationReached => "MAX_ITERATION_REACHED",
        };
        write!(f, "{}", label)
    }
}

/// Flows on every CNEC of a perimeter, in MW.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowResult {
    flows: BTreeMap<String, f64>,
    commercial_flows: BTreeMap<String, f64>,
    ptdf_zonal_sums: BTreeMap<String, f64>,
}

impl FlowResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_flow(&mut self, cnec_id: impl Into<String>, flow_mw: f64) {
        self.flows.insert(cnec_id.into(), flow_mw);
    }

    pub fn insert_commercial_flow(&mut self, cnec_id: impl Into<String>, flow_mw: f64) {
        self.commercial_flows.insert(cnec_id.into(), flow_mw);
    }

    pub fn insert_ptdf_zonal_sum(&mut self, cnec_id: impl Into<String>, ptdf_sum: f64) {
        self.ptdf_zonal_sums.insert(cnec_id.into(), ptdf_sum);
    }

    pub fn flow_mw(&self, cnec_id: &str) -> RaoResult<f64> {
        self.flows
            .get(cnec_id)
            .copied()
            .ok_or_else(|| RaoError::ResultNotAvailable(format!("no flow computed for CNEC '{}'", cnec_id)))
    }

    pub fn flow(&self, cnec: &FlowCnec, unit: Unit) -> RaoResult<f64> {
        let flow = self.flow_mw(&cnec.id)?;
        Ok(flow * cnec.unit_conversion_factor(rao_core::Side::One, Unit::Megawatt, unit))
    }

    pub fn margin(&self, cnec: &FlowCnec, unit: Unit) -> RaoResult<f64> {
        Ok(cnec.compute_margin(self.flow_mw(&cnec.id)?, unit))
    }

    /// Margin with positive values divided by the PTDF zonal sum, floored at
    /// `ptdf_floor`. Negative margins are returned as is.
    pub fn relative_margin(&self, cnec: &FlowCnec, unit: Unit, ptdf_floor: f64) -> RaoResult<f64> {
        let margin = self.margin(cnec, unit)?;
        if margin > 0.0 {
            Ok(margin / self.ptdf_zonal_sum(&cnec.id).max(ptdf_floor))
        } else {
            Ok(margin)
        }
    }

    pub fn commercial_flow(&self, cnec_id: &str) -> Option<f64> {
        self.commercial_flows.get(cnec_id).copied()
    }

    /// Flow minus commercial flow. A CNEC without commercial flow has none.
    pub fn loop_flow(&self, cnec_id: &str) -> RaoResult<f64> {
        let commercial = self.commercial_flow(cnec_id).ok_or_else(|| {
            RaoError::ResultNotAvailable(format!("no commercial flow for CNEC '{}'", cnec_id))
        })?;
        Ok(self.flow_mw(cnec_id)? - commercial)
    }

    /// Absolute PTDF zonal sum of a CNEC; 1.0 when not provided.
    pub fn ptdf_zonal_sum(&self, cnec_id: &str) -> f64 {
        self.ptdf_zonal_sums.get(cnec_id).copied().unwrap_or(1.0)
    }
}

/// Flow sensitivities to range action setpoints, in MW per setpoint unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensitivityResult {
    values: BTreeMap<(String, String), f64>,
}

impl SensitivityResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cnec_id: impl Into<String>, range_action_id: impl Into<String>, value: f64) {
        self.values.insert((cnec_id.into(), range_action_id.into()), value);
    }

    /// Zero for pairs that were not computed.
    pub fn sensitivity(&self, cnec_id: &str, range_action_id: &str) -> f64 {
        self.values
            .get(&(cnec_id.to_string(), range_action_id.to_string()))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Output of one sensitivity computation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicsResult {
    pub flow: FlowResult,
    pub sensitivity: SensitivityResult,
}

/// Range action setpoints per state, on top of reference setpoints.
///
/// A range action without a setpoint at a state keeps the one of the latest
/// earlier state of the same contingency (or of the preventive trunk) it has
/// one at, or its reference setpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeActionActivation {
    setpoints: BTreeMap<State, BTreeMap<String, f64>>,
    reference: BTreeMap<String, f64>,
}

impl RangeActionActivation {
    pub fn new(reference: BTreeMap<String, f64>) -> Self {
        Self {
            setpoints: BTreeMap::new(),
            reference,
        }
    }

    /// Reference setpoints read from a network.
    pub fn from_network(perimeter: &OptimizationPerimeter, network: &rao_core::Network) -> RaoResult<Self> {
        let mut reference = BTreeMap::new();
        for range_action in perimeter.range_actions() {
            reference.insert(range_action.id.clone(), range_action.current_setpoint(network)?);
        }
        Ok(Self::new(reference))
    }

    pub fn put(&mut self, state: &State, range_action_id: impl Into<String>, setpoint: f64) {
        self.setpoints
            .entry(state.clone())
            .or_default()
            .insert(range_action_id.into(), setpoint);
    }

    pub fn reference(&self) -> &BTreeMap<String, f64> {
        &self.reference
    }

    pub fn reference_setpoint(&self, range_action_id: &str) -> RaoResult<f64> {
        self.reference.get(range_action_id).copied().ok_or_else(|| {
            RaoError::ResultNotAvailable(format!("no reference setpoint for range action '{}'", range_action_id))
        })
    }

    pub fn setpoint(&self, range_action_id: &str, state: &State) -> RaoResult<f64> {
        let latest = self
            .setpoints
            .range(..=state.clone())
            .rev()
            .filter(|(earlier, _)| earlier.reaches(state))
            .find_map(|(_, setpoints)| setpoints.get(range_action_id).copied());
        match latest {
            Some(setpoint) => Ok(setpoint),
            None => self.reference_setpoint(range_action_id),
        }
    }

    /// Setpoint a range action had before `state`.
    pub fn previous_setpoint(&self, range_action_id: &str, state: &State) -> RaoResult<f64> {
        let latest = self
            .setpoints
            .range(..state.clone())
            .rev()
            .filter(|(earlier, _)| earlier.reaches(state))
            .find_map(|(_, setpoints)| setpoints.get(range_action_id).copied());
        match latest {
            Some(setpoint) => Ok(setpoint),
            None => self.reference_setpoint(range_action_id),
        }
    }

    pub fn tap(&self, range_action: &RangeAction, state: &State) -> RaoResult<i32> {
        let pst = range_action.as_pst().ok_or_else(|| {
            RaoError::Validation(format!("range action '{}' has no tap", range_action.id))
        })?;
        Ok(pst.convert_angle_to_tap(self.setpoint(&range_action.id, state)?))
    }

    /// Ids of range actions moved at `state` with respect to the previous
    /// state (or the reference).
    pub fn activated(&self, state: &State) -> BTreeSet<String> {
        let Some(setpoints) = self.setpoints.get(state) else {
            return BTreeSet::new();
        };
        setpoints
            .iter()
            .filter(|(id, setpoint)| {
                self.previous_setpoint(id, state)
                    .map(|previous| (**setpoint - previous).abs() > SETPOINT_EPSILON)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.setpoints.keys()
    }

    /// Writes the setpoints of every range action of the perimeter at `state`
    /// on the network.
    pub fn apply(&self, perimeter: &OptimizationPerimeter, state: &State, network: &mut rao_core::Network) -> RaoResult<()> {
        for range_action in perimeter.range_actions() {
            let setpoint = self.setpoint(&range_action.id, state)?;
            range_action.apply(network, setpoint)?;
        }
        Ok(())
    }
}

/// Cost of a flow result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectiveFunctionResult {
    pub functional_cost: f64,
    pub virtual_costs: BTreeMap<String, f64>,
    /// CNEC ids, most limiting first.
    pub most_limiting_elements: Vec<String>,
    /// CNEC ids per virtual cost, costliest first.
    pub costly_elements: BTreeMap<String, Vec<String>>,
}

impl ObjectiveFunctionResult {
    pub fn virtual_cost(&self) -> f64 {
        self.virtual_costs.values().sum()
    }

    pub fn cost(&self) -> f64 {
        self.functional_cost + self.virtual_cost()
    }
}

/// Flows, sensitivities and cost of one network situation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    pub flow: FlowResult,
    pub sensitivity: SensitivityResult,
    pub objective: ObjectiveFunctionResult,
}

impl EvaluationResult {
    pub fn cost(&self) -> f64 {
        self.objective.cost()
    }
}

/// Result of an iterating linear optimisation.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedResult {
    pub status: LinearProblemStatus,
    /// Iteration the result was found at; 0 for the starting point.
    pub iterations: usize,
    pub activation: RangeActionActivation,
    pub evaluation: EvaluationResult,
}

impl OptimizedResult {
    pub fn cost(&self) -> f64 {
        self.evaluation.cost()
    }
}

/// What the iterating optimiser hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearOptimizationResult {
    Computed(Box<OptimizedResult>),
    /// The very first solve failed; nothing can be read from this result.
    Failed { status: LinearProblemStatus },
}

impl LinearOptimizationResult {
    pub fn status(&self) -> LinearProblemStatus {
        match self {
            LinearOptimizationResult::Computed(result) => result.status,
            LinearOptimizationResult::Failed { status } => *status,
        }
    }

    fn computed(&self) -> RaoResult<&OptimizedResult> {
        match self {
            LinearOptimizationResult::Computed(result) => Ok(result),
            LinearOptimizationResult::Failed { status } => Err(RaoError::ResultNotAvailable(format!(
                "linear optimisation failed with status {}",
                status
            ))),
        }
    }

    pub fn cost(&self) -> RaoResult<f64> {
        Ok(self.computed()?.cost())
    }

    pub fn functional_cost(&self) -> RaoResult<f64> {
        Ok(self.computed()?.evaluation.objective.functional_cost)
    }

    pub fn virtual_cost(&self) -> RaoResult<f64> {
        Ok(self.computed()?.evaluation.objective.virtual_cost())
    }

    pub fn activation(&self) -> RaoResult<&RangeActionActivation> {
        Ok(&self.computed()?.activation)
    }

    pub fn flow(&self, cnec: &FlowCnec, unit: Unit) -> RaoResult<f64> {
        self.computed()?.evaluation.flow.flow(cnec, unit)
    }

    pub fn margin(&self, cnec: &FlowCnec, unit: Unit) -> RaoResult<f64> {
        self.computed()?.evaluation.flow.margin(cnec, unit)
    }

    pub fn into_computed(self) -> RaoResult<OptimizedResult> {
        match self {
            LinearOptimizationResult::Computed(result) => Ok(*result),
            LinearOptimizationResult::Failed { status } => Err(RaoError::ResultNotAvailable(format!(
                "linear optimisation failed with status {}",
                status
            ))),
        }
    }
}
