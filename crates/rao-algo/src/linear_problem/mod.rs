//! Keyed linear problem of one leaf.
//!
//! [`LinearProblem`] owns a solver-independent model (variables, constraints,
//! objective) addressed by deterministic string keys (see [`keys`]), plus the
//! ordered [`ProblemFillerChain`] that builds and refreshes it. Every bound,
//! coefficient and objective coefficient written through the wrapper is first
//! passed through [`round_double`], so that tiny floating-point differences
//! between iterations do not reach the solver.
//!
//! ```text
//! fill(flows, sensitivities)            → every filler adds its variables
//! solve()                               → backend (Clarabel / HiGHS)
//! update(flows, sensitivities, setpoints) → fillers refresh bounds/coefficients
//! ```
//!
//! The problem always minimises its objective.

mod backend;
pub mod keys;

pub use backend::{backend_for, ClarabelBackend, LinearSolverBackend, LpSolverKind, SolveOutcome};
#[cfg(feature = "solver-highs")]
pub use backend::HighsBackend;
#[cfg(feature = "solver-microlp")]
pub use backend::MicrolpBackend;

use crate::fillers::ProblemFillerChain;
use crate::result::{FlowResult, LinearProblemStatus, RangeActionActivation, SensitivityResult};
use rao_core::{RaoError, RaoResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Once;

/// Rounds `value` to `bits` bits after the binary point.
///
/// Computes `value − t + t` with `t = value · 2^bits`: adding and removing a
/// large number drops the low-order bits of the mantissa.
pub fn round_double(value: f64, bits: u32) -> f64 {
    if !value.is_finite() || value == 0.0 {
        return value;
    }
    let t = value * 2f64.powi(bits as i32);
    let rounded = value - t + t;
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

/// Handle to a variable of a [`LinearProblem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableHandle(usize);

/// Handle to a constraint of a [`LinearProblem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstraintHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Continuous,
    Integer,
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LpVariable {
    pub key: String,
    pub lb: f64,
    pub ub: f64,
    pub kind: VariableKind,
    pub objective: f64,
}

/// `lb ≤ Σ coefficient · variable ≤ ub`
#[derive(Debug, Clone, PartialEq)]
pub struct LpConstraint {
    pub key: String,
    pub lb: f64,
    pub ub: f64,
    /// Keyed by variable index.
    pub coefficients: BTreeMap<usize, f64>,
}

/// Solver-independent model handed to a [`LinearSolverBackend`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LpModel {
    pub variables: Vec<LpVariable>,
    pub constraints: Vec<LpConstraint>,
}

static RELAXATION_WARNING: Once = Once::new();

/// Linear problem with its fillers and solver.
pub struct LinearProblem {
    model: LpModel,
    variable_index: HashMap<String, usize>,
    constraint_index: HashMap<String, usize>,
    fillers: ProblemFillerChain,
    backend: Box<dyn LinearSolverBackend>,
    precision_bits: u32,
    status: LinearProblemStatus,
    solution: Vec<f64>,
    cnecs: BTreeSet<String>,
    range_actions: BTreeSet<String>,
}

impl LinearProblem {
    pub fn new(fillers: ProblemFillerChain, backend: Box<dyn LinearSolverBackend>, precision_bits: u32) -> Self {
        let problem = Self {
            model: LpModel::default(),
            variable_index: HashMap::new(),
            constraint_index: HashMap::new(),
            fillers,
            backend,
            precision_bits,
            status: LinearProblemStatus::NotSolved,
            solution: Vec::new(),
            cnecs: BTreeSet::new(),
            range_actions: BTreeSet::new(),
        };
        let relaxed = problem.relaxed_fillers();
        if !relaxed.is_empty() {
            RELAXATION_WARNING.call_once(|| {
                tracing::warn!(
                    "solver {} relaxes integer variables; {} will be solved as continuous",
                    problem.backend.name(),
                    relaxed.join(", ")
                );
            });
        }
        problem
    }

    /// Fillers whose integer variables the backend relaxes.
    pub fn relaxed_fillers(&self) -> Vec<&'static str> {
        if self.backend.supports_integrality() {
            return Vec::new();
        }
        self.fillers.integrality_dependent()
    }

    fn round(&self, value: f64) -> f64 {
        round_double(value, self.precision_bits)
    }

    fn push_variable(&mut self, key: &str, lb: f64, ub: f64, kind: VariableKind) -> RaoResult<VariableHandle> {
        if self.variable_index.contains_key(key) {
            return Err(RaoError::FillerConstruction(format!("variable '{}' already exists", key)));
        }
        let index = self.model.variables.len();
        self.model.variables.push(LpVariable {
            key: key.to_string(),
            lb: self.round(lb),
            ub: self.round(ub),
            kind,
            objective: 0.0,
        });
        self.variable_index.insert(key.to_string(), index);
        Ok(VariableHandle(index))
    }

    pub fn add_variable(&mut self, key: &str, lb: f64, ub: f64) -> RaoResult<VariableHandle> {
        self.push_variable(key, lb, ub, VariableKind::Continuous)
    }

    pub fn add_integer_variable(&mut self, key: &str, lb: f64, ub: f64) -> RaoResult<VariableHandle> {
        self.push_variable(key, lb, ub, VariableKind::Integer)
    }

    pub fn add_binary_variable(&mut self, key: &str) -> RaoResult<VariableHandle> {
        self.push_variable(key, 0.0, 1.0, VariableKind::Binary)
    }

    pub fn get_variable(&self, key: &str) -> Option<VariableHandle> {
        self.variable_index.get(key).copied().map(VariableHandle)
    }

    /// Like [`get_variable`](Self::get_variable), for variables another filler
    /// must have created.
    pub fn variable(&self, key: &str) -> RaoResult<VariableHandle> {
        self.get_variable(key)
            .ok_or_else(|| RaoError::FillerConstruction(format!("variable '{}' has not been created yet", key)))
    }

    pub fn set_variable_bounds(&mut self, variable: VariableHandle, lb: f64, ub: f64) {
        let (lb, ub) = (self.round(lb), self.round(ub));
        let entry = &mut self.model.variables[variable.0];
        entry.lb = lb;
        entry.ub = ub;
    }

    pub fn variable_bounds(&self, variable: VariableHandle) -> (f64, f64) {
        let entry = &self.model.variables[variable.0];
        (entry.lb, entry.ub)
    }

    pub fn add_constraint(&mut self, key: &str, lb: f64, ub: f64) -> RaoResult<ConstraintHandle> {
        if self.constraint_index.contains_key(key) {
            return Err(RaoError::FillerConstruction(format!("constraint '{}' already exists", key)));
        }
        let index = self.model.constraints.len();
        self.model.constraints.push(LpConstraint {
            key: key.to_string(),
            lb: self.round(lb),
            ub: self.round(ub),
            coefficients: BTreeMap::new(),
        });
        self.constraint_index.insert(key.to_string(), index);
        Ok(ConstraintHandle(index))
    }

    pub fn get_constraint(&self, key: &str) -> Option<ConstraintHandle> {
        self.constraint_index.get(key).copied().map(ConstraintHandle)
    }

    pub fn constraint(&self, key: &str) -> RaoResult<ConstraintHandle> {
        self.get_constraint(key)
            .ok_or_else(|| RaoError::FillerConstruction(format!("constraint '{}' has not been created yet", key)))
    }

    pub fn set_constraint_bounds(&mut self, constraint: ConstraintHandle, lb: f64, ub: f64) {
        let (lb, ub) = (self.round(lb), self.round(ub));
        let entry = &mut self.model.constraints[constraint.0];
        entry.lb = lb;
        entry.ub = ub;
    }

    pub fn constraint_bounds(&self, constraint: ConstraintHandle) -> (f64, f64) {
        let entry = &self.model.constraints[constraint.0];
        (entry.lb, entry.ub)
    }

    pub fn set_coefficient(&mut self, constraint: ConstraintHandle, variable: VariableHandle, coefficient: f64) {
        let coefficient = self.round(coefficient);
        self.model.constraints[constraint.0]
            .coefficients
            .insert(variable.0, coefficient);
    }

    pub fn coefficient(&self, constraint: ConstraintHandle, variable: VariableHandle) -> f64 {
        self.model.constraints[constraint.0]
            .coefficients
            .get(&variable.0)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn set_objective_coefficient(&mut self, variable: VariableHandle, coefficient: f64) {
        self.model.variables[variable.0].objective = self.round(coefficient);
    }

    pub fn objective_coefficient(&self, variable: VariableHandle) -> f64 {
        self.model.variables[variable.0].objective
    }

    /// Records a CNEC as represented in the problem.
    pub fn register_cnec(&mut self, cnec_id: &str) {
        self.cnecs.insert(cnec_id.to_string());
    }

    pub fn register_range_action(&mut self, range_action_id: &str) {
        self.range_actions.insert(range_action_id.to_string());
    }

    pub fn cnecs(&self) -> &BTreeSet<String> {
        &self.cnecs
    }

    pub fn range_actions(&self) -> &BTreeSet<String> {
        &self.range_actions
    }

    pub fn model(&self) -> &LpModel {
        &self.model
    }

    pub fn num_variables(&self) -> usize {
        self.model.variables.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.model.constraints.len()
    }

    /// Runs every filler's `fill`, in chain order.
    pub fn fill(&mut self, flows: &FlowResult, sensitivities: &SensitivityResult) -> RaoResult<()> {
        let fillers = std::mem::take(&mut self.fillers);
        let result = fillers.fill(self, flows, sensitivities);
        self.fillers = fillers;
        result
    }

    /// Runs every filler's `update`, in chain order.
    pub fn update(
        &mut self,
        flows: &FlowResult,
        sensitivities: &SensitivityResult,
        activation: &RangeActionActivation,
    ) -> RaoResult<()> {
        let fillers = std::mem::take(&mut self.fillers);
        let result = fillers.update(self, flows, sensitivities, activation);
        self.fillers = fillers;
        result
    }

    /// Refreshes what depends on rounded setpoints between two MIP solves.
    pub fn update_between_mip_iterations(&mut self, activation: &RangeActionActivation) -> RaoResult<()> {
        let fillers = std::mem::take(&mut self.fillers);
        let result = fillers.update_between_mip_iterations(self, activation);
        self.fillers = fillers;
        result
    }

    pub fn solve(&mut self) -> LinearProblemStatus {
        tracing::debug!(
            "solving linear problem with {}: {} variable(s), {} constraint(s)",
            self.backend.name(),
            self.num_variables(),
            self.num_constraints()
        );
        let outcome = self.backend.solve(&self.model);
        self.status = outcome.status;
        self.solution = outcome.values;
        self.status
    }

    pub fn status(&self) -> LinearProblemStatus {
        self.status
    }

    /// Value of a variable in the last solution.
    pub fn value(&self, variable: VariableHandle) -> RaoResult<f64> {
        if !self.status.has_solution() {
            return Err(RaoError::ResultNotAvailable(format!(
                "linear problem has no solution (status {})",
                self.status
            )));
        }
        self.solution.get(variable.0).copied().ok_or_else(|| {
            RaoError::ResultNotAvailable(format!(
                "variable '{}' was added after the last solve",
                self.model.variables[variable.0].key
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_problem() -> LinearProblem {
        LinearProblem::new(ProblemFillerChain::default(), Box::new(ClarabelBackend), 30)
    }

    #[test]
    fn test_round_double() {
        assert_eq!(round_double(0.0, 30), 0.0);
        assert_eq!(round_double(1.5, 30), 1.5);
        assert!((round_double(0.1, 30) - 0.1).abs() < 1e-8);
        assert_eq!(round_double(f64::INFINITY, 30), f64::INFINITY);
        assert!(round_double(f64::NAN, 30).is_nan());
        let noisy = 1.0 + 1e-15;
        assert_eq!(round_double(noisy, 30), 1.0);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let mut problem = empty_problem();
        problem.add_variable("x", 0.0, 1.0).unwrap();
        assert!(matches!(problem.add_variable("x", 0.0, 2.0), Err(RaoError::FillerConstruction(_))));
        problem.add_constraint("c", 0.0, 1.0).unwrap();
        assert!(problem.add_constraint("c", 0.0, 1.0).is_err());
        assert!(problem.get_variable("y").is_none());
        assert!(problem.variable("y").is_err());
    }

    #[test]
    fn test_bounds_and_coefficients_are_rounded() {
        let mut problem = empty_problem();
        let x = problem.add_variable("x", 0.0, 1.0 + 1e-15).unwrap();
        assert_eq!(problem.variable_bounds(x), (0.0, 1.0));
        let c = problem.add_constraint("c", f64::NEG_INFINITY, 2.0).unwrap();
        problem.set_coefficient(c, x, 3.0 + 1e-14);
        assert_eq!(problem.coefficient(c, x), 3.0);
        assert_eq!(problem.constraint_bounds(c), (f64::NEG_INFINITY, 2.0));
    }

    #[test]
    fn test_solve_small_lp() {
        // min -x - y  s.t.  x + 2y ≤ 4, 0 ≤ x ≤ 3, 0 ≤ y ≤ 10
        let mut problem = empty_problem();
        let x = problem.add_variable("x", 0.0, 3.0).unwrap();
        let y = problem.add_variable("y", 0.0, 10.0).unwrap();
        let c = problem.add_constraint("c", f64::NEG_INFINITY, 4.0).unwrap();
        problem.set_coefficient(c, x, 1.0);
        problem.set_coefficient(c, y, 2.0);
        problem.set_objective_coefficient(x, -1.0);
        problem.set_objective_coefficient(y, -1.0);
        assert!(problem.value(x).is_err());

        assert_eq!(problem.solve(), LinearProblemStatus::Optimal);
        assert!((problem.value(x).unwrap() - 3.0).abs() < 1e-4);
        assert!((problem.value(y).unwrap() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_infeasible_lp() {
        let mut problem = empty_problem();
        let x = problem.add_variable("x", 0.0, 1.0).unwrap();
        let c = problem.add_constraint("c", 2.0, f64::INFINITY).unwrap();
        problem.set_coefficient(c, x, 1.0);
        assert!(!problem.solve().has_solution());
        assert!(problem.value(x).is_err());
    }
}
