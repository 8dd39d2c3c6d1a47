//! Solver backends.
//!
//! The keyed [`LpModel`] is rebuilt into a `good_lp` problem on every solve.
//! Clarabel is an interior-point LP/QP solver: integer and binary variables
//! are relaxed to their continuous bounds. HiGHS (`solver-highs`) and the
//! pure-Rust microlp (`solver-microlp`) honour integrality.

use super::{LpModel, VariableKind};
use crate::result::LinearProblemStatus;
use good_lp::solvers::clarabel::clarabel;
#[cfg(feature = "solver-highs")]
use good_lp::solvers::highs::highs;
#[cfg(feature = "solver-microlp")]
use good_lp::solvers::microlp::microlp;
use good_lp::{
    constraint, variable, variables, Expression, ProblemVariables, ResolutionError, Solution, SolverModel, Variable,
};
use rao_core::{RaoError, RaoResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Status and, when a solution exists, one value per model variable.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    pub status: LinearProblemStatus,
    pub values: Vec<f64>,
}

impl SolveOutcome {
    fn without_solution(status: LinearProblemStatus) -> Self {
        Self {
            status,
            values: Vec::new(),
        }
    }
}

/// A MILP solver the linear problem can delegate to.
pub trait LinearSolverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether integer and binary variables are kept integral.
    fn supports_integrality(&self) -> bool;

    fn solve(&self, model: &LpModel) -> SolveOutcome;
}

/// Available solver backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LpSolverKind {
    #[default]
    Clarabel,
    #[cfg(feature = "solver-highs")]
    Highs,
    #[cfg(feature = "solver-microlp")]
    Microlp,
}

const AVAILABLE_LP_SOLVERS: &[&str] = &[
    "clarabel",
    #[cfg(feature = "solver-highs")]
    "highs",
    #[cfg(feature = "solver-microlp")]
    "microlp",
];

impl LpSolverKind {
    pub fn available() -> &'static [&'static str] {
        AVAILABLE_LP_SOLVERS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LpSolverKind::Clarabel => "clarabel",
            #[cfg(feature = "solver-highs")]
            LpSolverKind::Highs => "highs",
            #[cfg(feature = "solver-microlp")]
            LpSolverKind::Microlp => "microlp",
        }
    }

    pub fn build_backend(&self) -> Box<dyn LinearSolverBackend> {
        match self {
            LpSolverKind::Clarabel => Box::new(ClarabelBackend),
            #[cfg(feature = "solver-highs")]
            LpSolverKind::Highs => Box::new(HighsBackend),
            #[cfg(feature = "solver-microlp")]
            LpSolverKind::Microlp => Box::new(MicrolpBackend),
        }
    }
}

impl FromStr for LpSolverKind {
    type Err = RaoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "clarabel" => Ok(LpSolverKind::Clarabel),
            #[cfg(feature = "solver-highs")]
            "highs" => Ok(LpSolverKind::Highs),
            #[cfg(feature = "solver-microlp")]
            "microlp" => Ok(LpSolverKind::Microlp),
            other => Err(RaoError::Config(format!(
                "unknown lp solver '{}'; supported values: {}",
                other,
                LpSolverKind::available().join(", ")
            ))),
        }
    }
}

/// Clarabel on the continuous relaxation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClarabelBackend;

impl LinearSolverBackend for ClarabelBackend {
    fn name(&self) -> &'static str {
        "clarabel"
    }

    fn supports_integrality(&self) -> bool {
        false
    }

    fn solve(&self, model: &LpModel) -> SolveOutcome {
        if let Some(outcome) = precheck(model) {
            return outcome;
        }
        let (vars, handles, objective) = declare_variables(model, false);
        let problem = vars.minimise(objective).using(clarabel);
        finish(add_model_constraints(problem, model, &handles), &handles)
    }
}

/// HiGHS with integrality.
#[cfg(feature = "solver-highs")]
#[derive(Debug, Clone, Copy, Default)]
pub struct HighsBackend;

#[cfg(feature = "solver-highs")]
impl LinearSolverBackend for HighsBackend {
    fn name(&self) -> &'static str {
        "highs"
    }

    fn supports_integrality(&self) -> bool {
        true
    }

    fn solve(&self, model: &LpModel) -> SolveOutcome {
        if let Some(outcome) = precheck(model) {
            return outcome;
        }
        let (vars, handles, objective) = declare_variables(model, true);
        let problem = vars.minimise(objective).using(highs);
        finish(add_model_constraints(problem, model, &handles), &handles)
    }
}

/// microlp, simplex with branch and bound, with integrality.
#[cfg(feature = "solver-microlp")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MicrolpBackend;

#[cfg(feature = "solver-microlp")]
impl LinearSolverBackend for MicrolpBackend {
    fn name(&self) -> &'static str {
        "microlp"
    }

    fn supports_integrality(&self) -> bool {
        true
    }

    fn solve(&self, model: &LpModel) -> SolveOutcome {
        if let Some(outcome) = precheck(model) {
            return outcome;
        }
        let (vars, handles, objective) = declare_variables(model, true);
        let problem = vars.minimise(objective).using(microlp);
        finish(add_model_constraints(problem, model, &handles), &handles)
    }
}

fn declare_variables(model: &LpModel, integrality: bool) -> (ProblemVariables, Vec<Variable>, Expression) {
    let mut vars = variables!();
    let mut handles = Vec::with_capacity(model.variables.len());
    let mut objective = Expression::from(0.0);
    for lp_variable in &model.variables {
        let mut definition = variable();
        if lp_variable.lb.is_finite() {
            definition = definition.min(lp_variable.lb);
        }
        if lp_variable.ub.is_finite() {
            definition = definition.max(lp_variable.ub);
        }
        if integrality && lp_variable.kind != VariableKind::Continuous {
            definition = definition.integer();
        }
        let handle = vars.add(definition);
        if lp_variable.objective != 0.0 {
            objective += lp_variable.objective * handle;
        }
        handles.push(handle);
    }
    (vars, handles, objective)
}

fn add_model_constraints<M>(mut problem: M, model: &LpModel, handles: &[Variable]) -> M
where
    M: SolverModel,
{
    for lp_constraint in &model.constraints {
        let mut expression = Expression::from(0.0);
        let mut has_terms = false;
        for (index, coefficient) in &lp_constraint.coefficients {
            if *coefficient != 0.0 {
                expression += *coefficient * handles[*index];
                has_terms = true;
            }
        }
        if !has_terms {
            continue;
        }
        let (lb, ub) = (lp_constraint.lb, lp_constraint.ub);
        if lb.is_finite() && ub.is_finite() && lb == ub {
            problem = problem.with(constraint!(expression.clone() == lb));
            continue;
        }
        if lb.is_finite() {
            problem = problem.with(constraint!(expression.clone() >= lb));
        }
        if ub.is_finite() {
            problem = problem.with(constraint!(expression.clone() <= ub));
        }
    }
    problem
}

/// Answers models the solver does not need to see: empty ones, and those
/// with a constraint without any non-zero coefficient (`lb ≤ 0 ≤ ub`) that
/// does not hold.
fn precheck(model: &LpModel) -> Option<SolveOutcome> {
    let violated = model.constraints.iter().any(|c| {
        c.coefficients.values().all(|coefficient| *coefficient == 0.0) && (c.lb > 1e-9 || c.ub < -1e-9)
    });
    let empty_domain = model.variables.iter().any(|v| v.lb > v.ub);
    if violated || empty_domain {
        return Some(SolveOutcome::without_solution(LinearProblemStatus::Infeasible));
    }
    model.variables.is_empty().then(|| SolveOutcome::without_solution(LinearProblemStatus::Optimal))
}

fn finish<M>(problem: M, handles: &[Variable]) -> SolveOutcome
where
    M: SolverModel<Error = ResolutionError>,
{
    match problem.solve() {
        Ok(solution) => SolveOutcome {
            status: LinearProblemStatus::Optimal,
            values: handles.iter().map(|handle| solution.value(*handle)).collect(),
        },
        Err(ResolutionError::Infeasible) => SolveOutcome::without_solution(LinearProblemStatus::Infeasible),
        Err(ResolutionError::Unbounded) => SolveOutcome::without_solution(LinearProblemStatus::Unbounded),
        Err(err) => {
            tracing::warn!("solver failure: {}", err);
            SolveOutcome::without_solution(LinearProblemStatus::Abnormal)
        }
    }
}

/// Checks that a named backend is compiled in.
pub fn backend_for(name: &str) -> RaoResult<Box<dyn LinearSolverBackend>> {
    Ok(LpSolverKind::from_str(name)?.build_backend())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear_problem::LpVariable;

    #[test]
    fn test_solver_kind_round_trip() {
        assert_eq!(LpSolverKind::from_str("Clarabel").unwrap(), LpSolverKind::Clarabel);
        assert_eq!(LpSolverKind::Clarabel.as_str(), "clarabel");
        assert!(LpSolverKind::available().contains(&"clarabel"));
        assert!(matches!(LpSolverKind::from_str("gurobi"), Err(RaoError::Config(_))));
        assert_eq!(backend_for("clarabel").unwrap().name(), "clarabel");
        assert!(!ClarabelBackend.supports_integrality());
    }

    #[test]
    fn test_empty_domain_is_infeasible() {
        let model = LpModel {
            variables: vec![LpVariable {
                key: "x".into(),
                lb: 2.0,
                ub: 1.0,
                kind: VariableKind::Continuous,
                objective: 0.0,
            }],
            constraints: Vec::new(),
        };
        assert_eq!(ClarabelBackend.solve(&model).status, LinearProblemStatus::Infeasible);
    }
}
