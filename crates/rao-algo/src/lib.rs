//! # rao-algo: Search-tree remedial action optimisation
//!
//! Finds the set of network actions (topology changes) and range action
//! setpoints (PSTs, HVDC lines, injections) that maximises the minimum
//! margin over the CNECs of one [`OptimizationPerimeter`](rao_core::OptimizationPerimeter).
//!
//! ## Architecture
//!
//! - **[`SearchTree`]**: explores network action combinations depth by depth,
//!   optimising one [`Leaf`] per candidate on a rayon pool
//! - **[`SearchTreeBloomer`]**: generates and filters the candidates of a depth
//! - **[`IteratingLinearOptimizer`]**: optimises the range actions of a leaf by
//!   solving successive linearisations around the current setpoints
//! - **[`fillers`]**: pluggable contributions to the [`LinearProblem`]
//!   (margins, MNECs, loop flows, discrete taps, usage limits)
//! - **[`SensitivityComputer`]**: the physics seam; flows and sensitivities for
//!   a network and a set of setpoints
//!
//! ## Solvers
//!
//! Linear problems go through `good_lp`. Clarabel is the default backend and
//! solves the continuous relaxation. Discrete taps, usage limits, unoptimised
//! CNECs and the relative margin need integrality: enable `solver-highs` or
//! `solver-microlp` and select that solver. A chain with such fillers on a
//! relaxing backend is reported with a warning.
//!
//! ## Example
//!
//! ```ignore
//! use rao_algo::{RaoParameters, SearchTree, SearchTreeInput};
//!
//! let parameters = RaoParameters::from_toml_str(&std::fs::read_to_string("rao.toml")?)?;
//! let result = SearchTree::new(input, parameters)?.run()?;
//! println!("cost {:.2}", result.cost());
//! ```

pub mod best_tap;
pub mod bloomer;
pub mod fillers;
pub mod iterating_optimizer;
pub mod leaf;
pub mod linear_problem;
pub mod logging;
pub mod network_pool;
pub mod objective;
pub mod parameters;
pub mod result;
pub mod search_tree;
pub mod sensitivity;
pub mod test_utils;
pub mod usage_limits;

pub use best_tap::BestTapFinder;
pub use bloomer::{Candidate, SearchTreeBloomer};
pub use fillers::{FillerContext, ProblemFiller, ProblemFillerChain};
pub use iterating_optimizer::{IteratingLinearOptimizer, IteratingLinearOptimizerInput};
pub use leaf::{Leaf, LeafResult, LeafStatus};
pub use linear_problem::LinearProblem;
pub use logging::{init_tracing, try_init_tracing};
pub use network_pool::{NetworkLease, NetworkPool};
pub use objective::{ObjectiveFunction, LOOP_FLOW_COST, MNEC_VIOLATION_COST};
pub use parameters::{
    ObjectiveFunctionKind, ObjectiveFunctionParameters, RaUsageLimits, RangeActionsParameters, RaoParameters,
    StopCriterion, TopologyParameters,
};
pub use result::{
    EvaluationResult, FlowResult, LinearOptimizationResult, LinearProblemStatus, ObjectiveFunctionResult,
    OptimizedResult, PhysicsResult, RangeActionActivation, SensitivityResult,
};
pub use search_tree::{PrePerimeterResult, SearchTree, SearchTreeInput, SearchTreeResult};
pub use sensitivity::{LinearSensitivityComputer, SensitivityComputer};
