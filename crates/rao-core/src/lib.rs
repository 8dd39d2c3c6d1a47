//! # rao-core: Domain model for remedial action optimisation
//!
//! Data structures consumed by the search-tree optimiser in `rao-algo`:
//!
//! - [`Network`]: petgraph grid snapshot that remedial actions mutate
//! - [`State`] / [`Instant`]: when a constraint or an action applies
//! - [`FlowCnec`]: monitored branch flows with directional thresholds
//! - [`NetworkAction`] / [`NetworkActionCombination`]: discrete actions
//! - [`RangeAction`]: PST, HVDC and injection actuators
//! - [`OptimizationPerimeter`]: the read-only scope of one optimisation
//!
//! Everything here is built by the caller from already validated data and is
//! immutable during an optimisation, apart from [`Network`] clones owned by
//! search-tree leaves.
//!
//! ## Modules
//!
//! - [`graph`] - Hop-distance queries used to skip actions far from constraints
//! - [`error`] - [`RaoError`] and [`RaoResult`]

pub mod cnec;
pub mod error;
pub mod graph;
pub mod network;
pub mod network_action;
pub mod perimeter;
pub mod range_action;
pub mod state;

pub use cnec::{BranchThreshold, FlowCnec, Side, Unit};
pub use error::{RaoError, RaoResult};
pub use network::{Branch, BranchKind, Bus, Network};
pub use network_action::{ActionType, ElementaryAction, NetworkAction, NetworkActionCombination};
pub use perimeter::{OptimizationPerimeter, OptimizationPerimeterBuilder};
pub use petgraph::graph::NodeIndex;
pub use range_action::{PstModel, RangeAction, RangeActionKind, RangeType, StandardRange, TapRange};
pub use state::{Instant, InstantKind, State};
