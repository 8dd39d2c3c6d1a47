//! Critical network elements and contingencies (CNECs).
//!
//! A [`FlowCnec`] monitors the active flow on a branch at one [`State`]. It
//! carries one or more directional thresholds, each attached to a side of the
//! branch and expressed in MW or A. Margins are always computed against the
//! tightest bound:
//!
//! ```text
//! margin(flow) = min(upper_bound − flow, flow − lower_bound)
//! ```
//!
//! Flows are handled in MW everywhere in the engine; ampere values are derived
//! with the side's nominal voltage (`I[A] = P[MW] · 1000 / (V[kV] · √3)`).

use crate::error::{RaoError, RaoResult};
use crate::state::State;
use serde::{Deserialize, Serialize};

/// Physical unit of a flow value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Megawatt,
    Ampere,
}

/// Side of a branch a threshold or voltage refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    One,
    Two,
}

/// Directional flow limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchThreshold {
    pub side: Side,
    pub unit: Unit,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl BranchThreshold {
    /// Symmetric limit `[-limit, limit]`.
    pub fn symmetric(limit: f64, unit: Unit) -> Self {
        Self {
            side: Side::One,
            unit,
            min: Some(-limit),
            max: Some(limit),
        }
    }
}

/// A monitored branch flow at a given state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCnec {
    pub id: String,
    pub network_element_id: String,
    pub state: State,
    pub operator: Option<String>,
    pub thresholds: Vec<BranchThreshold>,
    /// Nominal voltage of side one and side two, in kV
    pub nominal_kv: [f64; 2],
    /// Subtracted from every threshold, in MW
    pub reliability_margin: f64,
    /// Whether the margin of this CNEC drives the objective
    pub optimized: bool,
    /// Whether this CNEC must not be degraded beyond an acceptable decrease (MNEC)
    pub monitored: bool,
    /// Maximum loop flow in MW, for CNECs subject to loop-flow limitation
    pub loop_flow_threshold: Option<f64>,
}

impl FlowCnec {
    pub fn new(id: impl Into<String>, network_element_id: impl Into<String>, state: State) -> Self {
        Self {
            id: id.into(),
            network_element_id: network_element_id.into(),
            state,
            operator: None,
            thresholds: Vec::new(),
            nominal_kv: [400.0, 400.0],
            reliability_margin: 0.0,
            optimized: true,
            monitored: false,
            loop_flow_threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: BranchThreshold) -> Self {
        self.thresholds.push(threshold);
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_nominal_kv(mut self, side_one: f64, side_two: f64) -> Self {
        self.nominal_kv = [side_one, side_two];
        self
    }

    pub fn with_reliability_margin(mut self, margin_mw: f64) -> Self {
        self.reliability_margin = margin_mw;
        self
    }

    /// Sets the optimized / monitored flags.
    pub fn with_roles(mut self, optimized: bool, monitored: bool) -> Self {
        self.optimized = optimized;
        self.monitored = monitored;
        self
    }

    pub fn with_loop_flow_threshold(mut self, threshold_mw: f64) -> Self {
        self.loop_flow_threshold = Some(threshold_mw);
        self
    }

    fn nominal_kv_on(&self, side: Side) -> f64 {
        match side {
            Side::One => self.nominal_kv[0],
            Side::Two => self.nominal_kv[1],
        }
    }

    /// Multiplier converting a flow value on `side` from `from` to `to`.
    pub fn unit_conversion_factor(&self, side: Side, from: Unit, to: Unit) -> f64 {
        let kv = self.nominal_kv_on(side);
        match (from, to) {
            (Unit::Megawatt, Unit::Ampere) => 1000.0 / (kv * 3f64.sqrt()),
            (Unit::Ampere, Unit::Megawatt) => kv * 3f64.sqrt() / 1000.0,
            _ => 1.0,
        }
    }

    fn to_megawatt(&self, threshold: &BranchThreshold, value: f64) -> f64 {
        value * self.unit_conversion_factor(threshold.side, threshold.unit, Unit::Megawatt)
    }

    /// Tightest upper bound in MW, reliability margin included.
    pub fn upper_bound_mw(&self) -> Option<f64> {
        self.thresholds
            .iter()
            .filter_map(|t| t.max.map(|max| self.to_megawatt(t, max)))
            .reduce(f64::min)
            .map(|bound| bound - self.reliability_margin)
    }

    /// Tightest lower bound in MW, reliability margin included.
    pub fn lower_bound_mw(&self) -> Option<f64> {
        self.thresholds
            .iter()
            .filter_map(|t| t.min.map(|min| self.to_megawatt(t, min)))
            .reduce(f64::max)
            .map(|bound| bound + self.reliability_margin)
    }

    pub fn upper_bound(&self, unit: Unit) -> Option<f64> {
        self.upper_bound_mw()
            .map(|b| b * self.unit_conversion_factor(Side::One, Unit::Megawatt, unit))
    }

    pub fn lower_bound(&self, unit: Unit) -> Option<f64> {
        self.lower_bound_mw()
            .map(|b| b * self.unit_conversion_factor(Side::One, Unit::Megawatt, unit))
    }

    /// Signed margin of a MW flow, expressed in `unit`. A CNEC without any
    /// bound has an unlimited margin, reported as `f64::MAX`.
    pub fn compute_margin(&self, flow_mw: f64, unit: Unit) -> f64 {
        let above = self.upper_bound_mw().map(|ub| ub - flow_mw);
        let below = self.lower_bound_mw().map(|lb| flow_mw - lb);
        let margin_mw = match (above, below) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return f64::MAX,
        };
        margin_mw * self.unit_conversion_factor(Side::One, Unit::Megawatt, unit)
    }

    /// Largest absolute bound in MW, used to size big-M constants.
    pub fn largest_threshold_mw(&self) -> f64 {
        let upper = self.upper_bound_mw().map(f64::abs).unwrap_or(0.0);
        let lower = self.lower_bound_mw().map(f64::abs).unwrap_or(0.0);
        upper.max(lower)
    }

    pub fn validate(&self) -> RaoResult<()> {
        if self.thresholds.is_empty() {
            return Err(RaoError::Validation(format!(
                "CNEC '{}' has no threshold",
                self.id
            )));
        }
        if self.nominal_kv.iter().any(|kv| *kv <= 0.0) {
            return Err(RaoError::Validation(format!(
                "CNEC '{}' has a non-positive nominal voltage",
                self.id
            )));
        }
        Ok(())
    }
}
