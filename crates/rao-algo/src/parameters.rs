//! Parameters of a search-tree optimisation.
//!
//! [`RaoParameters`] groups every tunable of the engine into sections. Each
//! section is `#[serde(default)]`, so partial TOML or JSON files are accepted
//! and unspecified values fall back to the defaults below:
//!
//! ```toml
//! [objective_function]
//! kind = "max_min_margin"
//! unit = "megawatt"
//!
//! [range_actions]
//! max_iterations = 10
//! pst_penalty_cost = 0.01
//!
//! [topology]
//! max_search_tree_depth = 3
//! absolute_min_impact_threshold = 1.0
//!
//! [ra_usage_limits_per_instant.preventive]
//! max_ra = 5
//! max_tso = 2
//! ```
//!
//! Optional sections (`loop_flow`, `mnec`, `unoptimized_cnecs`) switch the
//! corresponding linear-problem fillers and virtual costs on when present.

use crate::linear_problem::LpSolverKind;
use rao_core::{RaoError, RaoResult, Unit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// What the functional cost measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveFunctionKind {
    /// Maximise the worst margin
    #[default]
    MaxMinMargin,
    /// Maximise the worst margin, positive margins divided by the PTDF zonal sum
    MaxMinRelativeMargin,
}

/// When the search tree may stop before exhausting its depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopCriterion {
    /// Keep searching while the cost improves
    #[default]
    MinObjective,
    /// Stop once the cost is below `target_objective_value`
    AtTargetObjectiveValue,
}

/// How PST taps are represented in the linear problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PstModel {
    /// Continuous angle, rounded afterwards by the best-tap finder
    #[default]
    Continuous,
    /// Integer tap variations linked to the angle by calibrated factors
    ApproximatedIntegers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveFunctionParameters {
    pub kind: ObjectiveFunctionKind,
    /// Unit margins and costs are expressed in.
    pub unit: Unit,
    pub stop_criterion: StopCriterion,
    /// Only read with [`StopCriterion::AtTargetObjectiveValue`].
    pub target_objective_value: f64,
    /// Floor applied to PTDF zonal sums in relative margins.
    pub ptdf_sum_lower_bound: f64,
}

impl Default for ObjectiveFunctionParameters {
    fn default() -> Self {
        Self {
            kind: ObjectiveFunctionKind::MaxMinMargin,
            unit: Unit::Megawatt,
            stop_criterion: StopCriterion::MinObjective,
            target_objective_value: 0.0,
            ptdf_sum_lower_bound: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeActionsParameters {
    /// Maximum number of solves per leaf.
    pub max_iterations: usize,
    /// Cost per degree of PST variation.
    pub pst_penalty_cost: f64,
    /// Cost per MW of HVDC variation.
    pub hvdc_penalty_cost: f64,
    /// Cost per MW of injection variation.
    pub injection_penalty_cost: f64,
    /// Sensitivities below these values are left out of the flow constraints.
    pub pst_sensitivity_threshold: f64,
    pub hvdc_sensitivity_threshold: f64,
    pub injection_sensitivity_threshold: f64,
    pub pst_model: PstModel,
    /// Shrink setpoint ranges between iterations instead of stopping on the
    /// first non-improving one.
    pub ra_range_shrinking: bool,
    pub solver: LpSolverKind,
    /// Bits kept after the binary point by linear problem rounding.
    pub precision_bits: u32,
}

impl Default for RangeActionsParameters {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            pst_penalty_cost: 0.01,
            hvdc_penalty_cost: 0.001,
            injection_penalty_cost: 0.001,
            pst_sensitivity_threshold: 0.0,
            hvdc_sensitivity_threshold: 0.0,
            injection_sensitivity_threshold: 0.0,
            pst_model: PstModel::Continuous,
            ra_range_shrinking: false,
            solver: LpSolverKind::default(),
            precision_bits: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyParameters {
    pub max_search_tree_depth: usize,
    /// A child must beat the previous depth's cost by this share of it.
    pub relative_min_impact_threshold: f64,
    /// A child must beat the previous depth's cost by this amount.
    pub absolute_min_impact_threshold: f64,
    pub skip_actions_far_from_most_limiting_element: bool,
    /// Hop distance beyond which an action is considered far.
    pub max_number_of_boundaries_for_skipping_actions: usize,
    /// User-defined combinations, as lists of network action ids.
    pub predefined_combinations: Vec<Vec<String>>,
}

impl Default for TopologyParameters {
    fn default() -> Self {
        Self {
            max_search_tree_depth: 2_147_483_647,
            relative_min_impact_threshold: 0.0,
            absolute_min_impact_threshold: 0.0,
            skip_actions_far_from_most_limiting_element: false,
            max_number_of_boundaries_for_skipping_actions: 2,
            predefined_combinations: Vec::new(),
        }
    }
}

/// Remedial action usage limits of one instant. Missing values mean no limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaUsageLimits {
    pub max_ra: Option<usize>,
    pub max_tso: Option<usize>,
    pub max_topo_per_tso: BTreeMap<String, usize>,
    pub max_pst_per_tso: BTreeMap<String, usize>,
    pub max_ra_per_tso: BTreeMap<String, usize>,
    pub max_elementary_actions_per_tso: BTreeMap<String, usize>,
}

/// Range action budget of one state, after deduction of what network actions
/// already consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeActionLimits {
    pub max_ra: Option<usize>,
    pub max_tso: Option<usize>,
    /// Operators already counted in `max_tso`.
    pub excluded_tsos: BTreeSet<String>,
    pub max_ra_per_tso: BTreeMap<String, usize>,
    pub max_pst_per_tso: BTreeMap<String, usize>,
    pub max_elementary_actions_per_tso: BTreeMap<String, usize>,
}

impl RangeActionLimits {
    pub fn is_unlimited(&self) -> bool {
        self.max_ra.is_none()
            && self.max_tso.is_none()
            && self.max_ra_per_tso.is_empty()
            && self.max_pst_per_tso.is_empty()
            && self.max_elementary_actions_per_tso.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultithreadingParameters {
    /// Leaves optimised concurrently within a depth (0 = one per CPU).
    pub leaves_in_parallel: usize,
}

impl Default for MultithreadingParameters {
    fn default() -> Self {
        Self {
            leaves_in_parallel: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopFlowParameters {
    /// Loop flow increase tolerated above the initial loop flow, in MW.
    pub acceptable_increase: f64,
    /// Cost per MW of loop flow above the threshold.
    pub violation_cost: f64,
    /// Tightening applied to the threshold in the linear problem, in MW.
    pub constraint_adjustment_coefficient: f64,
}

impl Default for LoopFlowParameters {
    fn default() -> Self {
        Self {
            acceptable_increase: 0.0,
            violation_cost: 10.0,
            constraint_adjustment_coefficient: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MnecParameters {
    /// Margin decrease tolerated on monitored elements, in MW.
    pub acceptable_margin_decrease: f64,
    /// Cost per MW of margin decrease beyond the tolerated one.
    pub violation_cost: f64,
    pub constraint_adjustment_coefficient: f64,
}

impl Default for MnecParameters {
    fn default() -> Self {
        Self {
            acceptable_margin_decrease: 50.0,
            violation_cost: 10.0,
            constraint_adjustment_coefficient: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnoptimizedCnecParameters {
    /// Operators whose CNECs only count when their margin decreases.
    pub operators_not_to_optimize: BTreeSet<String>,
}

/// Thresholds of the best-tap heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapRoundingParameters {
    /// Distance to the midpoint of two taps, as a share of their angle gap,
    /// under which both taps are compared.
    pub ambiguity_threshold: f64,
    /// Relative margin gain the farther tap must bring to be kept.
    pub improvement_threshold: f64,
    /// Number of most limiting CNECs margins are computed on.
    pub most_limiting_elements: usize,
}

impl Default for TapRoundingParameters {
    fn default() -> Self {
        Self {
            ambiguity_threshold: 0.15,
            improvement_threshold: 0.10,
            most_limiting_elements: 10,
        }
    }
}

/// Full parameter set of a search-tree run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaoParameters {
    pub objective_function: ObjectiveFunctionParameters,
    pub range_actions: RangeActionsParameters,
    pub topology: TopologyParameters,
    /// Keyed by instant id.
    pub ra_usage_limits_per_instant: BTreeMap<String, RaUsageLimits>,
    pub multithreading: MultithreadingParameters,
    pub tap_rounding: TapRoundingParameters,
    pub loop_flow: Option<LoopFlowParameters>,
    pub mnec: Option<MnecParameters>,
    pub unoptimized_cnecs: Option<UnoptimizedCnecParameters>,
    /// Upper bound on the time one depth may take, in seconds.
    pub depth_timeout_secs: u64,
}

impl Default for RaoParameters {
    fn default() -> Self {
        Self {
            objective_function: ObjectiveFunctionParameters::default(),
            range_actions: RangeActionsParameters::default(),
            topology: TopologyParameters::default(),
            ra_usage_limits_per_instant: BTreeMap::new(),
            multithreading: MultithreadingParameters::default(),
            tap_rounding: TapRoundingParameters::default(),
            loop_flow: None,
            mnec: None,
            unoptimized_cnecs: None,
            depth_timeout_secs: 24 * 3600,
        }
    }
}

impl RaoParameters {
    pub fn from_toml_str(contents: &str) -> RaoResult<Self> {
        let parameters: Self = toml::from_str(contents)?;
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn from_json_str(contents: &str) -> RaoResult<Self> {
        let parameters: Self = serde_json::from_str(contents)?;
        parameters.validate()?;
        Ok(parameters)
    }

    /// Loads a parameter file; `.json` files are read as JSON, anything else
    /// as TOML.
    pub fn load(path: &Path) -> RaoResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_toml_str(&contents),
        }
    }

    pub fn to_toml_string(&self) -> RaoResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_toml(&self, path: &Path) -> RaoResult<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn depth_timeout(&self) -> Duration {
        Duration::from_secs(self.depth_timeout_secs)
    }

    /// Usage limits of an instant, if any were configured.
    pub fn ra_usage_limits(&self, instant_id: &str) -> Option<&RaUsageLimits> {
        self.ra_usage_limits_per_instant.get(instant_id)
    }

    pub fn validate(&self) -> RaoResult<()> {
        let range_actions = &self.range_actions;
        if range_actions.max_iterations == 0 {
            return Err(RaoError::Config("range_actions.max_iterations must be at least 1".into()));
        }
        let non_negative = [
            ("range_actions.pst_penalty_cost", range_actions.pst_penalty_cost),
            ("range_actions.hvdc_penalty_cost", range_actions.hvdc_penalty_cost),
            ("range_actions.injection_penalty_cost", range_actions.injection_penalty_cost),
            ("range_actions.pst_sensitivity_threshold", range_actions.pst_sensitivity_threshold),
            ("range_actions.hvdc_sensitivity_threshold", range_actions.hvdc_sensitivity_threshold),
            (
                "range_actions.injection_sensitivity_threshold",
                range_actions.injection_sensitivity_threshold,
            ),
            (
                "topology.relative_min_impact_threshold",
                self.topology.relative_min_impact_threshold,
            ),
            (
                "topology.absolute_min_impact_threshold",
                self.topology.absolute_min_impact_threshold,
            ),
            ("tap_rounding.ambiguity_threshold", self.tap_rounding.ambiguity_threshold),
            ("tap_rounding.improvement_threshold", self.tap_rounding.improvement_threshold),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) {
                return Err(RaoError::Config(format!("{} must be non-negative, got {}", name, value)));
            }
        }
        if !(self.objective_function.ptdf_sum_lower_bound > 0.0) {
            return Err(RaoError::Config(
                "objective_function.ptdf_sum_lower_bound must be positive".into(),
            ));
        }
        if range_actions.precision_bits > 52 {
            return Err(RaoError::Config(format!(
                "range_actions.precision_bits must not exceed 52, got {}",
                range_actions.precision_bits
            )));
        }
        if self.depth_timeout_secs == 0 {
            return Err(RaoError::Config("depth_timeout_secs must be positive".into()));
        }
        for (instant, limits) in &self.ra_usage_limits_per_instant {
            if let Some(max_ra) = limits.max_ra {
                for (tso, per_tso) in limits.max_ra_per_tso.iter().chain(&limits.max_topo_per_tso) {
                    if *per_tso > max_ra {
                        tracing::debug!(
                            "instant {}: per-TSO limit {} of {} exceeds max_ra {}",
                            instant,
                            per_tso,
                            tso,
                            max_ra
                        );
                    }
                }
            }
            for (tso, max_pst) in &limits.max_pst_per_tso {
                if let Some(max_ra) = limits.max_ra_per_tso.get(tso) {
                    if max_pst > max_ra {
                        return Err(RaoError::Config(format!(
                            "instant {}: max_pst_per_tso of {} ({}) exceeds its max_ra_per_tso ({})",
                            instant, tso, max_pst, max_ra
                        )));
                    }
                }
            }
        }
        if let Some(loop_flow) = &self.loop_flow {
            if loop_flow.violation_cost < 0.0 || loop_flow.acceptable_increase < 0.0 {
                return Err(RaoError::Config("loop_flow costs and increases must be non-negative".into()));
            }
        }
        if let Some(mnec) = &self.mnec {
            if mnec.violation_cost < 0.0 || mnec.acceptable_margin_decrease < 0.0 {
                return Err(RaoError::Config("mnec costs and decreases must be non-negative".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters() {
        let parameters = RaoParameters::default();
        assert_eq!(parameters.range_actions.max_iterations, 10);
        assert_eq!(parameters.range_actions.precision_bits, 30);
        assert_eq!(parameters.tap_rounding.ambiguity_threshold, 0.15);
        assert_eq!(parameters.tap_rounding.improvement_threshold, 0.10);
        assert_eq!(parameters.tap_rounding.most_limiting_elements, 10);
        assert_eq!(parameters.depth_timeout(), Duration::from_secs(86_400));
        assert!(parameters.loop_flow.is_none());
        assert!(parameters.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            depth_timeout_secs = 60

            [objective_function]
            kind = "max_min_relative_margin"
            unit = "ampere"

            [topology]
            max_search_tree_depth = 3

            [ra_usage_limits_per_instant.preventive]
            max_ra = 2
            max_ra_per_tso = { FR = 1 }

            [mnec]
            acceptable_margin_decrease = 20.0
        "#;
        let parameters = RaoParameters::from_toml_str(toml).unwrap();
        assert_eq!(parameters.objective_function.kind, ObjectiveFunctionKind::MaxMinRelativeMargin);
        assert_eq!(parameters.objective_function.unit, Unit::Ampere);
        assert_eq!(parameters.topology.max_search_tree_depth, 3);
        assert_eq!(parameters.range_actions.max_iterations, 10);
        let limits = parameters.ra_usage_limits("preventive").unwrap();
        assert_eq!(limits.max_ra, Some(2));
        assert_eq!(limits.max_ra_per_tso.get("FR"), Some(&1));
        let mnec = parameters.mnec.unwrap();
        assert_eq!(mnec.acceptable_margin_decrease, 20.0);
        assert_eq!(mnec.violation_cost, 10.0);
    }

    #[test]
    fn test_json_parsing() {
        let json = r#"{ "range_actions": { "max_iterations": 3, "pst_model": "approximated_integers" } }"#;
        let parameters = RaoParameters::from_json_str(json).unwrap();
        assert_eq!(parameters.range_actions.max_iterations, 3);
        assert_eq!(parameters.range_actions.pst_model, PstModel::ApproximatedIntegers);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut parameters = RaoParameters::default();
        parameters.range_actions.max_iterations = 0;
        assert!(matches!(parameters.validate(), Err(RaoError::Config(_))));

        let mut parameters = RaoParameters::default();
        parameters.topology.absolute_min_impact_threshold = -1.0;
        assert!(parameters.validate().is_err());

        let mut parameters = RaoParameters::default();
        parameters.range_actions.pst_penalty_cost = f64::NAN;
        assert!(parameters.validate().is_err());

        let mut limits = RaUsageLimits::default();
        limits.max_ra_per_tso.insert("FR".into(), 1);
        limits.max_pst_per_tso.insert("FR".into(), 2);
        let mut parameters = RaoParameters::default();
        parameters.ra_usage_limits_per_instant.insert("preventive".into(), limits);
        assert!(parameters.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let result = RaoParameters::from_toml_str("[range_actions\nmax_iterations = 2");
        assert!(matches!(result, Err(RaoError::Parse(_))));
    }
}
