//! Continuous and stepped remedial actions.
//!
//! A range action drives one network element over a setpoint interval:
//!
//! - **PST**: the setpoint is an angle in degrees, realised through a discrete
//!   tap. The tap ↔ angle table is monotone but not necessarily linear.
//! - **HVDC**: the setpoint is the active power of the link, in MW.
//! - **Injection**: the setpoint is a generator/load active power, in MW.
//!
//! Admissible setpoints are the intersection of all ranges of the action.
//! Ranges can be absolute, relative to the initial network, or relative to the
//! setpoint reached at the previous instant.
//!
//! Range actions sharing a `group_id` are physically linked and must always
//! be set to the same value.

use crate::error::{RaoError, RaoResult};
use crate::network::Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference a range is expressed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeType {
    Absolute,
    RelativeToInitialNetwork,
    RelativeToPreviousInstant,
}

/// Tap interval of a PST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapRange {
    pub min_tap: i32,
    pub max_tap: i32,
    pub range_type: RangeType,
}

/// Setpoint interval of an HVDC or injection range action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardRange {
    pub min: f64,
    pub max: f64,
    pub range_type: RangeType,
}

/// Phase-shifter data: tap table, initial tap and tap ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PstModel {
    tap_to_angle: BTreeMap<i32, f64>,
    pub initial_tap: i32,
    pub ranges: Vec<TapRange>,
}

impl PstModel {
    pub fn new(tap_to_angle: BTreeMap<i32, f64>, initial_tap: i32) -> RaoResult<Self> {
        if tap_to_angle.is_empty() {
            return Err(RaoError::Validation("PST tap table is empty".into()));
        }
        if !tap_to_angle.contains_key(&initial_tap) {
            return Err(RaoError::Validation(format!(
                "initial tap {} is not in the PST tap table",
                initial_tap
            )));
        }
        Ok(Self {
            tap_to_angle,
            initial_tap,
            ranges: Vec::new(),
        })
    }

    /// Table with evenly spaced angles from `min_tap` to `max_tap`.
    pub fn linear(min_tap: i32, max_tap: i32, min_angle: f64, max_angle: f64, initial_tap: i32) -> RaoResult<Self> {
        if max_tap <= min_tap {
            return Err(RaoError::Validation(format!(
                "invalid tap interval [{}, {}]",
                min_tap, max_tap
            )));
        }
        let step = (max_angle - min_angle) / f64::from(max_tap - min_tap);
        let table = (min_tap..=max_tap)
            .map(|tap| (tap, min_angle + step * f64::from(tap - min_tap)))
            .collect();
        Self::new(table, initial_tap)
    }

    pub fn with_range(mut self, range: TapRange) -> Self {
        self.ranges.push(range);
        self
    }

    pub fn tap_to_angle(&self) -> &BTreeMap<i32, f64> {
        &self.tap_to_angle
    }

    pub fn min_tap(&self) -> i32 {
        self.tap_to_angle.keys().next().copied().unwrap_or(self.initial_tap)
    }

    pub fn max_tap(&self) -> i32 {
        self.tap_to_angle.keys().next_back().copied().unwrap_or(self.initial_tap)
    }

    pub fn convert_tap_to_angle(&self, tap: i32) -> RaoResult<f64> {
        self.tap_to_angle
            .get(&tap)
            .copied()
            .ok_or_else(|| RaoError::Validation(format!("tap {} is outside the PST tap table", tap)))
    }

    /// Tap whose angle is closest to `angle`. Equidistant taps resolve to the
    /// lowest one.
    pub fn convert_angle_to_tap(&self, angle: f64) -> i32 {
        self.tap_to_angle
            .iter()
            .min_by(|(_, a), (_, b)| (angle - **a).abs().total_cmp(&(angle - **b).abs()))
            .map(|(tap, _)| *tap)
            .unwrap_or(self.initial_tap)
    }

    /// Mean absolute angle step between consecutive taps.
    pub fn average_step(&self) -> f64 {
        let taps = f64::from(self.max_tap() - self.min_tap());
        if taps == 0.0 {
            return 0.0;
        }
        let min_angle = self.tap_to_angle.values().copied().fold(f64::INFINITY, f64::min);
        let max_angle = self.tap_to_angle.values().copied().fold(f64::NEG_INFINITY, f64::max);
        (max_angle - min_angle).abs() / taps
    }

    /// Admissible tap interval given the tap reached at the previous instant.
    pub fn admissible_taps(&self, previous_tap: i32) -> (i32, i32) {
        let mut low = self.min_tap();
        let mut high = self.max_tap();
        for range in &self.ranges {
            let (range_low, range_high) = match range.range_type {
                RangeType::Absolute => (range.min_tap, range.max_tap),
                RangeType::RelativeToInitialNetwork => {
                    (self.initial_tap + range.min_tap, self.initial_tap + range.max_tap)
                }
                RangeType::RelativeToPreviousInstant => {
                    (previous_tap + range.min_tap, previous_tap + range.max_tap)
                }
            };
            low = low.max(range_low);
            high = high.min(range_high);
        }
        if low > high {
            // Contradictory ranges leave only the previous position.
            let stuck = previous_tap.clamp(self.min_tap(), self.max_tap());
            return (stuck, stuck);
        }
        (low, high)
    }
}

/// Element-specific part of a range action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RangeActionKind {
    Pst(PstModel),
    Hvdc {
        initial_setpoint: f64,
        ranges: Vec<StandardRange>,
    },
    Injection {
        initial_setpoint: f64,
        ranges: Vec<StandardRange>,
    },
}

/// A continuous or stepped remedial action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeAction {
    pub id: String,
    pub name: String,
    pub operator: Option<String>,
    pub group_id: Option<String>,
    pub network_element_id: String,
    pub kind: RangeActionKind,
}

impl RangeAction {
    pub fn pst(id: impl Into<String>, network_element_id: impl Into<String>, model: PstModel) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            operator: None,
            group_id: None,
            network_element_id: network_element_id.into(),
            kind: RangeActionKind::Pst(model),
        }
    }

    pub fn hvdc(
        id: impl Into<String>,
        network_element_id: impl Into<String>,
        initial_setpoint: f64,
        ranges: Vec<StandardRange>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            operator: None,
            group_id: None,
            network_element_id: network_element_id.into(),
            kind: RangeActionKind::Hvdc {
                initial_setpoint,
                ranges,
            },
        }
    }

    pub fn injection(
        id: impl Into<String>,
        network_element_id: impl Into<String>,
        initial_setpoint: f64,
        ranges: Vec<StandardRange>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            operator: None,
            group_id: None,
            network_element_id: network_element_id.into(),
            kind: RangeActionKind::Injection {
                initial_setpoint,
                ranges,
            },
        }
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn as_pst(&self) -> Option<&PstModel> {
        match &self.kind {
            RangeActionKind::Pst(model) => Some(model),
            _ => None,
        }
    }

    pub fn is_pst(&self) -> bool {
        self.as_pst().is_some()
    }

    pub fn is_hvdc(&self) -> bool {
        matches!(self.kind, RangeActionKind::Hvdc { .. })
    }

    pub fn initial_setpoint(&self) -> f64 {
        match &self.kind {
            RangeActionKind::Pst(model) => model
                .convert_tap_to_angle(model.initial_tap)
                .unwrap_or(0.0),
            RangeActionKind::Hvdc {
                initial_setpoint, ..
            }
            | RangeActionKind::Injection {
                initial_setpoint, ..
            } => *initial_setpoint,
        }
    }

    fn standard_bounds(initial: f64, ranges: &[StandardRange], previous: f64) -> (f64, f64) {
        let mut low = f64::NEG_INFINITY;
        let mut high = f64::INFINITY;
        for range in ranges {
            let reference = match range.range_type {
                RangeType::Absolute => 0.0,
                RangeType::RelativeToInitialNetwork => initial,
                RangeType::RelativeToPreviousInstant => previous,
            };
            low = low.max(reference + range.min);
            high = high.min(reference + range.max);
        }
        if low > high {
            return (previous, previous);
        }
        (low, high)
    }

    fn admissible_interval(&self, previous_setpoint: f64) -> (f64, f64) {
        match &self.kind {
            RangeActionKind::Pst(model) => {
                let previous_tap = model.convert_angle_to_tap(previous_setpoint);
                let (low_tap, high_tap) = model.admissible_taps(previous_tap);
                let low = model.convert_tap_to_angle(low_tap).unwrap_or(previous_setpoint);
                let high = model.convert_tap_to_angle(high_tap).unwrap_or(previous_setpoint);
                (low.min(high), low.max(high))
            }
            RangeActionKind::Hvdc {
                initial_setpoint,
                ranges,
            }
            | RangeActionKind::Injection {
                initial_setpoint,
                ranges,
            } => Self::standard_bounds(*initial_setpoint, ranges, previous_setpoint),
        }
    }

    /// Lowest reachable setpoint, given the setpoint at the previous instant.
    pub fn min_admissible_setpoint(&self, previous_setpoint: f64) -> f64 {
        self.admissible_interval(previous_setpoint).0
    }

    /// Highest reachable setpoint, given the setpoint at the previous instant.
    pub fn max_admissible_setpoint(&self, previous_setpoint: f64) -> f64 {
        self.admissible_interval(previous_setpoint).1
    }

    pub fn current_setpoint(&self, network: &Network) -> RaoResult<f64> {
        match &self.kind {
            RangeActionKind::Pst(model) => {
                let tap = network.pst_tap(&self.network_element_id)?;
                model.convert_tap_to_angle(tap)
            }
            RangeActionKind::Hvdc { .. } => network.hvdc_setpoint(&self.network_element_id),
            RangeActionKind::Injection { .. } => network.injection_setpoint(&self.network_element_id),
        }
    }

    /// Current tap of a PST range action.
    pub fn current_tap(&self, network: &Network) -> RaoResult<i32> {
        match &self.kind {
            RangeActionKind::Pst(_) => network.pst_tap(&self.network_element_id),
            _ => Err(RaoError::Validation(format!(
                "range action '{}' has no tap",
                self.id
            ))),
        }
    }

    /// Writes a setpoint on the network. PST angles snap to the closest tap.
    pub fn apply(&self, network: &mut Network, setpoint: f64) -> RaoResult<()> {
        match &self.kind {
            RangeActionKind::Pst(model) => {
                network.set_pst_tap(&self.network_element_id, model.convert_angle_to_tap(setpoint))
            }
            RangeActionKind::Hvdc { .. } => network.set_hvdc_setpoint(&self.network_element_id, setpoint),
            RangeActionKind::Injection { .. } => {
                network.set_injection_setpoint(&self.network_element_id, setpoint)
            }
        }
    }
}
