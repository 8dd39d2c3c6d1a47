//! Rounding of continuous PST angles to taps.
//!
//! The linear problem treats PST angles as continuous. Rounding each angle
//! to the closest tap is usually right, but when the optimum lies close to
//! the midpoint between two taps the farther tap may protect the most
//! limiting CNECs better. [`BestTapFinder`] then compares both taps with a
//! first-order flow estimate:
//!
//! ```text
//! flow[c](angle) ≈ sens[c,r] · (angle − current setpoint[r]) + reference flow[c]
//! ```
//!
//! PSTs sharing a group id always end on one common tap.

use crate::parameters::TapRoundingParameters;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{FlowCnec, OptimizationPerimeter, PstModel, RangeAction, RaoResult, State, Unit};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Candidate taps of one PST, with the worst margin each one leads to.
/// A single unambiguous tap scores `f64::MAX`.
type TapMargins = BTreeMap<i32, f64>;

pub struct BestTapFinder<'a> {
    perimeter: &'a OptimizationPerimeter,
    flows: &'a FlowResult,
    sensitivities: &'a SensitivityResult,
    /// Setpoints `flows` were computed with.
    reference_setpoints: &'a RangeActionActivation,
    pre_perimeter_setpoints: &'a RangeActionActivation,
    most_limiting_cnecs: Vec<Arc<FlowCnec>>,
    parameters: &'a TapRoundingParameters,
}

impl<'a> BestTapFinder<'a> {
    /// `most_limiting` lists CNEC ids, most limiting first; only the first
    /// `parameters.most_limiting_elements` known to the perimeter are kept.
    pub fn new(
        perimeter: &'a OptimizationPerimeter,
        flows: &'a FlowResult,
        sensitivities: &'a SensitivityResult,
        reference_setpoints: &'a RangeActionActivation,
        pre_perimeter_setpoints: &'a RangeActionActivation,
        most_limiting: &[String],
        parameters: &'a TapRoundingParameters,
    ) -> Self {
        let most_limiting_cnecs = most_limiting
            .iter()
            .filter_map(|id| perimeter.flow_cnec(id).cloned())
            .take(parameters.most_limiting_elements)
            .collect();
        Self {
            perimeter,
            flows,
            sensitivities,
            reference_setpoints,
            pre_perimeter_setpoints,
            most_limiting_cnecs,
            parameters,
        }
    }

    /// Rounds every setpoint of `optimal`: PST angles to the angle of their
    /// best tap, other setpoints to the closest integer.
    pub fn round(&self, optimal: &RangeActionActivation) -> RaoResult<RangeActionActivation> {
        let mut rounded = RangeActionActivation::new(optimal.reference().clone());
        for (state, range_actions) in self.perimeter.range_actions_per_state() {
            let mut groups: BTreeMap<&str, Vec<&Arc<RangeAction>>> = BTreeMap::new();
            for range_action in range_actions {
                let angle = optimal.setpoint(&range_action.id, state)?;
                let Some(pst) = range_action.as_pst() else {
                    rounded.put(state, range_action.id.clone(), angle.round());
                    continue;
                };
                if let Some(group) = range_action.group_id.as_deref() {
                    groups.entry(group).or_default().push(range_action);
                    continue;
                }
                let margins = self.tap_margins(range_action, pst, state, angle)?;
                let tap = best_tap(&margins).unwrap_or_else(|| pst.convert_angle_to_tap(angle));
                rounded.put(state, range_action.id.clone(), pst.convert_tap_to_angle(tap)?);
            }

            for (group, members) in groups {
                let tap = self.group_tap(&members, state, optimal)?;
                tracing::debug!("group '{}' at {} set to tap {}", group, state.id(), tap);
                for member in members {
                    if let Some(pst) = member.as_pst() {
                        rounded.put(state, member.id.clone(), pst.convert_tap_to_angle(tap)?);
                    }
                }
            }
        }
        Ok(rounded)
    }

    fn admissible_taps(&self, range_action: &RangeAction, pst: &PstModel, state: &State) -> RaoResult<(i32, i32)> {
        let previous = self.pre_perimeter_setpoints.setpoint(&range_action.id, state)?;
        Ok(pst.admissible_taps(pst.convert_angle_to_tap(previous)))
    }

    /// Closest tap and, when it exists, the neighbouring tap on the same
    /// side as `angle`.
    fn neighbouring_taps(&self, pst: &PstModel, angle: f64, (min_tap, max_tap): (i32, i32)) -> RaoResult<(i32, Option<i32>)> {
        let closest = pst.convert_angle_to_tap(angle).clamp(min_tap, max_tap);
        let closest_angle = pst.convert_tap_to_angle(closest)?;
        let same_side = |tap: i32| -> RaoResult<bool> {
            let tap_angle = pst.convert_tap_to_angle(tap)?;
            Ok(sign(tap_angle - closest_angle) * sign(angle - closest_angle) > 0.0)
        };
        let can_go_up = closest < max_tap;
        let can_go_down = closest > min_tap;
        let other = match (can_go_up, can_go_down) {
            (true, true) => Some(if same_side(closest + 1)? { closest + 1 } else { closest - 1 }),
            (true, false) => same_side(closest + 1)?.then_some(closest + 1),
            (false, true) => same_side(closest - 1)?.then_some(closest - 1),
            (false, false) => None,
        };
        Ok((closest, other))
    }

    fn tap_margins(&self, range_action: &RangeAction, pst: &PstModel, state: &State, angle: f64) -> RaoResult<TapMargins> {
        let window = self.admissible_taps(range_action, pst, state)?;
        let (closest, other) = self.neighbouring_taps(pst, angle, window)?;
        let unambiguous = TapMargins::from([(closest, f64::MAX)]);
        let Some(other) = other else {
            return Ok(unambiguous);
        };

        let closest_angle = pst.convert_tap_to_angle(closest)?;
        let other_angle = pst.convert_tap_to_angle(other)?;
        let midpoint = 0.5 * (closest_angle + other_angle);
        if (angle - midpoint).abs() / (closest_angle - other_angle).abs() >= self.parameters.ambiguity_threshold {
            return Ok(unambiguous);
        }

        let closest_margin = self.min_margin(range_action, state, closest_angle)?;
        let other_margin = self.min_margin(range_action, state, other_angle)?;
        if other_margin > closest_margin + self.parameters.improvement_threshold * closest_margin.abs() {
            Ok(TapMargins::from([(closest, closest_margin), (other, other_margin)]))
        } else {
            Ok(unambiguous)
        }
    }

    /// Worst margin over the most limiting CNECs with `range_action` at `angle`.
    fn min_margin(&self, range_action: &RangeAction, state: &State, angle: f64) -> RaoResult<f64> {
        let current = self.reference_setpoints.setpoint(&range_action.id, state)?;
        let mut worst = f64::MAX;
        for cnec in &self.most_limiting_cnecs {
            let sensitivity = self.sensitivities.sensitivity(&cnec.id, &range_action.id);
            let flow = sensitivity * (angle - current) + self.flows.flow_mw(&cnec.id)?;
            worst = worst.min(cnec.compute_margin(flow, Unit::Megawatt));
        }
        Ok(worst)
    }

    /// Common tap of a PST group: every member's closest and neighbouring
    /// taps are scored by the worst margin over all members, and the best
    /// score wins. Ties go to the lowest tap.
    fn group_tap(&self, members: &[&Arc<RangeAction>], state: &State, optimal: &RangeActionActivation) -> RaoResult<i32> {
        let mut candidates = BTreeSet::new();
        let mut window = (i32::MIN, i32::MAX);
        let mut fallback = None;
        for member in members {
            let Some(pst) = member.as_pst() else {
                continue;
            };
            let (min_tap, max_tap) = self.admissible_taps(member, pst, state)?;
            let (closest, other) = self.neighbouring_taps(pst, optimal.setpoint(&member.id, state)?, (min_tap, max_tap))?;
            window = (window.0.max(min_tap), window.1.min(max_tap));
            fallback.get_or_insert(closest);
            candidates.insert(closest);
            candidates.extend(other);
        }

        let mut best: Option<(i32, f64)> = None;
        for tap in candidates.into_iter().filter(|tap| (window.0..=window.1).contains(tap)) {
            let mut score = f64::MAX;
            for member in members {
                let Some(pst) = member.as_pst() else {
                    continue;
                };
                score = score.min(self.min_margin(member, state, pst.convert_tap_to_angle(tap)?)?);
            }
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((tap, score));
            }
        }
        match (best, fallback) {
            (Some((tap, _)), _) => Ok(tap),
            (None, Some(tap)) => Ok(tap),
            (None, None) => Err(rao_core::RaoError::Validation(format!(
                "PST group at {} has no member with a tap table",
                state.id()
            ))),
        }
    }
}

/// Sign of `value`, zero included.
fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Tap with the highest margin; ties go to the lowest tap.
fn best_tap(margins: &TapMargins) -> Option<i32> {
    let mut best: Option<(i32, f64)> = None;
    for (tap, margin) in margins {
        if best.map_or(true, |(_, best_margin)| *margin > best_margin) {
            best = Some((*tap, *margin));
        }
    }
    best.map(|(tap, _)| tap)
}
