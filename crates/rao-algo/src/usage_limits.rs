//! Remedial action usage budgets.
//!
//! Usage limits are configured per instant ([`RaUsageLimits`]). A leaf turns
//! them into per-state [`RangeActionLimits`] after deducting what its network
//! actions already consumed, and the iterating optimiser checks every rounded
//! solution against those budgets: a relaxed solve may spread a move over
//! more range actions than allowed, rounding never does.

use crate::fillers::previous_state;
use crate::parameters::{RangeActionLimits, RaoParameters};
use crate::result::{RangeActionActivation, SETPOINT_EPSILON};
use rao_core::{NetworkAction, OptimizationPerimeter, RangeAction, RaoResult, State};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Range action budgets per state of the perimeter, reduced by the network
/// actions applied at the main state.
pub fn range_action_limits(
    parameters: &RaoParameters,
    perimeter: &OptimizationPerimeter,
    applied_network_actions: &[Arc<NetworkAction>],
) -> BTreeMap<State, RangeActionLimits> {
    let mut per_state = BTreeMap::new();
    for state in perimeter.range_actions_per_state().keys() {
        let Some(usage) = parameters.ra_usage_limits(&state.instant.id) else {
            continue;
        };
        let mut limits = RangeActionLimits {
            max_ra: usage.max_ra,
            max_tso: usage.max_tso,
            excluded_tsos: BTreeSet::new(),
            max_ra_per_tso: usage.max_ra_per_tso.clone(),
            max_pst_per_tso: usage.max_pst_per_tso.clone(),
            max_elementary_actions_per_tso: usage.max_elementary_actions_per_tso.clone(),
        };
        if state == perimeter.main_state() && !applied_network_actions.is_empty() {
            deduct_network_actions(&mut limits, applied_network_actions);
        }
        per_state.insert(state.clone(), limits);
    }
    per_state
}

fn deduct_network_actions(limits: &mut RangeActionLimits, applied: &[Arc<NetworkAction>]) {
    limits.max_ra = limits.max_ra.map(|max| max.saturating_sub(applied.len()));

    let mut actions_per_operator: BTreeMap<String, usize> = BTreeMap::new();
    let mut elementary_per_operator: BTreeMap<String, usize> = BTreeMap::new();
    for action in applied {
        if let Some(operator) = &action.operator {
            *actions_per_operator.entry(operator.clone()).or_default() += 1;
            *elementary_per_operator.entry(operator.clone()).or_default() += action.elementary_actions.len();
        }
    }

    limits.max_tso = limits.max_tso.map(|max| max.saturating_sub(actions_per_operator.len()));
    limits.excluded_tsos = actions_per_operator.keys().cloned().collect();
    for (operator, used) in &actions_per_operator {
        if let Some(max) = limits.max_ra_per_tso.get_mut(operator) {
            *max = max.saturating_sub(*used);
        }
    }
    for (operator, used) in &elementary_per_operator {
        if let Some(max) = limits.max_elementary_actions_per_tso.get_mut(operator) {
            *max = max.saturating_sub(*used);
        }
    }
}

/// Remaining budget while range actions are admitted one after the other.
struct Budget<'a> {
    limits: &'a RangeActionLimits,
    range_actions: usize,
    operators: BTreeSet<String>,
    per_operator: BTreeMap<String, usize>,
    psts_per_operator: BTreeMap<String, usize>,
    taps_per_operator: BTreeMap<String, usize>,
}

impl<'a> Budget<'a> {
    fn new(limits: &'a RangeActionLimits) -> Self {
        Self {
            limits,
            range_actions: 0,
            operators: BTreeSet::new(),
            per_operator: BTreeMap::new(),
            psts_per_operator: BTreeMap::new(),
            taps_per_operator: BTreeMap::new(),
        }
    }

    /// Taps still available to the PSTs of `operator`.
    fn remaining_taps(&self, operator: &str) -> Option<usize> {
        let max = self.limits.max_elementary_actions_per_tso.get(operator)?;
        Some(max.saturating_sub(self.taps_per_operator.get(operator).copied().unwrap_or(0)))
    }

    fn admits(&self, moves: &[Move<'_>]) -> bool {
        if let Some(max) = self.limits.max_ra {
            if self.range_actions + moves.len() > max {
                return false;
            }
        }
        let mut new_operators = BTreeSet::new();
        let mut per_operator: BTreeMap<&str, usize> = BTreeMap::new();
        let mut psts_per_operator: BTreeMap<&str, usize> = BTreeMap::new();
        for movement in moves {
            let Some(operator) = movement.range_action.operator.as_deref() else {
                continue;
            };
            if !self.operators.contains(operator) && !self.limits.excluded_tsos.contains(operator) {
                new_operators.insert(operator);
            }
            *per_operator.entry(operator).or_default() += 1;
            if movement.range_action.is_pst() {
                *psts_per_operator.entry(operator).or_default() += 1;
            }
        }
        if let Some(max) = self.limits.max_tso {
            if self.operators.len() + new_operators.len() > max {
                return false;
            }
        }
        for (operator, count) in per_operator {
            if let Some(max) = self.limits.max_ra_per_tso.get(operator) {
                if self.per_operator.get(operator).copied().unwrap_or(0) + count > *max {
                    return false;
                }
            }
        }
        for (operator, count) in psts_per_operator {
            if let Some(max) = self.limits.max_pst_per_tso.get(operator) {
                if self.psts_per_operator.get(operator).copied().unwrap_or(0) + count > *max {
                    return false;
                }
            }
        }
        true
    }

    fn take(&mut self, moves: &[Move<'_>]) {
        self.range_actions += moves.len();
        for movement in moves {
            let Some(operator) = movement.range_action.operator.as_deref() else {
                continue;
            };
            if !self.limits.excluded_tsos.contains(operator) {
                self.operators.insert(operator.to_string());
            }
            *self.per_operator.entry(operator.to_string()).or_default() += 1;
            if movement.range_action.is_pst() {
                *self.psts_per_operator.entry(operator.to_string()).or_default() += 1;
                *self.taps_per_operator.entry(operator.to_string()).or_default() += movement.taps;
            }
        }
    }
}

/// One range action moved by a rounded solution.
struct Move<'a> {
    range_action: &'a Arc<RangeAction>,
    previous: f64,
    target: f64,
    /// Absolute tap variation, PSTs only.
    taps: usize,
    /// Variation as a share of the admissible span.
    weight: f64,
}

/// Brings `activation` back within `limits`.
///
/// Moved range actions (PST groups as a whole) are admitted by decreasing
/// variation, relative to their admissible span; those that no longer fit
/// are put back on their previous setpoint. A PST that exceeds the tap budget
/// of its operator is moved by the remaining taps only.
pub fn enforce(
    activation: &RangeActionActivation,
    perimeter: &OptimizationPerimeter,
    limits: &BTreeMap<State, RangeActionLimits>,
    pre_perimeter_setpoints: &RangeActionActivation,
) -> RaoResult<RangeActionActivation> {
    let mut enforced = activation.clone();
    for (state, state_limits) in limits {
        if state_limits.is_unlimited() {
            continue;
        }
        let Some(range_actions) = perimeter.range_actions_per_state().get(state) else {
            continue;
        };

        let mut units: BTreeMap<String, Vec<Move<'_>>> = BTreeMap::new();
        for range_action in range_actions {
            let previous = match previous_state(perimeter, &range_action.id, state) {
                Some(previous_state) => activation.setpoint(&range_action.id, previous_state)?,
                None => pre_perimeter_setpoints.setpoint(&range_action.id, state)?,
            };
            let target = activation.setpoint(&range_action.id, state)?;
            if (target - previous).abs() <= SETPOINT_EPSILON {
                continue;
            }
            let reference = pre_perimeter_setpoints.setpoint(&range_action.id, state)?;
            let span = range_action.max_admissible_setpoint(reference) - range_action.min_admissible_setpoint(reference);
            let taps = match range_action.as_pst() {
                Some(pst) => pst.convert_angle_to_tap(target).abs_diff(pst.convert_angle_to_tap(previous)) as usize,
                None => 0,
            };
            let unit = range_action.group_id.clone().unwrap_or_else(|| range_action.id.clone());
            units.entry(unit).or_default().push(Move {
                range_action,
                previous,
                target,
                taps,
                weight: if span > 0.0 { (target - previous).abs() / span } else { 0.0 },
            });
        }

        let mut ordered: Vec<(String, Vec<Move<'_>>)> = units.into_iter().collect();
        ordered.sort_by(|(a_id, a), (b_id, b)| {
            let a_weight = a.iter().map(|m| m.weight).fold(0.0, f64::max);
            let b_weight = b.iter().map(|m| m.weight).fold(0.0, f64::max);
            b_weight.total_cmp(&a_weight).then_with(|| a_id.cmp(b_id))
        });

        let mut budget = Budget::new(state_limits);
        for (unit, mut moves) in ordered {
            if !budget.admits(&moves) {
                tracing::debug!("usage limits at {}: {} kept at its previous setpoint", state.id(), unit);
                for movement in &moves {
                    enforced.put(state, movement.range_action.id.clone(), movement.previous);
                }
                continue;
            }
            for movement in moves.iter_mut() {
                let (Some(pst), Some(operator)) = (movement.range_action.as_pst(), movement.range_action.operator.as_deref())
                else {
                    continue;
                };
                let Some(remaining) = budget.remaining_taps(operator) else {
                    continue;
                };
                if movement.taps > remaining {
                    let previous_tap = pst.convert_angle_to_tap(movement.previous);
                    let direction = if movement.target > movement.previous { 1 } else { -1 };
                    let allowed = i32::try_from(remaining).unwrap_or(i32::MAX);
                    let tap = previous_tap + direction * allowed;
                    tracing::debug!(
                        "usage limits at {}: {} limited to {} tap(s)",
                        state.id(),
                        movement.range_action.id,
                        remaining
                    );
                    movement.target = pst.convert_tap_to_angle(tap)?;
                    movement.taps = remaining;
                }
            }
            let (kept, stopped): (Vec<Move<'_>>, Vec<Move<'_>>) = moves.into_iter().partition(|m| m.taps > 0 || !m.range_action.is_pst());
            for movement in &stopped {
                enforced.put(state, movement.range_action.id.clone(), movement.previous);
            }
            for movement in &kept {
                enforced.put(state, movement.range_action.id.clone(), movement.target);
            }
            budget.take(&kept);
        }
    }
    Ok(enforced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::RaUsageLimits;
    use crate::test_utils;
    use rao_core::{ActionType, ElementaryAction};

    fn perimeter() -> OptimizationPerimeter {
        let preventive = State::preventive();
        OptimizationPerimeter::builder(preventive.clone())
            .range_action(preventive.clone(), test_utils::pst_range_action("pst-fr", "pst-1"))
            .range_action(preventive, test_utils::pst_range_action("pst-be", "pst-2").with_operator("BE"))
            .build()
            .unwrap()
    }

    fn reference() -> RangeActionActivation {
        RangeActionActivation::new([("pst-fr".to_string(), 0.0), ("pst-be".to_string(), 0.0)].into_iter().collect())
    }

    fn topological(id: &str, operator: &str) -> Arc<NetworkAction> {
        Arc::new(NetworkAction::new(
            id,
            Some(operator),
            vec![ElementaryAction::Topological {
                element_id: "coupler".into(),
                action: ActionType::Open,
            }],
        ))
    }

    #[test]
    fn test_network_actions_consume_budget() {
        let mut parameters = RaoParameters::default();
        parameters.ra_usage_limits_per_instant.insert(
            "preventive".into(),
            RaUsageLimits {
                max_ra: Some(3),
                max_tso: Some(2),
                max_ra_per_tso: [("FR".to_string(), 2)].into_iter().collect(),
                max_elementary_actions_per_tso: [("FR".to_string(), 5)].into_iter().collect(),
                ..RaUsageLimits::default()
            },
        );
        let limits = range_action_limits(&parameters, &perimeter(), &[topological("open-coupler", "FR")]);
        let preventive = &limits[&State::preventive()];
        assert_eq!(preventive.max_ra, Some(2));
        assert_eq!(preventive.max_tso, Some(1));
        assert!(preventive.excluded_tsos.contains("FR"));
        assert_eq!(preventive.max_ra_per_tso["FR"], 1);
        assert_eq!(preventive.max_elementary_actions_per_tso["FR"], 4);
    }

    #[test]
    fn test_enforce_keeps_largest_moves() {
        let perimeter = perimeter();
        let state = State::preventive();
        let mut activation = reference();
        activation.put(&state, "pst-fr", 2.0);
        activation.put(&state, "pst-be", -0.5);
        let limits: BTreeMap<State, RangeActionLimits> = [(
            state.clone(),
            RangeActionLimits {
                max_ra: Some(1),
                ..RangeActionLimits::default()
            },
        )]
        .into_iter()
        .collect();

        let enforced = enforce(&activation, &perimeter, &limits, &reference()).unwrap();
        assert_eq!(enforced.setpoint("pst-fr", &state).unwrap(), 2.0);
        assert_eq!(enforced.setpoint("pst-be", &state).unwrap(), 0.0);
    }

    #[test]
    fn test_enforce_limits_taps_per_operator() {
        let perimeter = perimeter();
        let state = State::preventive();
        let mut activation = reference();
        activation.put(&state, "pst-fr", -2.0);
        let limits: BTreeMap<State, RangeActionLimits> = [(
            state.clone(),
            RangeActionLimits {
                max_elementary_actions_per_tso: [("FR".to_string(), 3)].into_iter().collect(),
                ..RangeActionLimits::default()
            },
        )]
        .into_iter()
        .collect();

        // four taps down, three allowed
        let enforced = enforce(&activation, &perimeter, &limits, &reference()).unwrap();
        assert_eq!(enforced.setpoint("pst-fr", &state).unwrap(), -1.5);
    }
}
