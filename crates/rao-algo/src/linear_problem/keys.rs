//! Deterministic variable and constraint names.
//!
//! Fillers find each other's variables through these keys only, so every
//! name is built here from the owning object id, the state id and a role tag.

use rao_core::State;

/// Direction of a variation or of a flow bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upward,
    Downward,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Upward => "upward",
            Direction::Downward => "downward",
        }
    }
}

/// Side of a threshold a margin constraint protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Below,
    Above,
}

impl Bound {
    fn tag(self) -> &'static str {
        match self {
            Bound::Below => "below",
            Bound::Above => "above",
        }
    }
}

pub fn flow_variable(cnec_id: &str) -> String {
    format!("{}_flow_variable", cnec_id)
}

pub fn flow_constraint(cnec_id: &str) -> String {
    format!("{}_flow_constraint", cnec_id)
}

pub fn setpoint_variable(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_setpoint_variable", range_action_id, state.id())
}

pub fn set_point_variation_variable(range_action_id: &str, state: &State, direction: Direction) -> String {
    format!("{}_{}_{}_setpoint_variation_variable", range_action_id, state.id(), direction.tag())
}

pub fn set_point_variation_constraint(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_setpoint_variation_constraint", range_action_id, state.id())
}

pub fn absolute_variation_variable(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_absolute_variation_variable", range_action_id, state.id())
}

pub fn absolute_variation_constraint(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_absolute_variation_constraint", range_action_id, state.id())
}

pub fn range_action_group_variable(group_id: &str, state: &State) -> String {
    format!("{}_{}_virtual_setpoint_variable", group_id, state.id())
}

pub fn range_action_group_constraint(range_action_id: &str, group_id: &str, state: &State) -> String {
    format!("{}_{}_{}_group_constraint", range_action_id, group_id, state.id())
}

pub const MIN_MARGIN_VARIABLE: &str = "minimum_margin_variable";
pub const MIN_RELATIVE_MARGIN_VARIABLE: &str = "minimum_relative_margin_variable";
pub const MIN_RELATIVE_MARGIN_SIGN_BINARY: &str = "minimum_relative_margin_sign_binary_variable";
pub const MIN_RELATIVE_MARGIN_SIGN_CONSTRAINT: &str = "minimum_relative_margin_sign_definition_constraint";
pub const MIN_RELATIVE_MARGIN_UPPER_CONSTRAINT: &str = "minimum_relative_margin_set_to_zero_constraint";
pub const MIN_RELATIVE_MARGIN_LINK_CONSTRAINT: &str = "minimum_relative_margin_link_constraint";

pub fn min_margin_constraint(cnec_id: &str, bound: Bound) -> String {
    format!("{}_{}_minmargin_constraint", cnec_id, bound.tag())
}

pub fn min_relative_margin_constraint(cnec_id: &str, bound: Bound) -> String {
    format!("{}_{}_minrelmargin_constraint", cnec_id, bound.tag())
}

pub fn loop_flow_violation_variable(cnec_id: &str) -> String {
    format!("{}_loopflowviolation_variable", cnec_id)
}

pub fn max_loop_flow_constraint(cnec_id: &str, bound: Bound) -> String {
    format!("{}_{}_maxloopflow_constraint", cnec_id, bound.tag())
}

pub fn mnec_violation_variable(cnec_id: &str) -> String {
    format!("{}_mnecviolation_variable", cnec_id)
}

pub fn mnec_flow_constraint(cnec_id: &str, bound: Bound) -> String {
    format!("{}_{}_mnecflow_constraint", cnec_id, bound.tag())
}

pub fn optimize_cnec_binary(cnec_id: &str) -> String {
    format!("{}_optimizecnec_variable", cnec_id)
}

pub fn dont_optimize_cnec_constraint(cnec_id: &str, bound: Bound) -> String {
    format!("{}_{}_dontoptimizecnec_constraint", cnec_id, bound.tag())
}

pub fn range_action_variation_binary(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_isvariable_variable", range_action_id, state.id())
}

pub fn is_variation_constraint(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_isvariation_constraint", range_action_id, state.id())
}

pub fn max_ra_constraint(state: &State) -> String {
    format!("{}_maxra_constraint", state.id())
}

pub fn tso_ra_used_variable(operator: &str, state: &State) -> String {
    format!("{}_{}_tsoraused_variable", operator, state.id())
}

pub fn tso_ra_used_constraint(operator: &str, range_action_id: &str, state: &State) -> String {
    format!("{}_{}_{}_tsoraused_constraint", operator, range_action_id, state.id())
}

pub fn max_tso_constraint(state: &State) -> String {
    format!("{}_maxtso_constraint", state.id())
}

pub fn max_ra_per_tso_constraint(operator: &str, state: &State) -> String {
    format!("{}_{}_maxrapertso_constraint", operator, state.id())
}

pub fn max_pst_per_tso_constraint(operator: &str, state: &State) -> String {
    format!("{}_{}_maxpstpertso_constraint", operator, state.id())
}

pub fn max_elementary_actions_per_tso_constraint(operator: &str, state: &State) -> String {
    format!("{}_{}_maxelementaryactionspertso_constraint", operator, state.id())
}

pub fn pst_absolute_tap_variation_variable(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_absolutetapvariation_variable", range_action_id, state.id())
}

pub fn pst_absolute_tap_variation_constraint(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_absolutetapvariation_constraint", range_action_id, state.id())
}

pub fn pst_tap_variation_variable(range_action_id: &str, state: &State, direction: Direction) -> String {
    format!("{}_{}_{}_tapvariation_variable", range_action_id, state.id(), direction.tag())
}

pub fn pst_tap_variation_binary(range_action_id: &str, state: &State, direction: Direction) -> String {
    format!("{}_{}_{}_tapvariationbinary_variable", range_action_id, state.id(), direction.tag())
}

pub fn tap_to_angle_conversion_constraint(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_taptoangleconversion_constraint", range_action_id, state.id())
}

pub fn up_or_down_pst_variation_constraint(range_action_id: &str, state: &State) -> String {
    format!("{}_{}_upordownpstvariation_constraint", range_action_id, state.id())
}

pub fn is_variation_in_direction_constraint(range_action_id: &str, state: &State, direction: Direction) -> String {
    format!("{}_{}_{}_isvariationindirection_constraint", range_action_id, state.id(), direction.tag())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rao_core::Instant;

    #[test]
    fn test_keys_are_distinct_per_state_and_role() {
        let preventive = State::preventive();
        let curative = State::after_contingency(Instant::curative(), "co");
        assert_ne!(setpoint_variable("pst", &preventive), setpoint_variable("pst", &curative));
        assert_ne!(
            set_point_variation_variable("pst", &preventive, Direction::Upward),
            set_point_variation_variable("pst", &preventive, Direction::Downward)
        );
        assert_ne!(min_margin_constraint("c", Bound::Below), min_margin_constraint("c", Bound::Above));
        assert_eq!(flow_variable("c"), "c_flow_variable");
    }
}
