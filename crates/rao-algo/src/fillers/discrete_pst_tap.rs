//! Integer tap variations for PSTs.
//!
//! ```text
//! S[r,s] − f_up·up[r,s] + f_down·down[r,s] = angle(current tap)
//! up[r,s]   − (maxTap − current)·b_up[r,s]   ≤ 0
//! down[r,s] − (current − minTap)·b_down[r,s] ≤ 0
//! b_up[r,s] + b_down[r,s]                    ≤ 1
//! ```
//!
//! On fill, `f_up` and `f_down` are the average angle steps between the
//! current tap and the range extremities. On every update they become the
//! angle step of one tap up and one tap down around the new current tap,
//! which is exact for the first move and good enough beyond.

use super::ProblemFiller;
use crate::linear_problem::keys::{self, Direction};
use crate::linear_problem::LinearProblem;
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{OptimizationPerimeter, PstModel, RangeAction, RaoResult, State};
use std::sync::Arc;

pub struct DiscretePstTapFiller {
    perimeter: Arc<OptimizationPerimeter>,
    pre_perimeter_setpoints: RangeActionActivation,
    starting_setpoints: RangeActionActivation,
}

/// Tap window and conversion factors around one tap.
struct TapWindow {
    current_tap: i32,
    current_angle: f64,
    min_tap: i32,
    max_tap: i32,
    upward_factor: f64,
    downward_factor: f64,
}

impl DiscretePstTapFiller {
    pub fn new(
        perimeter: Arc<OptimizationPerimeter>,
        pre_perimeter_setpoints: RangeActionActivation,
        starting_setpoints: RangeActionActivation,
    ) -> Self {
        Self {
            perimeter,
            pre_perimeter_setpoints,
            starting_setpoints,
        }
    }

    fn window(
        &self,
        range_action: &RangeAction,
        pst: &PstModel,
        state: &State,
        setpoints: &RangeActionActivation,
        extremities: bool,
    ) -> RaoResult<TapWindow> {
        let previous_tap = pst.convert_angle_to_tap(self.pre_perimeter_setpoints.setpoint(&range_action.id, state)?);
        let (min_tap, max_tap) = pst.admissible_taps(previous_tap);
        let current_tap = pst
            .convert_angle_to_tap(setpoints.setpoint(&range_action.id, state)?)
            .clamp(min_tap, max_tap);
        let current_angle = pst.convert_tap_to_angle(current_tap)?;

        let (upward_factor, downward_factor) = if extremities {
            let upward = if max_tap > current_tap {
                (pst.convert_tap_to_angle(max_tap)? - current_angle) / f64::from(max_tap - current_tap)
            } else {
                0.0
            };
            let downward = if current_tap > min_tap {
                (current_angle - pst.convert_tap_to_angle(min_tap)?) / f64::from(current_tap - min_tap)
            } else {
                0.0
            };
            (upward, downward)
        } else {
            let upward = if max_tap > current_tap {
                pst.convert_tap_to_angle(current_tap + 1)? - current_angle
            } else {
                0.0
            };
            let downward = if current_tap > min_tap {
                current_angle - pst.convert_tap_to_angle(current_tap - 1)?
            } else {
                0.0
            };
            (upward, downward)
        };

        Ok(TapWindow {
            current_tap,
            current_angle,
            min_tap,
            max_tap,
            upward_factor,
            downward_factor,
        })
    }

    fn write_window(problem: &mut LinearProblem, range_action: &RangeAction, state: &State, window: &TapWindow) -> RaoResult<()> {
        let id = &range_action.id;
        let setpoint = problem.variable(&keys::setpoint_variable(id, state))?;
        let upward = problem.variable(&keys::pst_tap_variation_variable(id, state, Direction::Upward))?;
        let downward = problem.variable(&keys::pst_tap_variation_variable(id, state, Direction::Downward))?;
        let upward_binary = problem.variable(&keys::pst_tap_variation_binary(id, state, Direction::Upward))?;
        let downward_binary = problem.variable(&keys::pst_tap_variation_binary(id, state, Direction::Downward))?;

        let room_up = f64::from((window.max_tap - window.current_tap).max(0));
        let room_down = f64::from((window.current_tap - window.min_tap).max(0));
        problem.set_variable_bounds(upward, 0.0, room_up);
        problem.set_variable_bounds(downward, 0.0, room_down);

        let up_direction = problem.constraint(&keys::is_variation_in_direction_constraint(id, state, Direction::Upward))?;
        problem.set_coefficient(up_direction, upward, 1.0);
        problem.set_coefficient(up_direction, upward_binary, -room_up);
        let down_direction = problem.constraint(&keys::is_variation_in_direction_constraint(id, state, Direction::Downward))?;
        problem.set_coefficient(down_direction, downward, 1.0);
        problem.set_coefficient(down_direction, downward_binary, -room_down);

        let conversion = problem.constraint(&keys::tap_to_angle_conversion_constraint(id, state))?;
        problem.set_coefficient(conversion, setpoint, 1.0);
        problem.set_coefficient(conversion, upward, -window.upward_factor);
        problem.set_coefficient(conversion, downward, window.downward_factor);
        problem.set_constraint_bounds(conversion, window.current_angle, window.current_angle);
        Ok(())
    }

    fn refresh(&self, problem: &mut LinearProblem, activation: &RangeActionActivation) -> RaoResult<()> {
        for (state, range_actions) in self.perimeter.range_actions_per_state() {
            for range_action in range_actions {
                let Some(pst) = range_action.as_pst() else {
                    continue;
                };
                let window = self.window(range_action, pst, state, activation, false)?;
                Self::write_window(problem, range_action, state, &window)?;
            }
        }
        Ok(())
    }
}

impl ProblemFiller for DiscretePstTapFiller {
    fn name(&self) -> &'static str {
        "discrete-pst-tap"
    }

    fn needs_integrality(&self) -> bool {
        true
    }

    fn fill(&self, problem: &mut LinearProblem, _flows: &FlowResult, _sensitivities: &SensitivityResult) -> RaoResult<()> {
        for (state, range_actions) in self.perimeter.range_actions_per_state() {
            for range_action in range_actions {
                let Some(pst) = range_action.as_pst() else {
                    continue;
                };
                let id = &range_action.id;
                for direction in [Direction::Upward, Direction::Downward] {
                    problem.add_integer_variable(&keys::pst_tap_variation_variable(id, state, direction), 0.0, 0.0)?;
                    problem.add_binary_variable(&keys::pst_tap_variation_binary(id, state, direction))?;
                    problem.add_constraint(
                        &keys::is_variation_in_direction_constraint(id, state, direction),
                        f64::NEG_INFINITY,
                        0.0,
                    )?;
                }
                let exclusive = problem.add_constraint(&keys::up_or_down_pst_variation_constraint(id, state), f64::NEG_INFINITY, 1.0)?;
                for direction in [Direction::Upward, Direction::Downward] {
                    let binary = problem.variable(&keys::pst_tap_variation_binary(id, state, direction))?;
                    problem.set_coefficient(exclusive, binary, 1.0);
                }
                problem.add_constraint(&keys::tap_to_angle_conversion_constraint(id, state), 0.0, 0.0)?;

                let window = self.window(range_action, pst, state, &self.starting_setpoints, true)?;
                Self::write_window(problem, range_action, state, &window)?;
            }
        }
        Ok(())
    }

    fn update(
        &self,
        problem: &mut LinearProblem,
        _flows: &FlowResult,
        _sensitivities: &SensitivityResult,
        activation: &RangeActionActivation,
    ) -> RaoResult<()> {
        self.refresh(problem, activation)
    }

    fn update_between_mip_iterations(&self, problem: &mut LinearProblem, activation: &RangeActionActivation) -> RaoResult<()> {
        self.refresh(problem, activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fillers::{FillerSlot, ProblemFillerChain};
    use crate::linear_problem::ClarabelBackend;
    use rao_core::{BranchKind, Network};
    use std::collections::BTreeMap;

    fn uneven_pst() -> RangeAction {
        let table: BTreeMap<i32, f64> = [(-1, -1.0), (0, 0.0), (1, 0.4), (2, 1.0)].into_iter().collect();
        RangeAction::pst("pst-ra", "pst", PstModel::new(table, 0).unwrap())
    }

    #[test]
    fn test_conversion_factors_follow_current_tap() {
        let mut network = Network::new();
        network.add_bus("A", 400.0);
        network.add_bus("B", 400.0);
        network.add_branch("pst", "A", "B", BranchKind::PhaseShifter { tap: 0 }).unwrap();
        let perimeter = Arc::new(
            OptimizationPerimeter::builder(State::preventive())
                .range_action(State::preventive(), uneven_pst())
                .build()
                .unwrap(),
        );
        let setpoints = RangeActionActivation::from_network(&perimeter, &network).unwrap();

        let mut chain = ProblemFillerChain::new();
        chain.insert(
            FillerSlot::DiscretePstTap,
            Box::new(DiscretePstTapFiller::new(Arc::clone(&perimeter), setpoints.clone(), setpoints.clone())),
        );
        let mut problem = LinearProblem::new(chain, Box::new(ClarabelBackend), 30);
        let state = State::preventive();
        problem
            .add_variable(&keys::setpoint_variable("pst-ra", &state), -1.0, 1.0)
            .unwrap();
        problem.fill(&FlowResult::new(), &SensitivityResult::new()).unwrap();

        let conversion = problem.constraint(&keys::tap_to_angle_conversion_constraint("pst-ra", &state)).unwrap();
        let upward = problem.variable(&keys::pst_tap_variation_variable("pst-ra", &state, Direction::Upward)).unwrap();
        let downward = problem.variable(&keys::pst_tap_variation_variable("pst-ra", &state, Direction::Downward)).unwrap();
        assert_eq!(problem.coefficient(conversion, upward), -0.5);
        assert_eq!(problem.coefficient(conversion, downward), 1.0);
        assert_eq!(problem.variable_bounds(upward), (0.0, 2.0));

        let mut moved = setpoints.clone();
        moved.put(&state, "pst-ra", 0.4);
        problem.update_between_mip_iterations(&moved).unwrap();
        assert!((problem.coefficient(conversion, upward) + 0.6).abs() < 1e-9);
        assert!((problem.coefficient(conversion, downward) - 0.4).abs() < 1e-9);
        assert_eq!(problem.variable_bounds(upward), (0.0, 1.0));
        assert_eq!(problem.variable_bounds(downward), (0.0, 2.0));
        assert!((problem.constraint_bounds(conversion).0 - 0.4).abs() < 1e-9);
    }
}
