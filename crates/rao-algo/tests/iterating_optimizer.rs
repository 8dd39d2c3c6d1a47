//! Iterating linear optimisation against misbehaving sensitivity providers

use rao_algo::test_utils::{self, FailingComputer};
use rao_algo::{
    IteratingLinearOptimizer, IteratingLinearOptimizerInput, LinearProblemStatus, LinearSensitivityComputer,
    PhysicsResult, RangeActionActivation, RaoParameters, SensitivityComputer, SensitivityResult,
};
use rao_core::{Network, OptimizationPerimeter, RaoResult, State};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Real flows from `physics`, but sensitivities overstated by a constant
/// factor, so that each linearisation overshoots less than the previous one.
struct OverstatedSensitivities {
    physics: LinearSensitivityComputer,
    factor: f64,
}

impl SensitivityComputer for OverstatedSensitivities {
    fn compute(
        &self,
        network: &Network,
        perimeter: &OptimizationPerimeter,
        setpoints: &RangeActionActivation,
    ) -> RaoResult<PhysicsResult> {
        let physics = self.physics.compute(network, perimeter, setpoints)?;
        let mut sensitivity = SensitivityResult::new();
        for cnec in perimeter.flow_cnecs() {
            for range_action in perimeter.range_actions() {
                let value = physics.sensitivity.sensitivity(&cnec.id, &range_action.id);
                sensitivity.insert(cnec.id.clone(), range_action.id.clone(), value * self.factor);
            }
        }
        Ok(PhysicsResult {
            flow: physics.flow,
            sensitivity,
        })
    }
}

#[test]
fn failure_at_second_iteration_returns_first_iteration_result() {
    let mut network = test_utils::two_area_network();
    let perimeter = Arc::new(test_utils::single_pst_perimeter());
    let parameters = RaoParameters::default();
    let skewed = OverstatedSensitivities {
        physics: test_utils::linear_computer(&network, 950.0),
        factor: 3.2,
    };
    let pre = test_utils::pre_perimeter(&network, &perimeter, &skewed, &parameters);
    let failing = FailingComputer::after(1, skewed);

    let result = IteratingLinearOptimizer::new(&parameters)
        .optimize(IteratingLinearOptimizerInput {
            network: &mut network,
            perimeter: &perimeter,
            pre_optimization: &pre.evaluation,
            starting_setpoints: &pre.setpoints,
            pre_perimeter_setpoints: &pre.setpoints,
            pre_perimeter_flows: &pre.evaluation.flow,
            initial_flows: &pre.evaluation.flow,
            sensitivity_computer: &failing,
            objective: &pre.objective,
            limits: &BTreeMap::new(),
        })
        .unwrap();

    // iteration 1 believes 320 MW/degree and stops at -3 degrees (950 -> 650 MW);
    // iteration 2 heads for the -5 degree bound and its load flow fails
    assert_eq!(result.status(), LinearProblemStatus::SensitivityComputationFailed);
    assert_eq!(failing.calls(), 2);
    let optimized = result.into_computed().unwrap();
    assert_eq!(optimized.iterations, 1);
    assert_eq!(optimized.activation.setpoint("pst-ra", &State::preventive()).unwrap(), -3.0);
    assert!((optimized.cost() + 350.0).abs() < 1e-6);
    // the network is left on the setpoints of the returned result
    assert_eq!(network.pst_tap("pst").unwrap(), -6);
}

#[test]
fn failure_at_first_iteration_keeps_starting_point() {
    let mut network = test_utils::two_area_network();
    let perimeter = Arc::new(test_utils::single_pst_perimeter());
    let parameters = RaoParameters::default();
    let healthy = test_utils::linear_computer(&network, 950.0);
    let pre = test_utils::pre_perimeter(&network, &perimeter, &healthy, &parameters);
    let failing = FailingComputer::after(0, healthy);

    let result = IteratingLinearOptimizer::new(&parameters)
        .optimize(IteratingLinearOptimizerInput {
            network: &mut network,
            perimeter: &perimeter,
            pre_optimization: &pre.evaluation,
            starting_setpoints: &pre.setpoints,
            pre_perimeter_setpoints: &pre.setpoints,
            pre_perimeter_flows: &pre.evaluation.flow,
            initial_flows: &pre.evaluation.flow,
            sensitivity_computer: &failing,
            objective: &pre.objective,
            limits: &BTreeMap::new(),
        })
        .unwrap();

    assert_eq!(result.status(), LinearProblemStatus::SensitivityComputationFailed);
    let optimized = result.into_computed().unwrap();
    assert_eq!(optimized.iterations, 0);
    assert!((optimized.cost() + 50.0).abs() < 1e-6);
    assert_eq!(network.pst_tap("pst").unwrap(), 0);
}
