//! Small networks, perimeters and sensitivity models shared by tests.

use crate::leaf::Leaf;
use crate::network_pool::NetworkLease;
use crate::objective::ObjectiveFunction;
use crate::parameters::RaoParameters;
use crate::result::{EvaluationResult, PhysicsResult, RangeActionActivation};
use crate::search_tree::{PrePerimeterResult, SearchTreeInput};
use crate::sensitivity::{LinearSensitivityComputer, SensitivityComputer};
use rao_core::{
    ActionType, BranchKind, BranchThreshold, ElementaryAction, FlowCnec, Network, NetworkAction,
    OptimizationPerimeter, PstModel, RangeAction, RaoError, RaoResult, State, Unit,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// `A -line- B -pst- C -coupler- D`, all at 400 kV.
pub fn two_area_network() -> Network {
    let mut network = Network::new();
    for bus in ["A", "B", "C", "D"] {
        network.add_bus(bus, 400.0);
    }
    network.add_branch("line", "A", "B", BranchKind::Line).expect("line");
    network
        .add_branch("pst", "B", "C", BranchKind::PhaseShifter { tap: 0 })
        .expect("pst");
    network.add_branch("coupler", "C", "D", BranchKind::Switch).expect("coupler");
    network
}

/// Taps -10..=10 spread over -5..=5 degrees, starting at 0.
pub fn pst_model() -> PstModel {
    PstModel::linear(-10, 10, -5.0, 5.0, 0).expect("linear PST model")
}

pub fn pst_range_action(id: &str, element: &str) -> RangeAction {
    RangeAction::pst(id, element, pst_model()).with_operator("FR")
}

fn line_cnec() -> FlowCnec {
    FlowCnec::new("cnec-line", "line", State::preventive())
        .with_threshold(BranchThreshold::symmetric(1000.0, Unit::Megawatt))
        .with_operator("FR")
}

/// Preventive perimeter: one CNEC on `line`, one PST range action on `pst`.
pub fn single_pst_perimeter() -> OptimizationPerimeter {
    OptimizationPerimeter::builder(State::preventive())
        .flow_cnec(line_cnec())
        .range_action(State::preventive(), pst_range_action("pst-ra", "pst"))
        .build()
        .expect("single PST perimeter")
}

/// `base_flow` on `cnec-line`, moved by 100 MW per PST degree.
pub fn linear_computer(network: &Network, base_flow: f64) -> LinearSensitivityComputer {
    LinearSensitivityComputer::new(network)
        .with_base_flow("cnec-line", base_flow)
        .with_sensitivity("cnec-line", "pst-ra", 100.0)
}

/// Opens `element`.
pub fn topological_action(id: &str, element: &str, operator: &str) -> Arc<NetworkAction> {
    Arc::new(NetworkAction::new(
        id,
        Some(operator),
        vec![ElementaryAction::Topological {
            element_id: element.to_string(),
            action: ActionType::Open,
        }],
    ))
}

pub struct PrePerimeter {
    pub evaluation: EvaluationResult,
    pub setpoints: RangeActionActivation,
    pub objective: ObjectiveFunction,
}

/// Evaluates `network` as it is, used as both initial and pre-perimeter
/// situation.
pub fn pre_perimeter(
    network: &Network,
    perimeter: &OptimizationPerimeter,
    computer: &dyn SensitivityComputer,
    parameters: &RaoParameters,
) -> PrePerimeter {
    let setpoints = RangeActionActivation::from_network(perimeter, network).expect("setpoints");
    let physics = computer.compute(network, perimeter, &setpoints).expect("pre-perimeter sensitivity");
    let objective = ObjectiveFunction::build(perimeter, parameters, &physics.flow, &physics.flow);
    let evaluation = EvaluationResult {
        objective: objective.evaluate(&physics.flow).expect("pre-perimeter objective"),
        flow: physics.flow,
        sensitivity: physics.sensitivity,
    };
    PrePerimeter {
        evaluation,
        setpoints,
        objective,
    }
}

/// Delegates to `inner` for the first `successes` calls, then fails.
pub struct FailingComputer<C> {
    inner: C,
    successes: usize,
    calls: AtomicUsize,
}

impl<C: SensitivityComputer> FailingComputer<C> {
    pub fn after(successes: usize, inner: C) -> Self {
        Self {
            inner,
            successes,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<C: SensitivityComputer> SensitivityComputer for FailingComputer<C> {
    fn compute(
        &self,
        network: &Network,
        perimeter: &OptimizationPerimeter,
        setpoints: &RangeActionActivation,
    ) -> RaoResult<PhysicsResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.successes {
            return Err(RaoError::Sensitivity(format!("load flow diverged on call {}", call + 1)));
        }
        self.inner.compute(network, perimeter, setpoints)
    }
}

pub struct SearchTreeFixture {
    pub input: SearchTreeInput,
    pub parameters: RaoParameters,
}

/// The single-PST perimeter plus `open-coupler`, which relieves the line by
/// 300 MW.
pub fn search_tree_fixture(base_flow: f64) -> SearchTreeFixture {
    let network = two_area_network();
    let perimeter = Arc::new(
        OptimizationPerimeter::builder(State::preventive())
            .flow_cnec(line_cnec())
            .range_action(State::preventive(), pst_range_action("pst-ra", "pst"))
            .network_action((*topological_action("open-coupler", "coupler", "FR")).clone())
            .build()
            .expect("search tree perimeter"),
    );
    let computer = linear_computer(&network, base_flow).with_topology_shift("cnec-line", "coupler", -300.0);
    let parameters = RaoParameters::default();
    let pre = pre_perimeter(&network, &perimeter, &computer, &parameters);
    let input = SearchTreeInput {
        network,
        perimeter,
        pre_perimeter: PrePerimeterResult {
            flow: pre.evaluation.flow.clone(),
            sensitivity: pre.evaluation.sensitivity.clone(),
            setpoints: pre.setpoints,
        },
        initial_flows: pre.evaluation.flow,
        sensitivity_computer: Arc::new(computer),
        objective: pre.objective,
        detected_combinations: Vec::new(),
    };
    SearchTreeFixture { input, parameters }
}

/// Root leaf of `fixture`, evaluated on its pre-perimeter flows.
pub fn root_leaf(fixture: &SearchTreeFixture) -> Leaf {
    let input = &fixture.input;
    let evaluation = EvaluationResult {
        flow: input.pre_perimeter.flow.clone(),
        sensitivity: input.pre_perimeter.sensitivity.clone(),
        objective: input
            .objective
            .evaluate(&input.pre_perimeter.flow)
            .expect("root objective"),
    };
    Leaf::root(
        Arc::clone(&input.perimeter),
        NetworkLease::detached(input.network.clone()),
        evaluation,
        input.pre_perimeter.setpoints.clone(),
    )
}
