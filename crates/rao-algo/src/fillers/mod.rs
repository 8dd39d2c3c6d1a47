//! Problem fillers.
//!
//! Each filler adds one concern to a [`LinearProblem`]: variables,
//! constraints and objective terms on `fill`, then refreshed bounds and
//! coefficients on `update`. Fillers never hold handles: they look each
//! other's variables up by key (see [`keys`](crate::linear_problem::keys)).
//!
//! ## Order
//!
//! A [`ProblemFillerChain`] always runs its fillers in [`FillerSlot`] order,
//! whatever order they were registered in:
//!
//! ```text
//! Core → Margin → LoopFlow → Mnec → UnoptimizedCnec → RaUsageLimits → DiscretePstTap
//! ```
//!
//! Later fillers rely on variables and constraints created by earlier ones
//! (the unoptimized-CNEC filler relaxes the margin filler's constraints, for
//! instance).

mod core_filler;
mod discrete_pst_tap;
mod max_loop_flow;
mod max_min_margin;
mod max_min_relative_margin;
mod mnec;
mod ra_usage_limits;
mod unoptimized_cnec;

pub use core_filler::CoreProblemFiller;
pub use discrete_pst_tap::DiscretePstTapFiller;
pub use max_loop_flow::MaxLoopFlowFiller;
pub use max_min_margin::MaxMinMarginFiller;
pub use max_min_relative_margin::MaxMinRelativeMarginFiller;
pub use mnec::MnecFiller;
pub use ra_usage_limits::RaUsageLimitsFiller;
pub use unoptimized_cnec::UnoptimizedCnecFiller;

use crate::linear_problem::LinearProblem;
use crate::parameters::{ObjectiveFunctionKind, PstModel as PstModelling, RangeActionLimits, RaoParameters};
use crate::result::{FlowResult, RangeActionActivation, SensitivityResult};
use rao_core::{OptimizationPerimeter, RaoError, RaoResult, State};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One concern of the linear problem.
pub trait ProblemFiller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates variables and constraints.
    fn fill(&self, problem: &mut LinearProblem, flows: &FlowResult, sensitivities: &SensitivityResult) -> RaoResult<()>;

    /// Refreshes bounds and coefficients after a new sensitivity computation.
    /// Never creates variables or constraints.
    fn update(
        &self,
        problem: &mut LinearProblem,
        flows: &FlowResult,
        sensitivities: &SensitivityResult,
        activation: &RangeActionActivation,
    ) -> RaoResult<()>;

    /// Refreshes what depends on rounded taps between two solves of the same
    /// iteration.
    fn update_between_mip_iterations(
        &self,
        _problem: &mut LinearProblem,
        _activation: &RangeActionActivation,
    ) -> RaoResult<()> {
        Ok(())
    }

    /// Whether the filler's binary or integer variables lose their meaning
    /// when relaxed to continuous ones.
    fn needs_integrality(&self) -> bool {
        false
    }
}

/// Position of a filler in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FillerSlot {
    Core,
    Margin,
    LoopFlow,
    Mnec,
    UnoptimizedCnec,
    RaUsageLimits,
    DiscretePstTap,
}

/// Everything a leaf knows when it builds its fillers.
pub struct FillerContext<'a> {
    pub perimeter: &'a Arc<OptimizationPerimeter>,
    pub parameters: &'a RaoParameters,
    /// Setpoints before any remedial action of the perimeter; reference of
    /// setpoint variations and admissible ranges.
    pub pre_perimeter_setpoints: &'a RangeActionActivation,
    /// Setpoints the fill-time flows were computed with.
    pub starting_setpoints: &'a RangeActionActivation,
    /// Reference for loop-flow thresholds and MNEC margins.
    pub initial_flows: &'a FlowResult,
    /// Reference margins of unoptimized CNECs.
    pub pre_perimeter_flows: &'a FlowResult,
    pub limits: &'a BTreeMap<State, RangeActionLimits>,
}

/// Ordered set of fillers.
#[derive(Default)]
pub struct ProblemFillerChain {
    fillers: BTreeMap<FillerSlot, Box<dyn ProblemFiller>>,
}

impl ProblemFillerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chain a leaf optimisation needs, given the parameters.
    pub fn build(context: &FillerContext<'_>) -> RaoResult<Self> {
        let parameters = context.parameters;
        let perimeter = context.perimeter;
        let discrete_taps = parameters.range_actions.pst_model == PstModelling::ApproximatedIntegers;
        let mut chain = Self::new();

        chain.insert(
            FillerSlot::Core,
            Box::new(CoreProblemFiller::new(
                Arc::clone(perimeter),
                context.pre_perimeter_setpoints.clone(),
                context.starting_setpoints.clone(),
                parameters.range_actions.clone(),
            )),
        );

        let objective = &parameters.objective_function;
        let margin: Box<dyn ProblemFiller> = match objective.kind {
            ObjectiveFunctionKind::MaxMinMargin => Box::new(MaxMinMarginFiller::new(perimeter, objective.unit)),
            ObjectiveFunctionKind::MaxMinRelativeMargin => Box::new(MaxMinRelativeMarginFiller::new(
                perimeter,
                objective.unit,
                context.initial_flows,
                objective.ptdf_sum_lower_bound,
            )),
        };
        chain.insert(FillerSlot::Margin, margin);

        if let Some(loop_flow) = &parameters.loop_flow {
            if perimeter.loop_flow_cnecs().next().is_some() {
                chain.insert(
                    FillerSlot::LoopFlow,
                    Box::new(MaxLoopFlowFiller::new(perimeter, loop_flow.clone(), context.initial_flows)),
                );
            }
        }

        if let Some(mnec) = &parameters.mnec {
            if perimeter.monitored_flow_cnecs().next().is_some() {
                chain.insert(
                    FillerSlot::Mnec,
                    Box::new(MnecFiller::new(perimeter, mnec.clone(), context.initial_flows)),
                );
            }
        }

        if let Some(unoptimized) = &parameters.unoptimized_cnecs {
            let filler = UnoptimizedCnecFiller::new(
                perimeter,
                &unoptimized.operators_not_to_optimize,
                context.pre_perimeter_flows,
                objective,
            );
            if filler.has_cnecs() {
                chain.insert(FillerSlot::UnoptimizedCnec, Box::new(filler));
            }
        }

        if context.limits.values().any(|limits| !limits.is_unlimited()) {
            chain.insert(
                FillerSlot::RaUsageLimits,
                Box::new(RaUsageLimitsFiller::new(
                    Arc::clone(perimeter),
                    context.limits.clone(),
                    context.pre_perimeter_setpoints.clone(),
                    discrete_taps,
                )),
            );
        }

        if discrete_taps && perimeter.range_actions().iter().any(|ra| ra.is_pst()) {
            chain.insert(
                FillerSlot::DiscretePstTap,
                Box::new(DiscretePstTapFiller::new(
                    Arc::clone(perimeter),
                    context.pre_perimeter_setpoints.clone(),
                    context.starting_setpoints.clone(),
                )),
            );
        }

        tracing::debug!("filler chain: {}", chain.names().join(", "));
        Ok(chain)
    }

    /// Sets the filler of a slot, replacing any previous one.
    pub fn insert(&mut self, slot: FillerSlot, filler: Box<dyn ProblemFiller>) {
        self.fillers.insert(slot, filler);
    }

    pub fn contains(&self, slot: FillerSlot) -> bool {
        self.fillers.contains_key(&slot)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.fillers.values().map(|filler| filler.name()).collect()
    }

    /// Fillers that only hold their contract on a solver honouring integrality.
    pub fn integrality_dependent(&self) -> Vec<&'static str> {
        self.fillers
            .values()
            .filter(|filler| filler.needs_integrality())
            .map(|filler| filler.name())
            .collect()
    }

    pub fn fill(&self, problem: &mut LinearProblem, flows: &FlowResult, sensitivities: &SensitivityResult) -> RaoResult<()> {
        for filler in self.fillers.values() {
            filler
                .fill(problem, flows, sensitivities)
                .map_err(|err| construction_error(filler.name(), err))?;
        }
        Ok(())
    }

    pub fn update(
        &self,
        problem: &mut LinearProblem,
        flows: &FlowResult,
        sensitivities: &SensitivityResult,
        activation: &RangeActionActivation,
    ) -> RaoResult<()> {
        for filler in self.fillers.values() {
            filler
                .update(problem, flows, sensitivities, activation)
                .map_err(|err| construction_error(filler.name(), err))?;
        }
        Ok(())
    }

    pub fn update_between_mip_iterations(
        &self,
        problem: &mut LinearProblem,
        activation: &RangeActionActivation,
    ) -> RaoResult<()> {
        for filler in self.fillers.values() {
            filler
                .update_between_mip_iterations(problem, activation)
                .map_err(|err| construction_error(filler.name(), err))?;
        }
        Ok(())
    }
}

fn construction_error(filler: &str, err: RaoError) -> RaoError {
    match err {
        RaoError::FillerConstruction(message) => RaoError::FillerConstruction(format!("{}: {}", filler, message)),
        other => RaoError::FillerConstruction(format!("{}: {}", filler, other)),
    }
}

/// Latest state at or before `state` where the range action is available.
pub(crate) fn applicable_state<'a>(
    perimeter: &'a OptimizationPerimeter,
    range_action_id: &str,
    state: &State,
) -> Option<&'a State> {
    perimeter
        .range_actions_per_state()
        .iter()
        .rev()
        .filter(|(candidate, _)| candidate.reaches(state))
        .find(|(_, actions)| actions.iter().any(|ra| ra.id == range_action_id))
        .map(|(candidate, _)| candidate)
}

/// Latest state strictly before `state` where the range action is available.
pub(crate) fn previous_state<'a>(
    perimeter: &'a OptimizationPerimeter,
    range_action_id: &str,
    state: &State,
) -> Option<&'a State> {
    perimeter
        .range_actions_per_state()
        .iter()
        .rev()
        .filter(|(candidate, _)| candidate.instant.order < state.instant.order && candidate.reaches(state))
        .find(|(_, actions)| actions.iter().any(|ra| ra.id == range_action_id))
        .map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear_problem::ClarabelBackend;
    use crate::test_utils;
    use parking_lot::Mutex;
    use rao_core::Instant;

    struct Recorder {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl ProblemFiller for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn fill(&self, _problem: &mut LinearProblem, _flows: &FlowResult, _sensitivities: &SensitivityResult) -> RaoResult<()> {
            self.calls.lock().push(format!("fill {}", self.name));
            if self.fail {
                return Err(RaoError::Network("missing element".into()));
            }
            Ok(())
        }

        fn update(
            &self,
            _problem: &mut LinearProblem,
            _flows: &FlowResult,
            _sensitivities: &SensitivityResult,
            _activation: &RangeActionActivation,
        ) -> RaoResult<()> {
            self.calls.lock().push(format!("update {}", self.name));
            Ok(())
        }
    }

    fn recorder(name: &'static str, calls: &Arc<Mutex<Vec<String>>>, fail: bool) -> Box<dyn ProblemFiller> {
        Box::new(Recorder {
            name,
            calls: Arc::clone(calls),
            fail,
        })
    }

    #[test]
    fn test_chain_runs_in_slot_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ProblemFillerChain::new();
        chain.insert(FillerSlot::DiscretePstTap, recorder("taps", &calls, false));
        chain.insert(FillerSlot::Mnec, recorder("mnec", &calls, false));
        chain.insert(FillerSlot::Core, recorder("core", &calls, false));

        let mut problem = LinearProblem::new(chain, Box::new(ClarabelBackend), 30);
        problem.fill(&FlowResult::new(), &SensitivityResult::new()).unwrap();
        problem
            .update(&FlowResult::new(), &SensitivityResult::new(), &RangeActionActivation::default())
            .unwrap();

        assert_eq!(
            *calls.lock(),
            vec!["fill core", "fill mnec", "fill taps", "update core", "update mnec", "update taps"]
        );
    }

    #[test]
    fn test_filler_failure_is_a_construction_error() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ProblemFillerChain::new();
        chain.insert(FillerSlot::Core, recorder("core", &calls, true));
        chain.insert(FillerSlot::Margin, recorder("margin", &calls, false));

        let mut problem = LinearProblem::new(chain, Box::new(ClarabelBackend), 30);
        let err = problem.fill(&FlowResult::new(), &SensitivityResult::new()).unwrap_err();
        match err {
            RaoError::FillerConstruction(message) => assert!(message.starts_with("core:")),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(*calls.lock(), vec!["fill core"]);
    }

    #[test]
    fn test_default_chain_has_core_and_margin_only() {
        let perimeter = Arc::new(test_utils::single_pst_perimeter());
        let network = test_utils::two_area_network();
        let setpoints = RangeActionActivation::from_network(&perimeter, &network).unwrap();
        let parameters = RaoParameters::default();
        let limits = BTreeMap::new();
        let flows = FlowResult::new();
        let context = FillerContext {
            perimeter: &perimeter,
            parameters: &parameters,
            pre_perimeter_setpoints: &setpoints,
            starting_setpoints: &setpoints,
            initial_flows: &flows,
            pre_perimeter_flows: &flows,
            limits: &limits,
        };
        let chain = ProblemFillerChain::build(&context).unwrap();
        assert!(chain.contains(FillerSlot::Core));
        assert!(chain.contains(FillerSlot::Margin));
        assert!(!chain.contains(FillerSlot::RaUsageLimits));
        assert!(!chain.contains(FillerSlot::DiscretePstTap));
    }

    struct IntegralBackend;

    impl crate::linear_problem::LinearSolverBackend for IntegralBackend {
        fn name(&self) -> &'static str {
            "integral"
        }

        fn supports_integrality(&self) -> bool {
            true
        }

        fn solve(&self, _model: &crate::linear_problem::LpModel) -> crate::linear_problem::SolveOutcome {
            crate::linear_problem::SolveOutcome {
                status: crate::result::LinearProblemStatus::NotSolved,
                values: Vec::new(),
            }
        }
    }

    #[test]
    fn test_relaxing_backend_reports_integer_fillers() {
        let perimeter = Arc::new(test_utils::single_pst_perimeter());
        let network = test_utils::two_area_network();
        let setpoints = RangeActionActivation::from_network(&perimeter, &network).unwrap();
        let mut parameters = RaoParameters::default();
        parameters.range_actions.pst_model = PstModelling::ApproximatedIntegers;
        let limits: BTreeMap<State, RangeActionLimits> = [(
            State::preventive(),
            RangeActionLimits {
                max_ra: Some(1),
                ..Default::default()
            },
        )]
        .into_iter()
        .collect();
        let flows = FlowResult::new();
        let context = FillerContext {
            perimeter: &perimeter,
            parameters: &parameters,
            pre_perimeter_setpoints: &setpoints,
            starting_setpoints: &setpoints,
            initial_flows: &flows,
            pre_perimeter_flows: &flows,
            limits: &limits,
        };

        let chain = ProblemFillerChain::build(&context).unwrap();
        assert_eq!(chain.integrality_dependent(), vec!["ra-usage-limits", "discrete-pst-tap"]);
        let relaxed = LinearProblem::new(chain, Box::new(ClarabelBackend), 30);
        assert_eq!(relaxed.relaxed_fillers(), vec!["ra-usage-limits", "discrete-pst-tap"]);

        let chain = ProblemFillerChain::build(&context).unwrap();
        let integral = LinearProblem::new(chain, Box::new(IntegralBackend), 30);
        assert!(integral.relaxed_fillers().is_empty());

        let mut continuous_parameters = parameters.clone();
        continuous_parameters.range_actions.pst_model = PstModelling::Continuous;
        let continuous = FillerContext {
            parameters: &continuous_parameters,
            limits: &BTreeMap::new(),
            ..context
        };
        let chain = ProblemFillerChain::build(&continuous).unwrap();
        assert!(LinearProblem::new(chain, Box::new(ClarabelBackend), 30).relaxed_fillers().is_empty());
    }

    #[test]
    fn test_applicable_state_follows_contingency_branch() {
        let curative_a = State::after_contingency(Instant::curative(), "co-a");
        let curative_b = State::after_contingency(Instant::curative(), "co-b");
        let perimeter = OptimizationPerimeter::builder(State::preventive())
            .range_action(State::preventive(), test_utils::pst_range_action("pst-ra", "pst"))
            .range_action(curative_a.clone(), test_utils::pst_range_action("pst-ra", "pst"))
            .build()
            .unwrap();

        assert_eq!(applicable_state(&perimeter, "pst-ra", &curative_a), Some(&curative_a));
        assert_eq!(applicable_state(&perimeter, "pst-ra", &curative_b), Some(&State::preventive()));
        assert_eq!(previous_state(&perimeter, "pst-ra", &curative_a), Some(&State::preventive()));
        assert_eq!(previous_state(&perimeter, "pst-ra", &State::preventive()), None);
        assert_eq!(applicable_state(&perimeter, "other", &curative_a), None);
    }
}
