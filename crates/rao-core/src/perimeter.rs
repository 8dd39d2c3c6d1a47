//! Optimization perimeter: what one search-tree run looks at and acts upon.

use crate::cnec::FlowCnec;
use crate::error::{RaoError, RaoResult};
use crate::network_action::NetworkAction;
use crate::range_action::RangeAction;
use crate::state::State;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Closure of states, CNECs and remedial actions for one optimisation.
///
/// Built once by the caller; the engine only reads it.
#[derive(Debug, Clone)]
pub struct OptimizationPerimeter {
    main_state: State,
    flow_cnecs: Vec<Arc<FlowCnec>>,
    network_actions: Vec<Arc<NetworkAction>>,
    range_actions: BTreeMap<State, Vec<Arc<RangeAction>>>,
}

impl OptimizationPerimeter {
    pub fn builder(main_state: State) -> OptimizationPerimeterBuilder {
        OptimizationPerimeterBuilder {
            main_state,
            flow_cnecs: Vec::new(),
            network_actions: Vec::new(),
            range_actions: BTreeMap::new(),
        }
    }

    pub fn main_state(&self) -> &State {
        &self.main_state
    }

    /// Every state of the perimeter: the main state plus the states of its CNECs
    /// and range actions.
    pub fn states(&self) -> BTreeSet<State> {
        let mut states: BTreeSet<State> = self.range_actions.keys().cloned().collect();
        states.insert(self.main_state.clone());
        states.extend(self.flow_cnecs.iter().map(|c| c.state.clone()));
        states
    }

    pub fn flow_cnecs(&self) -> &[Arc<FlowCnec>] {
        &self.flow_cnecs
    }

    pub fn optimized_flow_cnecs(&self) -> impl Iterator<Item = &Arc<FlowCnec>> {
        self.flow_cnecs.iter().filter(|c| c.optimized)
    }

    pub fn monitored_flow_cnecs(&self) -> impl Iterator<Item = &Arc<FlowCnec>> {
        self.flow_cnecs.iter().filter(|c| c.monitored)
    }

    pub fn loop_flow_cnecs(&self) -> impl Iterator<Item = &Arc<FlowCnec>> {
        self.flow_cnecs
            .iter()
            .filter(|c| c.loop_flow_threshold.is_some())
    }

    pub fn flow_cnec(&self, id: &str) -> Option<&Arc<FlowCnec>> {
        self.flow_cnecs.iter().find(|c| c.id == id)
    }

    pub fn network_actions(&self) -> &[Arc<NetworkAction>] {
        &self.network_actions
    }

    pub fn range_actions_per_state(&self) -> &BTreeMap<State, Vec<Arc<RangeAction>>> {
        &self.range_actions
    }

    /// All range actions, each listed once, sorted by id.
    pub fn range_actions(&self) -> Vec<Arc<RangeAction>> {
        let mut all: BTreeMap<&str, Arc<RangeAction>> = BTreeMap::new();
        for actions in self.range_actions.values() {
            for action in actions {
                all.entry(action.id.as_str()).or_insert_with(|| Arc::clone(action));
            }
        }
        all.into_values().collect()
    }

    pub fn range_action(&self, id: &str) -> Option<Arc<RangeAction>> {
        self.range_actions
            .values()
            .flatten()
            .find(|ra| ra.id == id)
            .cloned()
    }

    pub fn has_range_actions(&self) -> bool {
        self.range_actions.values().any(|ras| !ras.is_empty())
    }

    /// A perimeter without any optimized CNEC only carries virtual costs.
    pub fn is_purely_virtual(&self) -> bool {
        self.optimized_flow_cnecs().next().is_none()
    }
}

/// Incremental construction of an [`OptimizationPerimeter`].
pub struct OptimizationPerimeterBuilder {
    main_state: State,
    flow_cnecs: Vec<Arc<FlowCnec>>,
    network_actions: Vec<Arc<NetworkAction>>,
    range_actions: BTreeMap<State, Vec<Arc<RangeAction>>>,
}

impl OptimizationPerimeterBuilder {
    pub fn flow_cnec(mut self, cnec: FlowCnec) -> Self {
        self.flow_cnecs.push(Arc::new(cnec));
        self
    }

    pub fn network_action(mut self, action: NetworkAction) -> Self {
        self.network_actions.push(Arc::new(action));
        self
    }

    pub fn range_action(mut self, state: State, action: RangeAction) -> Self {
        self.range_actions
            .entry(state)
            .or_default()
            .push(Arc::new(action));
        self
    }

    pub fn build(mut self) -> RaoResult<OptimizationPerimeter> {
        let mut ids = BTreeSet::new();
        for cnec in &self.flow_cnecs {
            cnec.validate()?;
            if !ids.insert(cnec.id.clone()) {
                return Err(RaoError::Validation(format!("duplicate CNEC id '{}'", cnec.id)));
            }
        }
        let mut ids = BTreeSet::new();
        for action in &self.network_actions {
            if !ids.insert(action.id.clone()) {
                return Err(RaoError::Validation(format!(
                    "duplicate network action id '{}'",
                    action.id
                )));
            }
        }
        for (state, actions) in &self.range_actions {
            let mut ids = BTreeSet::new();
            for action in actions {
                if !ids.insert(action.id.clone()) {
                    return Err(RaoError::Validation(format!(
                        "range action '{}' declared twice for state {}",
                        action.id, state
                    )));
                }
            }
        }
        self.flow_cnecs.sort_by(|a, b| a.id.cmp(&b.id));
        self.network_actions.sort_by(|a, b| a.id.cmp(&b.id));
        for actions in self.range_actions.values_mut() {
            actions.sort_by(|a, b| a.id.cmp(&b.id));
        }
        Ok(OptimizationPerimeter {
            main_state: self.main_state,
            flow_cnecs: self.flow_cnecs,
            network_actions: self.network_actions,
            range_actions: self.range_actions,
        })
    }
}
